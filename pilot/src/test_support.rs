//! Test-only helpers: scripted session clients and temporary projects.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::config::PilotConfig;
use crate::ledger::{self, FeatureEntry};
use crate::looping::LoopRequest;
use crate::session::{
    AgentReply, ModelChoice, PromptRequest, ReplyPart, SessionClient, SessionError, SessionHandle,
};

/// Create a deterministic feature entry.
pub fn entry(category: &str, description: &str, passes: bool) -> FeatureEntry {
    FeatureEntry {
        category: category.to_string(),
        description: description.to_string(),
        steps: vec![format!("verify: {description}")],
        passes,
    }
}

/// A reply holding a single text part.
pub fn text_reply(text: &str) -> AgentReply {
    AgentReply {
        parts: vec![ReplyPart::Text(text.to_string())],
        model_used: None,
    }
}

/// A reply holding a single tool invocation.
pub fn tool_reply(name: &str, input: serde_json::Value) -> AgentReply {
    AgentReply {
        parts: vec![ReplyPart::ToolInvocation {
            name: name.to_string(),
            input,
        }],
        model_used: None,
    }
}

/// Temporary project directory with loop-friendly defaults (no delays).
pub struct TestProject {
    temp: tempfile::TempDir,
    config: PilotConfig,
    model: ModelChoice,
    interrupt: AtomicBool,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir()?,
            config: PilotConfig {
                auto_continue_delay_secs: 0,
                retry_backoff_secs: 0,
                ..PilotConfig::default()
            },
            model: ModelChoice::Auto,
            interrupt: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn config(&self) -> PilotConfig {
        self.config.clone()
    }

    pub fn write_spec(&self, text: &str) -> Result<()> {
        std::fs::write(self.root().join(crate::paths::SPEC_FILE), text)?;
        Ok(())
    }

    pub fn write_ledger(&self, entries: &[FeatureEntry]) -> Result<()> {
        ledger::save(self.root(), entries)
    }

    /// A loop request over this project's defaults.
    pub fn request(&self, max_iterations: Option<u32>) -> LoopRequest<'_> {
        LoopRequest {
            project_dir: self.root(),
            config: &self.config,
            model: &self.model,
            max_iterations,
            interrupt: &self.interrupt,
        }
    }
}

/// Session client returning predetermined results without any network.
///
/// Records every opened session title and sent prompt for assertions. An
/// exhausted script fails the call rather than panicking so halt paths stay
/// observable.
pub struct ScriptedSession {
    replies: RefCell<VecDeque<Result<AgentReply, SessionError>>>,
    titles: RefCell<Vec<String>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedSession {
    pub fn new(replies: Vec<Result<AgentReply, SessionError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            titles: RefCell::new(Vec::new()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Number of sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        self.titles.borrow().len()
    }

    pub fn titles(&self) -> Vec<String> {
        self.titles.borrow().clone()
    }

    /// Prompts sent so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl SessionClient for ScriptedSession {
    fn open_session(&self, _directory: &Path, title: &str) -> Result<SessionHandle, SessionError> {
        let mut titles = self.titles.borrow_mut();
        titles.push(title.to_string());
        Ok(SessionHandle {
            id: format!("scripted-{}", titles.len()),
        })
    }

    fn send_prompt(&self, request: &PromptRequest<'_>) -> Result<AgentReply, SessionError> {
        self.prompts.borrow_mut().push(request.prompt.to_string());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(SessionError::Remote("scripted replies exhausted".to_string())))
    }
}
