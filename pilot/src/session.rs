//! Session façade over the OpenCode HTTP endpoint.
//!
//! The [`SessionClient`] trait decouples the loop from the wire protocol;
//! tests use scripted clients that return predetermined replies. The
//! production [`OpenCodeClient`] speaks the OpenCode server API and decodes
//! every reply exactly once into [`AgentReply`]; nothing downstream ever
//! inspects raw response JSON. Tool invocations are reported, never executed
//! here.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, instrument};

/// Default OpenCode endpoint; override via config or `OPENCODE_BASE_URL`.
pub const DEFAULT_BASE_URL: &str = "http://localhost:4096";

/// Environment variables recognized as credentials, in lookup order.
pub const CREDENTIAL_VARS: &[&str] = &["OPENCODE_API_KEY", "ANTHROPIC_API_KEY"];

/// Model the original tool fell back to when only an Anthropic key is set.
const ANTHROPIC_DEFAULT_MODEL: &str = "anthropic/claude-3-5-sonnet-20241022";

/// Failure taxonomy for remote calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Endpoint unreachable or the bounded wait expired. Retryable.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Credentials absent or rejected. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Well-formed application-level failure from the endpoint. Retryable once.
    #[error("remote endpoint error: {0}")]
    Remote(String),
}

/// An API key resolved from the environment.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    /// Which environment variable supplied the key.
    pub source: &'static str,
}

impl Credentials {
    /// Look up the first recognized credential variable.
    pub fn from_env() -> Option<Self> {
        CREDENTIAL_VARS.iter().find_map(|&var| {
            std::env::var(var)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(|api_key| Self {
                    api_key,
                    source: var,
                })
        })
    }
}

/// A `provider/model` pair, passed through to the endpoint verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    /// Parse `provider/model`. Both halves must be non-empty.
    pub fn parse(selector: &str) -> Option<Self> {
        let (provider, model) = selector.trim().split_once('/')?;
        let (provider, model) = (provider.trim(), model.trim());
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider.to_string(),
            model_id: model.to_string(),
        })
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.model_id)
    }
}

/// Requested model: a fixed pair, or let the endpoint choose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChoice {
    Auto,
    Fixed(ModelRef),
}

impl ModelChoice {
    /// Resolve a CLI selector. `auto` picks based on available credentials:
    /// an OpenCode key defers to the endpoint, an Anthropic key uses the
    /// default Anthropic model.
    pub fn from_selector(selector: &str, credentials: Option<&Credentials>) -> Result<Self> {
        if selector.trim() == "auto" {
            return Ok(match credentials {
                Some(creds) if creds.source == "ANTHROPIC_API_KEY" => Self::Fixed(
                    ModelRef::parse(ANTHROPIC_DEFAULT_MODEL).expect("default model parses"),
                ),
                _ => Self::Auto,
            });
        }
        ModelRef::parse(selector)
            .map(Self::Fixed)
            .with_context(|| format!("invalid model selector '{selector}' (expected provider/model or auto)"))
    }
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fixed(model) => write!(f, "{model}"),
        }
    }
}

/// Opaque conversation handle returned by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
}

/// One decoded piece of a remote reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPart {
    Text(String),
    /// The remote agent asked the local environment to perform an action.
    ToolInvocation { name: String, input: Value },
}

/// A fully decoded remote reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentReply {
    pub parts: Vec<ReplyPart>,
    /// Model the endpoint reports it actually used, when stated.
    pub model_used: Option<ModelRef>,
}

impl AgentReply {
    /// Concatenated text parts.
    pub fn text(&self) -> String {
        let mut out = Vec::new();
        for part in &self.parts {
            if let ReplyPart::Text(text) = part {
                out.push(text.as_str());
            }
        }
        out.join("\n")
    }

    /// Tool invocations in reply order.
    pub fn tool_invocations(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.parts.iter().filter_map(|part| match part {
            ReplyPart::ToolInvocation { name, input } => Some((name.as_str(), input)),
            ReplyPart::Text(_) => None,
        })
    }
}

/// Parameters for one prompt call.
#[derive(Debug, Clone)]
pub struct PromptRequest<'a> {
    pub session: &'a SessionHandle,
    pub prompt: &'a str,
    pub model: &'a ModelChoice,
    /// Output-length ceiling, forwarded verbatim.
    pub max_output_tokens: u32,
}

/// Abstraction over the remote agent endpoint.
pub trait SessionClient {
    fn open_session(&self, directory: &Path, title: &str) -> Result<SessionHandle, SessionError>;
    fn send_prompt(&self, request: &PromptRequest<'_>) -> Result<AgentReply, SessionError>;
}

/// Production client for an OpenCode server.
pub struct OpenCodeClient {
    base_url: String,
    credentials: Option<Credentials>,
    http: reqwest::blocking::Client,
}

impl OpenCodeClient {
    /// Build a client with a bounded per-request timeout.
    ///
    /// Missing credentials are not an error here: they surface as
    /// [`SessionError::Auth`] at session-open time.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            base_url,
            credentials,
            http,
        })
    }

    fn credentials(&self) -> Result<&Credentials, SessionError> {
        self.credentials.as_ref().ok_or_else(|| {
            SessionError::Auth(format!(
                "no API key found: set {}",
                CREDENTIAL_VARS.join(" or ")
            ))
        })
    }

    fn post(&self, url: &str, body: &Value) -> Result<Value, SessionError> {
        let credentials = self.credentials()?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&credentials.api_key)
            .json(body)
            .send()
            .map_err(|err| SessionError::Transport(err.to_string()))?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SessionError::Auth(format!(
                "endpoint rejected the {} credential: {status}",
                credentials.source
            )));
        }
        if !status.is_success() {
            return Err(SessionError::Remote(format!("{status}: {text}")));
        }
        serde_json::from_str(&text)
            .map_err(|err| SessionError::Remote(format!("unparseable response: {err}")))
    }
}

impl SessionClient for OpenCodeClient {
    #[instrument(skip_all, fields(title = title))]
    fn open_session(&self, directory: &Path, title: &str) -> Result<SessionHandle, SessionError> {
        let url = format!(
            "{}/session?directory={}",
            self.base_url,
            urlencoding::encode(&directory.to_string_lossy())
        );
        let body = json!({ "title": title });
        let response = self.post(&url, &body)?;
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Remote("session response missing id".to_string()))?;
        debug!(session_id = id, "session opened");
        Ok(SessionHandle { id: id.to_string() })
    }

    #[instrument(skip_all, fields(session_id = %request.session.id))]
    fn send_prompt(&self, request: &PromptRequest<'_>) -> Result<AgentReply, SessionError> {
        let url = format!("{}/session/{}/message", self.base_url, request.session.id);
        let mut body = json!({
            "parts": [{ "type": "text", "text": request.prompt }],
            "maxOutputTokens": request.max_output_tokens,
        });
        if let ModelChoice::Fixed(model) = request.model {
            body["model"] = json!({
                "providerID": model.provider_id,
                "modelID": model.model_id,
            });
        }
        let response = self.post(&url, &body)?;
        let reply = decode_reply(&response)?;
        debug!(parts = reply.parts.len(), "reply decoded");
        Ok(reply)
    }
}

/// Decode a raw message response into an [`AgentReply`].
///
/// Reply shapes vary across endpoint versions, so keys are matched with
/// fallbacks here and nowhere else.
pub fn decode_reply(response: &Value) -> Result<AgentReply, SessionError> {
    let info = response.get("info");
    if let Some(error) = info.and_then(|info| info.get("error")).filter(|e| !e.is_null()) {
        return Err(SessionError::Remote(error.to_string()));
    }

    let model_used = info.and_then(|info| {
        let provider = first_str(info, &["providerID", "providerId", "provider_id"])?;
        let model = first_str(info, &["modelID", "modelId", "model_id"])?;
        Some(ModelRef {
            provider_id: provider.to_string(),
            model_id: model.to_string(),
        })
    });

    let mut parts = Vec::new();
    let raw_parts = response
        .get("parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for part in &raw_parts {
        let Some(part_type) = part.get("type").and_then(Value::as_str) else {
            continue;
        };
        match part_type {
            "text" => {
                if let Some(text) = part.get("text").and_then(Value::as_str)
                    && !text.is_empty()
                {
                    parts.push(ReplyPart::Text(text.to_string()));
                }
            }
            "tool" | "tool_use" | "tool-invocation" => {
                let name = first_str(part, &["tool", "name"]).unwrap_or("unknown").to_string();
                let input = part
                    .get("state")
                    .and_then(|state| state.get("input"))
                    .or_else(|| part.get("input"))
                    .or_else(|| part.get("args"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                parts.push(ReplyPart::ToolInvocation { name, input });
            }
            _ => {}
        }
    }

    Ok(AgentReply { parts, model_used })
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_model_selector() {
        let model = ModelRef::parse("anthropic/claude-3-5-sonnet-20241022").expect("parse");
        assert_eq!(model.provider_id, "anthropic");
        assert_eq!(model.model_id, "claude-3-5-sonnet-20241022");
        assert_eq!(model.to_string(), "anthropic/claude-3-5-sonnet-20241022");
    }

    #[test]
    fn rejects_malformed_model_selectors() {
        assert!(ModelRef::parse("").is_none());
        assert!(ModelRef::parse("anthropic").is_none());
        assert!(ModelRef::parse("anthropic/").is_none());
        assert!(ModelRef::parse("/model").is_none());
    }

    #[test]
    fn model_with_slashes_keeps_remainder() {
        let model = ModelRef::parse("openrouter/anthropic/claude-3.5-sonnet").expect("parse");
        assert_eq!(model.provider_id, "openrouter");
        assert_eq!(model.model_id, "anthropic/claude-3.5-sonnet");
    }

    #[test]
    fn auto_defers_to_endpoint_for_opencode_keys() {
        let creds = Credentials {
            api_key: "k".to_string(),
            source: "OPENCODE_API_KEY",
        };
        let choice = ModelChoice::from_selector("auto", Some(&creds)).expect("resolve");
        assert_eq!(choice, ModelChoice::Auto);
    }

    #[test]
    fn auto_picks_anthropic_default_for_anthropic_keys() {
        let creds = Credentials {
            api_key: "k".to_string(),
            source: "ANTHROPIC_API_KEY",
        };
        let choice = ModelChoice::from_selector("auto", Some(&creds)).expect("resolve");
        match choice {
            ModelChoice::Fixed(model) => assert_eq!(model.provider_id, "anthropic"),
            ModelChoice::Auto => panic!("expected fixed model"),
        }
    }

    #[test]
    fn decodes_text_and_tool_parts() {
        let response = serde_json::json!({
            "info": { "providerID": "anthropic", "modelID": "claude-3-5-sonnet-20241022" },
            "parts": [
                { "type": "text", "text": "Working on it." },
                { "type": "tool", "tool": "bash", "state": { "input": { "command": "ls" } } },
                { "type": "step-start" },
                { "type": "text", "text": "Done." }
            ]
        });

        let reply = decode_reply(&response).expect("decode");
        assert_eq!(reply.text(), "Working on it.\nDone.");
        let invocations: Vec<_> = reply.tool_invocations().collect();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].0, "bash");
        assert_eq!(invocations[0].1["command"], "ls");
        assert_eq!(
            reply.model_used.expect("model").to_string(),
            "anthropic/claude-3-5-sonnet-20241022"
        );
    }

    #[test]
    fn decodes_flat_tool_input_variants() {
        let response = serde_json::json!({
            "parts": [
                { "type": "tool_use", "name": "write", "input": { "filePath": "a.txt", "content": "hi" } }
            ]
        });

        let reply = decode_reply(&response).expect("decode");
        let invocations: Vec<_> = reply.tool_invocations().collect();
        assert_eq!(invocations[0].0, "write");
        assert_eq!(invocations[0].1["filePath"], "a.txt");
        assert!(reply.model_used.is_none());
    }

    #[test]
    fn reply_level_error_is_remote() {
        let response = serde_json::json!({
            "info": { "error": { "name": "QuotaExceeded", "message": "out of quota" } },
            "parts": []
        });

        let err = decode_reply(&response).expect_err("error");
        assert!(matches!(err, SessionError::Remote(_)));
        assert!(err.to_string().contains("QuotaExceeded"));
    }

    #[test]
    fn error_messages_name_the_failure_class() {
        assert!(
            SessionError::Transport("connection refused".to_string())
                .to_string()
                .starts_with("transport failure")
        );
        assert!(
            SessionError::Auth("no API key found".to_string())
                .to_string()
                .starts_with("authentication failed")
        );
    }
}
