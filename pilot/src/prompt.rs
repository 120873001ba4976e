//! Prompt rendering for the two session kinds.
//!
//! Fixed instruction templates: the initializer prompt bootstraps a fresh
//! project, the coding prompt advances an existing ledger. Templates are
//! embedded at compile time and rendered with minijinja.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

const INITIALIZER_TEMPLATE: &str = include_str!("prompts/initializer.md");
const CODING_TEMPLATE: &str = include_str!("prompts/coding.md");

/// Session titles, mirrored in the iteration transcripts.
pub const INITIALIZER_TITLE: &str = "Initializer - project setup";
pub const CODING_TITLE: &str = "Coding - feature implementation";

/// Inputs for the coding prompt.
#[derive(Debug, Clone)]
pub struct CodingPromptInputs<'a> {
    /// Pretty-printed current ledger document.
    pub ledger_json: &'a str,
    pub completed: usize,
    pub total: usize,
    /// Commands the gate rejected in the previous iteration, verbatim.
    pub rejected_commands: &'a [String],
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("initializer", INITIALIZER_TEMPLATE)
            .expect("initializer template should be valid");
        env.add_template("coding", CODING_TEMPLATE)
            .expect("coding template should be valid");
        Self { env }
    }

    /// Render the bootstrap prompt around the user-supplied specification.
    pub fn render_initializer(&self, spec_text: &str, allowlist: &[String]) -> Result<String> {
        let template = self.env.get_template("initializer")?;
        template
            .render(context! {
                spec_text => spec_text.trim(),
                allowlist => allowlist,
            })
            .context("render initializer prompt")
    }

    /// Render the iteration prompt around the current ledger state.
    pub fn render_coding(&self, inputs: &CodingPromptInputs<'_>, allowlist: &[String]) -> Result<String> {
        let template = self.env.get_template("coding")?;
        template
            .render(context! {
                ledger_json => inputs.ledger_json.trim(),
                completed => inputs.completed,
                total => inputs.total,
                rejected_commands => inputs.rejected_commands,
                allowlist => allowlist,
            })
            .context("render coding prompt")
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist() -> Vec<String> {
        vec!["ls".to_string(), "git".to_string()]
    }

    #[test]
    fn initializer_embeds_spec_and_allowlist() {
        let engine = PromptEngine::new();
        let rendered = engine
            .render_initializer("Build a todo app.", &allowlist())
            .expect("render");

        assert!(rendered.contains("You are the project initializer"));
        assert!(rendered.contains("Build a todo app."));
        assert!(rendered.contains("feature_list.json"));
        assert!(rendered.contains("ls, git"));
    }

    #[test]
    fn coding_embeds_ledger_and_progress() {
        let engine = PromptEngine::new();
        let rendered = engine
            .render_coding(
                &CodingPromptInputs {
                    ledger_json: "[]",
                    completed: 2,
                    total: 5,
                    rejected_commands: &[],
                },
                &allowlist(),
            )
            .expect("render");

        assert!(rendered.contains("You are the coding agent"));
        assert!(rendered.contains("2 of 5"));
        assert!(!rendered.contains("rejected by the gate"));
    }

    #[test]
    fn coding_reports_rejected_commands() {
        let engine = PromptEngine::new();
        let rejected = vec!["rm -rf /".to_string()];
        let rendered = engine
            .render_coding(
                &CodingPromptInputs {
                    ledger_json: "[]",
                    completed: 0,
                    total: 1,
                    rejected_commands: &rejected,
                },
                &allowlist(),
            )
            .expect("render");

        assert!(rendered.contains("rejected by the gate"));
        assert!(rendered.contains("rm -rf /"));
    }
}
