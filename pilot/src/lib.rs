//! Autonomous coding-agent loop driver.
//!
//! The pilot drives a remote OpenCode-style agent through a project until a
//! persisted feature checklist reports completion. The architecture keeps
//! the seams explicit:
//!
//! - **[`session`]**: the only module that touches the wire; replies are
//!   decoded once at this boundary.
//! - **[`gate`]**, **[`ledger`]**: pure policy and persistence, no network.
//! - **[`tools`]**, **[`process`]**: local application of the remote agent's
//!   tool invocations, gated and confined to the project directory.
//! - **[`looping`]**: orchestration: phase assessment, retries, pacing,
//!   halt classification.

pub mod config;
pub mod exit_codes;
pub mod gate;
pub mod iteration_log;
pub mod ledger;
pub mod logging;
pub mod looping;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod run_state;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
