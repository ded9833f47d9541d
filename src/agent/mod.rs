#[allow(clippy::module_inception)]
pub mod agent;
pub mod conversation;
pub mod loop_;
pub mod prompt;

pub use agent::Agent;
pub use conversation::Conversation;
pub use loop_::{auth_failure_hint, run, RunOptions};
pub use prompt::{build_system_prompt, DEFAULT_SYSTEM_PROMPT};
