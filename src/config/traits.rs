use async_trait::async_trait;
use std::path::Path;

/// Workspace files that shape the agent's system prompt.
///
/// Each file is optional; a missing file yields `Ok(None)`.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Root path of this workspace.
    fn path(&self) -> &Path;
    /// Agent instructions (AGENTS.md).
    async fn agent_instructions(&self) -> anyhow::Result<Option<String>>;
    /// Agent personality/voice (SOUL.md).
    async fn soul(&self) -> anyhow::Result<Option<String>>;
    /// Agent identity (IDENTITY.md).
    async fn identity(&self) -> anyhow::Result<Option<String>>;
    /// User context and preferences (USER.md).
    async fn user_context(&self) -> anyhow::Result<Option<String>>;
    /// Return the workspace name.
    fn name(&self) -> &str;
}
