//! File-based workspace implementation.
//!
//! Reads workspace markdown files from a directory on disk and assembles
//! them into system prompt sections.

use super::traits::Workspace;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Maximum content size per workspace file (20 KB).
const MAX_CONTENT_BYTES: usize = 20 * 1024;

/// File-based workspace that reads `.md` files from a directory.
pub struct FileWorkspace {
    root: PathBuf,
}

impl FileWorkspace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Collect the non-empty workspace files as `## <FILE>` prompt sections,
    /// in identity → soul → user → agents order.
    pub async fn prompt_sections(&self) -> anyhow::Result<Vec<String>> {
        let files = [
            ("IDENTITY.md", self.identity().await?),
            ("SOUL.md", self.soul().await?),
            ("USER.md", self.user_context().await?),
            ("AGENTS.md", self.agent_instructions().await?),
        ];

        Ok(files
            .into_iter()
            .filter_map(|(file, content)| {
                let content = content?;
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(format!("## {file}\n\n{trimmed}"))
                }
            })
            .collect())
    }
}

/// Starter files written by `nanobot onboard`.
const TEMPLATES: &[(&str, &str)] = &[
    (
        "AGENTS.md",
        "# Agent Instructions\n\nYou are a helpful AI assistant. Be concise, accurate and friendly.\n",
    ),
    (
        "SOUL.md",
        "# Soul\n\nI am nanobot, a lightweight AI assistant.\n\n- Helpful and friendly\n- Concise and to the point\n",
    ),
    (
        "USER.md",
        "# User\n\nInformation about the user goes here.\n",
    ),
];

/// Create the workspace directory and any missing template files.
///
/// Existing files are never overwritten. Returns the files that were created.
pub async fn init_workspace(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(root).await?;
    let mut created = Vec::new();
    for (file, content) in TEMPLATES {
        let path = root.join(file);
        if tokio::fs::try_exists(&path).await? {
            continue;
        }
        tokio::fs::write(&path, content).await?;
        created.push(path);
    }
    Ok(created)
}

/// Read a file if it exists, truncating to `MAX_CONTENT_BYTES`.
///
/// Unreadable files (not UTF-8, permissions) are skipped with a warning.
async fn read_workspace_file(path: &Path) -> anyhow::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            if content.len() > MAX_CONTENT_BYTES {
                // Truncate at a char boundary.
                let mut end = MAX_CONTENT_BYTES;
                while end > 0 && !content.is_char_boundary(end) {
                    end -= 1;
                }
                tracing::debug!(
                    path = %path.display(),
                    bytes = content.len(),
                    "Truncating oversized workspace file"
                );
                Ok(Some(content[..end].to_string()))
            } else {
                Ok(Some(content))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => {
            tracing::warn!(path = %path.display(), "Skipping unreadable workspace file: {e}");
            Ok(None)
        }
    }
}

#[async_trait]
impl Workspace for FileWorkspace {
    fn path(&self) -> &Path {
        &self.root
    }

    async fn agent_instructions(&self) -> anyhow::Result<Option<String>> {
        read_workspace_file(&self.root.join("AGENTS.md")).await
    }

    async fn soul(&self) -> anyhow::Result<Option<String>> {
        read_workspace_file(&self.root.join("SOUL.md")).await
    }

    async fn identity(&self) -> anyhow::Result<Option<String>> {
        read_workspace_file(&self.root.join("IDENTITY.md")).await
    }

    async fn user_context(&self) -> anyhow::Result<Option<String>> {
        read_workspace_file(&self.root.join("USER.md")).await
    }

    fn name(&self) -> &str {
        "file"
    }
}
