use crate::config::{Config, FileWorkspace};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are nanobot, a lightweight and helpful AI assistant. Answer clearly and concisely.";

/// Assemble the system prompt: the configured (or default) prompt, any
/// workspace files, then a runtime section.
pub async fn build_system_prompt(config: &Config, model: &str) -> anyhow::Result<String> {
    let base = config
        .agents
        .defaults
        .system_prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

    let mut sections = vec![base.to_string()];
    if config.workspace_dir.is_dir() {
        let workspace = FileWorkspace::new(config.workspace_dir.clone());
        sections.extend(workspace.prompt_sections().await?);
    }
    sections.push(format!(
        "## Runtime\n\nModel: {model}\nCurrent date: {}",
        chrono::Local::now().format("%Y-%m-%d")
    ));

    Ok(sections.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        Config {
            workspace_dir: dir.path().join("workspace"),
            config_path: dir.path().join("config.json"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn default_prompt_when_unset() {
        let tmp = TempDir::new().unwrap();
        let prompt = build_system_prompt(&config_in(&tmp), "z-ai/glm4.7")
            .await
            .unwrap();
        assert!(prompt.starts_with(DEFAULT_SYSTEM_PROMPT));
        assert!(prompt.contains("Model: z-ai/glm4.7"));
    }

    #[tokio::test]
    async fn configured_prompt_and_workspace_files() {
        let tmp = TempDir::new().unwrap();
        let mut config = config_in(&tmp);
        config.agents.defaults.system_prompt = Some("You are a pirate.".into());
        std::fs::create_dir_all(&config.workspace_dir).unwrap();
        std::fs::write(config.workspace_dir.join("USER.md"), "Name: Sam").unwrap();

        let prompt = build_system_prompt(&config, "m").await.unwrap();
        assert!(prompt.starts_with("You are a pirate.\n\n## USER.md\n\nName: Sam"));
        assert!(!prompt.contains(DEFAULT_SYSTEM_PROMPT));
    }
}
