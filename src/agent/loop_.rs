use crate::agent::{build_system_prompt, Agent, Conversation};
use crate::config::Config;
use crate::providers::{self, ChatResponse, ProviderError};
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Command-line overrides for a single `agent` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Send this message and exit instead of starting an interactive session.
    pub message: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    /// Print tokens as they arrive.
    pub stream: Option<bool>,
}

/// Hint printed after a provider rejected the credential.
pub fn auth_failure_hint(error: &anyhow::Error) -> Option<&'static str> {
    error
        .downcast_ref::<ProviderError>()
        .filter(|e| e.is_auth_failure())
        .map(|_| "Authentication failed: check that your API key is valid on the provider's website.")
}

/// Run the agent: one message with `-m`, otherwise an interactive session.
pub async fn run(config: Config, options: RunOptions) -> anyhow::Result<()> {
    let provider_name = options
        .provider
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| config.active_provider_name());
    let provider: Arc<dyn providers::Provider> =
        Arc::from(providers::create_provider_from_config(&config, Some(&provider_name))?);

    let mut agent = Agent::from_config(&config, provider, &provider_name)
        .with_usage_tracker(crate::infra::create_usage_tracker());
    if let Some(model) = options.model.as_deref().filter(|m| !m.trim().is_empty()) {
        agent = agent.with_model(model);
    }
    if let Some(temperature) = options.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            anyhow::bail!("--temperature must be between 0.0 and 2.0 (got {temperature})");
        }
        agent = agent.with_temperature(temperature);
    }
    let stream = options.stream.unwrap_or(config.agents.defaults.stream);

    let system_prompt = build_system_prompt(&config, agent.model()).await?;
    let mut conversation = Conversation::new(
        Some(system_prompt.as_str()),
        config.agents.defaults.max_history_messages,
    );

    tracing::info!(
        provider = %provider_name,
        model = agent.model(),
        stream,
        "Starting agent"
    );

    if let Some(message) = options.message {
        // Single-shot: surface the typed error so the caller can exit non-zero.
        let response = send(&agent, &mut conversation, &message, stream).await?;
        if !stream {
            println!("{} {}", crate::logo(), response.content);
        }
        return Ok(());
    }

    interactive(&agent, &mut conversation, stream).await
}

async fn interactive(agent: &Agent, conversation: &mut Conversation, stream: bool) -> anyhow::Result<()> {
    println!(
        "{} Interactive mode ({}). Type exit or quit to leave.\n",
        crate::logo(),
        agent.model()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_ascii_lowercase().as_str(), "exit" | "quit") {
            break;
        }

        match send(agent, conversation, input, stream).await {
            Ok(response) if !stream => println!("\n{} {}\n", crate::logo(), response.content),
            Ok(_) => println!(),
            Err(e) => {
                eprintln!("\n{}\n", ChatResponse::from_error(&e).content);
                if let Some(hint) = auth_failure_hint(&e) {
                    eprintln!("{hint}\n");
                }
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}

/// Send one turn, printing deltas as they arrive when streaming.
async fn send(
    agent: &Agent,
    conversation: &mut Conversation,
    text: &str,
    stream: bool,
) -> anyhow::Result<ChatResponse> {
    if !stream {
        return agent.try_process_message(conversation, text).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "{} ", crate::logo());
        while let Some(delta) = rx.recv().await {
            let _ = write!(stdout, "{delta}");
            let _ = stdout.flush();
        }
        let _ = writeln!(stdout);
    });

    let result = agent.try_stream_message(conversation, text, tx).await;
    let _ = printer.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_hint_only_for_auth_failures() {
        let unauthorized: anyhow::Error = ProviderError::Api {
            provider: "NVIDIA NIM".into(),
            status: 403,
            message: "Forbidden".into(),
        }
        .into();
        let server: anyhow::Error = ProviderError::Api {
            provider: "NVIDIA NIM".into(),
            status: 502,
            message: "Bad Gateway".into(),
        }
        .into();

        assert!(auth_failure_hint(&unauthorized)
            .unwrap()
            .contains("API key is valid"));
        assert!(auth_failure_hint(&server).is_none());
        assert!(auth_failure_hint(&anyhow::anyhow!("plain")).is_none());
    }

    #[tokio::test]
    async fn run_rejects_out_of_range_temperature() {
        let mut config = Config::default();
        config.providers.insert(
            "nvidia".into(),
            crate::config::ProviderConfig {
                api_key: Some("nvapi-test".into()),
                ..Default::default()
            },
        );
        let err = run(
            config,
            RunOptions {
                message: Some("hi".into()),
                temperature: Some(3.5),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("--temperature"));
    }
}
