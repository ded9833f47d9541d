#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use nanobot::agent::{self, RunOptions};
use nanobot::config::{self, Config};
use nanobot::{gateway, logo, providers, security};
use std::io::Write;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn parse_temperature(s: &str) -> std::result::Result<f64, String> {
    let t: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !(0.0..=2.0).contains(&t) {
        return Err("temperature must be between 0.0 and 2.0".to_string());
    }
    Ok(t)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// nanobot - a lightweight AI assistant for NVIDIA NIM and OpenAI-compatible APIs.
#[derive(Parser, Debug)]
#[command(name = "nanobot")]
#[command(version)]
#[command(about = "A lightweight AI assistant.", long_about = None)]
struct Cli {
    /// Configuration directory (default: ~/.nanobot)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chat with the agent
    #[command(long_about = "\
Chat with the agent.

Starts an interactive session with the configured provider. \
Use --message for a single question without entering interactive mode. \
Type exit or quit (or press Ctrl+D) to leave the session.

Examples:
  nanobot agent                              # interactive session
  nanobot agent -m \"What is NVIDIA NIM?\"     # single message
  nanobot agent -p openrouter --model z-ai/glm-4.7
  nanobot agent --stream")]
    Agent {
        /// Single message mode (don't enter interactive mode)
        #[arg(short, long)]
        message: Option<String>,

        /// Provider to use (nvidia, openai, openrouter, custom:<URL>)
        #[arg(short, long)]
        provider: Option<String>,

        /// Model to use (default: agents.defaults.model)
        #[arg(long)]
        model: Option<String>,

        /// Temperature (0.0 - 2.0, default: agents.defaults.temperature)
        #[arg(short, long, value_parser = parse_temperature)]
        temperature: Option<f64>,

        /// Print the reply as it is generated
        #[arg(long)]
        stream: bool,
    },

    /// Start the HTTP gateway
    #[command(long_about = "\
Start the HTTP gateway.

Serves the agent over a JSON API (POST /v1/chat). Bind address \
defaults to the values in your config file (gateway.host / gateway.port).

Examples:
  nanobot gateway                  # use config defaults
  nanobot gateway -p 8080          # listen on port 8080
  nanobot gateway --host 127.0.0.1 # local connections only
  nanobot gateway -p 0             # random available port")]
    Gateway {
        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,
    },

    /// Create the config file and workspace templates
    Onboard,

    /// Show configuration and provider status
    Status,

    /// List supported AI providers
    Providers,

    /// Inspect configuration
    #[command(long_about = "\
Inspect nanobot configuration.

Use 'schema' to dump the full JSON Schema for config.json, which \
documents every available key, type, and default value. Use 'show' \
to print the effective configuration with secrets masked.

Examples:
  nanobot config schema              # print JSON Schema to stdout
  nanobot config schema > schema.json
  nanobot config show")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `nanobot`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(nanobot completions bash)
  nanobot completions zsh > ~/.zfunc/_nanobot
  nanobot completions fish > ~/.config/fish/completions/nanobot.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
    /// Print the effective configuration with API keys masked
    Show,
}

fn init_logging(default_level: &str) -> Result<()> {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("NANOBOT_CONFIG_DIR", config_dir);
    }

    // Completions must remain stdout-only and should not load config or initialize logging.
    // This avoids warnings/log lines corrupting sourced completion scripts.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Schema output does not depend on the config file.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        let schema = schemars::schema_for!(Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    // Replies go to stdout; keep the agent quiet unless RUST_LOG asks otherwise.
    let default_level = if matches!(cli.command, Commands::Agent { .. }) {
        "warn"
    } else {
        "info"
    };
    init_logging(default_level)?;

    // All other commands need config loaded first
    let config = Config::load_or_init().await?;

    let result = run_command(cli.command, config).await;
    if let Err(e) = &result {
        if let Some(hint) = agent::auth_failure_hint(e) {
            eprintln!("{hint}");
        }
    }
    result
}

async fn run_command(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Completions { .. }
        | Commands::Config {
            config_command: ConfigCommands::Schema,
        } => unreachable!("handled before config is loaded"),

        Commands::Agent {
            message,
            provider,
            model,
            temperature,
            stream,
        } => {
            agent::run(
                config,
                RunOptions {
                    message,
                    provider,
                    model,
                    temperature,
                    stream: stream.then_some(true),
                },
            )
            .await
        }

        Commands::Gateway { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            if port == 0 {
                info!("Starting nanobot gateway on {host} (random port)");
            } else {
                info!("Starting nanobot gateway on {host}:{port}");
            }
            gateway::run_gateway(&host, port, config).await
        }

        Commands::Onboard => onboard(&config).await,

        Commands::Status => {
            print_status(&config);
            Ok(())
        }

        Commands::Providers => {
            print_providers(&config);
            Ok(())
        }

        Commands::Config {
            config_command: ConfigCommands::Show,
        } => {
            let masked = config.to_masked_json()?;
            println!("{}", serde_json::to_string_pretty(&masked)?);
            Ok(())
        }
    }
}

async fn onboard(config: &Config) -> Result<()> {
    let created = config::init_workspace(&config.workspace_dir).await?;

    println!("{} nanobot is ready!", logo());
    println!();
    println!("Config:      {}", config.config_path.display());
    println!("Workspace:   {}", config.workspace_dir.display());
    for path in &created {
        println!("  created    {}", path.display());
    }
    println!();
    println!("Next steps:");
    println!("  1. Get an API key at https://build.nvidia.com");
    println!(
        "  2. Set providers.nvidia.apiKey in {} (or export NVIDIA_API_KEY)",
        config.config_path.display()
    );
    println!("  3. Chat: nanobot agent -m \"Hello!\"");
    Ok(())
}

fn print_status(config: &Config) {
    let active = config.active_provider_name();
    let defaults = &config.agents.defaults;

    println!("{} nanobot Status", logo());
    println!();
    println!("Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Config:      {} {}",
        config.config_path.display(),
        if config.config_path.exists() { "(found)" } else { "(missing)" }
    );
    println!(
        "Workspace:   {} {}",
        config.workspace_dir.display(),
        if config.workspace_dir.is_dir() { "(found)" } else { "(missing, run nanobot onboard)" }
    );
    println!();
    println!("Provider:    {active}");
    println!("Model:       {}", defaults.model);
    println!("Max tokens:  {}", defaults.max_tokens);
    println!("Temperature: {}", defaults.temperature);
    println!(
        "Thinking:    {}",
        if defaults.enable_thinking { "on" } else { "off" }
    );
    println!();
    println!("API keys:");
    for info in providers::list_providers() {
        let settings = config.provider_config(info.name);
        let key = providers::resolve_provider_credential(info.name, settings)
            .map_or_else(|| "not set".to_string(), |key| security::redact(&key));
        println!("  {:<12} {key}", info.name);
    }
    for name in config
        .providers
        .keys()
        .filter(|name| providers::find_provider(name).is_none())
    {
        let settings = config.provider_config(name);
        let key = providers::resolve_provider_credential(name, settings)
            .map_or_else(|| "not set".to_string(), |key| security::redact(&key));
        println!("  {name:<12} {key}");
    }
    println!();
    println!(
        "Gateway:     {}:{} (auth: {})",
        config.gateway.host,
        config.gateway.port,
        if config.gateway.auth_token.is_some() { "token" } else { "none" }
    );

    if cfg!(windows) {
        println!();
        println!("If characters look garbled, switch the console to UTF-8 with: chcp 65001");
    }
}

fn print_providers(config: &Config) {
    let providers = providers::list_providers();
    let current = config.active_provider_name().to_ascii_lowercase();
    println!("Supported providers ({} total):\n", providers.len());
    println!("  ID (use in config)  DESCRIPTION");
    println!("  ─────────────────── ───────────");
    for p in &providers {
        let is_active = p.name.eq_ignore_ascii_case(&current)
            || p.aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(&current));
        let marker = if is_active { " (active)" } else { "" };
        let aliases = if p.aliases.is_empty() {
            String::new()
        } else {
            format!("  (aliases: {})", p.aliases.join(", "))
        };
        println!(
            "  {:<19} {}{}{}  [{}]",
            p.name, p.display_name, marker, aliases, p.base_url
        );
    }
    println!("\n  custom:<URL>        Any OpenAI-compatible endpoint");
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, Parser};

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn completions_cli_parses_supported_shells() {
        for shell in ["bash", "fish", "zsh", "powershell", "elvish"] {
            let cli = Cli::try_parse_from(["nanobot", "completions", shell])
                .expect("completions invocation should parse");
            match cli.command {
                Commands::Completions { .. } => {}
                other => panic!("expected completions command, got {other:?}"),
            }
        }
    }

    #[test]
    fn completion_generation_mentions_binary_name() {
        let mut output = Vec::new();
        write_shell_completion(CompletionShell::Bash, &mut output)
            .expect("completion generation should succeed");
        let script = String::from_utf8(output).expect("completion output should be valid utf-8");
        assert!(
            script.contains("nanobot"),
            "completion script should reference binary name"
        );
    }

    #[test]
    fn agent_cli_parses_single_message() {
        let cli = Cli::try_parse_from([
            "nanobot",
            "agent",
            "-m",
            "Hello!",
            "-p",
            "nvidia",
            "--temperature",
            "0.5",
            "--stream",
        ])
        .expect("agent invocation should parse");
        match cli.command {
            Commands::Agent {
                message,
                provider,
                temperature,
                stream,
                model,
            } => {
                assert_eq!(message.as_deref(), Some("Hello!"));
                assert_eq!(provider.as_deref(), Some("nvidia"));
                assert_eq!(temperature, Some(0.5));
                assert!(stream);
                assert!(model.is_none());
            }
            other => panic!("expected agent command, got {other:?}"),
        }
    }

    #[test]
    fn agent_cli_rejects_out_of_range_temperature() {
        assert!(Cli::try_parse_from(["nanobot", "agent", "-t", "2.5"]).is_err());
    }

    #[test]
    fn config_dir_is_global() {
        let cli = Cli::try_parse_from(["nanobot", "status", "--config-dir", "/tmp/nb"])
            .expect("global flag should parse after subcommand");
        assert_eq!(cli.config_dir.as_deref(), Some("/tmp/nb"));
    }

    #[test]
    fn gateway_cli_accepts_port_and_host() {
        let cli = Cli::try_parse_from(["nanobot", "gateway", "-p", "8080", "--host", "127.0.0.1"])
            .expect("gateway invocation should parse");
        match cli.command {
            Commands::Gateway { port, host } => {
                assert_eq!(port, Some(8080));
                assert_eq!(host.as_deref(), Some("127.0.0.1"));
            }
            other => panic!("expected gateway command, got {other:?}"),
        }
    }
}
