//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::info;

use intentflow_core::{Orchestrator, PipelineConfig, SessionHandle};
use intentflow_options::parse_options;
use intentflow_router::{
    GuardedRouter, ModelRouter, OpenRouterClient, RetryPolicy, UnavailableRouter,
};
use intentflow_shared::{
    ActiveSection, AppConfig, ConversationMessage, DocumentView, PipelineContext,
    WorkspaceEntity, config_file_path, init_config, load_config, load_config_from,
    validate_api_key,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// IntentFlow: turn chat messages into structured, tier-routed intents.
#[derive(Parser)]
#[command(
    name = "intentflow",
    version,
    about = "Resolve chat messages into structured intents with confidence-gated model escalation.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.intentflow/intentflow.toml.
    #[arg(long, global = true, env = "INTENTFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Analyze a single message and print the intent as JSON.
    Analyze {
        /// The message to analyze.
        message: String,

        /// JSON file with prior messages ([{"role": "user", "content": "..."}]).
        #[arg(long)]
        history: Option<PathBuf>,

        /// JSON file with workspace entities ([{"id", "label", "category"}]).
        #[arg(long)]
        entities: Option<PathBuf>,

        /// Format of the open document; implies the document panel is open.
        #[arg(long)]
        document_format: Option<String>,

        /// Name of the selected section; implies the document panel is open.
        #[arg(long)]
        active_section: Option<String>,

        /// Never call a model; rely on local triage only.
        #[arg(long)]
        offline: bool,
    },

    /// Interactive session over stdin.
    Chat {
        /// JSON file with workspace entities.
        #[arg(long)]
        entities: Option<PathBuf>,

        /// Never call a model; rely on local triage only.
        #[arg(long)]
        offline: bool,
    },

    /// Extract numbered options from a reply (file or stdin).
    Options {
        /// File to read; stdin when omitted.
        file: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Check thresholds and the API key.
    Validate,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so stdout stays JSON.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "intentflow=info",
        1 => "intentflow=debug",
        _ => "intentflow=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Analyze {
            message,
            history,
            entities,
            document_format,
            active_section,
            offline,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            let document = document_view(document_format, active_section);
            cmd_analyze(
                &config,
                &message,
                history.as_deref(),
                entities.as_deref(),
                document,
                offline,
            )
            .await
        }
        Command::Chat { entities, offline } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_chat(&config, entities.as_deref(), offline).await
        }
        Command::Options { file } => cmd_options(file.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path.as_deref()).await,
            ConfigAction::Validate => cmd_config_validate(config_path.as_deref()).await,
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn document_view(format: Option<String>, section: Option<String>) -> DocumentView {
    DocumentView {
        document_open: format.is_some() || section.is_some(),
        document_format: format,
        active_section: section.map(|name| ActiveSection {
            id: name.to_lowercase().replace(' ', "-"),
            name,
        }),
    }
}

fn build_orchestrator(config: &AppConfig, offline: bool) -> Result<Orchestrator> {
    let inner: Arc<dyn ModelRouter> = if offline {
        info!("offline mode, model calls disabled");
        Arc::new(UnavailableRouter)
    } else {
        validate_api_key(config)?;
        Arc::new(OpenRouterClient::from_config(config)?)
    };
    let router = GuardedRouter::new(inner, RetryPolicy::from(&config.router));
    Ok(Orchestrator::new(PipelineConfig::from(config), router)?)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).wrap_err_with(|| format!("invalid JSON in {}", path.display()))
}

fn read_entities(path: Option<&Path>) -> Result<Vec<WorkspaceEntity>> {
    path.map(read_json).transpose().map(Option::unwrap_or_default)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_analyze(
    config: &AppConfig,
    message: &str,
    history: Option<&Path>,
    entities: Option<&Path>,
    document: DocumentView,
    offline: bool,
) -> Result<()> {
    let history: Vec<ConversationMessage> =
        history.map(read_json).transpose()?.unwrap_or_default();
    let entities = read_entities(entities)?;
    let orchestrator = build_orchestrator(config, offline)?;

    info!(
        history = history.len(),
        entities = entities.len(),
        "analyzing message"
    );

    let context = PipelineContext::new(history, entities).with_document(document);
    let result = orchestrator.run(message, &context).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_chat(config: &AppConfig, entities: Option<&Path>, offline: bool) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config, offline)?);
    let session = SessionHandle::new(orchestrator);
    session.set_entities(read_entities(entities)?).await;

    info!(session = %session.id(), "chat session started");
    eprintln!("Type a message. /reply <text> records an assistant reply, /state shows the state, /quit exits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/state" => {
                println!("{}", serde_json::to_string_pretty(&session.state().await)?);
            }
            _ => {
                if let Some(reply) = line.strip_prefix("/reply ") {
                    let parsed = session.record_reply(&reply.replace("\\n", "\n")).await;
                    println!("{}", serde_json::to_string_pretty(&parsed)?);
                    continue;
                }

                let result = match session.submit(line).await {
                    Ok(result) => result,
                    Err(e) => return Err(eyre!("turn failed: {e}")),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);

                if let Some(question) = &result.clarification_needed {
                    session.record_reply(question).await;
                    eprintln!("? {question}");
                }
            }
        }
    }

    Ok(())
}

async fn cmd_options(file: Option<&Path>) -> Result<()> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };

    let parsed = parse_options(&text);
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

async fn cmd_config_validate(path: Option<&Path>) -> Result<()> {
    let shown = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    let config = resolve_config(path)?;
    println!("Thresholds OK ({})", shown.display());

    match validate_api_key(&config) {
        Ok(()) => println!("API key: found in {}", config.openrouter.api_key_env),
        Err(e) => println!("API key: {e}"),
    }
    for tier in intentflow_shared::ModelTier::ALL {
        println!(
            "  {:<9} {}",
            tier.as_str(),
            config.tiers.model_for(tier).unwrap_or("(unbound)")
        );
    }
    Ok(())
}
