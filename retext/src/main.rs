use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use retext_lib::config::{self, AppSettings};
use retext_lib::diff::render_inline;
use retext_lib::network::{EngineClient, NetworkEvent};
use retext_lib::orchestrator::{RevisionMode, RevisionOutcome, RewriteStyle};
use retext_lib::preferences::PreferenceStore;
use retext_lib::session::RecoveryCounter;
use retext_lib::state::AppState;
use retext_lib::target::{MemoryDocument, SystemClipboard};
use retext_lib::transport::{DocumentAgent, FrameTransport};
use retext_lib::{init_logging, init_rustls_crypto_provider};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Correct,
    Formal,
    Concise,
}

impl From<Mode> for RevisionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Correct => RevisionMode::Correct,
            Mode::Formal => RevisionMode::Rewrite(RewriteStyle::Formal),
            Mode::Concise => RevisionMode::Rewrite(RewriteStyle::Concise),
        }
    }
}

/// Revise text with a local model and show the change as a word diff.
#[derive(Debug, Parser)]
#[command(name = "retext", version)]
struct Cli {
    /// Text to revise; read from stdin when omitted.
    text: Vec<String>,

    #[arg(long, value_enum, default_value_t = Mode::Correct)]
    mode: Mode,

    /// Model to load; defaults to the configured or last fetched one.
    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    engine_url: Option<String>,

    /// Keep --model and --engine-url as the configured defaults.
    #[arg(long)]
    save: bool,

    /// Copy the accepted revision to the clipboard.
    #[arg(long)]
    apply: bool,

    /// Page text used by --ask and --summarize.
    #[arg(long)]
    page: Option<PathBuf>,

    /// Ask a question about the --page text instead of revising.
    #[arg(long, requires = "page", conflicts_with = "summarize")]
    ask: Option<String>,

    #[arg(long, requires = "page")]
    summarize: bool,

    /// Print the performance report as JSON when done.
    #[arg(long)]
    report: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(init_err) = init_logging() {
        eprintln!("logging bootstrap failed: {init_err}");
    }
    init_rustls_crypto_provider();

    let mut settings = resolve_settings(&cli);
    if cli.save {
        settings = config::save_settings(settings).context("failed to save settings")?;
        info!(engine_url = %settings.engine_url, model_id = ?settings.model_id, "settings saved");
    }
    let preferences = PreferenceStore::open_default().unwrap_or_else(|err| {
        warn!("preferences unavailable, using an in-memory list: {err}");
        PreferenceStore::in_memory()
    });

    let mut document = MemoryDocument::with_clipboard(SystemClipboard);
    if let Some(path) = cli.page.as_ref() {
        let page = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read page text from {}", path.display()))?;
        let body = document.body();
        document.append_text(body, &page);
    }
    let agent = DocumentAgent::new(Arc::new(Mutex::new(document)));
    let transport = FrameTransport::single(Arc::new(Mutex::new(agent)));

    let (network_events, mut events) = broadcast::channel(64);
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NetworkEvent::Progress { progress, text } => {
                    info!(progress = %format!("{:.0}%", progress * 100.0), "{text}");
                }
                NetworkEvent::TransportError(message) => warn!("{message}"),
            }
        }
    });

    let engine_url = settings.engine_url.clone();
    let make_client = {
        let engine_url = engine_url.clone();
        let network_events = network_events.clone();
        move || EngineClient::new(engine_url.clone(), network_events.clone())
    };
    let app = AppState::new(
        settings,
        make_client,
        transport,
        preferences,
        RecoveryCounter::new(),
        network_events.clone(),
    );

    let Some(model_id) = app.default_model().await else {
        let catalog = app.runtime().settings.model_catalog.join(", ");
        bail!("no model selected; pass --model or set RETEXT_MODEL (catalog: {catalog})");
    };
    info!(%model_id, action = app.load_label(&model_id).await, %engine_url, "preparing model");
    app.load_model(&model_id).await?;

    let runtime = app.runtime();
    if cli.ask.is_some() || cli.summarize {
        let mut assistant = runtime.assistant.lock().await;
        let answer = match cli.ask.as_deref() {
            Some(question) => assistant.ask(question).await?,
            None => assistant.summarize().await?,
        };
        println!("{answer}");
    } else {
        let text = read_input(&cli.text)?;
        match runtime.orchestrator.revise(&text, cli.mode.into()).await? {
            RevisionOutcome::Ready(result) => {
                println!("{}", render_inline(&result.diff));
                println!("{}", result.corrected_text);
                if cli.apply {
                    let delivery = runtime.orchestrator.accept().await?;
                    info!(outcomes = ?delivery.outcomes, "revision delivered");
                }
            }
            RevisionOutcome::Superseded => warn!("revision was superseded"),
        }
    }

    if cli.report {
        let report = runtime.orchestrator.report().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

fn resolve_settings(cli: &Cli) -> AppSettings {
    let mut settings = config::load_settings().unwrap_or_else(|err| {
        warn!("failed to load settings, using defaults: {err}");
        AppSettings::default()
    });
    if let Some(url) = cli.engine_url.as_ref() {
        settings.engine_url = url.clone();
    }
    if let Some(model) = cli.model.as_ref() {
        settings.model_id = Some(model.clone());
    }
    settings
}

fn read_input(args: &[String]) -> anyhow::Result<String> {
    if !args.is_empty() {
        return Ok(args.join(" "));
    }
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        bail!("no text given; pass it as arguments or pipe it on stdin");
    }
    let mut text = String::new();
    stdin
        .read_to_string(&mut text)
        .context("failed to read text from stdin")?;
    Ok(text)
}
