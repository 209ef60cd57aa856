use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chatstream_core::{
    ChatSessionController, ChatTranscript, Config, MemoryStore, OpenAIClient, SessionUpdate,
    SqliteStore, StreamErrorPolicy, TranscriptStore,
};

mod app;
mod handler;
mod tui;
mod ui;

use app::App;
use tui::{AppEvent, EventHandler};

#[derive(Parser)]
#[command(name = "chatstream")]
#[command(about = "Terminal chat client for streaming chat-completion APIs")]
struct Cli {
    /// Model to request completions from
    #[arg(short, long)]
    model: Option<String>,

    /// Chat-completions endpoint URL
    #[arg(short, long)]
    endpoint: Option<String>,

    /// SQLite file holding the chat history
    #[arg(long, value_name = "PATH")]
    history: Option<PathBuf>,

    /// Start with an empty transcript
    #[arg(long)]
    clear_history: bool,

    /// What to do with partial replies when a stream fails
    #[arg(long, value_name = "retain|rollback")]
    on_stream_error: Option<StreamErrorPolicy>,

    /// Write the model, endpoint, history and policy overrides to the config file
    #[arg(long)]
    save_config: bool,
}

/// Route tracing output to a file since the terminal belongs to the UI.
fn init_logging() {
    let Ok(dir) = Config::config_dir() else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let Ok(file) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("chatstream.log"))
    else {
        return;
    };

    let filter = EnvFilter::try_from_env("CHATSTREAM_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
}

fn open_store(config: &Config) -> Box<dyn TranscriptStore> {
    let opened = config
        .history_path()
        .and_then(|path| Ok(SqliteStore::open(&path)?));

    match opened {
        Ok(store) => Box::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "history database unavailable, keeping history in memory");
            Box::new(MemoryStore::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let mut config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to read config, using defaults");
        Config::new()
    });

    if let Some(model) = cli.model {
        config.model = Some(model);
    }
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = Some(endpoint);
    }
    if let Some(history) = cli.history {
        config.history_path = Some(history);
    }
    if let Some(policy) = cli.on_stream_error {
        config.on_stream_error = Some(policy);
    }

    if cli.save_config {
        // Re-read so a credential coming from the environment never lands on disk
        let mut saved = Config::load().unwrap_or_default();
        saved.model = config.model.clone();
        saved.endpoint = config.endpoint.clone();
        saved.history_path = config.history_path.clone();
        saved.on_stream_error = config.on_stream_error;
        saved.save()?;
    }

    // A missing key is not fatal: the request fails and the error is shown in the UI
    let api_key = config.api_key().unwrap_or_default();
    let model = config.model();
    let client = OpenAIClient::new(&api_key, &model).with_endpoint(&config.endpoint());

    let mut transcript = ChatTranscript::load(open_store(&config));
    if cli.clear_history {
        transcript.clear();
    }

    let controller =
        ChatSessionController::new(transcript, Arc::new(client), config.stream_error_policy());
    tracing::info!(model = %model, "starting chat session");

    let mut app = App::new(controller, model);

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    let result = run(&mut terminal, &mut app, &mut events).await;

    tui::restore()?;
    if let Err(e) = app.controller.transcript().flush() {
        tracing::warn!(error = %e, "chat history may be incomplete");
    }
    result
}

enum Step {
    Event(Option<AppEvent>),
    Update(Option<SessionUpdate>),
}

async fn run(terminal: &mut tui::Tui, app: &mut App, events: &mut EventHandler) -> Result<()> {
    while !app.should_quit {
        terminal.draw(|frame| ui::render(app, frame))?;

        let streaming = app.controller.is_streaming();
        let step = tokio::select! {
            event = events.next() => Step::Event(event),
            update = app.controller.next_update(), if streaming => Step::Update(update),
        };

        match step {
            Step::Event(Some(event)) => handler::handle_event(app, event),
            Step::Event(None) => break,
            Step::Update(Some(update)) => app.on_session_update(update),
            Step::Update(None) => app.refresh_transcript(),
        }
    }

    Ok(())
}
