use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use canvas_sync::api::{ApiError, HistoryEntry, RestClient, Section};
use canvas_sync::bus::{Callback, WILDCARD};
use canvas_sync::caret::Caret;
use canvas_sync::config::{
    ConfigError, ConnectionConfig, DEFAULT_API_BASE_URL, DEFAULT_ORIGIN, Origin, SyncConfig,
};
use canvas_sync::connection::{Connection, ConnectionError, OPEN_EVENT};
use canvas_sync::history::{HistoryAction, HistoryRow};
use canvas_sync::surface::{EditorSurface, MemorySurface};
use canvas_sync::sync::SectionSync;
use canvas_sync::transport::WsConnector;
use canvas_sync::{CanvasApi, EventBus};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::Notify;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("api request failed: {0}")]
    Api(#[from] ApiError),
    #[error("{0}")]
    Connection(#[from] ConnectionError),
    #[error("unknown section `{0}`")]
    UnknownSection(String),
    #[error("terminal io failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "canvas-cli", about = "Idea canvas sync client")]
struct Cli {
    #[arg(long, env = "CANVAS_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    /// Page origin the WebSocket endpoint is derived from.
    #[arg(long, env = "CANVAS_ORIGIN", default_value = DEFAULT_ORIGIN)]
    origin: String,

    #[arg(long, env = "CANVAS_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every event received on a canvas connection.
    Tail {
        canvas_id: String,
        #[arg(long, help = "Stop after this many seconds instead of waiting for Ctrl-C")]
        seconds: Option<u64>,
    },
    /// List an idea's sections.
    Sections { idea_id: String },
    /// Replace one section's text, broadcast it and autosave a history entry.
    Edit {
        idea_id: String,
        section_id: String,
        text: String,
    },
    History(HistoryCommand),
}

#[derive(Args, Debug)]
struct HistoryCommand {
    #[command(subcommand)]
    command: HistorySubcommand,
}

#[derive(Subcommand, Debug)]
enum HistorySubcommand {
    List {
        idea_id: String,
    },
    View {
        idea_id: String,
        entry_id: String,
    },
    Revert {
        idea_id: String,
        entry_id: String,
        #[arg(long, default_value_t = false, help = "Skip the confirmation prompt")]
        yes: bool,
    },
}

struct CliContext {
    api: Arc<RestClient>,
    origin: Origin,
    token: Option<String>,
    connection: ConnectionConfig,
    sync: SyncConfig,
}

impl CliContext {
    fn connection(&self) -> Connection {
        Connection::new(self.connection, self.origin.clone(), Arc::new(WsConnector), EventBus::new())
    }

    fn attach(&self, idea_id: &str, connection: &Connection, surface: Arc<TerminalSurface>) -> SectionSync {
        SectionSync::attach(
            idea_id,
            Arc::clone(&self.api) as Arc<dyn CanvasApi>,
            connection.clone(),
            surface,
            &self.sync,
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let cli = Cli::parse();
    let ctx = CliContext {
        api: Arc::new(RestClient::new(&cli.api_base_url, cli.token.clone())?),
        origin: Origin::parse(&cli.origin)?,
        token: cli.token,
        connection: ConnectionConfig::from_env(),
        sync: SyncConfig::from_env(),
    };

    match cli.command {
        Command::Tail { canvas_id, seconds } => run_tail(&ctx, &canvas_id, seconds).await,
        Command::Sections { idea_id } => run_sections(&ctx, &idea_id).await,
        Command::Edit { idea_id, section_id, text } => run_edit(&ctx, &idea_id, &section_id, &text).await,
        Command::History(history) => run_history(&ctx, history).await,
    }
}

async fn run_tail(ctx: &CliContext, canvas_id: &str, seconds: Option<u64>) -> Result<(), CliError> {
    let connection = ctx.connection();
    let printer: Callback = Arc::new(|kind: &str, payload: &Value| {
        if payload.is_null() {
            println!("{kind}");
        } else {
            println!("{kind} {payload}");
        }
    });
    connection.subscribe(WILDCARD, printer);
    connection.connect(canvas_id, ctx.token.clone())?;

    match seconds {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => tokio::signal::ctrl_c().await?,
    }
    connection.disconnect();
    Ok(())
}

async fn run_sections(ctx: &CliContext, idea_id: &str) -> Result<(), CliError> {
    let connection = ctx.connection();
    let sync = ctx.attach(idea_id, &connection, Arc::new(TerminalSurface::new(false, true)));
    let result = sync.load_sections().await;
    sync.teardown();
    result.map_err(CliError::from)
}

async fn run_edit(ctx: &CliContext, idea_id: &str, section_id: &str, text: &str) -> Result<(), CliError> {
    let connection = ctx.connection();
    let opened = Arc::new(Notify::new());
    let signal = Arc::clone(&opened);
    let on_open: Callback = Arc::new(move |_: &str, _: &Value| signal.notify_one());
    connection.subscribe(OPEN_EVENT, Arc::clone(&on_open));
    connection.connect(idea_id, ctx.token.clone())?;

    if tokio::time::timeout(OPEN_TIMEOUT, opened.notified()).await.is_err() {
        eprintln!("warning: canvas connection did not open; the edit will be saved but not broadcast");
    }
    connection.unsubscribe(OPEN_EVENT, &on_open);

    let surface = Arc::new(TerminalSurface::new(false, false));
    let sync = ctx.attach(idea_id, &connection, Arc::clone(&surface));
    let outcome = edit_and_flush(&sync, &surface, section_id, text).await;
    sync.teardown();
    connection.disconnect();
    outcome?;

    eprintln!("saved section {section_id}");
    Ok(())
}

async fn edit_and_flush(
    sync: &SectionSync,
    surface: &TerminalSurface,
    section_id: &str,
    text: &str,
) -> Result<(), CliError> {
    sync.load_sections().await?;
    if surface.section_text(section_id).is_none() {
        return Err(CliError::UnknownSection(section_id.to_owned()));
    }
    sync.edit_section(section_id, text);
    sync.flush().await;
    Ok(())
}

async fn run_history(ctx: &CliContext, history: HistoryCommand) -> Result<(), CliError> {
    let connection = ctx.connection();
    let (idea_id, action, assume_yes) = match history.command {
        HistorySubcommand::List { idea_id } => (idea_id, None, false),
        HistorySubcommand::View { idea_id, entry_id } => (idea_id, Some(HistoryAction::View(entry_id)), false),
        HistorySubcommand::Revert { idea_id, entry_id, yes } => {
            (idea_id, Some(HistoryAction::Revert(entry_id)), yes)
        }
    };

    let surface = Arc::new(TerminalSurface::new(assume_yes, true));
    let sync = ctx.attach(&idea_id, &connection, Arc::clone(&surface));
    let result = match &action {
        None => sync.load_history().await,
        Some(action) => action.dispatch(&sync).await,
    };
    sync.teardown();
    result.map_err(CliError::from)
}

// =============================================================================
// TERMINAL SURFACE
// =============================================================================

/// Prints renders to stdout, alerts to stderr, and prompts on stdin.
struct TerminalSurface {
    memory: MemorySurface,
    assume_yes: bool,
    print_sections: bool,
}

impl TerminalSurface {
    fn new(assume_yes: bool, print_sections: bool) -> Self {
        Self { memory: MemorySurface::new(), assume_yes, print_sections }
    }
}

impl EditorSurface for TerminalSurface {
    fn render_sections(&self, sections: &[Section]) {
        self.memory.render_sections(sections);
        if self.print_sections {
            for section in sections {
                println!("{}\t{}", section.id, section.text);
            }
        }
    }

    fn section_text(&self, section_id: &str) -> Option<String> {
        self.memory.section_text(section_id)
    }

    fn replace_text(&self, section_id: &str, text: &str) {
        self.memory.replace_text(section_id, text);
    }

    fn has_focus(&self, section_id: &str) -> bool {
        self.memory.has_focus(section_id)
    }

    fn caret(&self, section_id: &str) -> Option<Caret> {
        self.memory.caret(section_id)
    }

    fn set_caret(&self, section_id: &str, caret: Caret) {
        self.memory.set_caret(section_id, caret);
    }

    fn render_history(&self, rows: &[HistoryRow]) {
        for row in rows {
            println!("{}\t{}", row.id, row.label);
        }
    }

    fn show_snapshot(&self, entry: &HistoryEntry) {
        println!("{}", entry.text.as_deref().unwrap_or_default());
    }

    fn alert(&self, message: &str) {
        eprintln!("error: {message}");
    }

    fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!("{message} [y/N] ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}
