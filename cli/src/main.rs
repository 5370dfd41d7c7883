use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use itinerary_sync::net::types::{CHANNEL_MESSAGE, CHANNEL_STATE};
use itinerary_sync::services::mutation::move_item;
use itinerary_sync::{
    ApiClient, ApiError, ConfigError, ConnectionError, ConnectionManager, HistoryCommand, HistoryError,
    HistoryOutcome, MessageKind, MutationCoordinator, MutationError, RevisionPointer, RevisionTracker, SyncConfig,
    SyncEvent,
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("chat message not sent; session for {0} is not connected")]
    NotSent(String),
    #[error("timed out after {0:?} waiting for a chat response")]
    ChatTimeout(Duration),
    #[error("cannot move activity {from} to {to} in a day of {len}")]
    InvalidMove { from: usize, to: usize, len: usize },
    #[error("failed to write JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "itinerary", about = "Itinerary real-time sync CLI")]
struct Cli {
    /// Bearer token for REST calls and the STOMP handshake.
    #[arg(long, env = "ITINERARY_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Explicit STOMP-over-WebSocket endpoint.
    #[arg(long, env = "ITINERARY_WS_URL")]
    ws_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream state changes and inbound messages for an itinerary.
    Watch(WatchArgs),
    /// Send a chat message to the itinerary agent.
    Chat(ChatArgs),
    /// List the revision history.
    History { resource_id: String },
    Undo { resource_id: String },
    Redo { resource_id: String },
    /// Persist a new activity order for one day.
    Reorder(ReorderArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    resource_id: String,

    #[arg(long, help = "Stop after this many messages")]
    count: Option<usize>,
}

#[derive(Args, Debug)]
struct ChatArgs {
    resource_id: String,
    message: String,

    #[arg(long, default_value_t = 30, help = "Seconds to wait for a chat response; 0 to not wait")]
    wait_secs: u64,
}

#[derive(Args, Debug)]
struct ReorderArgs {
    resource_id: String,

    #[arg(long)]
    day: String,

    /// Activity ids in order. With --move-from/--move-to, the current order.
    #[arg(long, value_delimiter = ',', required = true)]
    activities: Vec<String>,

    #[arg(long, requires = "move_to")]
    move_from: Option<usize>,

    #[arg(long, requires = "move_from")]
    move_to: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;
    if cli.token.is_some() {
        config.auth_token = cli.token;
    }
    if let Some(ws_url) = cli.ws_url {
        config.set_ws_url(&ws_url)?;
    }

    match cli.command {
        Command::Watch(args) => run_watch(config, args).await,
        Command::Chat(args) => run_chat(config, args).await,
        Command::History { resource_id } => run_history(&config, &resource_id).await,
        Command::Undo { resource_id } => run_step(&config, &resource_id, HistoryCommand::Undo).await,
        Command::Redo { resource_id } => run_step(&config, &resource_id, HistoryCommand::Redo).await,
        Command::Reorder(args) => run_reorder(&config, args).await,
    }
}

// =============================================================================
// REAL-TIME
// =============================================================================

async fn run_watch(config: SyncConfig, args: WatchArgs) -> Result<(), CliError> {
    let manager = ConnectionManager::with_websocket(config);
    let mut states = manager.events().listen(CHANNEL_STATE);
    let mut messages = manager.events().listen(CHANNEL_MESSAGE);

    manager.connect(&args.resource_id).await?;

    let mut seen = 0_usize;
    loop {
        tokio::select! {
            Some(event) = states.recv() => {
                if let SyncEvent::StateChanged { resource_id, state } = event {
                    eprintln!("{resource_id}: {state}");
                }
            }
            Some(event) = messages.recv() => {
                if let Some(msg) = event.as_message() {
                    println!("{}", serde_json::to_string(&msg.to_json())?);
                    seen += 1;
                    if args.count.is_some_and(|limit| seen >= limit) {
                        break;
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            else => break,
        }
    }

    manager.disconnect(&args.resource_id);
    Ok(())
}

async fn run_chat(config: SyncConfig, args: ChatArgs) -> Result<(), CliError> {
    let manager = ConnectionManager::with_websocket(config);
    let mut responses = manager.events().listen(MessageKind::ChatResponse.channel());

    manager.connect(&args.resource_id).await?;
    if !manager.send_chat(&args.resource_id, &args.message) {
        manager.disconnect(&args.resource_id);
        return Err(CliError::NotSent(args.resource_id));
    }

    let result = if args.wait_secs == 0 {
        Ok(())
    } else {
        let wait = Duration::from_secs(args.wait_secs);
        match tokio::time::timeout(wait, responses.recv()).await {
            Ok(Some(event)) => match event.as_message() {
                Some(msg) => print_json(&msg.payload),
                None => Ok(()),
            },
            Ok(None) | Err(_) => Err(CliError::ChatTimeout(wait)),
        }
    };

    manager.disconnect(&args.resource_id);
    result
}

// =============================================================================
// HISTORY
// =============================================================================

async fn run_history(config: &SyncConfig, resource_id: &str) -> Result<(), CliError> {
    let api = ApiClient::new(config)?;
    let revisions = api.list_revisions(resource_id).await?;
    let pointer = RevisionPointer::from_revisions(&revisions);
    print_json(&json!({
        "revisions": revisions,
        "pointer": pointer_json(pointer),
    }))
}

async fn run_step(config: &SyncConfig, resource_id: &str, command: HistoryCommand) -> Result<(), CliError> {
    let tracker = RevisionTracker::new(Arc::new(ApiClient::new(config)?), config.request_timeout);
    tracker.refresh(resource_id).await?;

    let outcome = tracker.run(resource_id, command).await?;
    let report = match outcome {
        HistoryOutcome::Applied(pointer) => json!({ "applied": command.as_str(), "pointer": pointer_json(pointer) }),
        HistoryOutcome::Skipped(reason) => json!({
            "skipped": command.as_str(),
            "reason": format!("{reason:?}"),
            "pointer": pointer_json(tracker.pointer(resource_id)),
        }),
    };
    print_json(&report)
}

fn pointer_json(pointer: RevisionPointer) -> Value {
    json!({
        "currentVersion": pointer.current_version,
        "canUndo": pointer.can_undo,
        "canRedo": pointer.can_redo,
    })
}

// =============================================================================
// REORDER
// =============================================================================

async fn run_reorder(config: &SyncConfig, args: ReorderArgs) -> Result<(), CliError> {
    let (baseline, proposed) = match (args.move_from, args.move_to) {
        (Some(from), Some(to)) => {
            let len = args.activities.len();
            let moved = move_item(&args.activities, from, to).ok_or(CliError::InvalidMove { from, to, len })?;
            (vec![(args.day.clone(), args.activities)], moved)
        }
        _ => (Vec::new(), args.activities),
    };

    let sink = Arc::new(ApiClient::new(config)?);
    let coordinator = MutationCoordinator::new(args.resource_id, baseline, sink, config.request_timeout);
    coordinator.apply_locally(&args.day, proposed);

    let committed = coordinator.save().await?;
    let days: Vec<Value> = committed
        .iter()
        .map(|change| json!({ "dayId": change.entity_id, "activityIds": change.proposed_state }))
        .collect();
    print_json(&json!({ "committed": days }))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
