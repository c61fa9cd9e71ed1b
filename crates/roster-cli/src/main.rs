mod logging;
mod render;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use roster_core::{
    filter_active, Clock, Identity, PresenceConfig, PresenceView, RecordFilter, SystemClock,
};
use roster_engine::{spawn_session_gate, GateSignals, PresenceObserver, PresenceService};
use roster_store::{RecordStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "roster")]
#[command(about = "Who is online, kept fresh by heartbeats", long_about = None)]
struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[arg(long, global = true, env = "ROSTER_LOG_DIR")]
    log_dir: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the roster and keep watching it
    Watch(WatchArgs),
    /// Print who is online right now
    List(ListArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// Presence database shared by every client
    #[arg(long, env = "ROSTER_DB")]
    db: PathBuf,
    #[arg(long, default_value_t = roster_core::INACTIVE_THRESHOLD.as_secs())]
    threshold_secs: u64,
}

#[derive(Args)]
struct WatchArgs {
    #[command(flatten)]
    store: StoreArgs,
    #[arg(long, env = "ROSTER_LOGIN")]
    login: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, default_value_t = roster_core::HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_secs: u64,
    /// How often to look for writes made by other processes
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
}

#[derive(Args)]
struct ListArgs {
    #[command(flatten)]
    store: StoreArgs,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let debug = cli.debug || logging::env_true("ROSTER_DEBUG");
    let _log_guard = logging::init_logging(debug, cli.log_dir.as_deref(), &run_id());

    match cli.command {
        Commands::Watch(args) => watch_roster(args).await,
        Commands::List(args) => list_roster(args).await,
    }
}

fn run_id() -> String {
    format!("{}-{}", Local::now().format("%Y%m%d-%H%M%S"), std::process::id())
}

fn open_store(args: &StoreArgs) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("Failed to open presence database {}", args.db.display()))?;
    Ok(Arc::new(store))
}

async fn watch_roster(args: WatchArgs) -> Result<()> {
    let config = PresenceConfig::with_intervals(
        Duration::from_secs(args.heartbeat_secs),
        Duration::from_secs(args.store.threshold_secs),
    );
    let identity = Identity::new(args.login.as_str(), args.name.unwrap_or_default())
        .context("A login id is required to join the roster")?;
    let me = identity.login_id.clone();

    let store = open_store(&args.store)?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = store
        .clone()
        .spawn_change_poller(Duration::from_millis(args.poll_ms.max(50)), stop_rx.clone());

    let service = PresenceService::new(store, Arc::new(SystemClock), config)
        .context("Invalid presence timing")?;
    let observer = service.observer();
    let renderer = tokio::spawn(render_loop(observer, me));

    let (_identity_tx, identity_rx) = watch::channel(Some(identity));
    let (visible_tx, visible_rx) = watch::channel(true);
    let gate = spawn_session_gate(
        service,
        GateSignals {
            identity: identity_rx,
            visible: visible_rx,
            shutdown: stop_rx,
        },
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "hide" => {
                        let _ = visible_tx.send(false);
                    }
                    "show" => {
                        let _ = visible_tx.send(true);
                    }
                    "quit" | "exit" => break,
                    "" => {}
                    other => eprintln!("unknown command: {other} (hide, show, quit)"),
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(event = "stdin_error", error = %err);
                    break;
                }
            },
        }
    }

    info!(event = "shutdown_requested");
    let _ = stop_tx.send(true);
    gate.await.context("Presence session task failed")?;
    renderer.abort();
    let _ = poller.await;
    Ok(())
}

async fn render_loop(mut observer: PresenceObserver, me: String) {
    while let Ok(view) = observer.changed().await {
        print_view(&view, &observer, &me);
    }
}

fn print_view(view: &PresenceView, observer: &PresenceObserver, me: &str) {
    let users = observer.online_users();
    println!("{}", render::render_roster(view, &users, Some(me), &Local));
}

async fn list_roster(args: ListArgs) -> Result<()> {
    let store = open_store(&args.store)?;
    let records = store
        .list(&RecordFilter::online())
        .await
        .context("Failed to load online users")?;
    let users = filter_active(
        &records,
        SystemClock.now(),
        Duration::from_secs(args.store.threshold_secs),
    );

    if args.json {
        let payload = serde_json::to_string_pretty(&users).context("Failed to encode roster")?;
        println!("{payload}");
    } else {
        print!(
            "{}",
            render::render_roster(&PresenceView::ready(users.clone()), &users, None, &Local)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_defaults_follow_presence_constants() {
        let cli = Cli::try_parse_from([
            "roster",
            "watch",
            "--db",
            "/tmp/roster.db",
            "--login",
            "ada@example.com",
        ])
        .expect("parse");
        let Commands::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(args.heartbeat_secs, 30);
        assert_eq!(args.store.threshold_secs, 120);
        assert_eq!(args.name, None);
    }

    #[test]
    fn list_accepts_json_and_global_flags() {
        let cli = Cli::try_parse_from([
            "roster",
            "list",
            "--db",
            "/tmp/roster.db",
            "--json",
            "--debug",
        ])
        .expect("parse");
        assert!(cli.debug);
        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };
        assert!(args.json);
    }

    #[tokio::test]
    async fn list_reads_records_written_by_another_client() {
        let file = tempfile::NamedTempFile::new().expect("temp db");
        let writer = SqliteStore::open(file.path()).expect("open writer");
        writer
            .create(roster_core::NewPresence::online(
                "ada",
                "ada@example.com",
                SystemClock.now(),
            ))
            .await
            .expect("create");

        let args = ListArgs {
            store: StoreArgs {
                db: file.path().to_path_buf(),
                threshold_secs: 120,
            },
            json: true,
        };
        list_roster(args).await.expect("list");
    }
}
