//! # Textcast: Scheduled SMS Delivery Engine
//!
//! Usage:
//!   textcast serve                       # Gateway + scanner + retry controller
//!   textcast scan                        # One scanner pass, then exit
//!   textcast retry                       # One retry pass, then exit
//!   textcast failed --owner <id>         # List failed deliveries
//!   textcast key create --owner <id>     # Issue an API key (printed once)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use textcast_core::config::TextcastConfig;
use textcast_gateway::{ApiKeyDb, AppState};
use textcast_scheduler::{MessageDb, RetryPolicy, SchedulerEngine};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "textcast", version, about = "📨 Textcast: Scheduled SMS Delivery Engine")]
struct Cli {
    /// Config file (defaults to $TEXTCAST_CONFIG or ~/.textcast/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway and the delivery loops
    Serve {
        /// Override the gateway port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one scanner pass and wait for its deliveries
    Scan,
    /// Run one retry pass and wait for its deliveries
    Retry,
    /// List failed deliveries
    Failed {
        /// Only this owner's messages
        #[arg(long)]
        owner: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Register or update an owner
    Owner {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Phone number study messages are sent to
        #[arg(long)]
        phone: Option<String>,
    },
    /// Manage API keys
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Issue a new key for an owner
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "default")]
        label: String,
        /// Days until the key expires
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// Replace a key; the old one keeps working for the grace period
    Rotate {
        id: String,
        #[arg(long, default_value = "24")]
        grace_hours: i64,
    },
    /// Revoke a key immediately
    Revoke { id: String },
    /// List an owner's keys
    List {
        #[arg(long)]
        owner: String,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn open_db(config: &TextcastConfig) -> Result<(Arc<MessageDb>, String)> {
    let db_path = expand_path(&config.database.path);
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = MessageDb::open(Path::new(&db_path))?;
    Ok((Arc::new(db), db_path))
}

/// API keys live in the same database file as the messages.
fn open_keys(db_path: &str) -> Result<Arc<ApiKeyDb>> {
    Ok(Arc::new(ApiKeyDb::open(Path::new(db_path))?))
}

/// Start the engine, run one pass, then let the workers drain the queue.
async fn run_once<T: std::fmt::Debug>(
    config: &TextcastConfig,
    db: Arc<MessageDb>,
    pass: impl FnOnce(&SchedulerEngine) -> textcast_core::Result<Option<T>>,
) -> Result<()> {
    let transport = textcast_channels::sms::from_config(&config.transport)?;
    let (engine, workers) = SchedulerEngine::start(
        db,
        transport,
        config.scheduler.clone(),
        &config.retry,
        &config.transport.default_country_code,
    );
    let report = pass(engine.as_ref())?;
    // Dropping the engine closes the queue, so the workers exit once drained
    drop(engine);
    workers.await?;
    match report {
        Some(report) => println!("✅ {report:?}"),
        None => println!("⏭️  Skipped: the job ran less than an interval ago"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "textcast=debug,textcast_scheduler=debug,textcast_gateway=debug,tower_http=debug"
    } else {
        "textcast=info,textcast_scheduler=info,textcast_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => TextcastConfig::load_from(path)?,
        None => TextcastConfig::load()?,
    };
    let (db, db_path) = open_db(&config)?;

    match cli.command {
        Command::Serve { port } => {
            let mut gateway = config.gateway.clone();
            if let Some(port) = port {
                gateway.port = port;
            }
            let keys = open_keys(&db_path)?;
            let state = Arc::new(AppState::new(
                db.clone(),
                keys,
                RetryPolicy::from_config(&config.retry),
            ));

            println!("📨 Textcast v{}", env!("CARGO_PKG_VERSION"));
            println!("   🌐 Gateway:   http://{}:{}", gateway.host, gateway.port);
            println!("   🗄️  Database:  {db_path}");
            println!("   📡 Transport: {}", config.transport.kind);

            let mut handles = Vec::new();
            let _engine = if config.scheduler.enabled {
                let transport = textcast_channels::sms::from_config(&config.transport)?;
                let (engine, workers) = SchedulerEngine::start(
                    db,
                    transport,
                    config.scheduler.clone(),
                    &config.retry,
                    &config.transport.default_country_code,
                );
                println!(
                    "   ⏰ Scanner:   every {}s (retry every {}s)",
                    config.scheduler.scan_interval_secs, config.retry.interval_secs
                );
                handles.push(workers);
                handles.extend(engine.spawn());
                Some(engine)
            } else {
                println!("   ⏸️  Scheduler disabled: pull API only");
                None
            };
            println!();

            textcast_gateway::start(&gateway, state).await?;
            for handle in handles {
                handle.abort();
            }
        }
        Command::Scan => run_once(&config, db, |e| e.scan_once(Utc::now())).await?,
        Command::Retry => run_once(&config, db, |e| e.retry_once(Utc::now())).await?,
        Command::Failed { owner, json } => {
            let policy = RetryPolicy::from_config(&config.retry);
            let failed = db.failed_messages(owner.as_deref(), Utc::now(), &policy)?;
            if json {
                let rows: Vec<_> = failed
                    .iter()
                    .map(|f| {
                        serde_json::json!({
                            "kind": f.message.kind.as_str(),
                            "id": f.message.id,
                            "ownerId": f.owner_id,
                            "summary": f.summary,
                            "attempts": f.delivery.attempts,
                            "reason": f.delivery.failure_reason.map(|r| r.as_str()),
                            "error": f.delivery.error,
                            "retryEligible": f.retry_eligible,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if failed.is_empty() {
                println!("✅ No failed deliveries");
            } else {
                for f in &failed {
                    println!(
                        "❌ {} [{}] attempts={} reason={} retry={} {}",
                        f.message,
                        f.owner_id,
                        f.delivery.attempts,
                        f.delivery.failure_reason.map_or("-", |r| r.as_str()),
                        if f.retry_eligible { "yes" } else { "no" },
                        f.delivery.error.as_deref().unwrap_or(""),
                    );
                }
            }
        }
        Command::Owner { id, name, phone } => {
            db.upsert_owner(&id, &name, phone.as_deref())?;
            println!("✅ Owner {id} saved");
        }
        Command::Key { action } => {
            let keys = open_keys(&db_path)?;
            let now = Utc::now();
            match action {
                KeyAction::Create { owner, label, expires_in_days } => {
                    let expires_at = expires_in_days.map(|d| now + Duration::days(d));
                    let issued = keys.issue_key(&owner, &label, expires_at)?;
                    println!("🔑 API key created for {owner}");
                    println!("   ID:  {}", issued.id);
                    println!("   Key: {}", issued.key);
                    println!("   ⚠️  Store it now: it cannot be shown again.");
                }
                KeyAction::Rotate { id, grace_hours } => {
                    let issued = keys.rotate(&id, Duration::hours(grace_hours), now)?;
                    println!("🔑 Key {id} rotated (old key valid for {grace_hours}h)");
                    println!("   ID:  {}", issued.id);
                    println!("   Key: {}", issued.key);
                }
                KeyAction::Revoke { id } => {
                    if keys.revoke(&id)? {
                        println!("✅ Key {id} revoked");
                    } else {
                        println!("⚠️  No key with id {id}");
                    }
                }
                KeyAction::List { owner } => {
                    for k in keys.list_for_owner(&owner)? {
                        println!(
                            "{} {:<12} usable={} verified={} last_used={}",
                            k.id,
                            k.label,
                            k.is_usable(now),
                            k.verified_at.map_or("never".into(), |t| t.to_rfc3339()),
                            k.last_used_at.map_or("never".into(), |t| t.to_rfc3339()),
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
