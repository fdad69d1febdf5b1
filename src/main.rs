//! Binary entrypoint for the ftnbbs CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml` and create the queue directories
//! - `server` - run the binkp listener, with periodic polling and crashmail
//! - `poll [--address <addr>]` - call one uplink or all enabled uplinks
//! - `test-connection <host>` - plain TCP reachability check
//! - `inbound process|retry|cleanup|errors` - work the inbound packet queue
//! - `crashmail process|list|retry|queue` - work the crash delivery queue
//! - `status` - queue sizes, crashmail summary and recent sessions
//!
//! See the library crate docs for module‑level details: `ftnbbs::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use ftnbbs::binkp::{BinkpClient, BinkpServer};
use ftnbbs::config::{Config, DEFAULT_BINKP_PORT};
use ftnbbs::crashmail::{CrashDelivery, CrashmailStatus};
use ftnbbs::ftn::{FtnAddress, FtsPacketStore};
use ftnbbs::metrics;
use ftnbbs::nodelist::{NodelistManager, StaticNodelist};
use ftnbbs::queue::{InboundQueue, OutboundQueue};
use ftnbbs::sessionlog::{FileSessionLog, NullSessionLog, SessionLog};
use ftnbbs::storage::MessageStore;

/// How often the server works the inbound and crashmail queues.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "ftnbbs")]
#[command(about = "FidoNet binkp mailer and packet queues for a BBS")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Run the binkp server
    Server {
        /// Do not poll uplinks on the configured interval
        #[arg(long)]
        no_poll: bool,
    },
    /// Poll uplinks for mail
    Poll {
        /// Poll only this uplink address
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Check that a binkp host accepts TCP connections
    TestConnection {
        host: String,
        #[arg(short, long, default_value_t = DEFAULT_BINKP_PORT)]
        port: u16,
        /// Seconds to wait for the connection
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
    /// Inbound packet queue
    Inbound {
        #[command(subcommand)]
        action: InboundAction,
    },
    /// Crash delivery queue
    Crashmail {
        #[command(subcommand)]
        action: CrashmailAction,
    },
    /// Show queue and session status
    Status,
}

#[derive(Subcommand)]
enum InboundAction {
    /// Import every waiting packet
    Process,
    /// Move a file from error/ back into the queue and import again
    Retry { file: String },
    /// Delete error files older than the given age
    Cleanup {
        #[arg(long, default_value_t = 168)]
        max_age_hours: u64,
    },
    /// List files parked in error/
    Errors,
}

#[derive(Subcommand)]
enum CrashmailAction {
    /// Attempt due deliveries
    Process {
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show every queue item
    List,
    /// Reset a failed item so it is attempted again
    Retry { netmail_id: String },
    /// Queue a stored outbound netmail for crash delivery
    Queue { netmail_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(None, cli.verbose);
        return init_config(&cli.config).await;
    }

    let config = Config::load(&cli.config).await?;
    init_logging(Some(&config), cli.verbose);
    let config = Arc::new(config);

    match cli.command {
        Commands::Init => {}
        Commands::Server { no_poll } => run_server(config, !no_poll).await?,
        Commands::Poll { address } => {
            let client = BinkpClient::new(config.clone()).with_session_log(session_log(&config));
            let reports = match address {
                Some(a) => {
                    let wanted = FtnAddress::parse(&a).map_err(|e| anyhow!("{}: {}", a, e))?;
                    let uplink = config
                        .uplink_by_address(&wanted)
                        .ok_or_else(|| anyhow!("{} is not a configured uplink", a))?;
                    vec![client.poll_uplink(uplink).await]
                }
                None => client.poll_all_uplinks().await,
            };
            println!("{}", serde_json::to_string_pretty(&reports)?);
            let report = inbound_queue(&config).process(&packet_store(&config)?)?;
            if report.processed + report.failed > 0 {
                info!("Imported {} packet(s), {} failed", report.processed, report.failed);
            }
            if reports.iter().any(|r| !r.success) {
                std::process::exit(1);
            }
        }
        Commands::TestConnection { host, port, timeout } => {
            let result = BinkpClient::test_connection(&host, port, Duration::from_secs(timeout)).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.reachable {
                std::process::exit(1);
            }
        }
        Commands::Inbound { action } => {
            let queue = inbound_queue(&config);
            match action {
                InboundAction::Process => {
                    let report = queue.process(&packet_store(&config)?)?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                InboundAction::Retry { file } => {
                    let report = queue.retry(&file, &packet_store(&config)?)?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                InboundAction::Cleanup { max_age_hours } => {
                    let removed = queue.cleanup(max_age_hours)?;
                    println!("Removed {} error file(s)", removed);
                }
                InboundAction::Errors => {
                    println!("{}", serde_json::to_string_pretty(&queue.list_errors()?)?);
                }
            }
        }
        Commands::Crashmail { action } => {
            let crash = crash_delivery(&config)?;
            match action {
                CrashmailAction::Process { limit } => {
                    let limit = limit.unwrap_or(config.crashmail.batch_limit);
                    let stats = crash.process_queue(limit).await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                CrashmailAction::List => {
                    println!("{}", serde_json::to_string_pretty(&crash.list()?)?);
                }
                CrashmailAction::Retry { netmail_id } => {
                    let item = crash.retry(&netmail_id).await?;
                    println!("{}", serde_json::to_string_pretty(&item)?);
                }
                CrashmailAction::Queue { netmail_id } => {
                    let store = MessageStore::new(config.data_dir())?;
                    let message = store
                        .get(&netmail_id)?
                        .ok_or_else(|| anyhow!("no stored netmail {}", netmail_id))?;
                    if crash.queue(&message).await? {
                        println!("Queued {} for crash delivery to {}", netmail_id, message.message.dest);
                    } else {
                        println!("{} is already queued", netmail_id);
                    }
                }
            }
        }
        Commands::Status => show_status(&config).await?,
    }

    Ok(())
}

async fn init_config(path: &str) -> Result<()> {
    if std::path::Path::new(path).exists() {
        return Err(anyhow!("{} already exists; not overwriting", path));
    }
    Config::create_default(path).await?;
    let cfg = Config::default();
    for dir in [cfg.data_dir(), cfg.inbound_dir(), cfg.outbound_dir()] {
        tokio::fs::create_dir_all(&dir).await?;
    }
    info!("Configuration file created at {}", path);
    Ok(())
}

fn session_log(config: &Config) -> Arc<dyn SessionLog> {
    match &config.logging.session_log {
        Some(path) => Arc::new(FileSessionLog::new(path)),
        None => Arc::new(NullSessionLog),
    }
}

fn inbound_queue(config: &Config) -> InboundQueue {
    InboundQueue::new(config.inbound_dir())
}

fn packet_store(config: &Config) -> Result<FtsPacketStore> {
    let origin = config
        .primary_address()
        .ok_or_else(|| anyhow!("system.addresses is empty"))?;
    let messages = MessageStore::new(config.data_dir())?;
    Ok(FtsPacketStore::new(origin, config.outbound_dir(), messages))
}

fn crash_delivery(config: &Arc<Config>) -> Result<CrashDelivery> {
    let nodelist: Arc<dyn NodelistManager> = match &config.nodelist.file {
        Some(path) => Arc::new(StaticNodelist::load(std::path::Path::new(path))?),
        None => {
            warn!("No nodelist configured; crash delivery has no routes");
            Arc::new(StaticNodelist::default())
        }
    };
    Ok(CrashDelivery::new(
        config.clone(),
        MessageStore::new(config.data_dir())?,
        Arc::new(packet_store(config)?),
        nodelist,
    )
    .with_session_log(session_log(config)))
}

async fn run_server(config: Arc<Config>, poll: bool) -> Result<()> {
    info!("Starting ftnbbs v{}", env!("CARGO_PKG_VERSION"));
    let log = session_log(&config);
    let mut server = BinkpServer::new(config.clone()).with_session_log(log.clone());
    server.start().await?;
    let handle = server.handle();

    let crash = if config.crashmail.enabled {
        Some(crash_delivery(&config)?)
    } else {
        None
    };
    let store = packet_store(&config)?;
    let inbound = inbound_queue(&config);
    let client = BinkpClient::new(config.clone()).with_session_log(log);

    let poll_every = match config.binkp.poll_interval_minutes {
        0 => None,
        m if poll => Some(Duration::from_secs(m * 60)),
        _ => None,
    };

    let maintenance = async {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
        let mut last_poll: Option<tokio::time::Instant> = None;
        loop {
            tick.tick().await;
            if let Some(every) = poll_every {
                if last_poll.map(|t| t.elapsed() >= every).unwrap_or(true) {
                    client.poll_all_uplinks().await;
                    last_poll = Some(tokio::time::Instant::now());
                }
            }
            match inbound.process(&store) {
                Ok(r) if r.processed + r.failed > 0 => {
                    info!("Inbound: {} imported, {} failed", r.processed, r.failed)
                }
                Ok(_) => {}
                Err(e) => error!("Inbound processing failed: {:#}", e),
            }
            if let Some(crash) = &crash {
                if let Err(e) = crash.process_queue(config.crashmail.batch_limit).await {
                    error!("Crashmail processing failed: {:#}", e);
                }
            }
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
        handle.stop();
    };

    tokio::select! {
        result = server.run() => result?,
        _ = async { tokio::join!(maintenance, shutdown) } => {}
    }
    info!("Counters: {}", serde_json::to_string(&metrics::snapshot())?);
    Ok(())
}

async fn show_status(config: &Arc<Config>) -> Result<()> {
    println!("System:     {} ({})", config.system.name, config.system.addresses.join(", "));
    println!(
        "Listener:   {}:{} (max {} connections)",
        config.binkp.bind_address, config.binkp.port, config.binkp.max_connections
    );
    println!("Uplinks:    {} enabled of {}", config.enabled_uplinks().len(), config.uplinks.len());

    let outbound = OutboundQueue::new(config.outbound_dir());
    let inbound = inbound_queue(config);
    println!("Outbound:   {} packet(s)", outbound.list()?.len());
    println!(
        "Inbound:    {} packet(s), {} in error/",
        inbound.list()?.len(),
        inbound.list_errors()?.len()
    );

    let items = crash_delivery(config)?.list()?;
    let count = |s: CrashmailStatus| items.iter().filter(|i| i.status == s).count();
    println!(
        "Crashmail:  {} pending, {} sent, {} failed",
        count(CrashmailStatus::Pending) + count(CrashmailStatus::Attempting),
        count(CrashmailStatus::Sent),
        count(CrashmailStatus::Failed)
    );

    if let Some(path) = &config.logging.session_log {
        let recent = FileSessionLog::new(path).recent(5)?;
        if !recent.is_empty() {
            println!("Recent sessions:");
            for r in recent {
                println!(
                    "  {} {} {:<20} {} sent, {} received{}",
                    r.started_at.format("%Y-%m-%d %H:%M"),
                    r.role,
                    r.remote_address.as_deref().unwrap_or("-"),
                    r.files_sent.len(),
                    r.files_received.len(),
                    r.error.map(|e| format!(" ({})", e)).unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| std::fs::OpenOptions::new().create(true).append(true).open(path).ok());
    let security_path = config.and_then(|c| c.logging.security_file.clone());

    match log_file {
        Some(f) => {
            let file = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Foreground runs also echo to the console.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if record.target() == "security" {
                    if let Some(ref sec_path) = security_path {
                        if let Ok(mut sf) = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(sec_path)
                        {
                            let _ = writeln!(sf, "{}", line);
                        }
                    }
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
