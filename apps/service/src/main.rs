use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};

use ccc_service::config::Config;
use ccc_service::database::repository::SETTING_OUTAGE_THRESHOLD;
use ccc_service::orchestrator::Orchestrator;
use ccc_service::pool::open_local_pool;
use ccc_service::registry::EndpointRegistry;

const POOL_SIZE: usize = 16;

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), version, about = "Shared-building ISP connectivity monitor")]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/ccc/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Database file, overrides config and CCC_DB_PATH
    #[arg(long)]
    db: Option<PathBuf>,
    /// ASN rule JSON, overrides config and CCC_ISP_CONFIG
    #[arg(long)]
    isp_config: Option<PathBuf>,
    /// Use raw ICMP sockets for ping
    #[arg(long)]
    privileged: bool,
    /// Seconds between monitoring cycles
    #[arg(long)]
    interval: Option<u64>,
    #[arg(long)]
    expire_days: Option<u64>,
    #[arg(long, env = "CCC_LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitoring service (default)
    Run,
    /// Print the effective configuration
    Config,
    /// Classify an address by ISP
    Classify { address: String },
    /// Register an address for monitoring
    Register { address: String },
    /// Add an address regardless of the allow-list
    Add {
        address: String,
        /// ISP name to record instead of classifying the address
        #[arg(long)]
        isp: Option<String>,
    },
    /// Delete an endpoint by id
    Delete { id: String },
    /// List every endpoint with its address and probe mode
    List,
    /// Per-ISP endpoint counts, probe modes, uptime and recent events
    Status {
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
    /// Store a runtime outage threshold in the settings table
    SetThreshold { value: f64 },
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::from_config(self.config.as_ref())?;
        config.apply_env_overrides()?;

        if let Some(db) = &self.db {
            config.database.path = db.clone();
        }
        if let Some(path) = &self.isp_config {
            config.isp.rules_path = Some(path.clone());
        }
        if self.privileged {
            config.monitoring.privileged = true;
        }
        if let Some(interval) = self.interval {
            config.monitoring.cycle_interval_seconds = interval;
        }
        if let Some(days) = self.expire_days {
            config.retention.expire_days = days;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logger::init_with_level(args.log_level);

    let config = args.load_config()?;
    let command = args.command.unwrap_or(Command::Run);
    if let Command::Config = command {
        println!("{config}");
        return Ok(());
    }

    let db_path = config.database.path.to_string_lossy().to_string();
    let pool = open_local_pool(&db_path, POOL_SIZE)
        .await
        .with_context(|| format!("Failed to open database {db_path}"))?;
    let orchestrator = Orchestrator::new(config, pool).await?;

    match command {
        Command::Run | Command::Config => run(orchestrator).await,
        Command::Classify { address } => {
            let address = EndpointRegistry::parse_address(&address)?;
            let classifier = orchestrator.classifier();
            let isp = classifier.classify_isp(address).await;
            println!("{address}: {isp} (allowed: {})", classifier.is_allowed(&isp));
            Ok(())
        }
        Command::Register { address } => {
            let address = EndpointRegistry::parse_address(&address)?;
            let registration = orchestrator.registry().register(address).await?;
            let endpoint = &registration.endpoint;
            if registration.already_registered {
                println!("Already registered as {} ({})", endpoint.id, endpoint.isp);
            } else {
                println!("Registered {} ({})", endpoint.id, endpoint.isp);
            }
            Ok(())
        }
        Command::Add { address, isp } => {
            let address = EndpointRegistry::parse_address(&address)?;
            let registration = orchestrator.registry().add(address, isp).await?;
            let endpoint = &registration.endpoint;
            if registration.already_registered {
                println!("Already present as {} ({})", endpoint.id, endpoint.isp);
            } else {
                println!("Added {} ({})", endpoint.id, endpoint.isp);
            }
            Ok(())
        }
        Command::Delete { id } => {
            anyhow::ensure!(orchestrator.registry().delete(&id).await?, "no endpoint with id {id}");
            println!("Deleted {id}");
            Ok(())
        }
        Command::List => print_endpoints(&orchestrator).await,
        Command::Status { hours } => {
            print_status(&orchestrator, Duration::from_secs(hours.saturating_mul(3600))).await
        }
        Command::SetThreshold { value } => {
            anyhow::ensure!((0.0..=1.0).contains(&value), "threshold must be between 0 and 1");
            orchestrator.database().set_setting(SETTING_OUTAGE_THRESHOLD, &value.to_string()).await?;
            println!("Outage threshold set to {value}");
            Ok(())
        }
    }
}

async fn run(mut orchestrator: Orchestrator) -> Result<()> {
    info!("Starting connectivity monitor...");
    orchestrator.start()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    let monitor = orchestrator.monitor();
    let ran_for = monitor.start_time().elapsed().unwrap_or_default();
    info!(
        "Shutdown signal received after {}s and {} cycles",
        ran_for.as_secs(),
        monitor.total_cycles_completed()
    );
    orchestrator.shutdown().await;
    Ok(())
}

fn format_time(time: std::time::SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).format("%Y-%m-%d %H:%M:%S").to_string()
}

async fn print_endpoints(orchestrator: &Orchestrator) -> Result<()> {
    println!(
        "{:<22} {:<16} {:<24} {:<12} {:<20} {}",
        "id", "address", "ISP", "status", "last seen", "probe"
    );
    for endpoint in orchestrator.registry().list().await? {
        let probe = match (endpoint.use_hop, endpoint.monitored_hop) {
            (true, Some(hop)) => format!("hop {} ({} away)", hop, endpoint.hop_number),
            _ => "direct".to_string(),
        };
        println!(
            "{:<22} {:<16} {:<24} {:<12} {:<20} {}",
            endpoint.id,
            endpoint.address.to_string(),
            endpoint.isp,
            endpoint.status.to_string(),
            format_time(endpoint.last_seen),
            probe
        );
    }
    Ok(())
}

async fn print_status(orchestrator: &Orchestrator, window: Duration) -> Result<()> {
    let database = orchestrator.database();

    println!("{:<32} {:>6} {:>6} {:>6} {:>8}", "ISP", "total", "up", "down", "unknown");
    for stats in database.isp_stats().await? {
        println!(
            "{:<32} {:>6} {:>6} {:>6} {:>8}",
            stats.name, stats.total, stats.up, stats.down, stats.unknown
        );
    }

    let metrics = database.endpoint_metrics().await?;
    let shared_hops = database.shared_hop_count().await.unwrap_or_else(|e| {
        error!("Failed to count shared hops: {}", e);
        0
    });
    println!(
        "\nEndpoints: {} direct, {} via hop ({} shared hops)",
        metrics.direct, metrics.hop_monitored, shared_hops
    );

    let history = database.uptime_history(window).await?;
    if let Some(latest) = history.last() {
        let mean = history.iter().map(|s| s.uptime_pct()).sum::<f64>() / history.len() as f64;
        println!(
            "\nUptime: {:.1}% now, {:.1}% over {} snapshots",
            latest.uptime_pct(),
            mean,
            history.len()
        );
    }

    println!("\nRecent events:");
    for event in database.recent_events(window, 20).await? {
        println!(
            "  {} {:<10} {}",
            format_time(event.timestamp),
            event.event_type.to_string(),
            event.message
        );
    }
    Ok(())
}
