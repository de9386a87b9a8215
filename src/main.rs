//! WolfHA - MariaDB master/slave role agent
//!
//! Runs on each member of a two-node cluster and keeps the local database
//! services in the role the shared designation file asks for.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfha::alarm::{sender_from_config, AlarmNotifier, HealthWatch};
use wolfha::api::{AppState, HttpServer};
use wolfha::catalog::{CatalogSet, MariaDbCatalog};
use wolfha::config::AgentConfig;
use wolfha::driver::{ComputeDriver, DockerDriver};
use wolfha::error::Result;
use wolfha::peer::{PeerApi, PeerClient, RsyncTransport, SyncTransport};
use wolfha::reconcile::Reconciler;
use wolfha::service::{Catalog, ServiceRegistry};

/// WolfHA - MariaDB master/slave role agent
#[derive(Parser)]
#[command(name = "wolfha")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfha.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to [logging].level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfha.toml")]
        output: PathBuf,

        /// Shared designation file written by the cluster manager
        #[arg(long, default_value = "/var/local/share/cluster/cluster-info.json")]
        designation_file: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show agent information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins, then the flag, then the config file
    let logging = AgentConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(logging.level);
    init_logging(&level, &logging.format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init {
            output,
            designation_file,
        } => run_init(output, designation_file),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the agent
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfHA agent...");

    let config = match AgentConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!(
        "Watching designation {} every {} ms",
        config.node.designation_file.display(),
        config.node.tick_interval_ms
    );

    for dir in [config.data_dir(), config.backup_dir(), config.conf_dir(), config.endpoint_dir()] {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!("Failed to create directory {:?}: {}", dir, e);
            return Err(e.into());
        }
    }

    // Without a working driver there is nothing to manage
    let driver: Arc<dyn ComputeDriver> = match DockerDriver::connect(&config).await {
        Ok(d) => Arc::new(d),
        Err(e) => {
            tracing::error!("Failed to connect to the compute driver: {}", e);
            return Err(e);
        }
    };

    let registry = Arc::new(ServiceRegistry::new(config.node.catalogs.clone()));
    let peer: Arc<dyn PeerApi> = Arc::new(PeerClient::new(&config)?);
    let sync: Arc<dyn SyncTransport> = Arc::new(RsyncTransport::new(&config));

    let mut handlers = CatalogSet::new();
    for catalog in &config.node.catalogs {
        match catalog {
            Catalog::Mariadb => handlers.register(Arc::new(MariaDbCatalog::new(
                &config,
                driver.clone(),
                registry.clone(),
                peer.clone(),
                sync.clone(),
            ))),
        }
    }

    let reconciler = Arc::new(Reconciler::new(&config, driver.clone(), registry, handlers));
    match reconciler.seed_registry().await {
        Ok(count) => tracing::info!("Registered {} existing service(s)", count),
        Err(e) => tracing::warn!("Initial service listing failed: {}", e),
    }

    // Driver notifications
    let (event_tx, event_rx) = mpsc::channel(256);
    let watch_driver = driver.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_driver.watch(event_tx).await {
            tracing::error!("Service watch stopped: {}", e);
        }
    });
    tokio::spawn(reconciler.clone().consume_events(event_rx));

    // Reconciliation ticker; a tick still running when the next is due is dropped
    let tick_reconciler = reconciler.clone();
    let tick_interval = config.tick_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let reconciler = tick_reconciler.clone();
            tokio::spawn(async move {
                reconciler.tick(Utc::now()).await;
            });
        }
    });

    // Health watch
    let (notifier, _alarm_task) = AlarmNotifier::spawn(sender_from_config(&config.alarm)?);
    let health_reconciler = reconciler.clone();
    let threshold = config.alarm.failure_threshold;
    tokio::spawn(async move {
        let mut watch = HealthWatch::new(threshold);
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            let healthy = health_reconciler.health_status().await;
            let node = health_reconciler
                .current_designation()
                .await
                .map(|d| d.local_host)
                .unwrap_or_else(|| "local node".to_string());
            if let Some(alarm) = watch.observe(&node, healthy) {
                notifier.notify(alarm.title, alarm.content);
            }
        }
    });

    let server = HttpServer::new(
        config.api.clone(),
        AppState {
            reconciler,
            driver,
            sync,
        },
    );
    let api_enabled = config.api.enabled;
    let http = async {
        if api_enabled {
            server.start().await
        } else {
            tracing::info!("HTTP API disabled");
            std::future::pending::<Result<()>>().await
        }
    };

    tracing::info!("WolfHA agent running");
    tokio::select! {
        result = http => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
    }

    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, designation_file: PathBuf) -> Result<()> {
    let config_content = format!(
        r#"# WolfHA Configuration
# Generated configuration file

[node]
designation_file = "{designation}"
workspace = "/var/lib/wolfha"
tick_interval_ms = 2000
catalogs = ["mariadb"]

[api]
enabled = true
bind_address = "0.0.0.0:8080"

[peer]
# Port of the remote agent API (WOLFHA_NODE_PORT overrides)
port = 8080
status_timeout_secs = 30
backup_timeout_secs = 3600
connect_timeout_secs = 5

[failover]
retry_ceiling_secs = 1800
resync_window_hours = 72

[driver]
kind = "docker"
binary = "docker"
poll_interval_ms = 2000
exec_timeout_secs = 60
job_timeout_secs = 3600
label_prefix = "service."

[mariadb]
image = "mariadb:10.6.11"
root_user = "root"
root_password = "changeme"
port = 3306
binlog_marker = "xtrabackup_binlog_info"

[sync]
binary = "rsync"
password_file = "/etc/rsyncd.passwd"
module = "backup"

[alarm]
# webhook_url = "https://alarm.example.com/api/send"
# account = "wolfha"
# password = "changeme"
# receiver = "ops"
failure_threshold = 5

[logging]
level = "info"
format = "pretty"
"#,
        designation = designation_file.display()
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the database image and credentials.");
    println!("Then start with: wolfha start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match AgentConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Designation: {}", config.node.designation_file.display());
            println!("  Catalogs: {:?}", config.node.catalogs);
            println!("  Database: {}@{}", config.mariadb.root_user, config.mariadb.image);
            println!("  Peer Port: {}", config.peer_port());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show agent information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = AgentConfig::from_file(&config_path)?;

    println!("WolfHA Agent Information");
    println!("========================");
    println!();
    println!("Designation:      {}", config.node.designation_file.display());
    println!("Workspace:        {}", config.node.workspace.display());
    println!("Tick Interval:    {} ms", config.node.tick_interval_ms);
    println!("Catalogs:         {:?}", config.node.catalogs);
    println!();
    println!("API:");
    println!("  Enabled:        {}", config.api.enabled);
    println!("  Bind Address:   {}", config.api.bind_address);
    println!("  Peer Port:      {}", config.peer_port());
    println!();
    println!("Failover:");
    println!("  Retry Ceiling:  {} s", config.failover.retry_ceiling_secs);
    println!("  Resync Window:  {} h", config.failover.resync_window_hours);
    println!();
    println!("MariaDB:");
    println!("  Image:          {}", config.mariadb.image);
    println!("  Port:           {}", config.mariadb.port);
    println!("  Data:           {}", config.data_dir().display());
    println!("  Backups:        {}", config.backup_dir().display());
    println!();
    println!("Alarms:           {}", config.alarm.webhook_url.as_deref().unwrap_or("(log only)"));

    Ok(())
}
