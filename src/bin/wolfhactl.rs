//! WolfHACtl - Command line tool for inspecting WolfHA agents
//!
//! Usage:
//!   wolfhactl health             - Check service health
//!   wolfhactl ready              - Check replication readiness
//!   wolfhactl status <service>   - Show master/slave status of a service
//!   wolfhactl pending            - Show queued role switches

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use wolfha::catalog::StoredState;
use wolfha::config::AgentConfig;
use wolfha::designation::ClusterDesignation;
use wolfha::peer::{BackupResult, ErrorResponse, API_KEY_HEADER, API_PREFIX};
use wolfha::reconcile::PendingSummary;
use wolfha::status::ReplicationReport;

/// WolfHA Agent Control Tool
#[derive(Parser)]
#[command(name = "wolfhactl")]
#[command(about = "Inspect and operate WolfHA agents", long_about = None)]
struct Cli {
    /// Path to agent config file
    #[arg(short, long, default_value = "/etc/wolfha/wolfha.toml")]
    config: PathBuf,

    /// Agent endpoint (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Shared secret (defaults to the designation's syncSecret)
    #[arg(short, long, env = "WOLFHA_SECRET")]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that every local service is available
    Health,
    /// Check that no local slave is lagging
    Ready,
    /// Show master/slave status of a service
    Status { service: String },
    /// Show the persisted replication records of a service
    State { service: String },
    /// Show role switches waiting for retry
    Pending,
    /// Take a backup of a service
    Backup { service: String },
    /// Replace a service's data with a fresh copy from the peer
    Restore { service: String },
}

struct Agent {
    client: reqwest::Client,
    base: String,
    secret: String,
}

impl Agent {
    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base, API_PREFIX, path)
    }

    async fn get(&self, path: &str) -> anyhow::Result<reqwest::Response> {
        self.client
            .get(self.url(path))
            .header(API_KEY_HEADER, &self.secret)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.base))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let response = self.get(path).await?;
        let status = response.status();
        if !status.is_success() {
            match response.json::<ErrorResponse>().await {
                Ok(body) => bail!("{} ({}): {}", status, body.code, body.error),
                Err(_) => bail!("request failed: {}", status),
            }
        }
        Ok(response.json::<T>().await?)
    }

    /// Probe endpoints answer 200 or 403
    async fn check(&self, path: &str) -> anyhow::Result<bool> {
        let status = self.get(path).await?.status();
        match status.as_u16() {
            200 => Ok(true),
            403 => Ok(false),
            404 => bail!("agent rejected the secret or has no designation loaded"),
            _ => bail!("unexpected response: {}", status),
        }
    }
}

fn endpoint_from(config: Option<&AgentConfig>) -> String {
    let Some(config) = config else {
        return "http://127.0.0.1:8080".to_string();
    };
    let addr = &config.api.bind_address;
    if addr.starts_with("0.0.0.0") {
        format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
    } else {
        format!("http://{}", addr)
    }
}

async fn secret_from(config: Option<&AgentConfig>) -> anyhow::Result<String> {
    let Some(config) = config else {
        bail!("no secret given and no config to find the designation");
    };
    let designation = ClusterDesignation::load(&config.node.designation_file)
        .await
        .context("failed to read the designation for its sync secret")?;
    Ok(designation.sync_secret)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = if cli.config.exists() {
        Some(AgentConfig::from_file(&cli.config)?)
    } else {
        None
    };

    let base = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from(config.as_ref()));
    let secret = match cli.secret.clone() {
        Some(s) => s,
        None => secret_from(config.as_ref()).await?,
    };

    let agent = Agent {
        client: reqwest::Client::new(),
        base,
        secret,
    };

    match cli.command {
        Commands::Health => {
            let healthy = agent.check("/ha/health").await?;
            println!("{}", if healthy { "✓ healthy" } else { "✗ unhealthy" });
            if !healthy {
                std::process::exit(2);
            }
        }
        Commands::Ready => {
            let ready = agent.check("/ha/ready").await?;
            println!("{}", if ready { "✓ ready" } else { "✗ not ready" });
            if !ready {
                std::process::exit(2);
            }
        }
        Commands::Status { service } => {
            let report: ReplicationReport = agent.get_json(&format!("/status/{}", service)).await?;
            print_report(&service, &report);
        }
        Commands::State { service } => {
            let state: StoredState = agent.get_json(&format!("/state/{}", service)).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Pending => {
            let pending: Vec<PendingSummary> = agent.get_json("/pending").await?;
            print_pending(&pending);
        }
        Commands::Backup { service } => {
            let result: BackupResult = agent.get_json(&format!("/backup/{}", service)).await?;
            println!("Backup of {} at {}", service, result.data_path);
        }
        Commands::Restore { service } => {
            let _: serde_json::Value = agent.get_json(&format!("/restore/{}", service)).await?;
            println!("Restored {} from the peer", service);
        }
    }

    Ok(())
}

fn print_report(service: &str, report: &ReplicationReport) {
    println!("Service {}", service);
    match &report.master_status {
        Some(m) if m.enabled => println!("  Master: {}:{} at {}:{}", m.host, m.port, m.log_file, m.log_pos),
        _ => println!("  Master: disabled"),
    }
    match &report.slave_status {
        Some(s) if s.enabled => println!(
            "  Slave:  following {}:{}, running {}, {}s behind",
            s.master_host, s.master_port, s.running_ok, s.behind_seconds
        ),
        _ => println!("  Slave:  disabled"),
    }
}

fn print_pending(pending: &[PendingSummary]) {
    if pending.is_empty() {
        println!("No pending role switches");
        return;
    }

    println!("{:<38} {:<16} {:<16} {:>8} {:>8}  SERVICES", "BATCH", "MASTER", "SLAVE", "AGE(s)", "TRIES");
    for batch in pending {
        let services: Vec<String> = batch
            .services
            .iter()
            .flat_map(|(catalog, names)| names.iter().map(move |n| format!("{}:{}", catalog, n)))
            .collect();
        println!(
            "{:<38} {:<16} {:<16} {:>8} {:>8}  {}",
            batch.id,
            batch.master,
            batch.slave,
            batch.age_secs,
            batch.attempts,
            services.join(", ")
        );
    }
}
