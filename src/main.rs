use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sanitd::cli::{self, Client};
use sanitd::core::Orchestrator;
use sanitd::core::sanitizer::SanitizerBackend;
use sanitd::core::sanitizer::simulated::FaultPlan;
use sanitd::{adapters, config, context, db, logging};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sanitd")]
#[command(about = "Storage sanitization daemon with a certificate ledger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon RPC address for client commands
    #[arg(long, global = true)]
    rpc_bind: Option<String>,

    /// Print raw JSON instead of tables
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sanitization daemon
    Daemon(DaemonArgs),
    /// Daemon health and ledger summary
    Status,
    /// List attached devices
    Devices,
    /// Re-enumerate attached devices
    Rescan,
    /// Wipe one or more devices as a single job
    Wipe {
        #[arg(required = true)]
        device_ids: Vec<String>,
        /// Method name, e.g. "NIST Clear"; defaults per device type
        #[arg(long)]
        method: Option<String>,
        /// Follow progress until the job finishes
        #[arg(long)]
        wait: bool,
    },
    /// Show recent jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one job
    Job {
        job_id: String,
        /// Include the persisted status history
        #[arg(long)]
        history: bool,
    },
    /// Cancel a running job
    Cancel { job_id: String },
    /// Return a wiped or failed device to Ready
    Rearm { device_id: String },
    /// Print the certificate chain
    Chain,
    /// Verify a certificate by id or by its printed verification code
    Verify {
        #[arg(required_unless_present = "code")]
        certificate_id: Option<String>,
        #[arg(long, conflicts_with = "certificate_id")]
        code: Option<String>,
    },
    /// Print the latest certificate for a device
    Certificate {
        device_id: String,
        #[arg(long)]
        text: bool,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backend: Option<SanitizerBackend>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    progress_interval_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => config::AppConfig::new(Some(args))?,
        _ => config::AppConfig::new(None::<&DaemonArgs>)?,
    };

    if let Commands::Daemon(_) = &cli.command {
        logging::init(logging::LogConfig::from(&config));
        return run_daemon(config).await.context("Daemon failed");
    }

    if let Commands::Config = &cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let rpc_bind = cli.rpc_bind.as_deref().unwrap_or(&config.rpc_bind);
    let addr: SocketAddr = rpc_bind
        .parse()
        .with_context(|| format!("Invalid RPC address: {}", rpc_bind))?;
    let client = Client::new(addr, cli.json);

    match cli.command {
        Commands::Daemon(_) | Commands::Config => Ok(()),
        Commands::Status => cli::status(&client).await,
        Commands::Devices => cli::devices(&client).await,
        Commands::Rescan => cli::rescan(&client).await,
        Commands::Wipe {
            device_ids,
            method,
            wait,
        } => cli::wipe(&client, device_ids, method, wait).await,
        Commands::Jobs { limit } => cli::jobs(&client, limit).await,
        Commands::Job { job_id, history } => cli::job(&client, &job_id, history).await,
        Commands::Cancel { job_id } => cli::cancel(&client, &job_id).await,
        Commands::Rearm { device_id } => cli::rearm(&client, &device_id).await,
        Commands::Chain => cli::chain(&client).await,
        Commands::Verify {
            certificate_id,
            code,
        } => cli::verify(&client, certificate_id, code).await,
        Commands::Certificate { device_id, text } => cli::certificate(&client, &device_id, text).await,
    }
}

async fn run_daemon(config: config::AppConfig) -> Result<()> {
    let db_conn = db::init(&config.data_dir).await?;
    let faults = FaultPlan::new();
    let adapter = adapters::get_adapter(config.simulation, faults.clone())?;
    let ctx = context::AppContext::new(config, db_conn, adapter, faults);
    Orchestrator::new(ctx).start().await
}
