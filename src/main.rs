use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use relay_exec::config::{resolve_host_id, HostConfig, SandboxConfig, StoreConfig};
use relay_exec::dispatch::{ClientStatusRecord, ExecutionRequest, JobStatus, ResourceHints};
use relay_exec::node::{open_store, HostNode};
use relay_exec::shutdown::install_shutdown_handler;
use relay_exec::store::SharedState;

#[derive(Parser, Debug)]
#[command(name = "relay-exec")]
#[command(version)]
#[command(about = "Run sandboxed code on hosts coordinating through a shared store")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a host: advertise resources and execute requests addressed to it
    Server(ServerArgs),

    /// Submit code to a host and follow its status
    Submit(SubmitArgs),

    /// List hosts advertising resources
    Hosts {
        #[command(flatten)]
        store: StoreArgs,

        /// Seconds after which a host's advertisement counts as stale
        #[arg(long, default_value = "15")]
        ttl: u64,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Show the latest status written for a client
    Status {
        #[command(flatten)]
        store: StoreArgs,

        /// Client identity the status was written under
        #[arg(long)]
        client: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(clap::Args, Debug)]
struct StoreArgs {
    /// Redis URL of the shared store (in-process store when omitted)
    #[arg(long)]
    redis_url: Option<String>,

    /// Key prefix inside the shared store
    #[arg(long, default_value = "relay")]
    prefix: String,
}

impl StoreArgs {
    fn config(&self) -> StoreConfig {
        match &self.redis_url {
            Some(url) => StoreConfig::Redis {
                url: url.clone(),
                prefix: self.prefix.clone(),
            },
            None => StoreConfig::Memory,
        }
    }

    /// Client commands only make sense against a store other hosts share.
    fn shared_config(&self) -> Result<StoreConfig, Box<dyn std::error::Error>> {
        match self.config() {
            StoreConfig::Memory => {
                Err("this command needs a shared store, pass --redis-url".into())
            }
            config => Ok(config),
        }
    }
}

#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// Host identity (defaults to the hostname, then a random UUID)
    #[arg(long)]
    host_id: Option<String>,

    #[command(flatten)]
    store: StoreArgs,

    /// Port for the /run-code HTTP endpoint (disabled when omitted)
    #[arg(long)]
    http_port: Option<u16>,

    /// Address the HTTP endpoint binds to
    #[arg(long, default_value = "0.0.0.0")]
    http_bind: IpAddr,

    /// Container image jobs run in
    #[arg(long, default_value = "python:alpine")]
    image: String,

    /// Milliseconds between resource advertisements
    #[arg(long, default_value = "5000")]
    advertise_interval_ms: u64,

    /// Seconds a job may run before it is torn down (0 disables the deadline)
    #[arg(long, default_value = "600")]
    timeout_secs: u64,

    /// Directory for temporary code artifacts
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Give job containers network access
    #[arg(long)]
    allow_network: bool,
}

#[derive(clap::Args, Debug)]
struct SubmitArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Host the request is addressed to
    #[arg(long)]
    host: String,

    /// Client identity status is written under (random when omitted)
    #[arg(long)]
    client: Option<String>,

    /// CPUs to request
    #[arg(long)]
    cpus: Option<u32>,

    /// Memory to request, in bytes
    #[arg(long)]
    ram: Option<u64>,

    /// Return after submitting instead of waiting for a result
    #[arg(long)]
    no_wait: bool,

    /// File containing the code to run
    file: PathBuf,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    request_id: String,
    client_id: String,
    host_id: String,
}

#[derive(Serialize)]
struct HostOutput {
    host_id: String,
    cpu_count: u32,
    ram_bytes: u64,
    gpus: Vec<String>,
    age_secs: i64,
    stale: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn format_bytes(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else {
        format!("{} MiB", bytes / MIB)
    }
}

async fn shared_state(store: &StoreArgs) -> Result<SharedState, Box<dyn std::error::Error>> {
    let config = store.shared_config()?;
    Ok(SharedState::new(open_store(&config).await?))
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let mut sandbox = SandboxConfig {
        image: args.image,
        network_disabled: !args.allow_network,
        execution_timeout: (args.timeout_secs > 0)
            .then_some(Duration::from_secs(args.timeout_secs)),
        ..Default::default()
    };
    if let Some(dir) = args.work_dir {
        sandbox.work_dir = dir;
    }

    let mut config = HostConfig::new(resolve_host_id(args.host_id.as_deref()))
        .with_store(args.store.config())
        .with_advertise_interval(Duration::from_millis(args.advertise_interval_ms));
    config.sandbox = sandbox;
    if let Some(port) = args.http_port {
        config = config.with_http_addr(SocketAddr::new(args.http_bind, port));
    }

    if config.store == StoreConfig::Memory {
        tracing::warn!(
            "Running with an in-process store; no other host can reach this one. \
             Pass --redis-url to join a pool."
        );
    }

    tracing::info!(
        host_id = %config.host_id,
        image = %config.sandbox.image,
        http_addr = ?config.http_addr,
        "Host configured"
    );

    let node = HostNode::connect(config).await?;
    node.run(install_shutdown_handler()).await?;
    Ok(())
}

// =============================================================================
// Client Implementations
// =============================================================================

async fn run_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("warn");

    let code = tokio::fs::read_to_string(&args.file).await?;
    let state = shared_state(&args.store).await?;

    let request_id = Uuid::new_v4().to_string();
    let client_id = args
        .client
        .unwrap_or_else(|| format!("client-{}", Uuid::new_v4()));

    let mut request = ExecutionRequest::new(&request_id, &client_id, code);
    if args.cpus.is_some() || args.ram.is_some() {
        request = request.with_hints(ResourceHints {
            cpu_count: args.cpus,
            ram_bytes: args.ram,
        });
    }

    // Subscribe before submitting so no status update is missed
    let mut updates = state.watch_client(&client_id).await?;

    state
        .put_client_status(&client_id, &ClientStatusRecord::new(&request_id, JobStatus::Queued, ""))
        .await?;
    state.submit_request(&args.host, &request).await?;

    let submitted = SubmitOutput {
        request_id: request_id.clone(),
        client_id: client_id.clone(),
        host_id: args.host.clone(),
    };
    eprintln!("{}", serde_json::to_string(&submitted)?);

    if args.no_wait {
        return Ok(());
    }

    while let Some(update) = updates.next().await {
        let Ok(record) = serde_json::from_value::<ClientStatusRecord>(update.value) else {
            continue;
        };
        if record.request_id != request_id {
            continue;
        }
        eprintln!("status: {}", record.status);
        match record.status {
            JobStatus::Completed => {
                print!("{}", record.output);
                return Ok(());
            }
            JobStatus::Error => {
                return Err(format!("execution failed: {}", record.output).into());
            }
            JobStatus::Queued | JobStatus::Running => {}
        }
    }

    Err("store subscription closed before the job finished".into())
}

async fn run_hosts(
    store: StoreArgs,
    ttl: u64,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("warn");

    let state = shared_state(&store).await?;
    let now = Utc::now();
    let ttl = Duration::from_secs(ttl);

    let hosts: Vec<HostOutput> = state
        .list_resources()
        .await?
        .into_iter()
        .map(|record| HostOutput {
            stale: record.is_stale(now, ttl),
            age_secs: (now - record.observed_at).num_seconds(),
            gpus: record.gpu_list.iter().map(|g| g.name.clone()).collect(),
            host_id: record.host_id,
            cpu_count: record.cpu_count,
            ram_bytes: record.ram_bytes,
        })
        .collect();

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&hosts)?),
        OutputFormat::Table => {
            println!(
                "{:<32} {:>5} {:>10} {:>6} {:>8}  GPUS",
                "HOST", "CPUS", "RAM", "AGE", "STATE"
            );
            for host in hosts {
                println!(
                    "{:<32} {:>5} {:>10} {:>5}s {:>8}  {}",
                    host.host_id,
                    host.cpu_count,
                    format_bytes(host.ram_bytes),
                    host.age_secs,
                    if host.stale { "stale" } else { "live" },
                    if host.gpus.is_empty() {
                        "-".to_string()
                    } else {
                        host.gpus.join(", ")
                    }
                );
            }
        }
    }
    Ok(())
}

async fn run_status(
    store: StoreArgs,
    client: String,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("warn");

    let state = shared_state(&store).await?;
    let Some(record) = state.client_status(&client).await? else {
        return Err(format!("no status recorded for client {}", client).into());
    };

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Table => {
            println!("Request:   {}", record.request_id);
            println!("Status:    {}", record.status);
            println!("Updated:   {}", record.timestamp.to_rfc3339());
            if !record.output.is_empty() {
                println!("Output:\n{}", record.output);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::Submit(submit_args) => run_submit(submit_args).await,
        Commands::Hosts { store, ttl, output } => run_hosts(store, ttl, output).await,
        Commands::Status {
            store,
            client,
            output,
        } => run_status(store, client, output).await,
    }
}
