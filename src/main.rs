use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use fleet_relay::config::{AddressMap, ManagerConfig, PeerManager, SpawnedWorker, StandaloneWorker};
use fleet_relay::manager::Manager;
use fleet_relay::proto::worker_broker_client::WorkerBrokerClient;
use fleet_relay::proto::{ListManagersRequest, ListWorkersRequest, RegisterWorkerRequest};
use fleet_relay::shutdown::install_shutdown_handler;
use fleet_relay::workers::WorkerType;

#[derive(Parser, Debug)]
#[command(name = "fleet-relay")]
#[command(version)]
#[command(about = "Worker fleet manager with streaming run relay")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a manager
    Server(ServerArgs),

    /// Worker registration and listing
    Workers {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// List the managers known to a manager
    Managers {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Manager ID (unique identifier for this manager)
    #[arg(long, default_value = "manager-1")]
    manager_id: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50050")]
    port: u16,

    /// Address other processes use to reach this manager (default: 127.0.0.1:<port>)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Peer managers (comma-separated, format: "id=host:port")
    /// Example: "manager-2=10.0.0.2:50050,manager-3=10.0.0.3:50050"
    #[arg(long, default_value = "")]
    peers: String,

    /// Standalone worker to connect to at startup (format: "type@host:port"), repeatable
    #[arg(long = "standalone")]
    standalone: Vec<String>,

    /// Worker container to start at startup (format: "type=image"), repeatable
    #[arg(long = "spawn")]
    spawn: Vec<String>,

    /// Worker address rewrites (comma-separated, format: "from=to")
    /// Example: "worker-a:9000=10.0.0.5:9000,docker-host=127.0.0.1"
    #[arg(long, default_value = "")]
    address_map: String,

    /// Docker network spawned worker containers join
    #[arg(long)]
    network: Option<String>,

    /// Seconds `close()` waits for a worker to end a run
    #[arg(long, default_value = "5")]
    close_timeout_secs: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Manager address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50050")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum WorkerCommands {
    /// Register a worker with the manager
    Register {
        /// Worker ID
        #[arg(long)]
        worker_id: String,

        /// Address the manager dials (host:port)
        #[arg(long)]
        address: String,

        /// Worker type: runner, launcher or remote
        #[arg(long = "type")]
        worker_type: String,
    },
    /// List registered workers
    List {
        /// Only list workers of this type
        #[arg(long = "type")]
        worker_type: Option<String>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ManagerOutput {
    id: String,
    address: String,
}

#[derive(Serialize)]
struct WorkerOutput {
    worker_id: String,
    worker_type: String,
    address: String,
    healthy: bool,
    accepting_jobs: bool,
    standalone: bool,
    registered_at_ms: i64,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn worker_type_to_string(worker_type: i32) -> String {
    match fleet_relay::proto::WorkerType::try_from(worker_type) {
        Ok(fleet_relay::proto::WorkerType::Runner) => "runner".to_string(),
        Ok(fleet_relay::proto::WorkerType::Launcher) => "launcher".to_string(),
        Ok(fleet_relay::proto::WorkerType::Remote) => "remote".to_string(),
        _ => "unknown".to_string(),
    }
}

fn parse_peers(peers_str: &str) -> Vec<PeerManager> {
    peers_str
        .split(',')
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .filter_map(|peer| match peer.split_once('=') {
            Some((id, address)) if !id.is_empty() && !address.is_empty() => Some(PeerManager {
                id: id.to_string(),
                address: address.to_string(),
            }),
            _ => {
                tracing::warn!(peer, "Invalid peer format, expected id=host:port");
                None
            }
        })
        .collect()
}

fn parse_standalone(spec: &str) -> Result<StandaloneWorker, Box<dyn std::error::Error>> {
    let (worker_type, address) = spec
        .split_once('@')
        .ok_or_else(|| format!("invalid standalone worker '{}', expected type@host:port", spec))?;
    Ok(StandaloneWorker {
        worker_type: worker_type.parse()?,
        address: address.to_string(),
    })
}

fn parse_spawn(spec: &str) -> Result<SpawnedWorker, Box<dyn std::error::Error>> {
    let (worker_type, image) = spec
        .split_once('=')
        .ok_or_else(|| format!("invalid spawned worker '{}', expected type=image", spec))?;
    Ok(SpawnedWorker {
        worker_type: worker_type.parse()?,
        image: image.to_string(),
    })
}

async fn create_client(
    args: &ClientArgs,
) -> Result<WorkerBrokerClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(args.addr.clone())?.connect().await?;
    Ok(WorkerBrokerClient::new(channel))
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;

    let mut config = ManagerConfig::new(args.manager_id, listen_addr)
        .with_address_map(AddressMap::parse(&args.address_map)?);
    config.advertise_addr = args
        .advertise_addr
        .unwrap_or_else(|| format!("127.0.0.1:{}", args.port));
    config.peers = parse_peers(&args.peers);
    config.standalone_workers = args
        .standalone
        .iter()
        .map(|spec| parse_standalone(spec))
        .collect::<Result<_, _>>()?;
    config.spawned_workers = args
        .spawn
        .iter()
        .map(|spec| parse_spawn(spec))
        .collect::<Result<_, _>>()?;
    config.sandbox.network = args.network;
    config.run.close_timeout_ms = args.close_timeout_secs * 1000;

    tracing::info!(
        manager_id = %config.manager_id,
        listen_addr = %config.listen_addr,
        advertise_addr = %config.advertise_addr,
        peers = ?config.peers.iter().map(|p| format!("{}={}", p.id, p.address)).collect::<Vec<_>>(),
        standalone_workers = config.standalone_workers.len(),
        spawned_workers = config.spawned_workers.len(),
        "Starting fleet-relay manager"
    );

    let shutdown = install_shutdown_handler();
    Manager::new(config).run(shutdown).await?;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_worker_register(
    client: &mut WorkerBrokerClient<Channel>,
    worker_id: String,
    address: String,
    worker_type: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker_type: WorkerType = worker_type.parse()?;
    client
        .register_worker(RegisterWorkerRequest {
            worker_id: worker_id.clone(),
            address,
            worker_type: worker_type.to_proto() as i32,
        })
        .await?;

    println!("Worker {} registered", worker_id);
    Ok(())
}

async fn handle_worker_list(
    client: &mut WorkerBrokerClient<Channel>,
    worker_type: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker_type = match worker_type {
        Some(t) => t.parse::<WorkerType>()?.to_proto() as i32,
        None => fleet_relay::proto::WorkerType::Unspecified as i32,
    };
    let response = client
        .list_workers(ListWorkersRequest { worker_type })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output: Vec<_> = response
                .workers
                .into_iter()
                .map(|w| WorkerOutput {
                    worker_type: worker_type_to_string(w.worker_type),
                    worker_id: w.worker_id,
                    address: w.address,
                    healthy: w.healthy,
                    accepting_jobs: w.accepting_jobs,
                    standalone: w.standalone,
                    registered_at_ms: w.registered_at_ms,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if response.workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<22} {:<10} ACCEPTING",
                "ID", "TYPE", "ADDRESS", "HEALTH"
            );
            println!("{}", "-".repeat(92));
            for w in response.workers {
                let health = if w.healthy { "[+] up" } else { "[-] down" };
                let accepting = if w.accepting_jobs { "yes" } else { "no" };
                println!(
                    "{:<38} {:<10} {:<22} {:<10} {}",
                    w.worker_id,
                    worker_type_to_string(w.worker_type),
                    w.address,
                    health,
                    accepting
                );
            }
        }
    }
    Ok(())
}

async fn handle_managers(
    client: &mut WorkerBrokerClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .list_managers(ListManagersRequest {})
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output: Vec<_> = response
                .managers
                .into_iter()
                .map(|m| ManagerOutput {
                    id: m.id,
                    address: m.address,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("{:<20} ADDRESS", "ID");
            println!("{}", "-".repeat(45));
            for m in response.managers {
                println!("{:<20} {}", m.id, m.address);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Workers { client, command } => {
            let mut grpc_client = create_client(&client).await?;

            match command {
                WorkerCommands::Register {
                    worker_id,
                    address,
                    worker_type,
                } => {
                    handle_worker_register(&mut grpc_client, worker_id, address, &worker_type)
                        .await?;
                }
                WorkerCommands::List { worker_type } => {
                    handle_worker_list(&mut grpc_client, worker_type, &client.output).await?;
                }
            }
        }
        Commands::Managers { client } => {
            let mut grpc_client = create_client(&client).await?;
            handle_managers(&mut grpc_client, &client.output).await?;
        }
    }

    Ok(())
}
