use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{FleetError, Result};
use crate::workers::WorkerType;

/// Limits applied to containers started by the docker runtime.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker network the container joins; must be reachable from the manager
    pub network: Option<String>,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Port the worker process listens on inside the container
    pub container_port: u16,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network: None,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
            container_port: 50061,
        }
    }
}

/// Settings for the outbound control connection to each worker.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    /// HTTP/2 keepalive ping interval
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            keepalive_interval_ms: 60_000,
            keepalive_timeout_ms: 20_000,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }
}

/// Policy values for relay runs.
#[derive(Debug, Clone)]
pub struct RunPolicy {
    /// How long `close()` waits for the remote to end the stream
    pub close_timeout_ms: u64,
    /// Idle limit enforced by the orchestration layer, not by the relay
    pub inactivity_timeout_ms: u64,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            close_timeout_ms: 5_000,
            inactivity_timeout_ms: 20_000,
        }
    }
}

impl RunPolicy {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

/// Rewrites advertised worker addresses into addresses reachable from this
/// manager. Entries match either a full `host:port` or a bare host; a host
/// match keeps the original port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    entries: HashMap<String, String>,
}

impl AddressMap {
    /// Parse `from=to` pairs separated by commas.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (from, to) = pair.split_once('=').ok_or_else(|| {
                FleetError::InvalidConfig(format!("address mapping '{}' is not from=to", pair))
            })?;
            let (from, to) = (from.trim(), to.trim());
            if from.is_empty() || to.is_empty() {
                return Err(FleetError::InvalidConfig(format!(
                    "address mapping '{}' has an empty side",
                    pair
                )));
            }
            entries.insert(from.to_string(), to.to_string());
        }
        Ok(Self { entries })
    }

    pub fn with_entry(mut self, from: &str, to: &str) -> Self {
        self.entries.insert(from.to_string(), to.to_string());
        self
    }

    pub fn resolve(&self, address: &str) -> String {
        if let Some(mapped) = self.entries.get(address) {
            return mapped.clone();
        }

        if let Some((host, port)) = address.rsplit_once(':') {
            if let Some(mapped_host) = self.entries.get(host) {
                return format!("{}:{}", mapped_host, port);
            }
        }

        address.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerManager {
    pub id: String,
    pub address: String, // host:port format, supports both IP and hostnames
}

/// A worker configured at startup rather than registered over RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandaloneWorker {
    pub worker_type: WorkerType,
    pub address: String,
}

/// A worker the manager starts itself through the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnedWorker {
    pub worker_type: WorkerType,
    pub image: String,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub manager_id: String,
    pub listen_addr: SocketAddr,
    /// Address other processes use to reach this manager
    pub advertise_addr: String,
    pub peers: Vec<PeerManager>,
    pub standalone_workers: Vec<StandaloneWorker>,
    pub spawned_workers: Vec<SpawnedWorker>,
    pub connection: ConnectionConfig,
    pub run: RunPolicy,
    pub address_map: AddressMap,
    pub sandbox: SandboxConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manager_id: "manager-1".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50050)),
            advertise_addr: "127.0.0.1:50050".to_string(),
            peers: Vec::new(),
            standalone_workers: Vec::new(),
            spawned_workers: Vec::new(),
            connection: ConnectionConfig::default(),
            run: RunPolicy::default(),
            address_map: AddressMap::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn new(manager_id: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            manager_id: manager_id.into(),
            listen_addr,
            advertise_addr: listen_addr.to_string(),
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, id: &str, address: &str) -> Self {
        self.peers.push(PeerManager {
            id: id.to_string(),
            address: address.to_string(),
        });
        self
    }

    pub fn with_standalone_worker(mut self, worker_type: WorkerType, address: &str) -> Self {
        self.standalone_workers.push(StandaloneWorker {
            worker_type,
            address: address.to_string(),
        });
        self
    }

    pub fn with_spawned_worker(mut self, worker_type: WorkerType, image: &str) -> Self {
        self.spawned_workers.push(SpawnedWorker {
            worker_type,
            image: image.to_string(),
        });
        self
    }

    pub fn with_address_map(mut self, address_map: AddressMap) -> Self {
        self.address_map = address_map;
        self
    }
}
