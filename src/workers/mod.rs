//! Worker control connections.
//!
//! Every worker kind owns a [`WorkerConnection`] and delegates the shared
//! lifecycle (start, stop, health) to it. [`Worker`] is the tagged variant the
//! registry stores; type-specific RPCs live on the variant types:
//!
//! - [`RunnerWorker::create_run`]: relay session for a container workload
//! - [`RemoteWorker::create_run`]: relay session for a remote server
//! - [`LauncherWorker::run_launcher`]: sandboxed script returning JSON

pub mod connection;
pub mod launcher;
pub mod remote;
pub mod runner;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionConfig, RunPolicy};
use crate::error::{FleetError, Result};
use crate::proto::{self, run_config, LauncherConfig, RunConfig};
use crate::pubsub::Broadcaster;
use crate::run::Run;

pub use connection::{HealthStatus, WorkerConnection, WorkerHealth};
pub use launcher::LauncherWorker;
pub use remote::RemoteWorker;
pub use runner::RunnerWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Runner,
    Launcher,
    Remote,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerType::Runner => write!(f, "runner"),
            WorkerType::Launcher => write!(f, "launcher"),
            WorkerType::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for WorkerType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            // "container" is the name older workers register with
            "runner" | "container" => Ok(WorkerType::Runner),
            "launcher" => Ok(WorkerType::Launcher),
            "remote" => Ok(WorkerType::Remote),
            other => Err(FleetError::UnsupportedWorkerType(other.to_string())),
        }
    }
}

impl WorkerType {
    /// Convert the wire enum value carried in registration requests.
    pub fn from_proto(value: i32) -> Result<Self> {
        match proto::WorkerType::try_from(value) {
            Ok(proto::WorkerType::Runner) => Ok(WorkerType::Runner),
            Ok(proto::WorkerType::Launcher) => Ok(WorkerType::Launcher),
            Ok(proto::WorkerType::Remote) => Ok(WorkerType::Remote),
            Ok(proto::WorkerType::Unspecified) => Err(FleetError::UnsupportedWorkerType(
                "unspecified".to_string(),
            )),
            Err(_) => Err(FleetError::UnsupportedWorkerType(value.to_string())),
        }
    }

    pub fn to_proto(self) -> proto::WorkerType {
        match self {
            WorkerType::Runner => proto::WorkerType::Runner,
            WorkerType::Launcher => proto::WorkerType::Launcher,
            WorkerType::Remote => proto::WorkerType::Remote,
        }
    }
}

/// Settings every worker connection is built with.
#[derive(Debug, Clone, Default)]
pub struct WorkerSettings {
    pub connection: ConnectionConfig,
    pub run: RunPolicy,
}

/// Behaviour shared by every worker kind, delegated to its connection.
pub trait WorkerHandle {
    fn worker_type(&self) -> WorkerType;

    fn connection(&self) -> &WorkerConnection;

    fn worker_id(&self) -> &str {
        self.connection().worker_id()
    }

    fn address(&self) -> &str {
        self.connection().address()
    }

    fn stop(&self) {
        self.connection().stop()
    }

    fn is_healthy(&self) -> bool {
        self.connection().is_healthy()
    }

    fn is_accepting_jobs(&self) -> bool {
        self.connection().is_accepting_jobs()
    }

    fn health_broadcast(&self) -> &Broadcaster<WorkerHealth> {
        self.connection().health_broadcast()
    }
}

/// A registered worker of any kind.
pub enum Worker {
    Runner(RunnerWorker),
    Launcher(LauncherWorker),
    Remote(RemoteWorker),
}

impl Worker {
    /// Build an unstarted worker of the given type.
    pub fn new(
        worker_type: WorkerType,
        worker_id: &str,
        address: &str,
        settings: &WorkerSettings,
        parent: &CancellationToken,
    ) -> Self {
        let connection =
            WorkerConnection::new(worker_id, address, settings.connection.clone(), parent);
        match worker_type {
            WorkerType::Runner => Worker::Runner(RunnerWorker::new(connection, settings.run.clone())),
            WorkerType::Launcher => Worker::Launcher(LauncherWorker::new(connection)),
            WorkerType::Remote => Worker::Remote(RemoteWorker::new(connection, settings.run.clone())),
        }
    }

    /// Connect and complete the handshake. See [`WorkerConnection::start`].
    pub async fn start(&self) -> Result<()> {
        self.connection().start().await
    }

    /// Healthy and accepting jobs.
    pub fn is_eligible(&self) -> bool {
        self.is_healthy() && self.is_accepting_jobs()
    }

    /// Open a relay run. Container configs need a runner, remote configs a
    /// remote worker.
    pub fn create_run(&self, config: RunConfig) -> Result<Arc<Run>> {
        match (self, config.target) {
            (Worker::Runner(runner), Some(run_config::Target::Container(container))) => {
                runner.create_run(container)
            }
            (Worker::Remote(remote), Some(run_config::Target::Remote(server))) => {
                remote.create_run(server)
            }
            (_, None) => Err(FleetError::InvalidConfig(
                "run config has no target".to_string(),
            )),
            (worker, Some(_)) => Err(FleetError::UnsupportedOperation {
                worker_type: worker.worker_type().to_string(),
                operation: "this run target",
            }),
        }
    }

    pub async fn run_launcher(&self, config: LauncherConfig) -> Result<serde_json::Value> {
        match self {
            Worker::Launcher(launcher) => launcher.run_launcher(config).await,
            other => Err(FleetError::UnsupportedOperation {
                worker_type: other.worker_type().to_string(),
                operation: "run_launcher",
            }),
        }
    }

    pub fn as_launcher(&self) -> Option<&LauncherWorker> {
        match self {
            Worker::Launcher(launcher) => Some(launcher),
            _ => None,
        }
    }
}

impl WorkerHandle for Worker {
    fn worker_type(&self) -> WorkerType {
        match self {
            Worker::Runner(w) => w.worker_type(),
            Worker::Launcher(w) => w.worker_type(),
            Worker::Remote(w) => w.worker_type(),
        }
    }

    fn connection(&self) -> &WorkerConnection {
        match self {
            Worker::Runner(w) => w.connection(),
            Worker::Launcher(w) => w.connection(),
            Worker::Remote(w) => w.connection(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_type", &self.worker_type())
            .field("worker_id", &self.worker_id())
            .field("address", &self.address())
            .finish()
    }
}

/// Affinity key for a run config: the image for container runs, the server
/// URI for remote runs.
pub fn connection_hash(config: &RunConfig) -> Result<Vec<u8>> {
    match &config.target {
        Some(run_config::Target::Container(container)) => Ok(container.image.as_bytes().to_vec()),
        Some(run_config::Target::Remote(remote)) => Ok(remote.server_uri.as_bytes().to_vec()),
        None => Err(FleetError::InvalidConfig(
            "run config has no target".to_string(),
        )),
    }
}

/// Worker type able to serve a run config.
pub fn worker_type_for(config: &RunConfig) -> Result<WorkerType> {
    match &config.target {
        Some(run_config::Target::Container(_)) => Ok(WorkerType::Runner),
        Some(run_config::Target::Remote(_)) => Ok(WorkerType::Remote),
        None => Err(FleetError::InvalidConfig(
            "run config has no target".to_string(),
        )),
    }
}
