use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::{FleetError, Result};
use crate::grpc::GrpcServer;
use crate::proto::{ContainerRunConfig, RunConfig};
use crate::registry::WorkerRegistry;
use crate::run::Run;
use crate::runtime::{ContainerHandle, ContainerRuntime, DockerRuntime, ScriptSandbox};
use crate::workers::{connection_hash, worker_type_for, WorkerHandle, WorkerType};

/// Registration attempts for a freshly started container.
const SPAWN_REGISTER_ATTEMPTS: u32 = 10;
const SPAWN_REGISTER_BACKOFF: Duration = Duration::from_millis(500);

/// Manager process: owns the worker registry and serves the broker RPCs.
pub struct Manager {
    pub config: ManagerConfig,
    pub registry: WorkerRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    containers: Mutex<Vec<ContainerHandle>>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        let runtime = Arc::new(DockerRuntime::new(config.sandbox.clone()));
        Self::with_runtime(config, runtime)
    }

    pub fn with_runtime(config: ManagerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let registry = WorkerRegistry::from_config(&config);
        Self {
            config,
            registry,
            runtime,
            containers: Mutex::new(Vec::new()),
        }
    }

    /// Run the manager until `shutdown` is cancelled.
    ///
    /// 1. Connects to every configured standalone worker
    /// 2. Starts the configured worker containers and registers them
    /// 3. Serves the broker gRPC service
    /// 4. On shutdown, stops every worker connection and container
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server fails to bind or stops with a
    /// transport error. A standalone or spawned worker that cannot be brought
    /// up is logged and skipped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.register_standalone_workers().await;
        for spawned in &self.config.spawned_workers {
            if let Err(e) = self.spawn_worker(spawned.worker_type, &spawned.image).await {
                tracing::warn!(
                    worker_type = %spawned.worker_type,
                    image = %spawned.image,
                    error = %e,
                    "Failed to spawn worker"
                );
            }
        }

        let server = GrpcServer::new(self.config.listen_addr, self.registry.clone());
        let served = server.run(shutdown.clone()).await;

        self.registry.stop();
        self.stop_containers().await;
        served?;
        tracing::info!(manager_id = %self.config.manager_id, "Manager stopped");
        Ok(())
    }

    async fn register_standalone_workers(&self) {
        for standalone in &self.config.standalone_workers {
            match self
                .registry
                .register_standalone(standalone.worker_type, &standalone.address)
                .await
            {
                Ok(worker_id) => {
                    tracing::debug!(worker_id = %worker_id, "Standalone worker ready");
                }
                Err(e) => {
                    tracing::warn!(
                        worker_type = %standalone.worker_type,
                        address = %standalone.address,
                        error = %e,
                        "Failed to connect to standalone worker"
                    );
                }
            }
        }
    }

    /// Start a worker container from `image` and register it. The container
    /// is removed again if the worker never answers its handshake.
    pub async fn spawn_worker(&self, worker_type: WorkerType, image: &str) -> Result<String> {
        let worker_id = format!("{}-{}", worker_type, Uuid::new_v4().simple());
        let container = ContainerRunConfig {
            image: image.to_string(),
            ..Default::default()
        };
        let handle = self.runtime.start(&worker_id, &container).await?;

        let mut attempt = 1;
        loop {
            match self
                .registry
                .register_worker(&worker_id, &handle.address, worker_type)
                .await
            {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < SPAWN_REGISTER_ATTEMPTS => {
                    tracing::debug!(worker_id = %worker_id, attempt, error = %e, "Worker not ready yet");
                    attempt += 1;
                    tokio::time::sleep(SPAWN_REGISTER_BACKOFF).await;
                }
                Err(e) => {
                    if let Err(stop_err) = self.runtime.stop(&handle).await {
                        tracing::warn!(worker_id = %worker_id, error = %stop_err, "Failed to remove container");
                    }
                    return Err(e);
                }
            }
        }

        self.containers_guard().push(handle);
        Ok(worker_id)
    }

    async fn stop_containers(&self) {
        let containers: Vec<_> = self.containers_guard().drain(..).collect();
        for handle in &containers {
            if let Err(e) = self.runtime.stop(handle).await {
                tracing::warn!(container_id = %handle.container_id, error = %e, "Failed to stop container");
            }
        }
    }

    fn containers_guard(&self) -> std::sync::MutexGuard<'_, Vec<ContainerHandle>> {
        self.containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a run for `config` on a worker chosen by the config's connection
    /// hash, so runs of the same image or server land on the same worker.
    pub async fn open_run(&self, config: RunConfig) -> Result<Arc<Run>> {
        let worker_type = worker_type_for(&config)?;
        let hash = connection_hash(&config)?;
        let worker = self
            .registry
            .pick_worker_by_hash(worker_type, &hash)
            .ok_or_else(|| FleetError::NoWorkerAvailable(worker_type.to_string()))?;

        tracing::debug!(
            worker_id = %worker.worker_id(),
            worker_type = %worker_type,
            "Opening run"
        );
        let run = worker.create_run(config)?;
        run.start().await?;
        Ok(run)
    }

    /// Execute a launcher script on a random launcher worker.
    pub async fn run_launcher_script(
        &self,
        script: &str,
        input: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let worker = self
            .registry
            .pick_worker_randomly(WorkerType::Launcher)
            .ok_or_else(|| FleetError::NoWorkerAvailable(WorkerType::Launcher.to_string()))?;
        let launcher = worker.as_launcher().ok_or_else(|| {
            FleetError::Internal(format!("worker {} is not a launcher", worker.worker_id()))
        })?;
        launcher.execute(script, input, timeout).await
    }
}
