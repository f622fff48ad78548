use std::sync::Arc;

use super::{WorkerConnection, WorkerHandle, WorkerType};
use crate::config::RunPolicy;
use crate::error::{FleetError, Result};
use crate::proto::runner_client::RunnerClient;
use crate::proto::{run_config, ContainerRunConfig, RunConfig};
use crate::run::Run;

/// Worker that runs container workloads and relays their traffic.
pub struct RunnerWorker {
    connection: WorkerConnection,
    run_policy: RunPolicy,
}

impl RunnerWorker {
    pub fn new(connection: WorkerConnection, run_policy: RunPolicy) -> Self {
        Self {
            connection,
            run_policy,
        }
    }

    /// Create an unstarted run for a container workload. The run's lifetime
    /// is bound to this worker.
    pub fn create_run(&self, config: ContainerRunConfig) -> Result<Arc<Run>> {
        if config.image.trim().is_empty() {
            return Err(FleetError::InvalidConfig(
                "container run config has no image".to_string(),
            ));
        }
        let channel = self.connection.channel()?;
        Ok(Run::new(
            RunnerClient::new(channel),
            RunConfig {
                target: Some(run_config::Target::Container(config)),
            },
            self.connection.child_token(),
            self.run_policy.clone(),
        ))
    }
}

impl WorkerHandle for RunnerWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Runner
    }

    fn connection(&self) -> &WorkerConnection {
        &self.connection
    }
}
