use std::sync::Arc;

use super::{WorkerConnection, WorkerHandle, WorkerType};
use crate::config::RunPolicy;
use crate::error::{FleetError, Result};
use crate::proto::runner_client::RunnerClient;
use crate::proto::{run_config, RemoteRunConfig, RunConfig};
use crate::run::Run;

/// Worker that bridges runs to a server reachable over the network instead
/// of a container it owns. Speaks the same run protocol as a runner.
pub struct RemoteWorker {
    connection: WorkerConnection,
    run_policy: RunPolicy,
}

impl RemoteWorker {
    pub fn new(connection: WorkerConnection, run_policy: RunPolicy) -> Self {
        Self {
            connection,
            run_policy,
        }
    }

    pub fn create_run(&self, config: RemoteRunConfig) -> Result<Arc<Run>> {
        if config.server_uri.trim().is_empty() {
            return Err(FleetError::InvalidConfig(
                "remote run config has no server uri".to_string(),
            ));
        }
        let channel = self.connection.channel()?;
        Ok(Run::new(
            RunnerClient::new(channel),
            RunConfig {
                target: Some(run_config::Target::Remote(config)),
            },
            self.connection.child_token(),
            self.run_policy.clone(),
        ))
    }
}

impl WorkerHandle for RemoteWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Remote
    }

    fn connection(&self) -> &WorkerConnection {
        &self.connection
    }
}
