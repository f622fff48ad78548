use std::time::Duration;

use super::{WorkerConnection, WorkerHandle, WorkerType};
use crate::error::{FleetError, Result};
use crate::proto::launcher_client::LauncherClient;
use crate::proto::{run_launcher_response, LauncherConfig};
use crate::runtime::ScriptSandbox;

/// Extra time granted to the worker beyond the script's own limit before the
/// call is abandoned locally.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Worker that executes launcher scripts in its sandbox.
pub struct LauncherWorker {
    connection: WorkerConnection,
}

impl LauncherWorker {
    pub fn new(connection: WorkerConnection) -> Self {
        Self { connection }
    }

    /// Run a launcher script and decode its JSON output.
    pub async fn run_launcher(&self, config: LauncherConfig) -> Result<serde_json::Value> {
        if config.timeout_ms == 0 {
            return Err(FleetError::InvalidConfig(
                "launcher timeout must be positive".to_string(),
            ));
        }
        let limit = Duration::from_millis(u64::from(config.timeout_ms)) + TIMEOUT_GRACE;
        let mut client = LauncherClient::new(self.connection.channel()?);

        let started = std::time::Instant::now();
        let response = tokio::select! {
            _ = self.connection.cancelled() => return Err(FleetError::ConnectionClosed),
            reply = tokio::time::timeout(limit, client.run_launcher(config)) => match reply {
                Ok(reply) => reply?.into_inner(),
                Err(_) => {
                    return Err(FleetError::Launcher {
                        code: "timeout".to_string(),
                        message: format!("no result after {}ms", limit.as_millis()),
                    })
                }
            },
        };
        tracing::debug!(
            worker_id = %self.worker_id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Launcher call finished"
        );

        match response.result {
            Some(run_launcher_response::Result::OutputJson(output)) => serde_json::from_str(&output)
                .map_err(|e| FleetError::Launcher {
                    code: "invalid_output".to_string(),
                    message: e.to_string(),
                }),
            Some(run_launcher_response::Result::Error(err)) => Err(FleetError::Launcher {
                code: err.code,
                message: err.message,
            }),
            None => Err(FleetError::ProtocolViolation(
                "launcher response has no result".to_string(),
            )),
        }
    }
}

#[tonic::async_trait]
impl ScriptSandbox for LauncherWorker {
    async fn execute(
        &self,
        script: &str,
        input: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.run_launcher(LauncherConfig {
            script: script.to_string(),
            input_json: input.to_string(),
            timeout_ms,
        })
        .await
    }
}

impl WorkerHandle for LauncherWorker {
    fn worker_type(&self) -> WorkerType {
        WorkerType::Launcher
    }

    fn connection(&self) -> &WorkerConnection {
        &self.connection
    }
}
