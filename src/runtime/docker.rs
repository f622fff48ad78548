use std::process::Stdio;

use tokio::process::Command;

use super::{ContainerHandle, ContainerRuntime};
use crate::config::SandboxConfig;
use crate::error::{FleetError, Result};
use crate::proto::ContainerRunConfig;

/// Starts worker workloads as detached Docker containers.
///
/// Every container runs with:
/// - Dropped capabilities and no new privileges
/// - Read-only root filesystem
/// - Memory and CPU limits
/// - The configured network, which must be reachable from the manager
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    config: SandboxConfig,
}

impl DockerRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to `docker` to start `config` as container `name`.
    pub fn build_run_args(&self, name: &str, config: &ContainerRunConfig) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            format!("--name={}", name),
        ];

        if let Some(ref network) = self.config.network {
            args.push(format!("--network={}", network));
        }

        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }

        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        // sorted so the argument list is stable
        let mut env: Vec<_> = config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(config.image.clone());
        if !config.command.is_empty() {
            args.push(config.command.clone());
            args.extend(config.args.iter().cloned());
        }

        args
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FleetError::Runtime(format!("failed to run docker: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(FleetError::Runtime(if stderr.is_empty() {
                format!("docker exited with {:?}", output.status.code())
            } else {
                stderr
            }))
        }
    }
}

#[tonic::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, name: &str, config: &ContainerRunConfig) -> Result<ContainerHandle> {
        if config.image.is_empty() {
            return Err(FleetError::InvalidConfig(
                "container run config has no image".to_string(),
            ));
        }

        tracing::info!(name, image = %config.image, "Starting container");
        let container_id = self.docker(&self.build_run_args(name, config)).await?;

        let inspect = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}".to_string(),
            container_id.clone(),
        ];
        let ip = self.docker(&inspect).await.and_then(|ip| {
            if ip.is_empty() {
                Err(FleetError::Runtime(
                    "container has no network address".to_string(),
                ))
            } else {
                Ok(ip)
            }
        });
        let ip = match ip {
            Ok(ip) => ip,
            Err(e) => {
                let handle = ContainerHandle {
                    container_id,
                    address: String::new(),
                };
                if let Err(stop_err) = self.stop(&handle).await {
                    tracing::warn!(error = %stop_err, "Failed to remove unreachable container");
                }
                return Err(e);
            }
        };

        let handle = ContainerHandle {
            address: format!("{}:{}", ip, self.config.container_port),
            container_id,
        };
        tracing::info!(
            name,
            container_id = %handle.container_id,
            address = %handle.address,
            "Container started"
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        tracing::info!(container_id = %handle.container_id, "Stopping container");
        self.docker(&[
            "rm".to_string(),
            "-f".to_string(),
            handle.container_id.clone(),
        ])
        .await
        .map(|_| ())
    }
}
