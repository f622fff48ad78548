//! Collaborators that run workloads outside the manager process.

pub mod docker;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tonic::codegen::http::Uri;

use crate::error::{FleetError, Result};
use crate::proto::{ContainerRunConfig, RemoteProtocol, RemoteRunConfig};

pub use docker::DockerRuntime;

/// A started sandboxed workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub container_id: String,
    /// `host:port` the manager can dial
    pub address: String,
}

/// Starts and stops sandboxed workloads.
#[tonic::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, name: &str, config: &ContainerRunConfig) -> Result<ContainerHandle>;

    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;
}

/// Runs an isolated script under a hard wall-clock limit and returns its
/// JSON result.
#[tonic::async_trait]
pub trait ScriptSandbox: Send + Sync {
    async fn execute(
        &self,
        script: &str,
        input: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value>;
}

/// Launch parameters a launcher script returns for a container run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLaunchParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl ContainerLaunchParams {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let params: Self = serde_json::from_value(value).map_err(|e| {
            FleetError::InvalidConfig(format!("invalid container launch params: {}", e))
        })?;
        if params.command.trim().is_empty() {
            return Err(FleetError::InvalidConfig(
                "container launch params require a command".to_string(),
            ));
        }
        Ok(params)
    }

    /// Overwrite the command, arguments and environment of `config`.
    pub fn apply(self, config: &mut ContainerRunConfig) {
        config.command = self.command;
        config.args = self.args;
        config.env = self.env;
    }
}

/// Launch parameters a launcher script returns for a remote run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLaunchParams {
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Replacement server URI; must keep the configured scheme and host
    #[serde(default, rename = "remote_url")]
    pub server_uri: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

impl RemoteLaunchParams {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| FleetError::InvalidConfig(format!("invalid remote launch params: {}", e)))
    }

    pub fn apply(self, config: &mut RemoteRunConfig) -> Result<()> {
        if let Some(protocol) = self.protocol.as_deref() {
            let protocol = match protocol {
                "sse" => RemoteProtocol::Sse,
                "streamable_http" => RemoteProtocol::StreamableHttp,
                other => {
                    return Err(FleetError::InvalidConfig(format!(
                        "unsupported protocol: {}",
                        other
                    )))
                }
            };
            config.protocol = protocol as i32;
        }
        if let Some(server_uri) = self.server_uri.as_deref().filter(|uri| !uri.is_empty()) {
            config.server_uri = rebase_server_uri(&config.server_uri, server_uri)?;
        }
        config.headers = self.headers;
        config.query = self.query;
        Ok(())
    }
}

/// Resolve `updated` against `base`. A path-only URI inherits the base
/// scheme and host; an absolute one must name the same scheme and host.
fn rebase_server_uri(base: &str, updated: &str) -> Result<String> {
    let base: Uri = base
        .parse()
        .map_err(|e| FleetError::InvalidConfig(format!("invalid base server URI: {}", e)))?;
    let updated: Uri = updated
        .parse()
        .map_err(|e| FleetError::InvalidConfig(format!("invalid updated server URI: {}", e)))?;

    let scheme = updated.scheme().or(base.scheme()).cloned();
    let authority = updated.authority().or(base.authority()).cloned();
    if scheme.as_ref() != base.scheme() {
        return Err(FleetError::InvalidConfig(
            "updated server URI scheme does not match base URI scheme".to_string(),
        ));
    }
    if authority.as_ref() != base.authority() {
        return Err(FleetError::InvalidConfig(
            "updated server URI host does not match base URI host".to_string(),
        ));
    }

    let mut builder = Uri::builder();
    if let Some(scheme) = scheme {
        builder = builder.scheme(scheme);
    }
    if let Some(authority) = authority {
        builder = builder.authority(authority);
    }
    let path = updated
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    let uri = builder
        .path_and_query(path)
        .build()
        .map_err(|e| FleetError::InvalidConfig(format!("invalid updated server URI: {}", e)))?;
    Ok(uri.to_string())
}

/// Run `script` on `sandbox` and decode its output as container launch
/// parameters for `config`.
pub async fn resolve_container_launch(
    sandbox: &dyn ScriptSandbox,
    script: &str,
    input: &serde_json::Value,
    timeout: Duration,
    config: &mut ContainerRunConfig,
) -> Result<()> {
    let started = std::time::Instant::now();
    let output = sandbox.execute(script, input, timeout).await?;
    tracing::debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Launcher script finished"
    );
    ContainerLaunchParams::from_json(output)?.apply(config);
    Ok(())
}

/// Run `script` on `sandbox` and decode its output as remote launch
/// parameters for `config`. Headers and query arguments are replaced; the
/// server URI and protocol only when the script names them.
pub async fn resolve_remote_launch(
    sandbox: &dyn ScriptSandbox,
    script: &str,
    input: &serde_json::Value,
    timeout: Duration,
    config: &mut RemoteRunConfig,
) -> Result<()> {
    let output = sandbox.execute(script, input, timeout).await?;
    RemoteLaunchParams::from_json(output)?.apply(config)
}
