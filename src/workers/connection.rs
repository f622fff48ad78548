use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tonic::transport::{Channel, Endpoint};

use crate::config::ConnectionConfig;
use crate::error::{FleetError, Result};
use crate::proto::worker_client::WorkerClient;
use crate::proto::{self, WorkerHealthRequest, WorkerInfoRequest, WorkerInfoResponse};
use crate::pubsub::Broadcaster;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// One health report from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub status: HealthStatus,
    pub accepting_jobs: bool,
    pub observed_at: DateTime<Utc>,
}

impl From<&WorkerInfoResponse> for WorkerHealth {
    fn from(info: &WorkerInfoResponse) -> Self {
        let status = if info.status == proto::WorkerStatus::Healthy as i32 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        Self {
            worker_id: info.worker_id.clone(),
            status,
            accepting_jobs: info.accepting_jobs == proto::WorkerAcceptingJobs::Accepting as i32,
            observed_at: Utc::now(),
        }
    }
}

impl WorkerHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Copy)]
struct HealthState {
    status: HealthStatus,
    accepting_jobs: bool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            accepting_jobs: false,
        }
    }
}

/// Control connection to a single worker process.
///
/// The connection's cancellation token is a child of the owner's token and is
/// the worker's lifetime: it fires when the worker is stopped or when its
/// health stream ends or fails. Runs created on the worker hang their own
/// tokens off it.
pub struct WorkerConnection {
    worker_id: String,
    address: String,
    config: ConnectionConfig,
    cancel: CancellationToken,
    channel: Mutex<Option<Channel>>,
    state: Arc<Mutex<HealthState>>,
    health: Broadcaster<WorkerHealth>,
    started: AtomicBool,
    registered_at: DateTime<Utc>,
}

impl WorkerConnection {
    pub fn new(
        worker_id: &str,
        address: &str,
        config: ConnectionConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            address: address.to_string(),
            config,
            cancel: parent.child_token(),
            channel: Mutex::new(None),
            state: Arc::new(Mutex::new(HealthState::default())),
            health: Broadcaster::new(),
            started: AtomicBool::new(false),
            registered_at: Utc::now(),
        }
    }

    /// Dial the worker, perform the info handshake and start consuming its
    /// health stream in the background.
    ///
    /// A connection that failed to start is cancelled and must not be reused.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FleetError::AlreadyStarted);
        }

        match self.connect().await {
            Ok((client, info)) => {
                let snapshot = WorkerHealth::from(&info);
                set_state(&self.state, &snapshot);
                self.health.publish(snapshot);

                tokio::spawn(health_routine(
                    client,
                    self.worker_id.clone(),
                    self.state.clone(),
                    self.health.clone(),
                    self.cancel.clone(),
                ));

                tracing::info!(
                    worker_id = %self.worker_id,
                    address = %self.address,
                    healthy = info.status == proto::WorkerStatus::Healthy as i32,
                    "Connected to worker"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    address = %self.address,
                    error = %e,
                    "Failed to connect to worker"
                );
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<(WorkerClient<Channel>, WorkerInfoResponse)> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.address))?
            .connect_timeout(self.config.connect_timeout())
            .http2_keep_alive_interval(self.config.keepalive_interval())
            .keep_alive_timeout(self.config.keepalive_timeout())
            .keep_alive_while_idle(false);

        let channel = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FleetError::ConnectionClosed),
            channel = endpoint.connect() => channel?,
        };
        let mut client = WorkerClient::new(channel.clone());

        let handshake = tokio::time::timeout(
            self.config.connect_timeout(),
            client.get_worker_info(WorkerInfoRequest {}),
        );
        let info = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FleetError::ConnectionClosed),
            reply = handshake => match reply {
                Ok(reply) => reply?.into_inner(),
                Err(_) => {
                    return Err(FleetError::GrpcError(tonic::Status::deadline_exceeded(
                        "worker info handshake timed out",
                    )))
                }
            },
        };

        if info.worker_id != self.worker_id {
            tracing::warn!(
                worker_id = %self.worker_id,
                reported_id = %info.worker_id,
                "Worker reported a different id than it registered with"
            );
        }

        *self.channel_guard() = Some(channel);
        Ok((client, info))
    }

    /// Close the health broadcast, cancel the worker's lifetime and release
    /// the channel. Safe to call more than once.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(worker_id = %self.worker_id, "Stopping worker connection");
        }
        self.health.close();
        self.cancel.cancel();
        self.channel_guard().take();
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn is_healthy(&self) -> bool {
        !self.cancel.is_cancelled() && self.state_snapshot().status == HealthStatus::Healthy
    }

    pub fn is_accepting_jobs(&self) -> bool {
        !self.cancel.is_cancelled() && self.state_snapshot().accepting_jobs
    }

    pub fn health_broadcast(&self) -> &Broadcaster<WorkerHealth> {
        &self.health
    }

    /// Shared channel for type-specific RPC clients.
    pub fn channel(&self) -> Result<Channel> {
        if self.cancel.is_cancelled() {
            return Err(FleetError::ConnectionClosed);
        }
        self.channel_guard().clone().ok_or(FleetError::NotStarted)
    }

    /// Resolves once the worker's lifetime has ended.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that is cancelled together with this worker.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    fn channel_guard(&self) -> MutexGuard<'_, Option<Channel>> {
        self.channel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_snapshot(&self) -> HealthState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn set_state(state: &Mutex<HealthState>, snapshot: &WorkerHealth) -> HealthState {
    let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let previous = *state;
    state.status = snapshot.status;
    state.accepting_jobs = snapshot.accepting_jobs;
    previous
}

/// Consume the worker's health stream until it ends, fails or the worker is
/// cancelled. Ending for any reason cancels the worker.
async fn health_routine(
    mut client: WorkerClient<Channel>,
    worker_id: String,
    state: Arc<Mutex<HealthState>>,
    health: Broadcaster<WorkerHealth>,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = client.stream_worker_health(WorkerHealthRequest {}) => opened,
    };

    match opened {
        Ok(response) => {
            let mut stream = response.into_inner();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.message() => next,
                };

                match next {
                    Ok(Some(info)) => {
                        let snapshot = WorkerHealth::from(&info);
                        let previous = set_state(&state, &snapshot);
                        if previous.status != snapshot.status
                            || previous.accepting_jobs != snapshot.accepting_jobs
                        {
                            tracing::info!(
                                worker_id = %worker_id,
                                status = ?snapshot.status,
                                accepting_jobs = snapshot.accepting_jobs,
                                "Worker health changed"
                            );
                        }
                        health.publish(snapshot);
                    }
                    Ok(None) => {
                        tracing::info!(worker_id = %worker_id, "Worker health stream ended");
                        break;
                    }
                    Err(status) if status.code() == tonic::Code::Cancelled => {
                        tracing::debug!(worker_id = %worker_id, "Worker health stream cancelled");
                        break;
                    }
                    Err(status) => {
                        tracing::warn!(
                            worker_id = %worker_id,
                            error = %status,
                            "Worker health stream failed"
                        );
                        break;
                    }
                }
            }
        }
        Err(status) => {
            tracing::warn!(
                worker_id = %worker_id,
                error = %status,
                "Failed to open worker health stream"
            );
        }
    }

    health.close();
    cancel.cancel();
}
