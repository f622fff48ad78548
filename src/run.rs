//! Streaming relay session between a caller and one workload on a worker.
//!
//! A [`Run`] owns a single bidirectional `StreamRun` call. After the init
//! handshake a background receive loop fans inbound frames out to three
//! broadcasters:
//!
//! - [`Run::messages`]: relayed protocol envelopes
//! - [`Run::output`]: output lines from the workload
//! - [`Run::errors`]: error events; each one also triggers a close
//!
//! The run's cancellation token is a child of its worker's token, so stopping
//! the worker ends every run on it.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tonic::transport::Channel;
use tonic::Streaming;
use uuid::Uuid;

use crate::config::RunPolicy;
use crate::error::{FleetError, Result};
use crate::proto::runner_client::RunnerClient;
use crate::proto::{run_response, RunConfig, RunError, RunOutput, RunRequest, RunResponse};
use crate::protocol::{frames, Message, MessageKind};
use crate::pubsub::Broadcaster;

/// Frames buffered towards the worker before `send_message` waits.
const OUTBOUND_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Created,
    Initializing,
    Active,
    Closing,
    Closed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Created => write!(f, "created"),
            RunState::Initializing => write!(f, "initializing"),
            RunState::Active => write!(f, "active"),
            RunState::Closing => write!(f, "closing"),
            RunState::Closed => write!(f, "closed"),
        }
    }
}

pub struct Run {
    connection_id: String,
    config: RunConfig,
    client: RunnerClient<Channel>,
    policy: RunPolicy,
    remote_id: OnceLock<String>,
    state: Mutex<RunState>,
    outbound: Mutex<Option<mpsc::Sender<RunRequest>>>,
    cancel: CancellationToken,
    messages: Broadcaster<Message>,
    output: Broadcaster<RunOutput>,
    errors: Broadcaster<RunError>,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("connection_id", &self.connection_id)
            .field("remote_id", &self.remote_id.get())
            .field("state", &*self.state_guard())
            .finish()
    }
}

impl Run {
    pub fn new(
        client: RunnerClient<Channel>,
        config: RunConfig,
        cancel: CancellationToken,
        policy: RunPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_id: Uuid::new_v4().to_string(),
            config,
            client,
            policy,
            remote_id: OnceLock::new(),
            state: Mutex::new(RunState::Created),
            outbound: Mutex::new(None),
            cancel,
            messages: Broadcaster::new(),
            output: Broadcaster::new(),
            errors: Broadcaster::new(),
        })
    }

    /// Open the stream, send the init frame and wait for the worker's
    /// answer. On success the receive loop is running when this returns.
    ///
    /// # Errors
    ///
    /// - [`FleetError::RemoteRejected`] if the worker answered with an error
    /// - [`FleetError::ProtocolViolation`] if the first frame was neither init nor error
    /// - [`FleetError::ConnectionClosed`] or a transport error if the stream dropped
    ///
    /// A failed start tears the run down; it cannot be started again.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state_guard();
            if *state != RunState::Created {
                return Err(FleetError::AlreadyStarted);
            }
            *state = RunState::Initializing;
        }

        match self.initialize().await {
            Ok(inbound) => {
                self.set_state(RunState::Active);
                tracing::info!(
                    connection_id = %self.connection_id,
                    remote_id = %self.remote_id().unwrap_or_default(),
                    "Run initialized"
                );

                let run = self.clone();
                tokio::spawn(async move {
                    run.receive_loop(inbound).await;
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "Run initialization failed"
                );
                self.teardown();
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<Streaming<RunResponse>> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        tx.send(frames::init_frame(self.config.clone(), &self.connection_id))
            .await
            .map_err(|_| FleetError::SendFailed("request stream closed before init".to_string()))?;

        let mut client = self.client.clone();
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FleetError::ConnectionClosed),
            response = client.stream_run(ReceiverStream::new(rx)) => response?,
        };
        let mut inbound = response.into_inner();

        let first = tokio::select! {
            _ = self.cancel.cancelled() => return Err(FleetError::ConnectionClosed),
            first = inbound.message() => first?,
        };
        let Some(first) = first else {
            return Err(FleetError::ConnectionClosed);
        };

        match first.kind {
            Some(run_response::Kind::Init(init)) => {
                let _ = self.remote_id.set(init.remote_id);
            }
            Some(run_response::Kind::Error(err)) => {
                let rejected = FleetError::RemoteRejected {
                    code: err.code.clone(),
                    message: err.message.clone(),
                };
                self.errors.publish(err);
                return Err(rejected);
            }
            other => {
                let kind = frames::response_kind(&RunResponse { kind: other });
                return Err(FleetError::ProtocolViolation(format!(
                    "expected init response, got {} frame",
                    kind
                )));
            }
        }

        *self.outbound_guard() = Some(tx);
        Ok(inbound)
    }

    async fn receive_loop(self: Arc<Self>, mut inbound: Streaming<RunResponse>) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = inbound.message() => next,
            };

            match next {
                Ok(Some(response)) => {
                    if !self.dispatch(response) {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(connection_id = %self.connection_id, "Run stream ended");
                    break;
                }
                Err(status) if status.code() == tonic::Code::Cancelled => {
                    tracing::debug!(connection_id = %self.connection_id, "Run stream cancelled");
                    break;
                }
                Err(status) => {
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        error = %status,
                        "Run stream failed"
                    );
                    break;
                }
            }
        }

        self.teardown();
    }

    /// Route one inbound frame. Returns `false` when the loop should end.
    fn dispatch(self: &Arc<Self>, response: RunResponse) -> bool {
        match response.kind {
            Some(run_response::Kind::Message(raw)) => {
                match Message::from_frame(&raw) {
                    Ok(message) => self.messages.publish(message),
                    Err(e) => tracing::warn!(
                        connection_id = %self.connection_id,
                        error = %e,
                        "Dropping invalid relayed message"
                    ),
                }
                true
            }
            Some(run_response::Kind::Output(output)) => {
                self.output.publish(output);
                true
            }
            Some(run_response::Kind::Error(err)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    code = %err.code,
                    message = %err.message,
                    "Run reported an error"
                );
                self.errors.publish(err);

                let run = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = run.close().await {
                        tracing::debug!(error = %e, "Close after run error failed");
                    }
                });
                true
            }
            Some(run_response::Kind::Close(_)) => {
                tracing::info!(connection_id = %self.connection_id, "Run closed by worker");
                false
            }
            Some(run_response::Kind::Init(_)) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    "Ignoring init frame on an active run"
                );
                true
            }
            None => true,
        }
    }

    /// Relay an envelope to the workload.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let sender = self.active_sender()?;
        sender
            .send(frames::message_frame(message))
            .await
            .map_err(|_| FleetError::SendFailed("run stream is closed".to_string()))
    }

    /// Send a request and wait for the response or error carrying its id.
    ///
    /// Other messages published meanwhile are skipped, so several requests
    /// may be in flight on the same run.
    pub async fn send_and_wait_for_response(&self, request: &Message) -> Result<Message> {
        if request.kind() != MessageKind::Request {
            return Err(FleetError::NotARequest);
        }

        // subscribe before sending so the answer cannot slip past
        let mut subscription = self.messages.subscribe();
        let sender = self.active_sender()?;

        let send = sender.send(frames::message_frame(request));
        tokio::pin!(send);
        let mut sent = false;

        loop {
            tokio::select! {
                biased;

                received = subscription.recv() => match received {
                    Some(message) if message.is_response_to(request) => return Ok(message),
                    Some(_) => continue,
                    None => return Err(FleetError::ConnectionClosed),
                },
                result = &mut send, if !sent => {
                    if result.is_err() {
                        return Err(FleetError::SendFailed("run stream is closed".to_string()));
                    }
                    sent = true;
                }
                _ = self.cancel.cancelled() => return Err(FleetError::ConnectionClosed),
            }
        }
    }

    /// Ask the worker to end the run and wait until the stream is gone or
    /// the close timeout passes, whichever is first. Closing a closed run is
    /// a no-op.
    pub async fn close(&self) -> Result<()> {
        let first_close = {
            let mut state = self.state_guard();
            match *state {
                RunState::Created | RunState::Initializing => return Err(FleetError::NotInitialized),
                RunState::Closed => return Ok(()),
                RunState::Closing => false,
                RunState::Active => {
                    *state = RunState::Closing;
                    true
                }
            }
        };

        let sender = if first_close {
            self.outbound_guard().clone()
        } else {
            None
        };

        // the close frame counts against the timeout: a worker that stopped
        // reading leaves the request stream full
        let ended = tokio::time::timeout(self.policy.close_timeout(), async {
            if let Some(sender) = sender {
                if sender.send(frames::close_frame()).await.is_err() {
                    tracing::debug!(
                        connection_id = %self.connection_id,
                        "Request stream already closed"
                    );
                }
            }
            self.cancel.cancelled().await;
        })
        .await;

        if ended.is_err() {
            tracing::warn!(
                connection_id = %self.connection_id,
                timeout_ms = self.policy.close_timeout_ms,
                "Worker did not end the run in time, forcing close"
            );
            self.teardown();
        }

        self.outbound_guard().take();
        Ok(())
    }

    fn teardown(&self) {
        self.set_state(RunState::Closed);
        self.outbound_guard().take();
        self.messages.close();
        self.output.close();
        self.errors.close();
        self.cancel.cancel();
    }

    fn active_sender(&self) -> Result<mpsc::Sender<RunRequest>> {
        match self.state() {
            RunState::Created | RunState::Initializing => return Err(FleetError::NotInitialized),
            RunState::Closing | RunState::Closed => return Err(FleetError::ConnectionClosed),
            RunState::Active => {}
        }
        self.outbound_guard()
            .clone()
            .ok_or(FleetError::NotInitialized)
    }

    /// Id the worker assigned on init.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.get().map(String::as_str)
    }

    /// Id this side sent with the init frame.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.state_guard()
    }

    pub fn messages(&self) -> &Broadcaster<Message> {
        &self.messages
    }

    pub fn output(&self) -> &Broadcaster<RunOutput> {
        &self.output
    }

    pub fn errors(&self) -> &Broadcaster<RunError> {
        &self.errors
    }

    /// Idle limit the orchestration layer should enforce on this run.
    pub fn inactivity_timeout(&self) -> Duration {
        self.policy.inactivity_timeout()
    }

    /// Resolves once the run has ended for any reason.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_state(&self, next: RunState) {
        let mut state = self.state_guard();
        // states only move forward
        if next > *state {
            tracing::trace!(connection_id = %self.connection_id, from = %*state, to = %next, "Run state");
            *state = next;
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outbound_guard(&self) -> MutexGuard<'_, Option<mpsc::Sender<RunRequest>>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
