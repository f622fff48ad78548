use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Unsupported worker type: {0}")]
    UnsupportedWorkerType(String),

    #[error("Run stream is not initialized")]
    NotInitialized,

    #[error("Connection closed before the operation completed")]
    ConnectionClosed,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Only request messages can wait for a response")]
    NotARequest,

    #[error("Remote rejected the run ({code}): {message}")]
    RemoteRejected { code: String, message: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Already started")]
    AlreadyStarted,

    #[error("Worker connection is not started")]
    NotStarted,

    #[error("Worker type {worker_type} does not support {operation}")]
    UnsupportedOperation {
        worker_type: String,
        operation: &'static str,
    },

    #[error("No eligible {0} worker available")]
    NoWorkerAvailable(String),

    #[error("Launcher failed ({code}): {message}")]
    Launcher { code: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether a caller above this layer may retry the operation on another
    /// run or worker. Remote rejections and usage errors are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::ConnectionClosed
            | FleetError::TransportError(_)
            | FleetError::NoWorkerAvailable(_) => true,
            FleetError::GrpcError(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::Cancelled | tonic::Code::Aborted
            ),
            _ => false,
        }
    }
}

impl From<FleetError> for tonic::Status {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::InvalidEnvelope(_)
            | FleetError::UnsupportedWorkerType(_)
            | FleetError::NotARequest
            | FleetError::InvalidConfig(_) => tonic::Status::invalid_argument(err.to_string()),
            FleetError::NotInitialized | FleetError::NotStarted | FleetError::AlreadyStarted => {
                tonic::Status::failed_precondition(err.to_string())
            }
            FleetError::ConnectionClosed
            | FleetError::TransportError(_)
            | FleetError::NoWorkerAvailable(_) => tonic::Status::unavailable(err.to_string()),
            FleetError::UnsupportedOperation { .. } => tonic::Status::unimplemented(err.to_string()),
            FleetError::GrpcError(status) => status,
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
