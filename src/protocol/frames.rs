//! Builders for the frames exchanged over a run stream.

use crate::proto::{run_request, run_response, RunClose, RunConfig, RunRequest, RunRequestInit, RunResponse};
use crate::protocol::Message;

pub fn init_frame(config: RunConfig, connection_id: &str) -> RunRequest {
    RunRequest {
        kind: Some(run_request::Kind::Init(RunRequestInit {
            config: Some(config),
            connection_id: connection_id.to_string(),
        })),
    }
}

pub fn message_frame(message: &Message) -> RunRequest {
    RunRequest {
        kind: Some(run_request::Kind::Message(message.to_frame())),
    }
}

pub fn close_frame() -> RunRequest {
    RunRequest {
        kind: Some(run_request::Kind::Close(RunClose {})),
    }
}

/// Short frame name for logs.
pub fn response_kind(response: &RunResponse) -> &'static str {
    match &response.kind {
        Some(run_response::Kind::Init(_)) => "init",
        Some(run_response::Kind::Message(_)) => "message",
        Some(run_response::Kind::Output(_)) => "output",
        Some(run_response::Kind::Error(_)) => "error",
        Some(run_response::Kind::Close(_)) => "close",
        None => "empty",
    }
}
