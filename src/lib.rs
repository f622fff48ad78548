pub mod config;
pub mod error;
pub mod grpc;
pub mod key_lock;
pub mod manager;
pub mod protocol;
pub mod pubsub;
pub mod registry;
pub mod run;
pub mod runtime;
pub mod selection;
pub mod shutdown;
pub mod workers;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("fleet");
}
