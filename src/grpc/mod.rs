//! gRPC surface exposed by the manager.

pub mod broker_service;
pub mod server;

pub use broker_service::BrokerService;
pub use server::GrpcServer;
