use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::BrokerService;
use crate::proto::worker_broker_server::WorkerBrokerServer;
use crate::registry::WorkerRegistry;

pub struct GrpcServer {
    addr: SocketAddr,
    registry: WorkerRegistry,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, registry: WorkerRegistry) -> Self {
        Self { addr, registry }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let broker_service = BrokerService::new(self.registry.clone());

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(WorkerBrokerServer::new(broker_service))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
