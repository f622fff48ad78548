use tonic::{Request, Response, Status};

use crate::proto::worker_broker_server::WorkerBroker;
use crate::proto::{
    self, ListManagersRequest, ListManagersResponse, ListWorkersRequest, ListWorkersResponse,
    Manager, RegisterWorkerRequest, RegisterWorkerResponse,
};
use crate::registry::{WorkerRegistry, WorkerSummary};
use crate::workers::WorkerType;

/// Registration and discovery RPCs backed by the worker registry.
pub struct BrokerService {
    registry: WorkerRegistry,
}

impl BrokerService {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self { registry }
    }
}

fn summary_to_proto(summary: WorkerSummary) -> proto::WorkerSummary {
    proto::WorkerSummary {
        worker_id: summary.worker_id,
        worker_type: summary.worker_type.to_proto() as i32,
        address: summary.address,
        healthy: summary.healthy,
        accepting_jobs: summary.accepting_jobs,
        standalone: summary.standalone,
        registered_at_ms: summary.registered_at.timestamp_millis(),
    }
}

#[tonic::async_trait]
impl WorkerBroker for BrokerService {
    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let req = request.into_inner();
        let worker_type = WorkerType::from_proto(req.worker_type).map_err(|e| {
            tracing::warn!(worker_id = %req.worker_id, error = %e, "Rejected worker registration");
            Status::from(e)
        })?;

        self.registry
            .register_worker(&req.worker_id, &req.address, worker_type)
            .await?;

        Ok(Response::new(RegisterWorkerResponse {}))
    }

    async fn list_managers(
        &self,
        _request: Request<ListManagersRequest>,
    ) -> Result<Response<ListManagersResponse>, Status> {
        let managers = self
            .registry
            .list_managers()
            .into_iter()
            .map(|peer| Manager {
                id: peer.id,
                address: peer.address,
            })
            .collect();

        Ok(Response::new(ListManagersResponse { managers }))
    }

    async fn list_workers(
        &self,
        request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        let req = request.into_inner();
        let filter = if req.worker_type == proto::WorkerType::Unspecified as i32 {
            None
        } else {
            Some(WorkerType::from_proto(req.worker_type)?)
        };

        let workers = self
            .registry
            .list_workers()
            .into_iter()
            .filter(|summary| filter.map_or(true, |t| summary.worker_type == t))
            .map(summary_to_proto)
            .collect();

        Ok(Response::new(ListWorkersResponse { workers }))
    }
}
