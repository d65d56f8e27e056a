//! gRPC service handlers that adapt network requests into worker operations.
//!
//! This module is the server-side counterpart to `transport.rs`: it is pure
//! translation between protobuf messages and the worker's core operations,
//! plus the mapping of `WorkerError` onto gRPC status codes.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::trace;

use crate::errors::WorkerError;
use crate::rpc;
use crate::rpc::worker_server;
use crate::worker::Worker;

/// gRPC service implementation backed by the shared worker state.
#[derive(Clone)]
pub struct WorkerService {
    worker: Arc<Worker>,
}

impl WorkerService {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }
}

/// Map a worker error onto the gRPC status vocabulary.
fn to_status(err: WorkerError) -> Status {
    match &err {
        WorkerError::UnknownTable(_) | WorkerError::UnknownIterator(_) | WorkerError::NotFound => {
            Status::not_found(err.to_string())
        }
        WorkerError::RoutingViolation { .. } | WorkerError::InvalidShard { .. } => {
            Status::failed_precondition(err.to_string())
        }
        WorkerError::Transport(_) => Status::unavailable(err.to_string()),
        WorkerError::KernelFailure(_) | WorkerError::Internal(_) => {
            Status::internal(err.to_string())
        }
    }
}

#[tonic::async_trait]
impl worker_server::Worker for WorkerService {
    async fn initialize(
        &self,
        request: Request<rpc::WorkerInitReq>,
    ) -> Result<Response<rpc::Empty>, Status> {
        self.worker
            .initialize(request.into_inner())
            .map_err(to_status)?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn create_table(
        &self,
        request: Request<rpc::CreateTableReq>,
    ) -> Result<Response<rpc::Empty>, Status> {
        let req = request.into_inner();
        self.worker.create_table(req).map_err(|err| match err {
            // A bad plug-in spec is the master's mistake, not ours.
            WorkerError::Internal(msg) => Status::invalid_argument(msg),
            other => to_status(other),
        })?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn destroy_table(
        &self,
        request: Request<rpc::DestroyTableReq>,
    ) -> Result<Response<rpc::Empty>, Status> {
        self.worker
            .destroy_table(request.into_inner().table)
            .map_err(to_status)?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn assign_shards(
        &self,
        request: Request<rpc::ShardAssignmentReq>,
    ) -> Result<Response<rpc::Empty>, Status> {
        self.worker
            .assign_shards(request.into_inner())
            .map_err(to_status)?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn get(
        &self,
        request: Request<rpc::GetRequest>,
    ) -> Result<Response<rpc::TableData>, Status> {
        let req = request.into_inner();
        trace!(table = req.table, shard = req.shard, "handling get");
        let resp = self.worker.get(req).map_err(to_status)?;
        Ok(Response::new(resp))
    }

    async fn put(
        &self,
        request: Request<rpc::TableData>,
    ) -> Result<Response<rpc::PutResp>, Status> {
        let data = request.into_inner();
        trace!(
            table = data.table,
            shard = data.shard,
            source = data.source,
            entries = data.kv_data.len(),
            "handling put"
        );
        self.worker.put(data).map_err(to_status)?;
        Ok(Response::new(rpc::PutResp {}))
    }

    async fn get_iterator(
        &self,
        request: Request<rpc::IteratorReq>,
    ) -> Result<Response<rpc::IteratorResp>, Status> {
        let resp = self
            .worker
            .get_iterator(request.into_inner())
            .map_err(to_status)?;
        Ok(Response::new(resp))
    }

    async fn run_kernel(
        &self,
        request: Request<rpc::RunKernelReq>,
    ) -> Result<Response<rpc::RunKernelResp>, Status> {
        let resp = self
            .worker
            .clone()
            .run_kernel(request.into_inner())
            .await
            .map_err(to_status)?;
        Ok(Response::new(resp))
    }

    async fn flush(
        &self,
        _request: Request<rpc::Empty>,
    ) -> Result<Response<rpc::Empty>, Status> {
        self.worker.flush_all().await.map_err(to_status)?;
        Ok(Response::new(rpc::Empty {}))
    }

    async fn shutdown(
        &self,
        _request: Request<rpc::Empty>,
    ) -> Result<Response<rpc::Empty>, Status> {
        self.worker.shutdown();
        Ok(Response::new(rpc::Empty {}))
    }
}
