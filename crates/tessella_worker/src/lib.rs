//! Worker-side runtime of the Tessella sharded in-memory table engine.
//!
//! A cluster is one master plus many workers. Each worker hosts shards of
//! one or more tables and executes user kernels against the shards it owns;
//! tables route reads and writes so kernel code sees the global table as if
//! it were local. This crate provides the whole worker: storage, routing,
//! plug-in registries, the kernel harness, the RPC service, and an embedded
//! API for running workers in-process (used heavily by the integration
//! tests).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::info;

pub mod errors;
pub mod kernel;
pub mod plugins;
pub mod rpc_service;
pub mod shard;
pub mod table;
pub mod transport;
pub mod worker;

/// Generated protobuf/gRPC bindings.
pub mod rpc {
    tonic::include_proto!("tessella.rpc");
}

use rpc::master_client::MasterClient;
use rpc::worker_server::WorkerServer;
use rpc_service::WorkerService;
use worker::{Worker, WorkerTuning};

/// Configuration for one worker process (or embedded worker).
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Master address as `host:port`.
    pub master_addr: String,
    /// Hostname this worker advertises to the master.
    pub host: String,
    /// Listen port; `None` picks a free port.
    pub port: Option<u16>,
    /// Entries fetched per iterator batch.
    pub fetch_count: u32,
    /// Pending-buffer size that triggers an early shard flush.
    pub pending_high_water: usize,
    /// How long startup waits for the master's `Initialize` callback.
    pub register_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(master_addr: impl Into<String>) -> Self {
        Self {
            master_addr: master_addr.into(),
            host: "127.0.0.1".to_string(),
            port: None,
            fetch_count: 512,
            pending_high_water: 10_000,
            register_timeout: Duration::from_secs(20),
        }
    }
}

/// Handle to a running worker.
pub struct WorkerHandle {
    addr: SocketAddr,
    worker: Arc<Worker>,
    server: tokio::task::JoinHandle<Result<(), tonic::transport::Error>>,
}

impl WorkerHandle {
    /// The address the worker's RPC server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// This worker's cluster id (-1 before `Initialize`).
    pub fn worker_id(&self) -> i32 {
        self.worker.id()
    }

    /// Block until the worker shuts down; yields the process exit code
    /// (0 after a clean master-driven shutdown, non-zero on fatal errors).
    pub async fn wait_for_shutdown(self) -> anyhow::Result<i32> {
        let code = self.worker.wait_for_shutdown().await;
        self.server
            .await
            .context("join rpc server task")?
            .context("rpc server failed")?;
        Ok(code)
    }

    /// Tear the worker down without a master `Shutdown`.
    pub fn abort(&self) {
        self.server.abort();
    }
}

/// Start a worker: bind the RPC server, register with the master, and wait
/// until the master has initialized this worker's peer mesh.
pub async fn start_worker(config: WorkerConfig) -> anyhow::Result<WorkerHandle> {
    let worker = Arc::new(Worker::new(WorkerTuning {
        fetch_count: config.fetch_count,
        pending_high_water: config.pending_high_water,
    }));

    let bind_addr = format!("{}:{}", config.host, config.port.unwrap_or(0));
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind worker listener on {bind_addr}"))?;
    let addr = listener.local_addr().context("read bound address")?;
    info!(addr = %addr, "starting worker rpc server");

    let service = WorkerServer::new(WorkerService::new(worker.clone()));
    let shutdown_worker = worker.clone();
    let server = tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown_worker.wait_for_shutdown().await;
            }),
    );

    // Register with the master, then block until it calls back with
    // `Initialize(id, peers)`.
    let master_uri = format!("http://{}", config.master_addr);
    let mut master = MasterClient::connect(master_uri.clone())
        .await
        .with_context(|| format!("connect to master at {master_uri}"))?;
    info!(master = %config.master_addr, port = addr.port(), "registering worker");
    master
        .register_worker(rpc::RegisterReq {
            addr: Some(rpc::Addr {
                host: config.host.clone(),
                port: addr.port() as i32,
            }),
        })
        .await
        .context("register with master")?;

    worker
        .wait_for_registration(config.register_timeout)
        .await
        .context("wait for master initialize")?;
    info!(worker = worker.id(), addr = %addr, "worker registered");

    Ok(WorkerHandle {
        addr,
        worker,
        server,
    })
}
