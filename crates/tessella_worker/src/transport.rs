//! Peer transport: one lazily-connected gRPC client per peer worker.
//!
//! Peers are constructed once at `Initialize` and are stable until shutdown.
//! Calls surface transport failures as `WorkerError::Transport`; routing and
//! merge semantics live above this layer.

use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::errors::{Result, WorkerError};
use crate::rpc;
use crate::rpc::worker_client::WorkerClient;

/// Handle to one peer worker.
#[derive(Clone)]
pub struct Peer {
    worker_id: i32,
    addr: String,
    client: WorkerClient<Channel>,
}

impl Peer {
    /// Build a proxy for peer `worker_id` at `host:port`.
    ///
    /// The channel connects lazily: peers may come up in any order during
    /// cluster initialization, so the first RPC pays the connection cost.
    pub fn connect(worker_id: i32, host: &str, port: i32) -> Result<Self> {
        let addr = format!("http://{host}:{port}");
        let endpoint = Endpoint::from_shared(addr.clone()).map_err(WorkerError::transport)?;
        let channel = endpoint.connect_lazy();
        debug!(peer = worker_id, addr = %addr, "created peer proxy");
        Ok(Self {
            worker_id,
            addr,
            client: WorkerClient::new(channel),
        })
    }

    pub fn worker_id(&self) -> i32 {
        self.worker_id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Fetch one key from the peer's shard.
    pub async fn get(&self, req: rpc::GetRequest) -> Result<rpc::TableData> {
        let mut client = self.client.clone();
        let resp = client.get(req).await?;
        Ok(resp.into_inner())
    }

    /// Ship a drained pending batch to the owning peer.
    pub async fn put(&self, data: rpc::TableData) -> Result<()> {
        let mut client = self.client.clone();
        client.put(data).await?;
        Ok(())
    }

    /// Fetch or refill a server-side iterator batch.
    pub async fn get_iterator(&self, req: rpc::IteratorReq) -> Result<rpc::IteratorResp> {
        let mut client = self.client.clone();
        let resp = client.get_iterator(req).await?;
        Ok(resp.into_inner())
    }
}
