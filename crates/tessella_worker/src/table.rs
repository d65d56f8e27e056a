//! Table: a named collection of shards plus the routing, flushing, and
//! iteration machinery that makes the global table look local to kernels.
//!
//! The table owns its shard slots and a replica of the cluster-wide routing
//! vector (shard index -> owning worker). Reads and writes against shards
//! this worker owns touch memory directly; everything else routes to the
//! owning peer through its proxy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::try_join_all;
use tracing::{debug, trace};

use crate::errors::{Result, WorkerError};
use crate::plugins::{Accumulator, Selector, Sharder};
use crate::rpc;
use crate::shard::Shard;
use crate::transport::Peer;

/// Per-shard routing entry.
#[derive(Clone, Copy, Debug)]
pub struct ShardInfo {
    pub owner: i32,
}

/// Construction parameters for a table; plug-ins are already materialized.
pub struct TableOptions {
    pub id: i32,
    pub num_shards: usize,
    pub self_id: i32,
    pub peers: HashMap<i32, Peer>,
    pub sharder: Arc<dyn Sharder>,
    pub combiner: Arc<dyn Accumulator>,
    pub reducer: Arc<dyn Accumulator>,
    pub selector: Arc<dyn Selector>,
    pub fetch_count: u32,
    pub pending_high_water: usize,
}

/// A sharded key/value table.
pub struct Table {
    id: i32,
    num_shards: usize,
    self_id: i32,
    shards: Vec<Arc<Shard>>,
    routing: RwLock<Vec<ShardInfo>>,
    peers: HashMap<i32, Peer>,
    sharder: Arc<dyn Sharder>,
    combiner: Arc<dyn Accumulator>,
    reducer: Arc<dyn Accumulator>,
    selector: Arc<dyn Selector>,
    fetch_count: u32,
    pending_high_water: usize,
}

impl Table {
    pub fn new(opts: TableOptions) -> Self {
        let shards = (0..opts.num_shards)
            .map(|s| Arc::new(Shard::new(opts.id, s as i32)))
            .collect();
        // Until the master assigns shards, nothing is owned by anyone.
        let routing = vec![ShardInfo { owner: -1 }; opts.num_shards];
        Self {
            id: opts.id,
            num_shards: opts.num_shards,
            self_id: opts.self_id,
            shards,
            routing: RwLock::new(routing),
            peers: opts.peers,
            sharder: opts.sharder,
            combiner: opts.combiner,
            reducer: opts.reducer,
            selector: opts.selector,
            fetch_count: opts.fetch_count,
            pending_high_water: opts.pending_high_water,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// The shard index `key` routes to.
    pub fn shard_for_key(&self, key: &[u8]) -> usize {
        self.sharder.shard_for_key(key, self.num_shards) % self.num_shards
    }

    /// The worker owning shard `shard`, per the current routing table.
    pub fn worker_for_shard(&self, shard: usize) -> i32 {
        let routing = self.routing.read().expect("routing lock poisoned");
        routing.get(shard).map(|info| info.owner).unwrap_or(-1)
    }

    /// Install the owner for one shard (master-directed assignment).
    pub fn set_owner(&self, shard: usize, worker: i32) -> Result<()> {
        let mut routing = self.routing.write().expect("routing lock poisoned");
        match routing.get_mut(shard) {
            Some(info) => {
                info.owner = worker;
                Ok(())
            }
            None => Err(WorkerError::Internal(format!(
                "shard {shard} out of range for table {} ({} shards)",
                self.id, self.num_shards
            ))),
        }
    }

    fn shard(&self, shard: usize) -> Result<&Arc<Shard>> {
        self.shards
            .get(shard)
            .ok_or_else(|| WorkerError::Internal(format!(
                "shard {shard} out of range for table {} ({} shards)",
                self.id, self.num_shards
            )))
    }

    fn peer(&self, worker: i32) -> Result<&Peer> {
        self.peers.get(&worker).ok_or_else(|| {
            WorkerError::Internal(format!("no peer proxy for worker {worker}"))
        })
    }

    fn owns(&self, shard: usize) -> bool {
        self.worker_for_shard(shard) == self.self_id
    }

    /// Read `key`, serving locally when this worker owns its shard and
    /// routing to the owner otherwise. `None` means the key is absent.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let shard = self.shard_for_key(key);
        if self.owns(shard) {
            return self.local_get(shard, key);
        }

        let owner = self.worker_for_shard(shard);
        trace!(table = self.id, shard, owner, "routing get to peer");
        let resp = self
            .peer(owner)?
            .get(rpc::GetRequest {
                table: self.id,
                shard: shard as i32,
                key: key.to_vec(),
            })
            .await?;
        if resp.missing_key {
            return Ok(None);
        }
        // The owner applies the selector before responding.
        Ok(resp.kv_data.into_iter().next().map(|pair| pair.value))
    }

    /// Read `key` from the local shard slot, applying the selector.
    ///
    /// This is the path the `Get` RPC handler serves from: no routing, no
    /// ownership check. A non-owned shard holds no data, so a misdirected
    /// read simply reports the key as missing.
    pub fn local_get(&self, shard: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.shard(shard)?.get(key)?;
        Ok(value.map(|v| self.selector.select(&v)))
    }

    /// Whether the local shard slot holds `key`.
    pub fn contains(&self, shard: usize, key: &[u8]) -> Result<bool> {
        self.shard(shard)?.contains(key)
    }

    /// Entry count of a local shard slot.
    pub fn shard_size(&self, shard: usize) -> Result<u64> {
        self.shard(shard)?.size()
    }

    /// Write `value` under `key`. Owned shards merge in place through the
    /// combiner; non-owned shards accumulate into the pending buffer, which
    /// ships at `flush` (or earlier when the buffer crosses its high-water
    /// mark).
    pub async fn update(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let shard = self.shard_for_key(key);
        if self.owns(shard) {
            return self
                .shard(shard)?
                .merge_local(key, value, self.combiner.as_ref());
        }

        let pending = self
            .shard(shard)?
            .merge_pending(key, value, self.combiner.as_ref())?;
        if pending >= self.pending_high_water {
            debug!(
                table = self.id,
                shard, pending, "pending buffer crossed high-water mark"
            );
            self.flush_shard(shard).await?;
        }
        Ok(())
    }

    /// Apply an incoming `Put` batch to an owned shard through the reducer.
    /// The whole batch lands before the caller acknowledges the RPC.
    pub fn apply_put(&self, shard: usize, pairs: Vec<rpc::KvPair>) -> Result<()> {
        let target = self.shard(shard)?;
        for pair in pairs {
            target.apply_remote(&pair.key, pair.value, self.reducer.as_ref())?;
        }
        Ok(())
    }

    /// Ship every dirty pending buffer to its owner. Sends for distinct
    /// shards proceed concurrently; `flush` returns only after every send is
    /// acknowledged. Returns the number of entries shipped.
    pub async fn flush(&self) -> Result<usize> {
        let mut sends = Vec::new();
        for shard in 0..self.num_shards {
            if !self.owns(shard) && self.shards[shard].dirty() {
                sends.push(self.flush_shard(shard));
            }
        }
        if sends.is_empty() {
            return Ok(0);
        }
        let shipped: usize = try_join_all(sends).await?.into_iter().sum();
        debug!(table = self.id, shipped, "flushed pending updates");
        Ok(shipped)
    }

    /// Drain one shard's pending buffer and put it to the owner.
    async fn flush_shard(&self, shard: usize) -> Result<usize> {
        let batch = self.shard(shard)?.drain_pending()?;
        if batch.is_empty() {
            return Ok(0);
        }
        let owner = self.worker_for_shard(shard);
        let kv_data = batch
            .into_iter()
            .map(|(key, value)| rpc::KvPair { key, value })
            .collect::<Vec<_>>();
        let count = kv_data.len();
        trace!(table = self.id, shard, owner, count, "shipping pending batch");
        self.peer(owner)?
            .put(rpc::TableData {
                source: self.self_id,
                table: self.id,
                shard: shard as i32,
                done: true,
                missing_key: false,
                kv_data,
            })
            .await?;
        Ok(count)
    }

    /// Open an iterator over one shard: local when owned, remote otherwise.
    pub async fn iterate(&self, shard: usize) -> Result<TableIterator> {
        if self.owns(shard) {
            let local = LocalIterator::new(self.shard(shard)?.clone(), self.fetch_count);
            return Ok(TableIterator::Local(local));
        }
        let owner = self.worker_for_shard(shard);
        let remote = RemoteIterator::open(
            self.peer(owner)?.clone(),
            self.id,
            shard as i32,
            self.fetch_count,
        )
        .await?;
        Ok(TableIterator::Remote(remote))
    }

    /// Shard handle for the worker-side iterator registry.
    pub fn shard_handle(&self, shard: usize) -> Result<Arc<Shard>> {
        Ok(self.shard(shard)?.clone())
    }

    /// Destroy every shard; later operations fail with `InvalidShard`.
    pub fn destroy(&self) {
        for shard in &self.shards {
            shard.destroy();
        }
    }
}

/// Cursor over one shard, local or remote.
pub enum TableIterator {
    Local(LocalIterator),
    Remote(RemoteIterator),
}

impl TableIterator {
    pub fn done(&self) -> bool {
        match self {
            TableIterator::Local(it) => it.done(),
            TableIterator::Remote(it) => it.done(),
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        match self {
            TableIterator::Local(it) => it.key(),
            TableIterator::Remote(it) => it.key(),
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            TableIterator::Local(it) => it.value(),
            TableIterator::Remote(it) => it.value(),
        }
    }

    pub async fn next(&mut self) -> Result<()> {
        match self {
            TableIterator::Local(it) => it.next(),
            TableIterator::Remote(it) => it.next().await,
        }
    }
}

/// Lazy cursor over an owned shard.
///
/// Fetches entries in batches, resuming after the last yielded key, so shard
/// locks are held only while a batch is copied out. A kernel mutating the
/// shard it iterates sees an unspecified (but memory-safe) mix of old and new
/// entries, matching the engine's single-kernel execution discipline.
pub struct LocalIterator {
    shard: Arc<Shard>,
    batch: Vec<(Vec<u8>, Vec<u8>)>,
    index: usize,
    exhausted: bool,
    fetch: usize,
}

impl LocalIterator {
    fn new(shard: Arc<Shard>, fetch_count: u32) -> Self {
        let mut it = Self {
            shard,
            batch: Vec::new(),
            index: 0,
            exhausted: false,
            fetch: fetch_count.max(1) as usize,
        };
        it.refill(None);
        it
    }

    fn refill(&mut self, cursor: Option<Vec<u8>>) {
        match self.shard.entries_after(cursor.as_deref(), self.fetch) {
            Ok((batch, done)) => {
                self.batch = batch;
                self.exhausted = done;
            }
            Err(_) => {
                // The shard was destroyed under us; end the iteration.
                self.batch = Vec::new();
                self.exhausted = true;
            }
        }
        self.index = 0;
    }

    pub fn done(&self) -> bool {
        self.exhausted && self.index >= self.batch.len()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.batch.get(self.index).map(|(k, _)| k.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.batch.get(self.index).map(|(_, v)| v.as_slice())
    }

    pub fn next(&mut self) -> Result<()> {
        self.index += 1;
        if self.index >= self.batch.len() && !self.exhausted {
            let cursor = self.batch.last().map(|(k, _)| k.clone());
            self.refill(cursor);
        }
        Ok(())
    }
}

/// Prefetching cursor over a peer-owned shard.
///
/// Construction issues `get_iterator(id = -1)` to the owner, which allocates
/// a server-side iterator and returns the first batch. Stepping past the
/// buffered batch refills with the assigned id. Terminal once the server
/// reported `done` and the buffer is consumed.
pub struct RemoteIterator {
    peer: Peer,
    request: rpc::IteratorReq,
    results: Vec<rpc::KvPair>,
    server_done: bool,
    index: usize,
}

impl RemoteIterator {
    async fn open(peer: Peer, table: i32, shard: i32, fetch_count: u32) -> Result<Self> {
        let mut request = rpc::IteratorReq {
            table,
            shard,
            id: -1,
            count: fetch_count.max(1),
            close: false,
        };
        let resp = peer.get_iterator(request.clone()).await?;
        request.id = resp.id as i32;
        Ok(Self {
            peer,
            request,
            results: resp.results,
            server_done: resp.done,
            index: 0,
        })
    }

    pub fn done(&self) -> bool {
        self.server_done && self.index >= self.results.len()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.results.get(self.index).map(|pair| pair.key.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.results.get(self.index).map(|pair| pair.value.as_slice())
    }

    pub async fn next(&mut self) -> Result<()> {
        self.index += 1;
        if self.index >= self.results.len() && !self.server_done {
            let resp = self.peer.get_iterator(self.request.clone()).await?;
            self.results = resp.results;
            self.server_done = resp.done;
            self.index = 0;
        }
        Ok(())
    }
}
