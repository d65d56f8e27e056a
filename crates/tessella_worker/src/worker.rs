//! Worker state and the core operation behind every RPC handler.
//!
//! One mutex guards the worker-global maps (tables, server-side iterators,
//! peers); individual shards carry their own locks. Registration and
//! shutdown are watch channels so startup code and `wait_for_shutdown` can
//! block on state transitions without polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::errors::{Result, WorkerError};
use crate::kernel::{kernel_registry, KernelContext};
use crate::plugins::{create_accumulator, create_selector, create_sharder};
use crate::rpc;
use crate::shard::Shard;
use crate::table::{Table, TableOptions};
use crate::transport::Peer;

/// Tuning knobs shared by every table the worker hosts.
#[derive(Clone, Copy, Debug)]
pub struct WorkerTuning {
    /// Entries fetched per iterator batch (local and remote).
    pub fetch_count: u32,
    /// Pending-buffer size that triggers an early shard flush.
    pub pending_high_water: usize,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            fetch_count: 512,
            pending_high_water: 10_000,
        }
    }
}

/// Server-side cursor state for one remote iteration.
struct ServerIterator {
    table: i32,
    shard: i32,
    handle: Arc<Shard>,
    cursor: Option<Vec<u8>>,
    done: bool,
}

#[derive(Default)]
struct WorkerInner {
    tables: HashMap<i32, Arc<Table>>,
    peers: HashMap<i32, Peer>,
    iterators: HashMap<u32, ServerIterator>,
    next_iterator_id: u32,
}

/// The RPC-facing worker process state.
pub struct Worker {
    id: AtomicI32,
    tuning: WorkerTuning,
    inner: Mutex<WorkerInner>,
    registered_tx: watch::Sender<bool>,
    // None while running; Some(exit code) once shut down.
    shutdown_tx: watch::Sender<Option<i32>>,
}

impl Worker {
    pub fn new(tuning: WorkerTuning) -> Self {
        let (registered_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            id: AtomicI32::new(-1),
            tuning,
            inner: Mutex::new(WorkerInner::default()),
            registered_tx,
            shutdown_tx,
        }
    }

    /// This worker's cluster id; -1 until the master has initialized it.
    pub fn id(&self) -> i32 {
        self.id.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerInner> {
        self.inner.lock().expect("worker lock poisoned")
    }

    /// Look up a hosted table.
    pub fn table(&self, id: i32) -> Result<Arc<Table>> {
        self.lock()
            .tables
            .get(&id)
            .cloned()
            .ok_or(WorkerError::UnknownTable(id))
    }

    /// Install this worker's id and build the peer mesh.
    pub fn initialize(&self, req: rpc::WorkerInitReq) -> Result<()> {
        if req.id == -1 {
            return Err(WorkerError::Internal(
                "initialize with invalid worker id -1".into(),
            ));
        }
        self.id.store(req.id, Ordering::SeqCst);

        let mut peers = HashMap::new();
        for (peer_id, addr) in &req.workers {
            // A worker does not RPC itself.
            if *peer_id == req.id {
                continue;
            }
            peers.insert(*peer_id, Peer::connect(*peer_id, &addr.host, addr.port)?);
        }
        info!(
            worker = req.id,
            peers = peers.len(),
            "initializing worker with peer connections"
        );

        self.lock().peers = peers;
        let _ = self.registered_tx.send(true);
        Ok(())
    }

    /// Materialize plug-ins and create a table's local shard slots.
    pub fn create_table(&self, req: rpc::CreateTableReq) -> Result<()> {
        if self.id() == -1 {
            return Err(WorkerError::Internal(
                "create_table before initialize".into(),
            ));
        }

        let spec = |plugin: &Option<rpc::PluginSpec>| -> (String, String) {
            match plugin {
                Some(spec) => (spec.type_id.clone(), spec.opts.clone()),
                None => (String::new(), String::new()),
            }
        };
        let (sharder_id, sharder_opts) = spec(&req.sharder);
        let (combiner_id, combiner_opts) = spec(&req.combiner);
        let (reducer_id, reducer_opts) = spec(&req.reducer);
        let (selector_id, selector_opts) = spec(&req.selector);

        let sharder = create_sharder(&sharder_id, &sharder_opts)
            .map_err(|err| WorkerError::Internal(format!("sharder: {err}")))?;
        let combiner = create_accumulator(&combiner_id, &combiner_opts)
            .map_err(|err| WorkerError::Internal(format!("combiner: {err}")))?;
        let reducer = create_accumulator(&reducer_id, &reducer_opts)
            .map_err(|err| WorkerError::Internal(format!("reducer: {err}")))?;
        let selector = create_selector(&selector_id, &selector_opts)
            .map_err(|err| WorkerError::Internal(format!("selector: {err}")))?;

        debug!(worker = self.id(), table = req.id, shards = req.num_shards, "creating table");

        let mut inner = self.lock();
        let table = Table::new(TableOptions {
            id: req.id,
            num_shards: req.num_shards.max(1) as usize,
            self_id: self.id(),
            peers: inner.peers.clone(),
            sharder,
            combiner,
            reducer,
            selector,
            fetch_count: self.tuning.fetch_count,
            pending_high_water: self.tuning.pending_high_water,
        });
        if inner.tables.insert(req.id, Arc::new(table)).is_some() {
            warn!(table = req.id, "create_table replaced an existing table");
        }
        Ok(())
    }

    /// Install master-directed shard ownership.
    pub fn assign_shards(&self, req: rpc::ShardAssignmentReq) -> Result<()> {
        for assign in &req.assign {
            let table = self.table(assign.table)?;
            table.set_owner(assign.shard as usize, assign.worker)?;
        }
        Ok(())
    }

    /// Drop a table, its shards, and every iterator bound to it.
    pub fn destroy_table(&self, id: i32) -> Result<()> {
        let mut inner = self.lock();
        let table = inner
            .tables
            .remove(&id)
            .ok_or(WorkerError::UnknownTable(id))?;
        table.destroy();
        inner.iterators.retain(|_, it| it.table != id);
        debug!(worker = self.id(), table = id, "destroyed table");
        Ok(())
    }

    /// Serve a `Get` against the local shard slot.
    ///
    /// No ownership check: a non-owned shard is empty, so a misdirected read
    /// reports `missing_key` rather than failing.
    pub fn get(&self, req: rpc::GetRequest) -> Result<rpc::TableData> {
        let table = self.table(req.table)?;
        let value = table.local_get(req.shard as usize, &req.key)?;
        let mut resp = rpc::TableData {
            source: self.id(),
            table: req.table,
            shard: req.shard,
            done: true,
            missing_key: value.is_none(),
            kv_data: Vec::new(),
        };
        if let Some(value) = value {
            resp.kv_data.push(rpc::KvPair {
                key: req.key,
                value,
            });
        }
        Ok(resp)
    }

    /// Apply an incoming pending batch to the owned shard.
    pub fn put(&self, data: rpc::TableData) -> Result<()> {
        let table = self.table(data.table)?;
        let owner = table.worker_for_shard(data.shard as usize);
        if owner != self.id() {
            let err = WorkerError::RoutingViolation {
                worker: self.id(),
                owner,
                table: data.table,
                shard: data.shard,
            };
            self.fatal(&err);
            return Err(err);
        }
        table.apply_put(data.shard as usize, data.kv_data)
    }

    /// Serve one iterator batch, allocating a server-side iterator on first
    /// contact (`id == -1`).
    ///
    /// The registry lock is dropped while the batch is copied out of the
    /// shard; a single client drives an iterator serially, so the two-phase
    /// read/write-back does not race with itself.
    pub fn get_iterator(&self, req: rpc::IteratorReq) -> Result<rpc::IteratorResp> {
        let (id, handle, cursor, done) = {
            let mut inner = self.lock();
            if req.id == -1 {
                let handle = inner
                    .tables
                    .get(&req.table)
                    .cloned()
                    .ok_or(WorkerError::UnknownTable(req.table))?
                    .shard_handle(req.shard as usize)?;
                let id = inner.next_iterator_id;
                inner.next_iterator_id = inner
                    .next_iterator_id
                    .checked_add(1)
                    .ok_or_else(|| {
                        WorkerError::Internal("iterator id space exhausted".into())
                    })?;
                inner.iterators.insert(
                    id,
                    ServerIterator {
                        table: req.table,
                        shard: req.shard,
                        handle: handle.clone(),
                        cursor: None,
                        done: false,
                    },
                );
                (id, handle, None, false)
            } else {
                let id = req.id as u32;
                let it = inner
                    .iterators
                    .get(&id)
                    .ok_or(WorkerError::UnknownIterator(id))?;
                (id, it.handle.clone(), it.cursor.clone(), it.done)
            }
        };

        // Fill outside the worker lock; only the shard lock is taken per batch.
        let (entries, done) = if done {
            (Vec::new(), true)
        } else {
            handle.entries_after(cursor.as_deref(), req.count as usize)?
        };

        let mut resp = rpc::IteratorResp {
            id,
            results: Vec::with_capacity(entries.len()),
            row_count: 0,
            done,
        };
        let next_cursor = entries.last().map(|(key, _)| key.clone()).or(cursor);
        for (key, value) in entries {
            resp.results.push(rpc::KvPair { key, value });
            resp.row_count = resp.results.len() as u32;
        }

        let mut inner = self.lock();
        if done || req.close {
            inner.iterators.remove(&id);
        } else if let Some(it) = inner.iterators.get_mut(&id) {
            it.cursor = next_cursor;
            it.done = done;
        }
        Ok(resp)
    }

    /// Dispatch a kernel against a locally-owned shard.
    ///
    /// A misrouted dispatch is a master bug and fatal for this worker. Kernel
    /// failures are captured into the response; `elapsed_seconds` is always
    /// set.
    pub async fn run_kernel(self: Arc<Self>, req: rpc::RunKernelReq) -> Result<rpc::RunKernelResp> {
        let start = Instant::now();
        let table = self.table(req.table)?;
        let owner = table.worker_for_shard(req.shard as usize);
        if owner != self.id() {
            let err = WorkerError::RoutingViolation {
                worker: self.id(),
                owner,
                table: req.table,
                shard: req.shard,
            };
            self.fatal(&err);
            return Err(err);
        }

        debug!(
            worker = self.id(),
            table = req.table,
            shard = req.shard,
            kernel = %req.kernel,
            items = table.shard_size(req.shard as usize).unwrap_or(0),
            "running kernel"
        );

        let error = match kernel_registry().create(&req.kernel, "") {
            Err(err) => format!("unknown kernel '{}': {err}", req.kernel),
            Ok(kernel) => {
                let ctx = KernelContext::new(
                    Arc::clone(&self),
                    req.table,
                    req.shard,
                    req.kernel_args,
                    req.task_args,
                );
                match kernel.run(&ctx).await {
                    Ok(()) => String::new(),
                    Err(err) => err.to_string(),
                }
            }
        };

        let elapsed_seconds = start.elapsed().as_secs_f64();
        debug!(
            worker = self.id(),
            table = req.table,
            shard = req.shard,
            elapsed_seconds,
            failed = !error.is_empty(),
            "finished kernel"
        );
        Ok(rpc::RunKernelResp {
            elapsed_seconds,
            error,
        })
    }

    /// Flush every hosted table's pending buffers to their owners.
    pub async fn flush_all(&self) -> Result<usize> {
        let tables: Vec<Arc<Table>> = self.lock().tables.values().cloned().collect();
        debug!(worker = self.id(), tables = tables.len(), "flushing tables");
        let mut shipped = 0;
        for table in tables {
            shipped += table.flush().await?;
        }
        Ok(shipped)
    }

    /// Tear down all state and wake `wait_for_shutdown` with exit code 0.
    pub fn shutdown(&self) {
        info!(worker = self.id(), "shutdown requested");
        let mut inner = self.lock();
        for table in inner.tables.values() {
            table.destroy();
        }
        inner.tables.clear();
        inner.iterators.clear();
        drop(inner);
        let _ = self.shutdown_tx.send(Some(0));
    }

    /// Record a fatal invariant violation and terminate with a non-zero exit.
    pub fn fatal(&self, err: &WorkerError) {
        error!(worker = self.id(), error = %err, "fatal invariant violation");
        let r = self.shutdown_tx.send(Some(1));
        eprintln!("DBG-fatal-send result={:?} receiver_count={}", r.is_ok(), self.shutdown_tx.receiver_count());
    }

    /// Block until the master has called `Initialize`.
    pub async fn wait_for_registration(&self, timeout: Duration) -> Result<()> {
        let mut registered = self.registered_tx.subscribe();
        let wait = async {
            while !*registered.borrow_and_update() {
                if registered.changed().await.is_err() {
                    return Err(WorkerError::Internal("worker dropped".into()));
                }
            }
            Ok(())
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| WorkerError::Internal("timed out waiting for master initialize".into()))?
    }

    /// Resolve once the worker has shut down; yields the process exit code.
    pub async fn wait_for_shutdown(&self) -> i32 {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let v = *shutdown.borrow_and_update();
            eprintln!("DBG-shutdown-value={:?}", v);
            if let Some(code) = v {
                return code;
            }
            if shutdown.changed().await.is_err() {
                return 0;
            }
        }
    }
}
