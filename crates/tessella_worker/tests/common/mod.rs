//! Shared helpers for integration tests: an in-process master, multi-worker
//! cluster bring-up, and the kernels the scenarios dispatch.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use tessella_worker::errors::{Result as WorkerResult, WorkerError};
use tessella_worker::kernel::{register_kernel, Kernel, KernelContext};
use tessella_worker::plugins::{encode_i64, ModSharder, Sharder};
use tessella_worker::rpc;
use tessella_worker::rpc::master_server::{Master, MasterServer};
use tessella_worker::rpc::worker_client::WorkerClient;
use tessella_worker::{start_worker, WorkerConfig, WorkerHandle};

/// Timeout for cluster bring-up and command round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);

/// Minimal master: collects worker registrations for the harness.
struct MasterService {
    registrations: watch::Sender<Vec<(String, i32)>>,
}

#[tonic::async_trait]
impl Master for MasterService {
    async fn register_worker(
        &self,
        request: Request<rpc::RegisterReq>,
    ) -> Result<Response<rpc::RegisterResp>, Status> {
        let addr = request
            .into_inner()
            .addr
            .ok_or_else(|| Status::invalid_argument("missing addr"))?;
        self.registrations
            .send_modify(|v| v.push((addr.host, addr.port)));
        Ok(Response::new(rpc::RegisterResp {}))
    }
}

/// An in-process cluster: one harness master plus `n` embedded workers.
pub struct TestCluster {
    pub master_addr: SocketAddr,
    pub workers: Vec<WorkerHandle>,
    clients: Vec<WorkerClient<Channel>>,
    master_task: tokio::task::JoinHandle<()>,
}

impl TestCluster {
    /// Bring up the master and `num_workers` workers, wire the peer mesh,
    /// and wait until every worker is initialized.
    pub async fn start(num_workers: usize) -> Self {
        Self::start_tuned(num_workers, 512).await
    }

    /// As `start`, with an explicit iterator fetch count.
    pub async fn start_tuned(num_workers: usize, fetch_count: u32) -> Self {
        register_test_kernels();

        // Master first, so workers have something to register with.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind master");
        let master_addr = listener.local_addr().expect("master addr");
        let (reg_tx, mut reg_rx) = watch::channel(Vec::new());
        let master_task = tokio::spawn(async move {
            let service = MasterServer::new(MasterService {
                registrations: reg_tx,
            });
            let _ = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
        });

        // Workers register concurrently; `start_worker` returns only after
        // the master (this harness) has initialized them.
        let mut worker_tasks = Vec::new();
        for _ in 0..num_workers {
            let mut config = WorkerConfig::new(master_addr.to_string());
            config.fetch_count = fetch_count;
            worker_tasks.push(tokio::spawn(start_worker(config)));
        }

        let registered = tokio::time::timeout(
            IO_TIMEOUT,
            reg_rx.wait_for(|v| v.len() == num_workers),
        )
        .await
        .expect("workers registered in time")
        .expect("master alive")
        .clone();

        // Registration order assigns worker ids; every worker gets the same
        // peer map.
        let mut peer_map = HashMap::new();
        for (id, (host, port)) in registered.iter().enumerate() {
            peer_map.insert(
                id as i32,
                rpc::Addr {
                    host: host.clone(),
                    port: *port,
                },
            );
        }
        let mut clients = Vec::new();
        for (id, (host, port)) in registered.iter().enumerate() {
            let mut client = WorkerClient::connect(format!("http://{host}:{port}"))
                .await
                .expect("connect worker");
            client
                .initialize(rpc::WorkerInitReq {
                    id: id as i32,
                    workers: peer_map.clone(),
                })
                .await
                .expect("initialize worker");
            clients.push(client);
        }

        let mut handles = Vec::new();
        for task in worker_tasks {
            handles.push(task.await.expect("join worker").expect("start worker"));
        }
        // Order handles by assigned id (registration order).
        handles.sort_by_key(|handle| {
            registered
                .iter()
                .position(|(_, port)| *port == handle.addr().port() as i32)
                .expect("handle matches a registration")
        });

        Self {
            master_addr,
            workers: handles,
            clients,
            master_task,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.clients.len()
    }

    /// RPC client for worker `id`.
    pub fn client(&self, id: usize) -> WorkerClient<Channel> {
        self.clients[id].clone()
    }

    /// Create a table on every worker and assign shards round-robin
    /// (shard `s` is owned by worker `s % num_workers`).
    pub async fn create_table(&self, table: i32, num_shards: i32, accumulator: &str) {
        let plugin = |type_id: &str| {
            Some(rpc::PluginSpec {
                type_id: type_id.to_string(),
                opts: String::new(),
            })
        };
        let assign: Vec<_> = (0..num_shards)
            .map(|shard| rpc::ShardAssignment {
                table,
                shard,
                worker: (shard as usize % self.num_workers()) as i32,
            })
            .collect();
        for id in 0..self.num_workers() {
            let mut client = self.client(id);
            client
                .create_table(rpc::CreateTableReq {
                    id: table,
                    num_shards,
                    sharder: plugin("mod"),
                    combiner: plugin(accumulator),
                    reducer: plugin(accumulator),
                    selector: None,
                })
                .await
                .expect("create table");
            client
                .assign_shards(rpc::ShardAssignmentReq {
                    assign: assign.clone(),
                })
                .await
                .expect("assign shards");
        }
    }

    /// Worker id owning `shard` under the round-robin assignment.
    pub fn owner_of_shard(&self, shard: usize) -> usize {
        shard % self.num_workers()
    }

    /// Dispatch a kernel and panic on transport failure (the returned
    /// response still carries any kernel failure).
    pub async fn run_kernel(
        &self,
        worker: usize,
        table: i32,
        shard: i32,
        kernel: &str,
        args: &[(&str, &str)],
    ) -> rpc::RunKernelResp {
        let task_args: HashMap<String, String> = args
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.client(worker)
            .run_kernel(rpc::RunKernelReq {
                table,
                shard,
                kernel: kernel.to_string(),
                kernel_args: HashMap::new(),
                task_args,
            })
            .await
            .expect("run kernel rpc")
            .into_inner()
    }

    /// Master-style flush of one worker's tables.
    pub async fn flush(&self, worker: usize) {
        self.client(worker)
            .flush(rpc::Empty {})
            .await
            .expect("flush rpc");
    }

    /// Read one key from the worker's local shard slot.
    pub async fn get(&self, worker: usize, table: i32, shard: i32, key: &[u8]) -> rpc::TableData {
        self.client(worker)
            .get(rpc::GetRequest {
                table,
                shard,
                key: key.to_vec(),
            })
            .await
            .expect("get rpc")
            .into_inner()
    }

    /// Shut every worker down through the master protocol and assert clean
    /// exit codes.
    pub async fn shutdown_all(self) {
        for id in 0..self.num_workers() {
            let _ = self.client(id).shutdown(rpc::Empty {}).await;
        }
        for handle in self.workers {
            let code = tokio::time::timeout(IO_TIMEOUT, handle.wait_for_shutdown())
                .await
                .expect("worker exits in time")
                .expect("worker exits");
            assert_eq!(code, 0, "expected clean shutdown");
        }
        self.master_task.abort();
    }
}

/// The shard `key` routes to (the default sharder is pure, so tests can
/// precompute routing).
pub fn shard_of(key: &[u8], num_shards: usize) -> usize {
    ModSharder.shard_for_key(key, num_shards)
}

/// Find a key whose shard is owned by `owner` under round-robin assignment.
pub fn key_owned_by(num_shards: usize, num_workers: usize, owner: usize, tag: &str) -> Vec<u8> {
    for i in 0..10_000 {
        let key = format!("{tag}-{i}");
        if shard_of(key.as_bytes(), num_shards) % num_workers == owner {
            return key.into_bytes();
        }
    }
    panic!("no key routes to worker {owner}");
}

fn arg<'a>(ctx: &'a KernelContext, name: &str) -> WorkerResult<&'a str> {
    ctx.arg(name)
        .ok_or_else(|| WorkerError::kernel(format!("missing kernel arg '{name}'")))
}

fn i64_arg(ctx: &KernelContext, name: &str) -> WorkerResult<i64> {
    arg(ctx, name)?
        .parse()
        .map_err(|err| WorkerError::kernel(format!("bad i64 arg '{name}': {err}")))
}

/// Writes `value` under `key` through the bound table.
struct UpdateKernel;

#[async_trait]
impl Kernel for UpdateKernel {
    async fn run(&self, ctx: &KernelContext) -> WorkerResult<()> {
        let table = ctx.current_table()?;
        let key = arg(ctx, "key")?.as_bytes().to_vec();
        let value = i64_arg(ctx, "value")?;
        table.update(&key, encode_i64(value)).await
    }
}

/// Reads `key` and fails unless the value matches `expect` (or is absent
/// when `expect_missing` is set).
struct CheckKernel;

#[async_trait]
impl Kernel for CheckKernel {
    async fn run(&self, ctx: &KernelContext) -> WorkerResult<()> {
        let table = ctx.current_table()?;
        let key = arg(ctx, "key")?.as_bytes().to_vec();
        let value = table.get(&key).await?;
        if ctx.arg("expect_missing").is_some() {
            return match value {
                None => Ok(()),
                Some(_) => Err(WorkerError::kernel("expected key to be missing")),
            };
        }
        let expected = encode_i64(i64_arg(ctx, "expect")?);
        match value {
            Some(found) if found == expected => Ok(()),
            Some(found) => Err(WorkerError::kernel(format!(
                "value mismatch: {found:?} != {expected:?}"
            ))),
            None => Err(WorkerError::kernel("key missing")),
        }
    }
}

/// Iterates `target_shard` of the bound table and fails unless exactly
/// `expect` entries arrive in ascending key order.
struct IterateKernel;

#[async_trait]
impl Kernel for IterateKernel {
    async fn run(&self, ctx: &KernelContext) -> WorkerResult<()> {
        let table = ctx.current_table()?;
        let shard = i64_arg(ctx, "target_shard")? as usize;
        let expect = i64_arg(ctx, "expect")?;
        let mut it = table.iterate(shard).await?;
        let mut count = 0i64;
        let mut last_key: Option<Vec<u8>> = None;
        while !it.done() {
            let key = it
                .key()
                .ok_or_else(|| WorkerError::kernel("cursor yielded no key"))?
                .to_vec();
            if let Some(prev) = &last_key {
                if *prev >= key {
                    return Err(WorkerError::kernel("keys out of order"));
                }
            }
            last_key = Some(key);
            count += 1;
            it.next().await?;
        }
        if count != expect {
            return Err(WorkerError::kernel(format!(
                "iterated {count} entries, expected {expect}"
            )));
        }
        Ok(())
    }
}

/// Buffers one update, then raises a kernel failure.
struct UpdateThenFailKernel;

#[async_trait]
impl Kernel for UpdateThenFailKernel {
    async fn run(&self, ctx: &KernelContext) -> WorkerResult<()> {
        let table = ctx.current_table()?;
        let key = arg(ctx, "key")?.as_bytes().to_vec();
        let value = i64_arg(ctx, "value")?;
        table.update(&key, encode_i64(value)).await?;
        Err(WorkerError::kernel("induced mid-run failure"))
    }
}

static REGISTER_KERNELS: Once = Once::new();

/// Register the scenario kernels exactly once per test binary.
pub fn register_test_kernels() {
    REGISTER_KERNELS.call_once(|| {
        register_kernel("update", || std::sync::Arc::new(UpdateKernel));
        register_kernel("check", || std::sync::Arc::new(CheckKernel));
        register_kernel("iterate", || std::sync::Arc::new(IterateKernel));
        register_kernel("update-then-fail", || {
            std::sync::Arc::new(UpdateThenFailKernel)
        });
    });
}
