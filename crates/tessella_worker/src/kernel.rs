//! Kernel runtime: user-supplied computations bound to one table shard.
//!
//! A kernel is registered under a string id and instantiated per `RunKernel`
//! dispatch on the worker that owns the target shard. Inside `run`, kernel
//! code reaches the global table state through its context; the tables route
//! every access for it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::errors::Result;
use crate::plugins::Registry;
use crate::table::Table;
use crate::worker::Worker;

/// A user computation over one shard of one table.
///
/// `run` executes to completion on the owning worker; a returned error is
/// captured at the kernel boundary and reported to the master, leaving the
/// worker healthy.
#[async_trait]
pub trait Kernel: Send + Sync {
    async fn run(&self, ctx: &KernelContext) -> Result<()>;
}

/// Execution context handed to a kernel: the worker it runs on, the bound
/// `(table, shard)`, and the master-supplied argument maps.
pub struct KernelContext {
    worker: Arc<Worker>,
    table_id: i32,
    shard_id: i32,
    kernel_args: HashMap<String, String>,
    task_args: HashMap<String, String>,
}

impl KernelContext {
    pub fn new(
        worker: Arc<Worker>,
        table_id: i32,
        shard_id: i32,
        kernel_args: HashMap<String, String>,
        task_args: HashMap<String, String>,
    ) -> Self {
        Self {
            worker,
            table_id,
            shard_id,
            kernel_args,
            task_args,
        }
    }

    /// The table this kernel is bound to.
    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    /// The shard this kernel is bound to.
    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub fn kernel_args(&self) -> &HashMap<String, String> {
        &self.kernel_args
    }

    pub fn task_args(&self) -> &HashMap<String, String> {
        &self.task_args
    }

    /// Convenience lookup across both argument maps (task args win).
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.task_args
            .get(name)
            .or_else(|| self.kernel_args.get(name))
            .map(String::as_str)
    }

    /// The table this kernel is bound to.
    pub fn current_table(&self) -> Result<Arc<Table>> {
        self.worker.table(self.table_id)
    }

    /// Any table hosted by this worker, by id.
    pub fn get_table(&self, id: i32) -> Result<Arc<Table>> {
        self.worker.table(id)
    }
}

static KERNELS: OnceLock<Registry<dyn Kernel>> = OnceLock::new();

/// Process-wide kernel registry.
pub fn kernel_registry() -> &'static Registry<dyn Kernel> {
    KERNELS.get_or_init(Registry::new)
}

/// Register a kernel class under `kernel_id`.
pub fn register_kernel<F>(kernel_id: &str, factory: F)
where
    F: Fn() -> Arc<dyn Kernel> + Send + Sync + 'static,
{
    kernel_registry().register(kernel_id, move |_opts| Ok(factory()));
}
