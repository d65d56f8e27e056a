//! Pluggable table components and their process-wide registries.
//!
//! A table is parameterized by a sharder (key -> shard index), two
//! accumulators (the combiner for local write merging, the reducer for
//! applying shipped batches on the owner), and a selector (read-side view of
//! a stored value). The master names each component by a registry id plus an
//! opaque options string; workers materialize them at table creation.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::warn;

/// Maps a key to a shard index in `[0, num_shards)`.
///
/// Implementations must be deterministic and pure: every worker computes the
/// same index for the same key, which is what makes routing agree cluster
/// wide.
pub trait Sharder: Send + Sync {
    fn shard_for_key(&self, key: &[u8], num_shards: usize) -> usize;
}

/// Associative, commutative merge of two values for the same key.
///
/// Used both as a table's combiner (merging a kernel's repeated writes before
/// they ship) and as its reducer (merging shipped batches into the owner's
/// shard).
pub trait Accumulator: Send + Sync {
    fn merge(&self, current: &[u8], update: &[u8]) -> Vec<u8>;
}

/// Read-side transform applied to stored values before they are returned.
pub trait Selector: Send + Sync {
    fn select(&self, value: &[u8]) -> Vec<u8>;
}

/// Hash a key for shard selection.
pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Default sharder: key hash modulo shard count.
pub struct ModSharder;

impl Sharder for ModSharder {
    fn shard_for_key(&self, key: &[u8], num_shards: usize) -> usize {
        (hash_key(key) % num_shards.max(1) as u64) as usize
    }
}

/// Default accumulator: the newest value wins.
pub struct Replace;

impl Accumulator for Replace {
    fn merge(&self, _current: &[u8], update: &[u8]) -> Vec<u8> {
        update.to_vec()
    }
}

/// Encode an `i64` value for the numeric accumulators.
pub fn encode_i64(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode an `i64` value; `None` when the operand is not 8 bytes.
pub fn decode_i64(bytes: &[u8]) -> Option<i64> {
    Some(i64::from_le_bytes(bytes.try_into().ok()?))
}

/// Numeric fold over little-endian `i64` operands.
///
/// A malformed operand degrades to replace semantics; accumulators are pure
/// functions and have no error channel.
struct I64Fold {
    name: &'static str,
    fold: fn(i64, i64) -> i64,
}

impl Accumulator for I64Fold {
    fn merge(&self, current: &[u8], update: &[u8]) -> Vec<u8> {
        match (decode_i64(current), decode_i64(update)) {
            (Some(a), Some(b)) => encode_i64((self.fold)(a, b)),
            _ => {
                warn!(
                    accumulator = self.name,
                    current_len = current.len(),
                    update_len = update.len(),
                    "malformed i64 operand, falling back to replace"
                );
                update.to_vec()
            }
        }
    }
}

/// Default selector: return the stored value unchanged.
pub struct IdentitySelector;

impl Selector for IdentitySelector {
    fn select(&self, value: &[u8]) -> Vec<u8> {
        value.to_vec()
    }
}

type Factory<T> = Arc<dyn Fn(&str) -> anyhow::Result<Arc<T>> + Send + Sync>;

/// String-keyed factory table for one plug-in kind.
pub struct Registry<T: ?Sized> {
    factories: RwLock<HashMap<String, Factory<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory under `type_id`, replacing any previous entry.
    pub fn register<F>(&self, type_id: &str, factory: F)
    where
        F: Fn(&str) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().expect("registry lock poisoned");
        factories.insert(type_id.to_string(), Arc::new(factory));
    }

    /// Instantiate the plug-in registered under `type_id` with `opts`.
    pub fn create(&self, type_id: &str, opts: &str) -> anyhow::Result<Arc<T>> {
        let factory = {
            let factories = self.factories.read().expect("registry lock poisoned");
            factories.get(type_id).cloned()
        };
        match factory {
            Some(factory) => factory(opts),
            None => anyhow::bail!("no plug-in registered under id '{type_id}'"),
        }
    }
}

static SHARDERS: OnceLock<Registry<dyn Sharder>> = OnceLock::new();
static ACCUMULATORS: OnceLock<Registry<dyn Accumulator>> = OnceLock::new();
static SELECTORS: OnceLock<Registry<dyn Selector>> = OnceLock::new();

/// Process-wide sharder registry, seeded with the built-ins.
pub fn sharder_registry() -> &'static Registry<dyn Sharder> {
    SHARDERS.get_or_init(|| {
        let registry = Registry::new();
        registry.register("mod", |_opts| Ok(Arc::new(ModSharder) as Arc<dyn Sharder>));
        registry
    })
}

/// Process-wide accumulator registry, seeded with the built-ins.
pub fn accumulator_registry() -> &'static Registry<dyn Accumulator> {
    ACCUMULATORS.get_or_init(|| {
        let registry = Registry::new();
        registry.register("replace", |_opts| Ok(Arc::new(Replace) as Arc<dyn Accumulator>));
        registry.register("i64_add", |_opts| {
            Ok(Arc::new(I64Fold {
                name: "i64_add",
                fold: i64::wrapping_add,
            }) as Arc<dyn Accumulator>)
        });
        registry.register("i64_max", |_opts| {
            Ok(Arc::new(I64Fold {
                name: "i64_max",
                fold: i64::max,
            }) as Arc<dyn Accumulator>)
        });
        registry.register("i64_min", |_opts| {
            Ok(Arc::new(I64Fold {
                name: "i64_min",
                fold: i64::min,
            }) as Arc<dyn Accumulator>)
        });
        registry
    })
}

/// Process-wide selector registry, seeded with the built-ins.
pub fn selector_registry() -> &'static Registry<dyn Selector> {
    SELECTORS.get_or_init(|| {
        let registry = Registry::new();
        registry.register("identity", |_opts| {
            Ok(Arc::new(IdentitySelector) as Arc<dyn Selector>)
        });
        registry
    })
}

/// Materialize a sharder from its wire spec; an empty id selects the default.
pub fn create_sharder(type_id: &str, opts: &str) -> anyhow::Result<Arc<dyn Sharder>> {
    let type_id = if type_id.is_empty() { "mod" } else { type_id };
    sharder_registry().create(type_id, opts)
}

/// Materialize an accumulator; an empty id selects replace semantics.
pub fn create_accumulator(type_id: &str, opts: &str) -> anyhow::Result<Arc<dyn Accumulator>> {
    let type_id = if type_id.is_empty() { "replace" } else { type_id };
    accumulator_registry().create(type_id, opts)
}

/// Materialize a selector; an empty id selects the identity view.
pub fn create_selector(type_id: &str, opts: &str) -> anyhow::Result<Arc<dyn Selector>> {
    let type_id = if type_id.is_empty() { "identity" } else { type_id };
    selector_registry().create(type_id, opts)
}
