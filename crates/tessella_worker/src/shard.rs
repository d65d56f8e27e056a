//! Shard storage: the unit a table is partitioned into.
//!
//! A shard owns two ordered maps behind one mutex: `data` for entries this
//! worker owns, and `pending` for writes destined for the owning peer. Merge
//! semantics come from the table's accumulators; the shard only knows how to
//! apply them.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use crate::errors::{Result, WorkerError};
use crate::plugins::Accumulator;

/// One partition of a table's key space.
pub struct Shard {
    table_id: i32,
    shard_id: i32,
    state: Mutex<ShardState>,
}

#[derive(Default)]
struct ShardState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Vec<u8>>,
    dirty: bool,
    destroyed: bool,
}

impl ShardState {
    fn check_live(&self, table_id: i32, shard_id: i32) -> Result<()> {
        if self.destroyed {
            return Err(WorkerError::InvalidShard {
                table: table_id,
                shard: shard_id,
            });
        }
        Ok(())
    }
}

impl Shard {
    pub fn new(table_id: i32, shard_id: i32) -> Self {
        Self {
            table_id,
            shard_id,
            state: Mutex::new(ShardState::default()),
        }
    }

    pub fn table_id(&self) -> i32 {
        self.table_id
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShardState> {
        self.state.lock().expect("shard lock poisoned")
    }

    /// Whether `key` is present in the owned data.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let state = self.lock();
        state.check_live(self.table_id, self.shard_id)?;
        Ok(state.data.contains_key(key))
    }

    /// Read the stored value for `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.lock();
        state.check_live(self.table_id, self.shard_id)?;
        Ok(state.data.get(key).cloned())
    }

    /// Number of owned entries.
    pub fn size(&self) -> Result<u64> {
        let state = self.lock();
        state.check_live(self.table_id, self.shard_id)?;
        Ok(state.data.len() as u64)
    }

    /// Merge a local write into the owned data through the combiner.
    pub fn merge_local(&self, key: &[u8], value: Vec<u8>, combiner: &dyn Accumulator) -> Result<()> {
        let mut state = self.lock();
        state.check_live(self.table_id, self.shard_id)?;
        merge_into(&mut state.data, key, value, combiner);
        Ok(())
    }

    /// Buffer a write destined for the owning peer, merging against any
    /// pending entry for the same key. Returns the pending entry count so the
    /// caller can apply its high-water mark.
    pub fn merge_pending(
        &self,
        key: &[u8],
        value: Vec<u8>,
        combiner: &dyn Accumulator,
    ) -> Result<usize> {
        let mut state = self.lock();
        state.check_live(self.table_id, self.shard_id)?;
        merge_into(&mut state.pending, key, value, combiner);
        state.dirty = true;
        Ok(state.pending.len())
    }

    /// Apply one entry of an incoming batch through the reducer. Only ever
    /// called on the owning worker.
    pub fn apply_remote(&self, key: &[u8], value: Vec<u8>, reducer: &dyn Accumulator) -> Result<()> {
        let mut state = self.lock();
        state.check_live(self.table_id, self.shard_id)?;
        merge_into(&mut state.data, key, value, reducer);
        Ok(())
    }

    /// Whether the pending buffer holds unshipped writes.
    pub fn dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Atomically snapshot-and-clear the pending buffer for a network send.
    pub fn drain_pending(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut state = self.lock();
        state.check_live(self.table_id, self.shard_id)?;
        state.dirty = false;
        let drained = std::mem::take(&mut state.pending);
        Ok(drained.into_iter().collect())
    }

    /// Fetch up to `count` owned entries strictly after `cursor` in key
    /// order. The second element is true when the scan reached the end of the
    /// shard.
    ///
    /// This is the primitive both local cursors and server-side iterators are
    /// built on; no lock is held between batches.
    pub fn entries_after(
        &self,
        cursor: Option<&[u8]>,
        count: usize,
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, bool)> {
        let state = self.lock();
        state.check_live(self.table_id, self.shard_id)?;
        let lower = match cursor {
            Some(key) => Bound::Excluded(key.to_vec()),
            None => Bound::Unbounded,
        };
        let mut entries = Vec::with_capacity(count.min(1024));
        let mut range = state.data.range((lower, Bound::Unbounded));
        for (key, value) in range.by_ref().take(count) {
            entries.push((key.clone(), value.clone()));
        }
        let done = range.next().is_none();
        Ok((entries, done))
    }

    /// Drop all contents and reject every later operation.
    pub fn destroy(&self) {
        let mut state = self.lock();
        state.data.clear();
        state.pending.clear();
        state.dirty = false;
        state.destroyed = true;
    }
}

/// Store `value` at `key`, merging through `acc` when an entry exists.
fn merge_into(
    map: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    key: &[u8],
    value: Vec<u8>,
    acc: &dyn Accumulator,
) {
    match map.get_mut(key) {
        Some(current) => *current = acc.merge(current, &value),
        None => {
            map.insert(key.to_vec(), value);
        }
    }
}
