//! Correlation table: request id -> pending continuation
//!
//! One table per connection. Ids are allocated from a monotonically increasing
//! counter starting at 1, so they are unique for the lifetime of the
//! connection. `take` removes an entry atomically; whichever of the response
//! path or the timeout path takes it first owns the continuation.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{ClientError, ClientResult};

#[derive(Debug)]
pub struct CorrelationTable<T> {
    next_id: AtomicU64,
    entries: DashMap<u64, T>,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an outstanding request. Rejects an id that is still outstanding.
    pub fn insert(&self, id: u64, entry: T) -> ClientResult<()> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(ClientError::DuplicateRequestId { id }),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Remove and return the entry for `id`, if it is still outstanding.
    pub fn take(&self, id: u64) -> Option<T> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    /// Run `f` on an outstanding entry. Returns false if the entry is gone.
    pub fn with_entry(&self, id: u64, f: impl FnOnce(&mut T)) -> bool {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Remove every outstanding entry.
    pub fn drain(&self) -> Vec<T> {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
