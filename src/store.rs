/// In-memory transactional store.
///
/// Each entity type lives in its own `Table`. A table offers CRUD, filtered
/// and paged queries, and two atomic write paths:
/// - `update`: pessimistic row update. The closure runs under the row lock
///   against a scratch copy, which is committed only if it returns `Ok`.
/// - `compare_and_swap`: optimistic write guarded by the row version.
///
/// Every row carries its own mutex. The map shard is only held long enough
/// to clone the row handle out, so a writer on one row never blocks writers
/// on other rows. Writers take the row mutex with `try_lock`; contention is
/// retried a bounded number of times with linear backoff, then surfaces as
/// `Conflict`. Because no write path blocks on a lock, nested updates across
/// tables cannot deadlock. Readers wait for the row mutex, so a row must not
/// be read from inside its own `update` closure.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{EntityKind, FulfillmentError, Result};

/// A storable entity with a stable identity.
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> Uuid;
}

/// Bounded retry for lock contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            backoff: Duration::from_millis(2),
        }
    }
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(config: &StoreConfig) -> Self {
        RetryPolicy {
            attempts: config.lock_retries,
            backoff: Duration::from_millis(config.lock_backoff_ms),
        }
    }
}

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<E> {
    pub version: u64,
    pub value: E,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        PageRequest { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        PageRequest { offset: 0, limit }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<E> {
    pub items: Vec<E>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl<E> Page<E> {
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

struct Row<E> {
    version: u64,
    value: E,
}

type RowHandle<E> = Arc<Mutex<Row<E>>>;

/// Closures run against a scratch copy, so a panic inside one never leaves
/// a half-written row behind and a poisoned row is still consistent.
fn read_row<E>(handle: &Mutex<Row<E>>) -> MutexGuard<'_, Row<E>> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Table<E: Entity> {
    rows: DashMap<Uuid, RowHandle<E>>,
    retry: RetryPolicy,
}

impl<E: Entity> Table<E> {
    pub fn new(retry: RetryPolicy) -> Self {
        Table {
            rows: DashMap::new(),
            retry,
        }
    }

    /// Insert a new row at version 1.
    pub fn insert(&self, value: E) -> Result<()> {
        let id = value.id();
        match self.rows.entry(id) {
            Entry::Occupied(_) => Err(FulfillmentError::conflict(
                E::KIND,
                id,
                "an entity with this id already exists",
            )),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(Row { version: 1, value })));
                Ok(())
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<E> {
        let handle = self.handle(id)?;
        let row = read_row(&handle);
        Some(row.value.clone())
    }

    /// Like `get`, but absence is a `NotFound` error.
    pub fn require(&self, id: Uuid) -> Result<E> {
        self.get(id)
            .ok_or_else(|| FulfillmentError::not_found(E::KIND, id))
    }

    pub fn get_versioned(&self, id: Uuid) -> Option<Versioned<E>> {
        let handle = self.handle(id)?;
        let row = read_row(&handle);
        Some(Versioned {
            version: row.version,
            value: row.value.clone(),
        })
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Atomically read-modify-write one row.
    ///
    /// The closure sees a copy of the current value. Its changes are kept
    /// only when it returns `Ok`, so a failed transition never leaves a
    /// partial write behind.
    pub fn update<T>(&self, id: Uuid, f: impl FnOnce(&mut E) -> Result<T>) -> Result<T> {
        let handle = self.require_handle(id)?;
        let mut row = self.lock(id, &handle)?;
        let mut scratch = row.value.clone();
        let output = f(&mut scratch)?;
        row.value = scratch;
        row.version += 1;
        Ok(output)
    }

    /// Replace a row only if nobody wrote it since `expected_version`.
    ///
    /// Returns the new version.
    pub fn compare_and_swap(&self, id: Uuid, expected_version: u64, value: E) -> Result<u64> {
        let handle = self.require_handle(id)?;
        let mut row = self.lock(id, &handle)?;
        if row.version != expected_version {
            return Err(FulfillmentError::conflict(
                E::KIND,
                id,
                format!(
                    "stale version {} (current is {})",
                    expected_version, row.version
                ),
            ));
        }
        row.value = value;
        row.version += 1;
        Ok(row.version)
    }

    pub fn filter(&self, predicate: impl Fn(&E) -> bool) -> Vec<E> {
        self.handles()
            .iter()
            .filter_map(|handle| {
                let row = read_row(handle);
                predicate(&row.value).then(|| row.value.clone())
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&E) -> bool) -> usize {
        self.handles()
            .iter()
            .filter(|handle| predicate(&read_row(handle).value))
            .count()
    }

    /// Filter, sort, and slice.
    pub fn page(
        &self,
        predicate: impl Fn(&E) -> bool,
        compare: impl Fn(&E, &E) -> Ordering,
        request: PageRequest,
    ) -> Page<E> {
        let mut items = self.filter(predicate);
        items.sort_by(|a, b| compare(a, b));
        let total = items.len();
        let items = items
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .collect();
        Page {
            items,
            total,
            offset: request.offset,
            limit: request.limit,
        }
    }

    fn handle(&self, id: Uuid) -> Option<RowHandle<E>> {
        self.rows.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn require_handle(&self, id: Uuid) -> Result<RowHandle<E>> {
        self.handle(id)
            .ok_or_else(|| FulfillmentError::not_found(E::KIND, id))
    }

    /// Snapshot of the row handles; no shard lock is held afterwards.
    fn handles(&self) -> Vec<RowHandle<E>> {
        self.rows.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    fn lock<'a>(&self, id: Uuid, handle: &'a Mutex<Row<E>>) -> Result<MutexGuard<'a, Row<E>>> {
        let mut attempt = 0;
        loop {
            match handle.try_lock() {
                Ok(row) => return Ok(row),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    attempt += 1;
                    if attempt > self.retry.attempts {
                        warn!(entity = %E::KIND, %id, attempts = attempt, "row lock contention, giving up");
                        return Err(FulfillmentError::conflict(
                            E::KIND,
                            id,
                            "row is locked by a concurrent writer",
                        ));
                    }
                    thread::sleep(self.retry.backoff * attempt);
                }
            }
        }
    }
}

impl<E: Entity> Default for Table<E> {
    fn default() -> Self {
        Table::new(RetryPolicy::default())
    }
}
