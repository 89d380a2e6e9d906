//! Shared in-memory tick buffer
//!
//! Holds every retained tick, partitioned by instrument. Ingestion appends,
//! the delta job reads, and the retention job prunes, all concurrently.
//!
//! Each tick is tagged with a buffer-wide insertion sequence so that scans
//! by arrival time can be returned in exactly the order ticks were appended,
//! and so that "first in insertion order" tie-breaks are well defined.
//!
//! Readers that need several queries to agree with each other take a
//! [`BufferView`], which pins a single consistent snapshot for its lifetime.
//!
//! Arrival stamping and scanning share one frontier. A scan seals the time
//! it reads up to while holding its view; a tick stamped by
//! [`TickBuffer::append_stamped`] after that is always stamped later than
//! the sealed time, so an incremental scan can never step over it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use types::ids::InstrumentId;
use types::tick::Tick;

use crate::clock::Clock;

#[derive(Debug, Clone)]
struct Entry {
    sequence: u64,
    tick: Tick,
}

#[derive(Debug, Default)]
struct Partitions {
    next_sequence: u64,
    len: usize,
    by_instrument: BTreeMap<InstrumentId, Vec<Entry>>,
}

/// Concurrent store of retained ticks.
#[derive(Debug)]
pub struct TickBuffer {
    inner: RwLock<Partitions>,
    /// Highest arrival time a scan has claimed.
    sealed: AtomicI64,
}

impl Default for TickBuffer {
    fn default() -> Self {
        Self {
            inner: RwLock::default(),
            sealed: AtomicI64::new(i64::MIN),
        }
    }
}

impl TickBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tick as-is. It is visible to every query that starts afterwards.
    pub fn append(&self, tick: Tick) {
        let mut inner = self.write();
        Self::push(&mut inner, tick);
    }

    /// Stamp `tick.ingest_time` under the write lock and append it.
    ///
    /// The stamp is `clock.now()`, raised if needed to just past the sealed
    /// frontier. Returns the stored tick.
    pub fn append_stamped(&self, mut tick: Tick, clock: &dyn Clock) -> Tick {
        let mut inner = self.write();
        let floor = self.sealed.load(Ordering::SeqCst).saturating_add(1);
        tick.ingest_time = clock.now().max(floor);
        Self::push(&mut inner, tick.clone());
        tick
    }

    /// Raise the sealed frontier to `at`. Never lowers it.
    pub fn seal(&self, at: i64) {
        self.sealed.fetch_max(at, Ordering::SeqCst);
    }

    /// Ticks of `instrument` with `lo <= publish_time <= hi`, in insertion order.
    pub fn query_range(&self, instrument: &InstrumentId, lo: i64, hi: i64) -> Vec<Tick> {
        self.view().query_range(instrument, lo, hi)
    }

    /// Ticks of any instrument with `since < ingest_time <= upto`, in insertion order.
    pub fn query_ingested_since(&self, since: i64, upto: i64) -> Vec<Tick> {
        self.view().query_ingested_since(since, upto)
    }

    /// Remove every tick with `publish_time < horizon` and return how many went.
    ///
    /// Partitions left empty are dropped.
    pub fn prune_older_than(&self, horizon: i64) -> usize {
        let mut inner = self.write();
        let mut removed = 0;

        inner.by_instrument.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.tick.publish_time >= horizon);
            removed += before - entries.len();
            !entries.is_empty()
        });

        inner.len -= removed;
        removed
    }

    /// Pin a consistent snapshot for several reads.
    ///
    /// Writers block while the view is alive, so keep it short.
    pub fn view(&self) -> BufferView<'_> {
        BufferView {
            inner: self.inner.read().unwrap_or_else(PoisonError::into_inner),
            sealed: &self.sealed,
        }
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn instrument_count(&self) -> usize {
        self.view().instrument_count()
    }

    // A panic while holding the lock cannot leave a partition half-written:
    // every mutation above completes or never starts touching the map.
    fn write(&self) -> RwLockWriteGuard<'_, Partitions> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(inner: &mut Partitions, tick: Tick) {
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.len += 1;
        inner
            .by_instrument
            .entry(tick.instrument.clone())
            .or_default()
            .push(Entry { sequence, tick });
    }
}

/// Read-locked snapshot of a [`TickBuffer`].
pub struct BufferView<'a> {
    inner: RwLockReadGuard<'a, Partitions>,
    sealed: &'a AtomicI64,
}

impl<'a> BufferView<'a> {
    /// Read `clock` while no append can be in flight and seal the result.
    ///
    /// Every tick stamped at or before the returned time is already in this
    /// view; every later append is stamped after it.
    pub fn seal_now(&self, clock: &dyn Clock) -> i64 {
        let now = clock.now();
        self.seal(now);
        now
    }

    /// Raise the sealed frontier to `at`.
    pub fn seal(&self, at: i64) {
        self.sealed.fetch_max(at, Ordering::SeqCst);
    }
    /// Ticks of `instrument` with `lo <= publish_time <= hi`, in insertion order.
    pub fn range(&self, instrument: &InstrumentId, lo: i64, hi: i64) -> impl Iterator<Item = &Tick> {
        self.inner
            .by_instrument
            .get(instrument)
            .into_iter()
            .flatten()
            .map(|e| &e.tick)
            .filter(move |t| t.publish_time >= lo && t.publish_time <= hi)
    }

    pub fn query_range(&self, instrument: &InstrumentId, lo: i64, hi: i64) -> Vec<Tick> {
        self.range(instrument, lo, hi).cloned().collect()
    }

    /// Ticks of any instrument with `since < ingest_time <= upto`, in insertion order.
    pub fn query_ingested_since(&self, since: i64, upto: i64) -> Vec<Tick> {
        let mut hits: Vec<&Entry> = self
            .inner
            .by_instrument
            .values()
            .flatten()
            .filter(|e| e.tick.ingest_time > since && e.tick.ingest_time <= upto)
            .collect();
        hits.sort_unstable_by_key(|e| e.sequence);
        hits.into_iter().map(|e| e.tick.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn instrument_count(&self) -> usize {
        self.inner.by_instrument.len()
    }
}
