use ahash::AHashMap;
use arc_swap::ArcSwapOption;
use nohash_hasher::IntMap;
use std::alloc::System;
use std::collections::hash_map::Entry;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::alloc::allocator::{BookkeepingGuard, LockOwner, track_here};
use crate::alloc::shared::fatal;
use crate::config::{DEFAULT_PERCENTILES, TracerBuilder, clamp_frames, env_format};
use crate::level::Level;
use crate::output::Reporter;
use crate::report::{LeakReport, UnresolvedReport};
use crate::stack::{self, CapturedStack, StackId, StackRecord};

const INITIAL_CAPACITY: usize = 1024;

/// One currently live tracked allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AllocationRecord {
    pub(crate) size: usize,
    pub(crate) acquired_at: quanta::Instant,
    /// Breaks ties between records acquired within one clock tick.
    pub(crate) sequence: u64,
    pub(crate) stack: Option<StackId>,
}

/// Live allocation table and stack store. Only ever touched under the tracer lock.
pub(crate) struct Bookkeeping {
    pub(crate) started_at: quanta::Instant,
    next_sequence: u64,
    pub(crate) allocs: AHashMap<usize, AllocationRecord>,
    pub(crate) stacks: IntMap<StackId, StackRecord>,
}

impl Bookkeeping {
    pub(crate) fn new(level: Level) -> Self {
        let stacks = if level == Level::Stacks {
            IntMap::with_capacity_and_hasher(INITIAL_CAPACITY, Default::default())
        } else {
            IntMap::default()
        };

        Self {
            started_at: quanta::Instant::now(),
            next_sequence: 0,
            allocs: AHashMap::with_capacity(INITIAL_CAPACITY),
            stacks,
        }
    }

    /// Records a fresh allocation at `addr`. The stack, if any, is stored before the
    /// record that references it; frames are copied only the first time a stack is seen.
    pub(crate) fn insert(&mut self, addr: usize, size: usize, stack: Option<&CapturedStack>) {
        let stack = stack.map(|captured| {
            let id = captured.id();
            self.stacks
                .entry(id)
                .or_insert_with(|| StackRecord::new(captured.frames()));
            id
        });

        let record = AllocationRecord {
            size,
            acquired_at: quanta::Instant::now(),
            sequence: self.next_sequence,
            stack,
        };
        self.next_sequence += 1;
        self.reinsert(addr, record);
    }

    pub(crate) fn reinsert(&mut self, addr: usize, record: AllocationRecord) {
        match self.allocs.entry(addr) {
            Entry::Occupied(_) => fatal(format_args!(
                "address {addr:#x} is already tracked; allocator handed out a live block twice"
            )),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
    }

    pub(crate) fn remove(&mut self, addr: usize) -> Option<AllocationRecord> {
        self.allocs.remove(&addr)
    }
}

/// The bookkeeping lock, tagged with its owner for the duration of the borrow.
struct Books<'a> {
    inner: MutexGuard<'a, Option<Bookkeeping>>,
    _owner: LockOwner,
}

impl Deref for Books<'_> {
    type Target = Option<Bookkeeping>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Books<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// An allocator decorator that records every live allocation made through it.
///
/// `Tracer` wraps any [`GlobalAlloc`] and implements [`GlobalAlloc`] itself, so it can
/// be used as an explicit handle or installed process-wide:
///
/// ```rust,no_run
/// use memtrace::{Level, Tracer};
/// use std::alloc::System;
///
/// #[global_allocator]
/// static GLOBAL: Tracer = Tracer::global(System, Level::Stacks, 8);
///
/// fn main() {
///     let leaked = Box::leak(Box::new([0u8; 64]));
///     std::hint::black_box(leaked);
///     GLOBAL.dump();
/// }
/// ```
///
/// The byte counter is updated outside the table lock, so while other threads are
/// allocating it may briefly disagree with the sum of the live table.
/// [`bytes_tracked`](Self::bytes_tracked) is a live aggregate, not a snapshot.
pub struct Tracer<A = System> {
    delegate: A,
    level: Level,
    frame_limit: usize,
    percentiles: Vec<u8>,
    bytes: AtomicUsize,
    books: Mutex<Option<Bookkeeping>>,
    reporter: ArcSwapOption<Box<dyn Reporter>>,
}

impl Tracer<System> {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::new()
    }
}

impl<A> Tracer<A> {
    /// Wraps `delegate`, tracing at `level` with up to `frame_limit` frames per stack.
    ///
    /// `frame_limit` is clamped to `1..=128`, zero selecting 8. `Level::Stacks` drops to
    /// `Level::Bytes` when the platform cannot capture stacks.
    pub fn new(delegate: A, level: Level, frame_limit: usize) -> Self {
        Self::from_parts(
            delegate,
            level,
            frame_limit,
            DEFAULT_PERCENTILES.to_vec(),
            None,
        )
    }

    /// `const` constructor for `#[global_allocator]` statics.
    ///
    /// Bookkeeping tables are created on the first tracked allocation, and the stack
    /// capture check is compile-time only.
    pub const fn global(delegate: A, level: Level, frame_limit: usize) -> Self {
        let level = match level {
            Level::Stacks if !stack::CAPTURE_AVAILABLE => Level::Bytes,
            level => level,
        };

        Self {
            delegate,
            level,
            frame_limit: clamp_frames(frame_limit),
            percentiles: Vec::new(),
            bytes: AtomicUsize::new(0),
            books: Mutex::new(None),
            reporter: ArcSwapOption::const_empty(),
        }
    }

    pub(crate) fn from_parts(
        delegate: A,
        requested: Level,
        frame_limit: usize,
        percentiles: Vec<u8>,
        reporter: Option<Box<dyn Reporter>>,
    ) -> Self {
        let _guard = BookkeepingGuard::enter();

        let level = if requested == Level::Stacks && !stack::capture_supported() {
            tracing::debug!(
                target: "memtrace",
                "stack capture unavailable, tracing at level `{}`",
                Level::Bytes
            );
            Level::Bytes
        } else {
            requested
        };

        let clamped = clamp_frames(frame_limit);
        if level == Level::Stacks && clamped != frame_limit {
            tracing::debug!(
                target: "memtrace",
                requested = frame_limit,
                frames = clamped,
                "frame limit clamped"
            );
        }

        let books = (level >= Level::Bytes).then(|| Bookkeeping::new(level));

        Self {
            delegate,
            level,
            frame_limit: clamped,
            percentiles,
            bytes: AtomicUsize::new(0),
            books: Mutex::new(books),
            reporter: ArcSwapOption::from(reporter.map(Arc::new)),
        }
    }

    /// Tears the tracer down and hands back the wrapped allocator.
    ///
    /// All bookkeeping is released, including records of allocations that are still
    /// live. Blocks handed out to the host are not touched.
    pub fn into_inner(self) -> A {
        let Self {
            delegate, books, ..
        } = self;

        let _guard = BookkeepingGuard::enter();
        drop(books);
        delegate
    }

    pub(crate) fn delegate(&self) -> &A {
        &self.delegate
    }

    /// Effective level after platform clamping.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Effective frames kept per stack after clamping.
    pub fn frame_limit(&self) -> usize {
        self.frame_limit
    }

    /// Bytes currently tracked. Lock-free.
    pub fn bytes_tracked(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Number of live tracked allocations.
    pub fn count_tracked(&self) -> usize {
        self.lock().as_ref().map_or(0, |books| books.allocs.len())
    }

    /// Number of distinct stacks observed so far. Stacks are never forgotten.
    pub fn stacks_tracked(&self) -> usize {
        self.lock().as_ref().map_or(0, |books| books.stacks.len())
    }

    /// Replaces the sink used by [`dump`](Self::dump).
    pub fn set_reporter(&self, reporter: Box<dyn Reporter>) {
        self.reporter.store(Some(Arc::new(reporter)));
    }

    /// Records a live allocation of `size` bytes at `ptr`. Null pointers are ignored.
    ///
    /// Aborts the process if `ptr` is already tracked.
    #[inline(never)]
    pub fn track(&self, ptr: *mut u8, size: usize) {
        track_here!(self, ptr, size);
    }

    #[inline]
    pub(crate) fn should_track(&self, ptr: *mut u8) -> bool {
        self.level != Level::None && !ptr.is_null()
    }

    /// Table half of [`track`](Self::track). The caller holds the bookkeeping guard.
    pub(crate) fn insert(&self, ptr: *mut u8, size: usize, captured: Option<&CapturedStack>) {
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.lock()
            .get_or_insert_with(|| Bookkeeping::new(self.level))
            .insert(ptr.addr(), size, captured);
    }

    /// Forgets the allocation at `ptr`. Addresses that were never tracked are ignored.
    pub fn untrack(&self, ptr: *mut u8) {
        let _ = self.retire(ptr);
    }

    /// Removes and returns the record for `ptr`.
    ///
    /// Runs with or without the bookkeeping guard: a host block may be freed from
    /// inside bookkeeping and its record must still go. Frees issued while this thread
    /// holds this tracer's lock are bookkeeping memory, never tracked, and are skipped.
    pub(crate) fn retire(&self, ptr: *mut u8) -> Option<AllocationRecord> {
        if !self.should_track(ptr) || LockOwner::holds(self.id()) {
            return None;
        }

        let record = self.lock().as_mut()?.remove(ptr.addr())?;
        self.bytes.fetch_sub(record.size, Ordering::Relaxed);
        Some(record)
    }

    pub(crate) fn restore(&self, ptr: *mut u8, record: AllocationRecord) {
        if LockOwner::holds(self.id()) {
            return;
        }
        // Reinserting may grow the table.
        let _guard = BookkeepingGuard::enter();

        self.bytes.fetch_add(record.size, Ordering::Relaxed);
        if let Some(books) = self.lock().as_mut() {
            books.reinsert(ptr.addr(), record);
        }
    }

    /// Builds the leak report without emitting it.
    ///
    /// Returns `None` where [`dump`](Self::dump) would do nothing: tracing is off or no
    /// bytes are tracked.
    pub fn leak_report(&self) -> Option<LeakReport> {
        if self.level == Level::None || self.bytes_tracked() == 0 {
            return None;
        }
        let _guard = BookkeepingGuard::enter()?;

        let unresolved = {
            let books = self.lock();
            self.snapshot(books.as_ref()?)
        };
        Some(unresolved.resolve())
    }

    /// Emits a leak report through the installed reporter.
    ///
    /// The tables are copied under the tracer lock; symbols are resolved and the
    /// reporter runs after it is released, so concurrent allocations only wait for
    /// the copy. Does nothing when tracing is off or no bytes are tracked.
    pub fn dump(&self) {
        let Some(report) = self.leak_report() else {
            return;
        };

        let result = match &*self.reporter.load() {
            Some(reporter) => reporter.report(&report),
            None => env_format().reporter().report(&report),
        };

        if let Err(err) = result {
            tracing::warn!(target: "memtrace", "failed to emit leak report: {err}");
        }
    }

    fn snapshot(&self, books: &Bookkeeping) -> UnresolvedReport {
        let percentiles = if self.percentiles.is_empty() {
            DEFAULT_PERCENTILES
        } else {
            &self.percentiles
        };
        LeakReport::snapshot(books, self.level, self.bytes_tracked(), percentiles)
    }

    fn id(&self) -> usize {
        std::ptr::from_ref(self).addr()
    }

    fn lock(&self) -> Books<'_> {
        let inner = self
            .books
            .lock()
            .unwrap_or_else(|_| fatal(format_args!("bookkeeping lock poisoned")));
        Books {
            inner,
            _owner: LockOwner::claim(self.id()),
        }
    }
}

impl<A> fmt::Debug for Tracer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("level", &self.level)
            .field("frame_limit", &self.frame_limit)
            .field("bytes_tracked", &self.bytes_tracked())
            .finish_non_exhaustive()
    }
}
