//! The timer wheel proper.
//!
//! # Design
//!
//! Entries live in a [`Slab`] arena and are chained into per-slice intrusive
//! doubly-linked lists through index pairs, so links survive cross-slice
//! moves and never dangle. Every linkage mutation happens under the lock of
//! the slice that owns the entry at that moment; `del`/`upd` stabilize the
//! owning slice with a lock-acquire/re-read retry loop because a concurrent
//! periodic reschedule may migrate the entry.
//!
//! # Firing
//!
//! `tick` walks a slice tail to head under its lock, reclaiming invalid
//! entries and decrementing spin counters. Due entries are unlinked and
//! marked mid-fire; their callbacks then run with the slice lock released,
//! and the `valid` flag is re-checked on return before the entry is either
//! rescheduled (periodic) or parked for delay-delete. Deleting a mid-fire
//! entry just clears `valid`; the post-fire pass finishes the job.
//!
//! # Handles
//!
//! A [`TimerHandle`] is an `(index, generation)` pair into the arena. Once
//! the delay-delete epoch ends and the slot is reclaimed, the generation
//! moves on and the handle goes stale; stale handles are safe no-ops
//! everywhere.

use crate::slab::{Slab, SlabConfigError, SlabHandle};
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Default slice width in milliseconds.
pub const DEFAULT_SLICE_INTERVAL_MS: u64 = 250;
/// Default duration of one full wheel rotation in milliseconds.
pub const DEFAULT_WHEEL_DURATION_MS: u64 = 120_000;
/// Delay-delete epoch in milliseconds.
pub const DELAY_DELETE_MS: u64 = 2_000;

/// Null link index.
const NIL: u32 = u32::MAX;
/// `slice` value for a slot that is not linked anywhere.
const FREE_SLICE: u32 = u32::MAX;
/// `slice` value while the entry is unlinked with its callback in flight.
const FIRING_SLICE: u32 = u32::MAX - 1;

/// Opaque user context carried through to the callback.
pub type TimerCtx = Arc<dyn Any + Send + Sync>;

/// Timer callback: `(handle, timer_id, ctx)`.
pub type TimerCallback = Arc<dyn Fn(TimerHandle, u32, Option<&TimerCtx>) + Send + Sync>;

/// Error returned for invalid wheel construction parameters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TimerWheelConfigError {
    /// The slice interval was zero.
    #[error("slice interval must be non-zero")]
    ZeroSliceInterval,
    /// The wheel duration was zero.
    #[error("wheel duration must be non-zero")]
    ZeroWheelDuration,
    /// The wheel duration did not exceed the slice interval.
    #[error("wheel duration {duration_ms} ms must exceed slice interval {slice_intvl_ms} ms")]
    DurationTooShort {
        /// Rejected duration.
        duration_ms: u64,
        /// Slice interval it must exceed.
        slice_intvl_ms: u64,
    },
    /// The entry pool could not be created.
    #[error(transparent)]
    Slab(#[from] SlabConfigError),
}

/// Handle to a scheduled timer.
///
/// Stays safe to use forever: operations on a handle whose entry has been
/// reclaimed are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    raw: SlabHandle,
}

/// One timer entry in the arena.
///
/// Fields are individually synchronized: `valid` and `slice` form the
/// cross-thread protocol, the links are only touched under the owning slice
/// lock, and the payload sits behind its own small mutex.
pub(crate) struct TwEntry {
    timer_id: AtomicU32,
    timeout: AtomicU64,
    periodic: AtomicBool,
    valid: AtomicBool,
    nspins: AtomicU32,
    slice: AtomicU32,
    prev: AtomicU32,
    next: AtomicU32,
    payload: Mutex<Option<Payload>>,
}

struct Payload {
    cb: TimerCallback,
    ctx: Option<TimerCtx>,
}

impl Default for TwEntry {
    fn default() -> Self {
        Self {
            timer_id: AtomicU32::new(0),
            timeout: AtomicU64::new(0),
            periodic: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            nspins: AtomicU32::new(0),
            slice: AtomicU32::new(FREE_SLICE),
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            payload: Mutex::new(None),
        }
    }
}

/// Head/tail of one slice's intrusive list.
struct SliceList {
    head: u32,
    tail: u32,
}

/// Snapshot taken under the slice lock for a due entry.
struct Fired {
    index: u32,
    generation: u32,
    timer_id: u32,
    timeout: u64,
    periodic: bool,
    cb: TimerCallback,
    ctx: Option<TimerCtx>,
}

/// A hashed timer wheel.
pub struct TimerWheel {
    entries: Slab<TwEntry>,
    slices: Box<[Mutex<SliceList>]>,
    slice_intvl: u64,
    nslices: u32,
    thread_safe: bool,
    curr_slice: AtomicU32,
    num_entries: AtomicU32,
}

impl TimerWheel {
    /// Creates a wheel of `wheel_duration_ms / slice_intvl_ms` slices.
    ///
    /// `thread_safe` records the intended sharing mode; locking is uniform
    /// in this implementation, so the flag is advisory.
    pub fn new(
        slice_intvl_ms: u64,
        wheel_duration_ms: u64,
        thread_safe: bool,
    ) -> Result<Self, TimerWheelConfigError> {
        if slice_intvl_ms == 0 {
            return Err(TimerWheelConfigError::ZeroSliceInterval);
        }
        if wheel_duration_ms == 0 {
            return Err(TimerWheelConfigError::ZeroWheelDuration);
        }
        if wheel_duration_ms <= slice_intvl_ms {
            return Err(TimerWheelConfigError::DurationTooShort {
                duration_ms: wheel_duration_ms,
                slice_intvl_ms,
            });
        }
        let nslices = (wheel_duration_ms / slice_intvl_ms) as u32;
        let slices = (0..nslices)
            .map(|_| Mutex::new(SliceList { head: NIL, tail: NIL }))
            .collect();
        Ok(Self {
            entries: Slab::new("twheel", 256, true)?,
            slices,
            slice_intvl: slice_intvl_ms,
            nslices,
            thread_safe,
            curr_slice: AtomicU32::new(0),
            num_entries: AtomicU32::new(0),
        })
    }

    /// Creates a wheel with the contract defaults (250 ms slices over 120 s).
    pub fn with_defaults(thread_safe: bool) -> Result<Self, TimerWheelConfigError> {
        Self::new(
            DEFAULT_SLICE_INTERVAL_MS,
            DEFAULT_WHEEL_DURATION_MS,
            thread_safe,
        )
    }

    /// Duration of one full rotation in milliseconds.
    fn span_ms(&self) -> u64 {
        u64::from(self.nslices) * self.slice_intvl
    }

    /// Schedules a timer firing after `initial_delay_ms + timeout_ms`.
    ///
    /// Periodic timers then re-fire every `timeout_ms`. Returns `None` when
    /// the entry pool is exhausted.
    pub fn add_timer(
        &self,
        timer_id: u32,
        timeout_ms: u64,
        ctx: Option<TimerCtx>,
        cb: TimerCallback,
        periodic: bool,
        initial_delay_ms: u64,
    ) -> Option<TimerHandle> {
        let slice = self.next_slice(initial_delay_ms + timeout_ms, 0, false);
        let handle = self.entries.alloc()?;
        let entry = self
            .entries
            .get(handle)
            .expect("freshly allocated slot must resolve");

        entry.timer_id.store(timer_id, Ordering::Relaxed);
        entry.timeout.store(timeout_ms, Ordering::Relaxed);
        entry.periodic.store(periodic, Ordering::Relaxed);
        entry
            .nspins
            .store((timeout_ms / self.span_ms()) as u32, Ordering::Relaxed);
        *entry.payload.lock() = Some(Payload { cb, ctx });

        let mut list = self.slices[slice as usize].lock();
        self.link(&mut list, handle.index(), slice);
        entry.valid.store(true, Ordering::Release);
        drop(list);

        trace!(timer_id, timeout_ms, periodic, slice, "timer added");
        Some(TimerHandle { raw: handle })
    }

    /// Cancels a timer, returning its stored context.
    ///
    /// Idempotent: deleting an entry already parked for delay-delete returns
    /// the same context again. Stale handles return `None`. The entry's
    /// memory is reclaimed only when `tick` later visits the delay-delete
    /// slice.
    pub fn del_timer(&self, handle: TimerHandle) -> Option<TimerCtx> {
        let entry = self.entries.get(handle.raw)?;
        loop {
            let slice = entry.slice.load(Ordering::Acquire);
            match slice {
                FREE_SLICE => return None,
                FIRING_SLICE => {
                    // Callback in flight: the entry is unlinked and owned by
                    // the ticking thread. Flag the delete; the post-fire pass
                    // routes the entry to delay-delete.
                    if !self.entries.validate(handle.raw) {
                        return None;
                    }
                    let ctx = entry.payload.lock().as_ref().and_then(|p| p.ctx.clone());
                    entry.valid.store(false, Ordering::Release);
                    trace!(index = handle.raw.index(), "timer deleted mid-fire");
                    return ctx;
                }
                _ => {}
            }
            let mut list = self.slices[slice as usize].lock();
            // The slice may have moved while we were acquiring the lock.
            if entry.slice.load(Ordering::Acquire) != slice {
                continue;
            }
            if !self.entries.validate(handle.raw) {
                return None;
            }
            let ctx = entry.payload.lock().as_ref().and_then(|p| p.ctx.clone());
            if !entry.valid.load(Ordering::Acquire) {
                trace!(index = handle.raw.index(), "timer already deleted");
                return ctx;
            }
            entry.valid.store(false, Ordering::Release);
            self.unlink(&mut list, handle.raw.index());
            self.delay_delete(&entry, handle.raw.index(), slice);
            return ctx;
        }
    }

    /// Reschedules a live timer with a new timeout/periodicity/context.
    ///
    /// Returns the handle unchanged for entries already parked for
    /// delay-delete; `None` for stale handles. Must not be called from the
    /// timer's own callback: a mid-fire entry is waited out.
    pub fn upd_timer(
        &self,
        handle: TimerHandle,
        timeout_ms: u64,
        periodic: bool,
        ctx: Option<TimerCtx>,
    ) -> Option<TimerHandle> {
        let entry = self.entries.get(handle.raw)?;
        loop {
            let slice = entry.slice.load(Ordering::Acquire);
            match slice {
                FREE_SLICE => return None,
                FIRING_SLICE => {
                    std::thread::yield_now();
                    continue;
                }
                _ => {}
            }
            let mut list = self.slices[slice as usize].lock();
            if entry.slice.load(Ordering::Acquire) != slice {
                continue;
            }
            if !self.entries.validate(handle.raw) {
                return None;
            }
            if !entry.valid.load(Ordering::Acquire) {
                trace!(index = handle.raw.index(), "update on deleted timer");
                return Some(handle);
            }
            self.unlink(&mut list, handle.raw.index());
            // Lock order is entry slice then target; `update = true`
            // guarantees they differ, so there is no self-deadlock.
            let target = self.next_slice(timeout_ms, slice, true);
            let mut tlist = self.slices[target as usize].lock();
            entry.timeout.store(timeout_ms, Ordering::Relaxed);
            entry.periodic.store(periodic, Ordering::Relaxed);
            entry
                .nspins
                .store((timeout_ms / self.span_ms()) as u32, Ordering::Relaxed);
            if let Some(payload) = entry.payload.lock().as_mut() {
                payload.ctx = ctx;
            }
            self.link(&mut tlist, handle.raw.index(), target);
            entry.valid.store(true, Ordering::Release);
            trace!(index = handle.raw.index(), timeout_ms, target, "timer updated");
            return Some(handle);
        }
    }

    /// Replaces the stored context. Caller-synchronized, like the rest of
    /// the handle API.
    pub fn upd_timer_ctx(
        &self,
        handle: TimerHandle,
        ctx: Option<TimerCtx>,
    ) -> Option<TimerHandle> {
        let entry = self.entries.get(handle.raw)?;
        if let Some(payload) = entry.payload.lock().as_mut() {
            payload.ctx = ctx;
        }
        Some(handle)
    }

    /// Milliseconds until the timer fires, derived from its spin count and
    /// ring position. Stale and mid-fire handles report 0.
    #[must_use]
    pub fn get_timeout_remaining(&self, handle: TimerHandle) -> u64 {
        let Some(entry) = self.entries.get(handle.raw) else {
            return 0;
        };
        let slice = entry.slice.load(Ordering::Acquire);
        if slice >= self.nslices {
            return 0;
        }
        let nspins = u64::from(entry.nspins.load(Ordering::Relaxed));
        let curr = self.curr_slice.load(Ordering::Acquire);
        let ahead = u64::from((slice + self.nslices - curr) % self.nslices);
        nspins * self.span_ms() + ahead * self.slice_intvl
    }

    /// Returns true while the entry is live (inserted and not deleted).
    #[must_use]
    pub fn is_valid(&self, handle: TimerHandle) -> bool {
        self.entries
            .get(handle.raw)
            .is_some_and(|entry| entry.valid.load(Ordering::Acquire))
    }

    /// Advances the wheel by `msecs_elapsed / slice_interval` slices,
    /// firing due entries and reclaiming delay-deleted ones.
    ///
    /// Called by a single driver; elapsed times shorter than one slice are
    /// ignored. The caller must not cover more than one full rotation in a
    /// single call (the periodic driver's batch cap enforces this).
    pub fn tick(&self, msecs_elapsed: u64) {
        if msecs_elapsed < self.slice_intvl {
            return;
        }
        let mut remaining = msecs_elapsed / self.slice_intvl;
        while remaining > 0 {
            let slice = self.curr_slice.load(Ordering::Acquire);
            self.process_slice(slice);
            self.curr_slice
                .store((slice + 1) % self.nslices, Ordering::Release);
            remaining -= 1;
        }
    }

    /// Total linked entries, delay-delete corpses included.
    #[must_use]
    pub fn num_entries(&self) -> u32 {
        self.num_entries.load(Ordering::Acquire)
    }

    /// Number of slices on the ring.
    #[must_use]
    pub const fn num_slices(&self) -> u32 {
        self.nslices
    }

    /// Slice width in milliseconds.
    #[must_use]
    pub const fn slice_interval_ms(&self) -> u64 {
        self.slice_intvl
    }

    /// Slice currently under the tick cursor.
    #[must_use]
    pub fn curr_slice(&self) -> u32 {
        self.curr_slice.load(Ordering::Acquire)
    }

    /// The sharing mode requested at construction.
    #[must_use]
    pub const fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Arena slots currently allocated (live entries plus corpses).
    #[must_use]
    pub fn entries_in_use(&self) -> u64 {
        self.entries.num_in_use()
    }

    // === internals ===

    fn entry(&self, index: u32) -> crate::slab::SlotGuard<TwEntry> {
        self.entries
            .slot_at(index)
            .expect("linked entry must be live")
    }

    /// Picks the slice for a timeout relative to the current cursor.
    ///
    /// With `update = true` the result is nudged off `entry_slice`, both to
    /// avoid re-entering a lock the caller already holds and to keep the
    /// entry-then-target lock pair distinct. Costs at most one slice of
    /// extra latency.
    fn next_slice(&self, timeout_ms: u64, entry_slice: u32, update: bool) -> u32 {
        let rem = timeout_ms % self.span_ms();
        let mut num_slices = (rem / self.slice_intvl) as u32;
        if num_slices == 0 {
            num_slices = 1;
        }
        let mut slice =
            (self.curr_slice.load(Ordering::Acquire) + num_slices) % self.nslices;
        if update && slice == entry_slice {
            slice = (slice + 1) % self.nslices;
        }
        slice
    }

    /// Links `index` at the head of `list`. Caller holds the slice lock.
    fn link(&self, list: &mut SliceList, index: u32, slice: u32) {
        let entry = self.entry(index);
        entry.prev.store(NIL, Ordering::Relaxed);
        entry.next.store(list.head, Ordering::Relaxed);
        if list.head == NIL {
            list.tail = index;
        } else {
            self.entry(list.head).prev.store(index, Ordering::Relaxed);
        }
        list.head = index;
        entry.slice.store(slice, Ordering::Release);
        self.num_entries.fetch_add(1, Ordering::AcqRel);
    }

    /// Unlinks `index` from `list`. Caller holds the slice lock.
    fn unlink(&self, list: &mut SliceList, index: u32) {
        let entry = self.entry(index);
        let prev = entry.prev.load(Ordering::Relaxed);
        let next = entry.next.load(Ordering::Relaxed);
        if next == NIL {
            list.tail = prev;
        } else {
            self.entry(next).prev.store(prev, Ordering::Relaxed);
        }
        if prev == NIL {
            list.head = next;
        } else {
            self.entry(prev).next.store(next, Ordering::Relaxed);
        }
        entry.prev.store(NIL, Ordering::Relaxed);
        entry.next.store(NIL, Ordering::Relaxed);
        self.num_entries.fetch_sub(1, Ordering::AcqRel);
    }

    /// Parks an unlinked entry in the slice `DELAY_DELETE_MS` ahead.
    ///
    /// The entry keeps its context so a repeated delete can return it; the
    /// payload is dropped when the corpse is reclaimed.
    fn delay_delete(&self, entry: &TwEntry, index: u32, entry_slice: u32) {
        let target = self.next_slice(DELAY_DELETE_MS, entry_slice, true);
        entry.timeout.store(DELAY_DELETE_MS, Ordering::Relaxed);
        entry.periodic.store(false, Ordering::Relaxed);
        entry
            .nspins
            .store((DELAY_DELETE_MS / self.span_ms()) as u32, Ordering::Relaxed);
        let mut tlist = self.slices[target as usize].lock();
        self.link(&mut tlist, index, target);
        trace!(index, target, "timer parked for delay delete");
    }

    /// Processes one slice: reclaim, spin, fire.
    fn process_slice(&self, slice: u32) {
        let mut fired: Vec<Fired> = Vec::new();
        {
            let mut list: MutexGuard<'_, SliceList> = self.slices[slice as usize].lock();
            let mut cursor = list.tail;
            while cursor != NIL {
                let entry = self.entry(cursor);
                let prev = entry.prev.load(Ordering::Relaxed);
                if !entry.valid.load(Ordering::Acquire) {
                    // Delay-delete reclamation.
                    self.unlink(&mut list, cursor);
                    entry.slice.store(FREE_SLICE, Ordering::Release);
                    entry.payload.lock().take();
                    let handle = self
                        .entries
                        .handle_at(cursor)
                        .expect("linked entry must be live");
                    drop(entry);
                    self.entries.free(handle);
                    trace!(index = cursor, "reclaimed delay-deleted timer");
                } else if entry.nspins.load(Ordering::Relaxed) > 0 {
                    // Revisit after one more full rotation.
                    entry.nspins.fetch_sub(1, Ordering::Relaxed);
                } else {
                    self.unlink(&mut list, cursor);
                    entry.slice.store(FIRING_SLICE, Ordering::Release);
                    let payload = entry.payload.lock();
                    let snapshot = payload.as_ref().expect("live entry must carry payload");
                    fired.push(Fired {
                        index: cursor,
                        generation: self
                            .entries
                            .handle_at(cursor)
                            .expect("linked entry must be live")
                            .generation(),
                        timer_id: entry.timer_id.load(Ordering::Relaxed),
                        timeout: entry.timeout.load(Ordering::Relaxed),
                        periodic: entry.periodic.load(Ordering::Relaxed),
                        cb: Arc::clone(&snapshot.cb),
                        ctx: snapshot.ctx.clone(),
                    });
                }
                cursor = prev;
            }
        }

        // Callbacks run with the slice lock released; the entries are
        // unlinked and owned by this pass until relinked below.
        for f in fired {
            let handle = TimerHandle {
                raw: SlabHandle::from_parts(f.index, f.generation),
            };
            (f.cb)(handle, f.timer_id, f.ctx.as_ref());

            let entry = self.entry(f.index);
            if f.periodic && entry.valid.load(Ordering::Acquire) {
                // Reschedule relative to the slice it fired from.
                let target = self.next_slice(f.timeout, slice, true);
                entry
                    .nspins
                    .store((f.timeout / self.span_ms()) as u32, Ordering::Relaxed);
                let mut tlist = self.slices[target as usize].lock();
                self.link(&mut tlist, f.index, target);
            } else {
                // One-shot completion, or the callback deleted the entry.
                entry.valid.store(false, Ordering::Release);
                self.delay_delete(&entry, f.index, slice);
            }
        }
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("nslices", &self.nslices)
            .field("slice_intvl_ms", &self.slice_intvl)
            .field("curr_slice", &self.curr_slice.load(Ordering::Relaxed))
            .field("num_entries", &self.num_entries.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
