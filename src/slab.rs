//! Fixed-size object pool backing the timer wheel's entries.
//!
//! The pool hands out slots from blocks of a fixed element count, growing by
//! one block on demand and releasing a block back to the allocator once its
//! in-use count drops to zero (the last block is always retained). Slots are
//! addressed by [`SlabHandle`], an `(index, generation)` pair: freeing a slot
//! bumps its generation, so a stale handle can never reach a recycled slot.
//!
//! # Ownership
//!
//! Ownership is single: a slot returned by [`Slab::alloc`] belongs to the
//! caller until returned through [`Slab::free`]. The pool does not reset slot
//! contents on allocation; callers re-initialize the fields they use.
//!
//! # Concurrency
//!
//! The pool is thread-safe. [`Slab::get`] returns a guard that keeps the
//! containing block alive, so reads through a guard stay valid even if the
//! block is released concurrently.

use parking_lot::{Mutex, RwLock};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Error returned for invalid pool construction parameters.
#[derive(Debug, Clone, thiserror::Error)]
#[error("slab {name:?}: elems_per_block must be greater than 1 (got {elems_per_block})")]
pub struct SlabConfigError {
    /// The offending pool name.
    pub name: String,
    /// The rejected block element count.
    pub elems_per_block: u32,
}

/// Handle to an allocated slot.
///
/// Carries the slot index and the generation observed at allocation time;
/// the handle goes stale once the slot is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabHandle {
    index: u32,
    generation: u32,
}

impl SlabHandle {
    /// Returns the raw slot index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation observed at allocation time.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Rebuilds a handle from its parts, for intrusive users that store the
    /// index and generation separately.
    pub(crate) const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Per-slot metadata kept beside the payload.
struct SlotMeta {
    in_use: AtomicBool,
    generation: AtomicU32,
}

struct Block<T> {
    slots: Box<[T]>,
    meta: Box<[SlotMeta]>,
}

impl<T: Default> Block<T> {
    fn new(elems: u32) -> Self {
        Self {
            slots: (0..elems).map(|_| T::default()).collect(),
            meta: (0..elems)
                .map(|_| SlotMeta {
                    in_use: AtomicBool::new(false),
                    generation: AtomicU32::new(0),
                })
                .collect(),
        }
    }
}

/// Shared read access to one slot; keeps the containing block alive.
pub struct SlotGuard<T> {
    block: Arc<Block<T>>,
    offset: usize,
}

impl<T> Deref for SlotGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.block.slots[self.offset]
    }
}

struct SlabInner {
    /// Free slot indices; only indices of live blocks appear here.
    free: Vec<u32>,
    /// Per-block in-use counts, indexed by block position.
    block_in_use: Vec<u32>,
    live_blocks: u32,
    num_in_use: u64,
    num_allocs: u64,
    num_frees: u64,
    num_alloc_fails: u64,
}

/// A fixed-size object pool.
pub struct Slab<T> {
    name: String,
    elems_per_block: u32,
    grow_on_demand: bool,
    inner: Mutex<SlabInner>,
    blocks: RwLock<Vec<Option<Arc<Block<T>>>>>,
}

impl<T: Default + Send + Sync> Slab<T> {
    /// Creates a pool growing in blocks of `elems_per_block` slots (rounded
    /// up to a power of two). When `grow_on_demand` is false, the pool is
    /// capped at its first block.
    pub fn new(
        name: impl Into<String>,
        elems_per_block: u32,
        grow_on_demand: bool,
    ) -> Result<Self, SlabConfigError> {
        let name = name.into();
        if elems_per_block <= 1 {
            return Err(SlabConfigError {
                name,
                elems_per_block,
            });
        }
        Ok(Self {
            name,
            elems_per_block: elems_per_block.next_power_of_two(),
            grow_on_demand,
            inner: Mutex::new(SlabInner {
                free: Vec::new(),
                block_in_use: Vec::new(),
                live_blocks: 0,
                num_in_use: 0,
                num_allocs: 0,
                num_frees: 0,
                num_alloc_fails: 0,
            }),
            blocks: RwLock::new(Vec::new()),
        })
    }

    /// Allocates a slot, growing the pool by one block if needed.
    ///
    /// Returns `None` when the pool cannot grow (`grow_on_demand` off and the
    /// first block exhausted).
    pub fn alloc(&self) -> Option<SlabHandle> {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            if inner.live_blocks > 0 && !self.grow_on_demand {
                inner.num_alloc_fails += 1;
                return None;
            }
            self.grow(&mut inner);
        }
        let index = inner.free.pop()?;
        let block_pos = (index / self.elems_per_block) as usize;
        inner.block_in_use[block_pos] += 1;
        inner.num_in_use += 1;
        inner.num_allocs += 1;
        drop(inner);

        let blocks = self.blocks.read();
        let block = blocks[block_pos]
            .as_ref()
            .expect("free list referenced a released block");
        let meta = &block.meta[(index % self.elems_per_block) as usize];
        meta.in_use.store(true, Ordering::Release);
        let generation = meta.generation.load(Ordering::Acquire);
        Some(SlabHandle { index, generation })
    }

    /// Returns the slot to the pool.
    ///
    /// Stale handles are rejected with `false`. A block whose in-use count
    /// drops to zero is released unless it is the only remaining block.
    pub fn free(&self, handle: SlabHandle) -> bool {
        let mut inner = self.inner.lock();
        let block_pos = (handle.index / self.elems_per_block) as usize;
        let offset = (handle.index % self.elems_per_block) as usize;

        let release = {
            let blocks = self.blocks.read();
            let Some(Some(block)) = blocks.get(block_pos) else {
                return false;
            };
            let meta = &block.meta[offset];
            if !meta.in_use.load(Ordering::Acquire)
                || meta.generation.load(Ordering::Acquire) != handle.generation
            {
                return false;
            }
            // Generation bump first so concurrent lookups go stale before the
            // slot can be handed out again.
            meta.generation.fetch_add(1, Ordering::AcqRel);
            meta.in_use.store(false, Ordering::Release);

            inner.num_frees += 1;
            inner.num_in_use -= 1;
            inner.block_in_use[block_pos] -= 1;
            inner.block_in_use[block_pos] == 0 && inner.live_blocks > 1
        };

        if release {
            inner
                .free
                .retain(|&idx| idx / self.elems_per_block != block_pos as u32);
            inner.live_blocks -= 1;
            self.blocks.write()[block_pos] = None;
        } else {
            inner.free.push(handle.index);
        }
        true
    }

    /// Shared access to the slot behind `handle`; `None` for stale handles.
    pub fn get(&self, handle: SlabHandle) -> Option<SlotGuard<T>> {
        let block_pos = (handle.index / self.elems_per_block) as usize;
        let offset = (handle.index % self.elems_per_block) as usize;
        let blocks = self.blocks.read();
        let block = blocks.get(block_pos)?.as_ref()?;
        let meta = &block.meta[offset];
        if !meta.in_use.load(Ordering::Acquire)
            || meta.generation.load(Ordering::Acquire) != handle.generation
        {
            return None;
        }
        Some(SlotGuard {
            block: Arc::clone(block),
            offset,
        })
    }

    /// Returns true if `handle` still addresses a live slot.
    #[must_use]
    pub fn validate(&self, handle: SlabHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Shared access to an in-use slot by raw index, for intrusive users
    /// that store indices as links.
    pub(crate) fn slot_at(&self, index: u32) -> Option<SlotGuard<T>> {
        let block_pos = (index / self.elems_per_block) as usize;
        let offset = (index % self.elems_per_block) as usize;
        let blocks = self.blocks.read();
        let block = blocks.get(block_pos)?.as_ref()?;
        if !block.meta[offset].in_use.load(Ordering::Acquire) {
            return None;
        }
        Some(SlotGuard {
            block: Arc::clone(block),
            offset,
        })
    }

    /// Current handle for an in-use slot addressed by raw index.
    pub(crate) fn handle_at(&self, index: u32) -> Option<SlabHandle> {
        let block_pos = (index / self.elems_per_block) as usize;
        let offset = (index % self.elems_per_block) as usize;
        let blocks = self.blocks.read();
        let block = blocks.get(block_pos)?.as_ref()?;
        let meta = &block.meta[offset];
        if !meta.in_use.load(Ordering::Acquire) {
            return None;
        }
        Some(SlabHandle {
            index,
            generation: meta.generation.load(Ordering::Acquire),
        })
    }

    /// Visits every in-use slot. The visitor returns `false` to stop early.
    pub fn walk(&self, mut visitor: impl FnMut(SlabHandle, &T) -> bool) {
        let blocks: Vec<(usize, Arc<Block<T>>)> = self
            .blocks
            .read()
            .iter()
            .enumerate()
            .filter_map(|(pos, block)| block.as_ref().map(|b| (pos, Arc::clone(b))))
            .collect();
        for (pos, block) in &blocks {
            for offset in 0..block.slots.len() {
                let meta = &block.meta[offset];
                if !meta.in_use.load(Ordering::Acquire) {
                    continue;
                }
                let handle = SlabHandle {
                    index: *pos as u32 * self.elems_per_block + offset as u32,
                    generation: meta.generation.load(Ordering::Acquire),
                };
                if !visitor(handle, &block.slots[offset]) {
                    return;
                }
            }
        }
    }

    fn grow(&self, inner: &mut SlabInner) {
        let mut blocks = self.blocks.write();
        let block_pos = blocks.len() as u32;
        blocks.push(Some(Arc::new(Block::new(self.elems_per_block))));
        drop(blocks);
        let base = block_pos * self.elems_per_block;
        // Reverse so the lowest index pops first.
        inner
            .free
            .extend((base..base + self.elems_per_block).rev());
        inner.block_in_use.push(0);
        inner.live_blocks += 1;
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block element count after power-of-two rounding.
    #[must_use]
    pub const fn elems_per_block(&self) -> u32 {
        self.elems_per_block
    }

    /// Slots currently allocated.
    #[must_use]
    pub fn num_in_use(&self) -> u64 {
        self.inner.lock().num_in_use
    }

    /// Total successful allocations.
    #[must_use]
    pub fn num_allocs(&self) -> u64 {
        self.inner.lock().num_allocs
    }

    /// Total frees.
    #[must_use]
    pub fn num_frees(&self) -> u64 {
        self.inner.lock().num_frees
    }

    /// Allocation attempts rejected because the pool could not grow.
    #[must_use]
    pub fn num_alloc_fails(&self) -> u64 {
        self.inner.lock().num_alloc_fails
    }

    /// Live block count.
    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        self.inner.lock().live_blocks
    }
}

impl<T> std::fmt::Debug for Slab<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Slab")
            .field("name", &self.name)
            .field("elems_per_block", &self.elems_per_block)
            .field("num_in_use", &inner.num_in_use)
            .field("live_blocks", &inner.live_blocks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Payload {
        value: AtomicU32,
    }

    #[test]
    fn rejects_tiny_blocks() {
        assert!(Slab::<Payload>::new("bad", 1, true).is_err());
        assert!(Slab::<Payload>::new("ok", 2, true).is_ok());
    }

    #[test]
    fn alloc_get_free_roundtrip() {
        let slab: Slab<Payload> = Slab::new("t", 4, true).unwrap();
        let h = slab.alloc().unwrap();
        slab.get(h).unwrap().value.store(7, Ordering::Relaxed);
        assert_eq!(slab.get(h).unwrap().value.load(Ordering::Relaxed), 7);
        assert_eq!(slab.num_in_use(), 1);
        assert!(slab.free(h));
        assert_eq!(slab.num_in_use(), 0);
        assert_eq!(slab.num_allocs(), 1);
        assert_eq!(slab.num_frees(), 1);
    }

    #[test]
    fn stale_handle_goes_dark() {
        let slab: Slab<Payload> = Slab::new("t", 4, true).unwrap();
        let h = slab.alloc().unwrap();
        assert!(slab.free(h));
        assert!(slab.get(h).is_none());
        assert!(!slab.validate(h));
        // Double free is rejected.
        assert!(!slab.free(h));
        // Reuse of the same slot yields a different generation.
        let mut reused = None;
        for _ in 0..8 {
            let h2 = slab.alloc().unwrap();
            if h2.index() == h.index() {
                reused = Some(h2);
                break;
            }
        }
        let h2 = reused.expect("slot should be reused");
        assert_ne!(h2.generation(), h.generation());
        assert!(slab.get(h).is_none());
        assert!(slab.get(h2).is_some());
    }

    #[test]
    fn grows_and_releases_blocks() {
        let slab: Slab<Payload> = Slab::new("t", 2, true).unwrap();
        let handles: Vec<_> = (0..6).map(|_| slab.alloc().unwrap()).collect();
        assert_eq!(slab.num_blocks(), 3);

        // Free everything in the middle block; it should be released.
        let mid: Vec<_> = handles
            .iter()
            .copied()
            .filter(|h| h.index() / 2 == 1)
            .collect();
        assert_eq!(mid.len(), 2);
        for h in &mid {
            assert!(slab.free(*h));
        }
        assert_eq!(slab.num_blocks(), 2);
        assert!(slab.get(mid[0]).is_none());

        // Remaining handles still resolve.
        for h in handles.iter().filter(|h| h.index() / 2 != 1) {
            assert!(slab.get(*h).is_some());
        }
    }

    #[test]
    fn last_block_is_retained() {
        let slab: Slab<Payload> = Slab::new("t", 2, true).unwrap();
        let a = slab.alloc().unwrap();
        let b = slab.alloc().unwrap();
        assert!(slab.free(a));
        assert!(slab.free(b));
        assert_eq!(slab.num_blocks(), 1);
        assert!(slab.alloc().is_some());
    }

    #[test]
    fn capped_pool_reports_alloc_fails() {
        let slab: Slab<Payload> = Slab::new("t", 2, false).unwrap();
        assert!(slab.alloc().is_some());
        assert!(slab.alloc().is_some());
        assert!(slab.alloc().is_none());
        assert_eq!(slab.num_alloc_fails(), 1);
    }

    #[test]
    fn walk_visits_in_use_only() {
        let slab: Slab<Payload> = Slab::new("t", 4, true).unwrap();
        let keep = slab.alloc().unwrap();
        let drop_me = slab.alloc().unwrap();
        slab.get(keep).unwrap().value.store(1, Ordering::Relaxed);
        assert!(slab.free(drop_me));

        let mut seen = Vec::new();
        slab.walk(|h, slot| {
            seen.push((h, slot.value.load(Ordering::Relaxed)));
            true
        });
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, keep);
        assert_eq!(seen[0].1, 1);

        // Early stop.
        let extra = slab.alloc().unwrap();
        let _ = extra;
        let mut count = 0;
        slab.walk(|_, _| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn stats_balance() {
        let slab: Slab<Payload> = Slab::new("t", 4, true).unwrap();
        let handles: Vec<_> = (0..10).map(|_| slab.alloc().unwrap()).collect();
        for h in &handles[..4] {
            assert!(slab.free(*h));
        }
        assert_eq!(
            slab.num_allocs() - slab.num_frees(),
            slab.num_in_use()
        );
    }
}
