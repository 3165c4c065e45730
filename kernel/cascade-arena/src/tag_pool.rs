//! The kernel-wide boundary-tag pool.
//!
//! Unused tags float on a lock-free stack shared by every arena. When the
//! stack runs dry, one page is taken from the physical allocator and
//! carved into [`TAGS_PER_PAGE`](crate::tag::TAGS_PER_PAGE) fresh tags;
//! those page grabs are serialized by the pool's grow mutex so concurrent
//! shortfalls cannot each burn a page. Tag pages are never returned.

use crate::tag::{BoundaryTag, TAGS_PER_PAGE};
use cascade_collections::AtomicStack;
use cascade_pmm::PhysicalPageAllocator;
use cascade_sync::{Mutex, SyncOnceCell};
use core::ptr::NonNull;

static TAG_POOL: SyncOnceCell<TagPool> = SyncOnceCell::new();

/// Wire the tag pool to the physical allocator.
///
/// Must run once during stage 1, after the physical allocator has memory,
/// before the first arena mutation. Later calls are ignored (first wins),
/// and the pool is never torn down.
pub fn init_tag_pool(pmm: &'static PhysicalPageAllocator) {
    let _ = TAG_POOL.set(TagPool {
        unused: AtomicStack::new(),
        grow_lock: Mutex::new(()),
        pmm,
    });
}

/// The pool; panics if [`init_tag_pool`] has not run.
pub(crate) fn tag_pool() -> &'static TagPool {
    TAG_POOL
        .get()
        .expect("boundary tag pool used before init_tag_pool")
}

pub(crate) struct TagPool {
    unused: AtomicStack,
    /// Serializes page-backed growth across all arenas.
    grow_lock: Mutex<()>,
    pmm: &'static PhysicalPageAllocator,
}

impl TagPool {
    /// Take one unused tag off the shared stack.
    pub(crate) fn pop(&self) -> Option<NonNull<BoundaryTag>> {
        self.unused
            .pop()
            .map(|node| unsafe { BoundaryTag::from_unused_node(node) })
    }

    /// Return an unused tag to the shared stack.
    ///
    /// # Safety
    /// `tag` must be unlinked from every arena list.
    pub(crate) unsafe fn push(&self, tag: NonNull<BoundaryTag>) {
        unsafe { self.unused.push(BoundaryTag::unused_node(tag)) };
    }

    /// Refill `reserved` up to `want` tags, growing from the physical
    /// allocator if the shared stack cannot cover the shortfall.
    ///
    /// Callers must *not* hold any arena mutex: the lock order is
    /// `arena mutex -> grow lock -> PMM spinlock`, and an arena waiting
    /// here while holding its own mutex would invert it.
    ///
    /// On failure the tags already reserved are pushed back and the pool
    /// is left unchanged.
    pub(crate) fn reserve(
        &self,
        reserved: &mut TagReserve,
        want: usize,
    ) -> Result<(), OutOfBoundaryTags> {
        let _grow = self.grow_lock.lock();

        // Another arena may have replenished the stack while we waited
        // for the grow lock.
        while reserved.len() < want {
            match self.pop() {
                Some(tag) => reserved.push(tag),
                None => break,
            }
        }
        if reserved.len() >= want {
            return Ok(());
        }

        // Carve one page into fresh tags: keep what we need, share the
        // surplus.
        let page = match self.pmm.allocate_page() {
            Ok(page) => page,
            Err(cascade_pmm::OutOfPhysicalMemory) => {
                while let Some(tag) = reserved.pop() {
                    unsafe { self.push(tag) };
                }
                return Err(OutOfBoundaryTags);
            }
        };

        let tags: *mut BoundaryTag = self
            .pmm
            .direct_map()
            .virtual_from_physical(page.address())
            .as_ptr();
        for index in 0..TAGS_PER_PAGE {
            let tag = unsafe {
                let ptr = tags.add(index);
                ptr.write(BoundaryTag::empty());
                NonNull::new_unchecked(ptr)
            };
            if reserved.len() < want {
                reserved.push(tag);
            } else {
                unsafe { self.push(tag) };
            }
        }
        Ok(())
    }
}

/// Replenishment failed because the physical allocator is empty.
pub(crate) struct OutOfBoundaryTags;

/// A small private stash of tags popped from the pool, carried across the
/// arena-mutex reacquisition during replenishment.
pub(crate) struct TagReserve {
    tags: [Option<NonNull<BoundaryTag>>; crate::MAX_TAGS_PER_OPERATION],
    len: usize,
}

impl TagReserve {
    pub(crate) const fn new() -> Self {
        Self {
            tags: [None; crate::MAX_TAGS_PER_OPERATION],
            len: 0,
        }
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push(&mut self, tag: NonNull<BoundaryTag>) {
        self.tags[self.len] = Some(tag);
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<NonNull<BoundaryTag>> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        self.tags[self.len].take()
    }
}
