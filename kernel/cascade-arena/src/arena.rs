//! The arena proper: spans, fit policies, coalescing and import/release.

use crate::tag::{BoundaryTag, TagKind};
use crate::tag_pool::{OutOfBoundaryTags, TagReserve, tag_pool};
use crate::MAX_TAGS_PER_OPERATION;
use cascade_collections::{DoubleNode, DoublyLinkedList, Name, SinglyLinkedList};
use cascade_sync::{Mutex, MutexGuard};
use core::fmt;
use core::ptr::NonNull;

const FREELIST_COUNT: usize = usize::BITS as usize;
const ALLOCATION_TABLE_BUCKETS: usize = 64;

/// A successful arena allocation: `len` is the quantum-rounded length.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Allocation {
    pub base: usize,
    pub len: usize,
}

/// How [`Arena::allocate`] picks a free tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocationPolicy {
    /// O(1): the first tag of the lowest freelist whose members are all
    /// guaranteed to fit, found with one bitmap mask and count-trailing-
    /// zeros.
    InstantFit,
    /// Search the request's own freelist for an exact or tightest match
    /// before falling back to the instant-fit list's tightest member.
    BestFit,
    /// Take the first fitting tag of the request's own freelist, falling
    /// back to instant fit.
    FirstFit,
}

/// Errors from [`Arena::add_span`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddSpanError {
    ZeroLength,
    /// `base + len` overflows the integer space.
    WouldWrap,
    /// Base or length is not a multiple of the arena's quantum.
    Unaligned,
    /// The span overlaps a span already owned by the arena.
    Overlap,
    /// Boundary-tag replenishment failed; the arena is unchanged.
    OutOfBoundaryTags,
}

impl fmt::Display for AddSpanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroLength => f.write_str("span has zero length"),
            Self::WouldWrap => f.write_str("span wraps the integer space"),
            Self::Unaligned => f.write_str("span is not quantum aligned"),
            Self::Overlap => f.write_str("span overlaps an existing span"),
            Self::OutOfBoundaryTags => f.write_str("out of boundary tags"),
        }
    }
}

/// Errors from [`Arena::allocate`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocateError {
    ZeroLength,
    /// No free run is large enough and the source (if any) could not
    /// provide one.
    RequestedLengthUnavailable,
    /// Boundary-tag replenishment failed; the arena is unchanged.
    OutOfBoundaryTags,
}

impl fmt::Display for AllocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroLength => f.write_str("allocation has zero length"),
            Self::RequestedLengthUnavailable => f.write_str("requested length unavailable"),
            Self::OutOfBoundaryTags => f.write_str("out of boundary tags"),
        }
    }
}

/// Import/release composition: where an arena grows from when it runs dry.
///
/// `import` obtains a run of at least the requested length from the parent
/// arena; `release` gives back exactly what was imported. The defaults
/// simply call the parent's `allocate` (instant fit) and `deallocate`;
/// overriding them lets an importer attach side effects, such as the
/// kernel heap mapping fresh pages behind each imported range.
///
/// Import graphs must form a forest: each arena has at most one source and
/// no cycles, which is also the lock order between arenas.
#[derive(Copy, Clone)]
pub struct Source {
    arena: &'static Arena,
    import: fn(&'static Arena, usize) -> Result<Allocation, AllocateError>,
    release: fn(&'static Arena, Allocation),
}

impl Source {
    /// A source using the parent's plain `allocate`/`deallocate`.
    #[must_use]
    pub const fn new(arena: &'static Arena) -> Self {
        Self {
            arena,
            import: default_import,
            release: default_release,
        }
    }

    /// A source with custom import/release callbacks.
    #[must_use]
    pub const fn with_callbacks(
        arena: &'static Arena,
        import: fn(&'static Arena, usize) -> Result<Allocation, AllocateError>,
        release: fn(&'static Arena, Allocation),
    ) -> Self {
        Self {
            arena,
            import,
            release,
        }
    }
}

fn default_import(arena: &'static Arena, len: usize) -> Result<Allocation, AllocateError> {
    arena.allocate(len, AllocationPolicy::InstantFit)
}

fn default_release(arena: &'static Arena, allocation: Allocation) {
    arena.deallocate(allocation);
}

/// Everything the arena mutex protects.
struct Inner {
    /// Every live tag, ordered by ascending base; each span tag is
    /// directly followed by the free/allocated tags tiling it.
    all_tags: DoublyLinkedList,
    /// Span and imported-span tags, via their `kind_node`.
    spans: DoublyLinkedList,
    /// Free tags bucketed by `floor(log2(len))`, via their `kind_node`.
    freelists: [DoublyLinkedList; FREELIST_COUNT],
    /// Bit `i` set iff `freelists[i]` is non-empty.
    freelist_bitmap: usize,
    /// Allocated tags hashed by base, via their `kind_node`.
    allocation_table: [DoublyLinkedList; ALLOCATION_TABLE_BUCKETS],
    /// Local stash of unused tags, replenished from the shared pool.
    unused_tags: SinglyLinkedList,
}

impl Inner {
    const fn new() -> Self {
        Self {
            all_tags: DoublyLinkedList::new(),
            spans: DoublyLinkedList::new(),
            freelists: [const { DoublyLinkedList::new() }; FREELIST_COUNT],
            freelist_bitmap: 0,
            allocation_table: [const { DoublyLinkedList::new() }; ALLOCATION_TABLE_BUCKETS],
            unused_tags: SinglyLinkedList::new(),
        }
    }

    fn take_unused(&mut self) -> NonNull<BoundaryTag> {
        let node = self
            .unused_tags
            .pop()
            .expect("unused tags were guaranteed before taking the mutex");
        unsafe { BoundaryTag::from_unused_node(node) }
    }

    unsafe fn push_unused(&mut self, tag: NonNull<BoundaryTag>) {
        unsafe { self.unused_tags.push(BoundaryTag::unused_node(tag)) };
    }

    /// Link a free tag into its freelist and set the bitmap bit.
    unsafe fn push_free(&mut self, tag: NonNull<BoundaryTag>) {
        let index = freelist_index(unsafe { tag.as_ref().len });
        unsafe {
            self.freelists[index].push_front(BoundaryTag::kind_node(tag));
        }
        self.freelist_bitmap |= 1 << index;
    }

    /// Unlink a free tag from its freelist, clearing the bitmap bit if the
    /// list drained.
    unsafe fn remove_free(&mut self, tag: NonNull<BoundaryTag>) {
        let index = freelist_index(unsafe { tag.as_ref().len });
        unsafe {
            self.freelists[index].remove(BoundaryTag::kind_node(tag));
        }
        if self.freelists[index].is_empty() {
            self.freelist_bitmap &= !(1 << index);
        }
    }

    unsafe fn insert_allocated(&mut self, tag: NonNull<BoundaryTag>) {
        let bucket = allocation_bucket(unsafe { tag.as_ref().base });
        unsafe {
            self.allocation_table[bucket].push_front(BoundaryTag::kind_node(tag));
        }
    }

    fn find_allocated(&self, base: usize) -> Option<NonNull<BoundaryTag>> {
        self.allocation_table[allocation_bucket(base)]
            .iter()
            .map(|node| unsafe { BoundaryTag::from_kind_node(node) })
            .find(|tag| unsafe { tag.as_ref().base } == base)
    }

    /// The `all_node` after which a tag with this base belongs, or `None`
    /// for the front of the chain.
    fn all_insertion_point(&self, base: usize) -> Option<NonNull<DoubleNode>> {
        let mut prev = None;
        for node in self.all_tags.iter() {
            if unsafe { BoundaryTag::from_all_node(node).as_ref().base } >= base {
                break;
            }
            prev = Some(node);
        }
        prev
    }
}

/// `floor(log2(len))`: the freelist holding free tags of this length.
fn freelist_index(len: usize) -> usize {
    debug_assert!(len > 0);
    (usize::BITS - 1 - len.leading_zeros()) as usize
}

/// Lower bound on the tag lengths in freelist `index`.
fn smallest_len_in_freelist(index: usize) -> usize {
    1 << index
}

/// The lowest non-empty freelist whose members are all >= `len`, found
/// with one mask and count-trailing-zeros.
fn instant_fit_index(bitmap: usize, len: usize) -> Option<usize> {
    let min = len.checked_next_power_of_two()?;
    let mask = bitmap & !(min - 1);
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros() as usize)
    }
}

/// Hash a base into its allocation-table bucket (wyhash-style mix).
fn allocation_bucket(base: usize) -> usize {
    let x = (base as u64) ^ 0xA076_1D64_78BD_642F;
    let product = u128::from(x).wrapping_mul(u128::from(0xE703_7ED1_A0B4_28DB_u64));
    (((product >> 64) ^ product) as u64 as usize) % ALLOCATION_TABLE_BUCKETS
}

/// Snapshot of one boundary tag, for diagnostics and tests.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TagSnapshot {
    pub base: usize,
    pub len: usize,
    pub kind: TagKind,
}

/// A vmem-style resource arena. See the [crate docs](crate) for the model.
pub struct Arena {
    name: Name,
    quantum: usize,
    source: Option<Source>,
    inner: Mutex<Inner>,
}

impl Arena {
    /// Create an empty arena.
    ///
    /// `quantum` must be a power of two; every base and length the arena
    /// handles is a multiple of it. `const`-constructible so arenas can be
    /// `static`s wired together with [`Source`]s.
    #[must_use]
    pub const fn new(name: &str, quantum: usize, source: Option<Source>) -> Self {
        assert!(quantum.is_power_of_two(), "quantum must be a power of two");
        Self {
            name: Name::new(name),
            quantum,
            source,
            inner: Mutex::new(Inner::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[must_use]
    pub const fn quantum(&self) -> usize {
        self.quantum
    }

    /// Donate the range `[base, base + len)` to the arena.
    pub fn add_span(&self, base: usize, len: usize) -> Result<(), AddSpanError> {
        if len == 0 {
            return Err(AddSpanError::ZeroLength);
        }
        let Some(end) = base.checked_add(len) else {
            return Err(AddSpanError::WouldWrap);
        };
        if base % self.quantum != 0 || len % self.quantum != 0 {
            return Err(AddSpanError::Unaligned);
        }

        let mut inner = self
            .replenish_and_lock()
            .map_err(|OutOfBoundaryTags| AddSpanError::OutOfBoundaryTags)?;
        self.check_invariants(&inner);

        for node in inner.spans.iter() {
            let span = unsafe { BoundaryTag::from_kind_node(node).as_ref() };
            if base < span.base + span.len && span.base < end {
                return Err(AddSpanError::Overlap);
            }
        }

        unsafe { self.insert_span(&mut inner, base, len, TagKind::Span) };
        self.check_invariants(&inner);
        Ok(())
    }

    /// Allocate `len` (rounded up to the quantum) under `policy`.
    pub fn allocate(&self, len: usize, policy: AllocationPolicy) -> Result<Allocation, AllocateError> {
        if len == 0 {
            return Err(AllocateError::ZeroLength);
        }
        let len = len
            .checked_next_multiple_of(self.quantum)
            .ok_or(AllocateError::RequestedLengthUnavailable)?;

        let mut inner = self
            .replenish_and_lock()
            .map_err(|OutOfBoundaryTags| AllocateError::OutOfBoundaryTags)?;
        self.check_invariants(&inner);

        let chosen = match self.choose(&mut inner, len, policy) {
            Some(tag) => tag,
            None => self.import_and_retry(&mut inner, len, policy)?,
        };

        // `choose` already unlinked the tag from its freelist; split off
        // the surplus before publishing it as allocated.
        let (base, chosen_len) = unsafe {
            let tag = chosen.as_ref();
            debug_assert_eq!(tag.kind, TagKind::Free);
            debug_assert!(tag.len >= len);
            (tag.base, tag.len)
        };
        if chosen_len > len {
            let mut rest = inner.take_unused();
            unsafe {
                *rest.as_mut() = BoundaryTag {
                    base: base + len,
                    len: chosen_len - len,
                    kind: TagKind::Free,
                    ..BoundaryTag::empty()
                };
                inner
                    .all_tags
                    .insert_after(BoundaryTag::all_node(rest), BoundaryTag::all_node(chosen));
                inner.push_free(rest);
            }
        }

        unsafe {
            let mut chosen = chosen;
            let tag = chosen.as_mut();
            tag.len = len;
            tag.kind = TagKind::Allocated;
        }
        unsafe { inner.insert_allocated(chosen) };

        self.check_invariants(&inner);
        Ok(Allocation { base, len })
    }

    /// Free an allocation, checking that its length matches.
    ///
    /// # Panics
    /// Panics if `allocation.base` is unknown to the arena or the length
    /// disagrees with the allocation table.
    pub fn deallocate(&self, allocation: Allocation) {
        let len = allocation
            .len
            .checked_next_multiple_of(self.quantum)
            .expect("allocation length wraps");
        self.deallocate_with(allocation.base, Some(len));
    }

    /// Free an allocation identified by base alone.
    ///
    /// # Panics
    /// Panics if `base` is unknown to the arena.
    pub fn deallocate_base(&self, base: usize) {
        self.deallocate_with(base, None);
    }

    /// Tear down an exclusively owned arena.
    ///
    /// Releases every imported span back to the source and returns all
    /// tags to the shared pool. No locking: `&mut self` proves exclusive
    /// access.
    ///
    /// # Panics
    /// Panics if any allocation is still live.
    pub fn destroy(&mut self) {
        let source = self.source;
        let name = self.name;
        let inner = self.inner.get_mut();
        let pool = tag_pool();

        for bucket in &inner.allocation_table {
            assert!(
                bucket.is_empty(),
                "arena {name:?} destroyed with live allocations"
            );
        }

        // Kind lists and the all chain link the same tags through
        // different nodes; drain the kind lists first so every node is
        // unlinked by the time the tag returns to the pool.
        while inner.spans.pop_front().is_some() {}
        for freelist in &mut inner.freelists {
            while freelist.pop_front().is_some() {}
        }
        inner.freelist_bitmap = 0;

        while let Some(node) = inner.all_tags.pop_front() {
            let tag = unsafe { BoundaryTag::from_all_node(node) };
            let (kind, base, len) = unsafe {
                let t = tag.as_ref();
                (t.kind, t.base, t.len)
            };
            if kind == TagKind::ImportedSpan {
                let source = source.expect("imported span without a source");
                (source.release)(source.arena, Allocation { base, len });
            }
            unsafe { pool.push(tag) };
        }

        while let Some(node) = inner.unused_tags.pop() {
            unsafe { pool.push(BoundaryTag::from_unused_node(node)) };
        }
    }

    /// Visit every live tag in base order.
    pub fn for_each_tag(&self, mut f: impl FnMut(TagSnapshot)) {
        let inner = self.inner.lock();
        for node in inner.all_tags.iter() {
            let tag = unsafe { BoundaryTag::from_all_node(node).as_ref() };
            f(TagSnapshot {
                base: tag.base,
                len: tag.len,
                kind: tag.kind,
            });
        }
    }

    // ---- internals ----

    /// Take the arena mutex with at least [`MAX_TAGS_PER_OPERATION`]
    /// unused tags in the local stash.
    ///
    /// Escalation never holds the arena mutex while waiting on the pool's
    /// grow lock; after growing, the stash is re-checked because a
    /// concurrent operation on this arena may have consumed it.
    fn replenish_and_lock(&self) -> Result<MutexGuard<'_, Inner>, OutOfBoundaryTags> {
        let pool = tag_pool();
        loop {
            let mut inner = self.inner.lock();
            while inner.unused_tags.len() < MAX_TAGS_PER_OPERATION {
                match pool.pop() {
                    Some(tag) => unsafe { inner.push_unused(tag) },
                    None => break,
                }
            }
            if inner.unused_tags.len() >= MAX_TAGS_PER_OPERATION {
                return Ok(inner);
            }
            let shortfall = MAX_TAGS_PER_OPERATION - inner.unused_tags.len();
            drop(inner);

            let mut reserved = TagReserve::new();
            pool.reserve(&mut reserved, shortfall)?;

            let mut inner = self.inner.lock();
            while let Some(tag) = reserved.pop() {
                unsafe { inner.push_unused(tag) };
            }
            if inner.unused_tags.len() >= MAX_TAGS_PER_OPERATION {
                return Ok(inner);
            }
            // A concurrent allocate drained the stash while the mutex was
            // dropped; go around again.
        }
    }

    /// Lock for deallocation: replenishment is attempted per protocol but
    /// a shortage is tolerated, since freeing never consumes tags.
    fn lock_for_deallocate(&self) -> MutexGuard<'_, Inner> {
        match self.replenish_and_lock() {
            Ok(inner) => inner,
            Err(OutOfBoundaryTags) => self.inner.lock(),
        }
    }

    /// Create a span plus its single free tile. Consumes
    /// [`TAGS_PER_SPAN_CREATE`] unused tags.
    ///
    /// # Safety
    /// The range must not overlap any existing span and must be quantum
    /// aligned and non-wrapping.
    unsafe fn insert_span(&self, inner: &mut Inner, base: usize, len: usize, kind: TagKind) {
        debug_assert!(matches!(kind, TagKind::Span | TagKind::ImportedSpan));

        let mut span = inner.take_unused();
        let mut free = inner.take_unused();
        unsafe {
            *span.as_mut() = BoundaryTag {
                base,
                len,
                kind,
                ..BoundaryTag::empty()
            };
            *free.as_mut() = BoundaryTag {
                base,
                len,
                kind: TagKind::Free,
                ..BoundaryTag::empty()
            };

            let prev = inner.all_insertion_point(base);
            let next = match prev {
                Some(node) => node.as_ref().next(),
                None => inner.all_tags.first(),
            };
            inner
                .all_tags
                .insert_between(BoundaryTag::all_node(span), prev, next);
            inner
                .all_tags
                .insert_after(BoundaryTag::all_node(free), BoundaryTag::all_node(span));

            inner.spans.push_front(BoundaryTag::kind_node(span));
            inner.push_free(free);
        }
    }

    /// Pick a free tag for `len` under `policy` and unlink it from its
    /// freelist.
    fn choose(
        &self,
        inner: &mut Inner,
        len: usize,
        policy: AllocationPolicy,
    ) -> Option<NonNull<BoundaryTag>> {
        match policy {
            AllocationPolicy::InstantFit => self.choose_instant(inner, len),
            AllocationPolicy::FirstFit => {
                let index = freelist_index(len);
                let first = inner.freelists[index]
                    .iter()
                    .map(|node| unsafe { BoundaryTag::from_kind_node(node) })
                    .find(|tag| unsafe { tag.as_ref().len } >= len);
                match first {
                    Some(tag) => {
                        unsafe { inner.remove_free(tag) };
                        Some(tag)
                    }
                    None => self.choose_instant(inner, len),
                }
            }
            AllocationPolicy::BestFit => {
                let index = freelist_index(len);
                let mut best = tightest_fit(&inner.freelists[index], len, len);
                if best.is_none() {
                    // The request's own freelist cannot serve it; fall
                    // back to the guaranteed-fit list and take its
                    // tightest member, short-circuiting on the list's
                    // lower bound.
                    if let Some(index) = instant_fit_index(inner.freelist_bitmap, len) {
                        best = tightest_fit(
                            &inner.freelists[index],
                            len,
                            smallest_len_in_freelist(index),
                        );
                    }
                }
                let tag = best?;
                unsafe { inner.remove_free(tag) };
                Some(tag)
            }
        }
    }

    fn choose_instant(&self, inner: &mut Inner, len: usize) -> Option<NonNull<BoundaryTag>> {
        let index = instant_fit_index(inner.freelist_bitmap, len)?;
        let node = inner.freelists[index].first()?;
        let tag = unsafe { BoundaryTag::from_kind_node(node) };
        debug_assert!(unsafe { tag.as_ref().len } >= len);
        unsafe { inner.remove_free(tag) };
        Some(tag)
    }

    /// Grow from the source and retry the fit.
    ///
    /// Called with the arena mutex held; the import runs against the
    /// *parent* arena, which is strictly above this one in the import
    /// forest, so the lock order stays acyclic.
    fn import_and_retry(
        &self,
        inner: &mut Inner,
        len: usize,
        policy: AllocationPolicy,
    ) -> Result<NonNull<BoundaryTag>, AllocateError> {
        let Some(source) = &self.source else {
            return Err(AllocateError::RequestedLengthUnavailable);
        };

        let imported = (source.import)(source.arena, len).map_err(|error| match error {
            AllocateError::OutOfBoundaryTags => AllocateError::OutOfBoundaryTags,
            _ => AllocateError::RequestedLengthUnavailable,
        })?;
        debug_assert!(imported.len >= len);

        unsafe { self.insert_span(inner, imported.base, imported.len, TagKind::ImportedSpan) };

        // The fresh free tile may sit below the instant-fit threshold
        // (e.g. an exact-length import that is not a power of two), so
        // fall back to best fit, which searches the tile's own freelist.
        self.choose(inner, len, policy)
            .or_else(|| self.choose(inner, len, AllocationPolicy::BestFit))
            .ok_or(AllocateError::RequestedLengthUnavailable)
    }

    fn deallocate_with(&self, base: usize, expected_len: Option<usize>) {
        let mut inner = self.lock_for_deallocate();
        self.check_invariants(&inner);

        let Some(mut tag) = inner.find_allocated(base) else {
            panic!(
                "deallocate of unknown base {base:#x} in arena {:?}",
                self.name
            );
        };
        if let Some(expected) = expected_len {
            let actual = unsafe { tag.as_ref().len };
            assert_eq!(
                actual, expected,
                "deallocate length mismatch at {base:#x} in arena {:?}",
                self.name
            );
        }

        unsafe {
            let bucket = allocation_bucket(base);
            inner.allocation_table[bucket].remove(BoundaryTag::kind_node(tag));
            tag.as_mut().kind = TagKind::Free;
        }

        // Coalesce with the next tag, then the previous one. Span tags
        // head their spans in the all chain, so a merge can never cross a
        // span boundary.
        unsafe {
            if let Some(node) = BoundaryTag::all_node(tag).as_ref().next() {
                let next = BoundaryTag::from_all_node(node);
                if next.as_ref().kind == TagKind::Free {
                    let next_len = next.as_ref().len;
                    inner.remove_free(next);
                    inner.all_tags.remove(BoundaryTag::all_node(next));
                    tag.as_mut().len += next_len;
                    inner.push_unused(next);
                }
            }
            if let Some(node) = BoundaryTag::all_node(tag).as_ref().prev() {
                let prev = BoundaryTag::from_all_node(node);
                if prev.as_ref().kind == TagKind::Free {
                    let (prev_base, prev_len) = {
                        let prev = prev.as_ref();
                        (prev.base, prev.len)
                    };
                    inner.remove_free(prev);
                    inner.all_tags.remove(BoundaryTag::all_node(prev));
                    tag.as_mut().base = prev_base;
                    tag.as_mut().len += prev_len;
                    inner.push_unused(prev);
                }
            }
        }

        // If the free run now covers an entire imported span, retire the
        // span and give it back to the source, after dropping the mutex.
        let (freed_base, freed_len) = unsafe {
            let freed = tag.as_ref();
            (freed.base, freed.len)
        };
        let mut release = None;
        unsafe {
            if let Some(node) = BoundaryTag::all_node(tag).as_ref().prev() {
                let span = BoundaryTag::from_all_node(node);
                let (span_kind, span_base, span_len) = {
                    let span = span.as_ref();
                    (span.kind, span.base, span.len)
                };
                if span_kind == TagKind::ImportedSpan
                    && span_base == freed_base
                    && span_len == freed_len
                {
                    inner.spans.remove(BoundaryTag::kind_node(span));
                    inner.all_tags.remove(BoundaryTag::all_node(span));
                    inner.all_tags.remove(BoundaryTag::all_node(tag));
                    inner.push_unused(span);
                    inner.push_unused(tag);
                    release = Some(Allocation {
                        base: freed_base,
                        len: freed_len,
                    });
                }
            }
        }
        if release.is_none() {
            unsafe { inner.push_free(tag) };
        }

        self.check_invariants(&inner);
        drop(inner);

        if let Some(allocation) = release {
            let source = self
                .source
                .as_ref()
                .expect("imported span without a source");
            (source.release)(source.arena, allocation);
        }
    }

    /// Debug-build structural audit, run on entry and exit of every
    /// public operation: tiling, coalescing, freelist/bitmap membership
    /// and length conservation.
    #[cfg(debug_assertions)]
    fn check_invariants(&self, inner: &Inner) {
        let mut cursor = 0usize;
        let mut span_end = 0usize;
        let mut in_span = false;
        let mut previous_free = false;
        let mut free_total = 0usize;
        let mut allocated_total = 0usize;
        let mut span_total = 0usize;

        for node in inner.all_tags.iter() {
            let tag = unsafe { BoundaryTag::from_all_node(node).as_ref() };
            match tag.kind {
                TagKind::Span | TagKind::ImportedSpan => {
                    assert_eq!(cursor, span_end, "previous span is not fully tiled");
                    assert!(
                        !in_span || tag.base >= span_end,
                        "spans overlap in the all chain"
                    );
                    span_total += tag.len;
                    cursor = tag.base;
                    span_end = tag.base + tag.len;
                    in_span = true;
                    previous_free = false;
                }
                TagKind::Free | TagKind::Allocated => {
                    assert!(in_span, "tile tag outside any span");
                    assert_eq!(tag.base, cursor, "gap or overlap in span tiling");
                    cursor += tag.len;
                    assert!(cursor <= span_end, "tile overruns its span");
                    if tag.kind == TagKind::Free {
                        assert!(!previous_free, "adjacent free tags were not coalesced");
                        free_total += tag.len;
                        let index = freelist_index(tag.len);
                        assert!(
                            inner.freelist_bitmap & (1 << index) != 0,
                            "free tag in a freelist with a clear bitmap bit"
                        );
                        previous_free = true;
                    } else {
                        allocated_total += tag.len;
                        previous_free = false;
                    }
                }
            }
        }
        assert_eq!(cursor, span_end, "final span is not fully tiled");
        assert_eq!(
            free_total + allocated_total,
            span_total,
            "span length is not conserved"
        );

        for (index, freelist) in inner.freelists.iter().enumerate() {
            assert_eq!(
                inner.freelist_bitmap & (1 << index) != 0,
                !freelist.is_empty(),
                "freelist bitmap out of sync at index {index}"
            );
            for node in freelist.iter() {
                let tag = unsafe { BoundaryTag::from_kind_node(node).as_ref() };
                assert_eq!(tag.kind, TagKind::Free);
                assert_eq!(freelist_index(tag.len), index, "tag in wrong freelist");
            }
        }

        for bucket in &inner.allocation_table {
            for node in bucket.iter() {
                let tag = unsafe { BoundaryTag::from_kind_node(node).as_ref() };
                assert_eq!(tag.kind, TagKind::Allocated);
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self, _inner: &Inner) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freelist_index_is_floor_log2() {
        assert_eq!(freelist_index(1), 0);
        assert_eq!(freelist_index(2), 1);
        assert_eq!(freelist_index(3), 1);
        assert_eq!(freelist_index(0x1000), 12);
        assert_eq!(freelist_index(0x1001), 12);
        assert_eq!(freelist_index(usize::MAX), usize::BITS as usize - 1);
        assert_eq!(smallest_len_in_freelist(12), 0x1000);
    }

    #[test]
    fn instant_fit_skips_lists_that_cannot_guarantee_the_length() {
        // A single free tag of 0x1800 lives in freelist 12 but cannot be
        // *guaranteed* to satisfy 0x1800; only list 13+ can.
        let bitmap = 1 << 12;
        assert_eq!(instant_fit_index(bitmap, 0x1000), Some(12));
        assert_eq!(instant_fit_index(bitmap, 0x1800), None);
        assert_eq!(instant_fit_index(bitmap | 1 << 14, 0x1800), Some(14));
        assert_eq!(instant_fit_index(0, 1), None);
    }

    #[test]
    fn allocation_buckets_spread_and_stay_in_range() {
        let mut seen = [false; ALLOCATION_TABLE_BUCKETS];
        for base in (0..0x100_000usize).step_by(0x1000) {
            seen[allocation_bucket(base)] = true;
        }
        let used = seen.iter().filter(|&&b| b).count();
        assert!(used > ALLOCATION_TABLE_BUCKETS / 2, "hash clumps: {used}");
        // Deterministic for a given base.
        assert_eq!(allocation_bucket(0x1234), allocation_bucket(0x1234));
    }
}

/// Scan one freelist for the tightest tag of at least `len`,
/// short-circuiting when a tag of exactly `short_circuit` turns up.
fn tightest_fit(
    freelist: &DoublyLinkedList,
    len: usize,
    short_circuit: usize,
) -> Option<NonNull<BoundaryTag>> {
    let mut best: Option<(NonNull<BoundaryTag>, usize)> = None;
    for node in freelist.iter() {
        let tag = unsafe { BoundaryTag::from_kind_node(node) };
        let tag_len = unsafe { tag.as_ref().len };
        if tag_len < len {
            continue;
        }
        if tag_len == short_circuit {
            return Some(tag);
        }
        if best.is_none_or(|(_, best_len)| tag_len < best_len) {
            best = Some((tag, tag_len));
        }
    }
    best.map(|(tag, _)| tag)
}
