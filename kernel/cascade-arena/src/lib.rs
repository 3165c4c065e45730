//! # Resource arenas
//!
//! A general-purpose range allocator in the tradition of Bonwick's vmem:
//! an arena manages a sparse one-dimensional space of `usize` values,
//! virtual addresses, interrupt vectors, port numbers, any
//! integer-identified resource, in multiples of a power-of-two *quantum*.
//!
//! Contiguous runs are described by **boundary tags**. Every tag sits in
//! the arena-wide, base-ordered `all` chain and, depending on its kind, in
//! exactly one of: the span list, a power-of-two freelist, or a bucket of
//! the allocation hash table. The freelist bitmap makes *instant fit*
//! allocation a mask-and-count-trailing-zeros away; *best fit* and *first
//! fit* trade a linear scan for tighter packing.
//!
//! Arenas compose: an arena with a [`Source`] lazily imports spans from a
//! parent arena when it runs dry and releases them once an imported span
//! has coalesced back into a single free run. Stacking arenas this way
//! expresses hierarchies like *kernel address space → heap → typed
//! caches*, with pressure escalating upward only on demand.
//!
//! Tags themselves are supplied by a kernel-wide [`tag pool`](init_tag_pool)
//! that carves pages from the physical allocator through the direct map;
//! replenishment is the only path on which an arena operation can touch
//! another subsystem.
//!
//! The per-CPU magazine layer from Bonwick's follow-up paper is not
//! implemented; [`Arena::allocate`] / [`Arena::deallocate`] are the seam
//! where magazines would slot in.

#![cfg_attr(target_os = "none", no_std)]
#![allow(unsafe_code)]

mod arena;
mod tag;
mod tag_pool;

pub use arena::{
    AddSpanError, AllocateError, Allocation, AllocationPolicy, Arena, Source, TagSnapshot,
};
pub use tag::TagKind;
pub use tag_pool::init_tag_pool;

/// Tags consumed by creating a span (the span tag plus its free tile).
pub const TAGS_PER_SPAN_CREATE: usize = 2;

/// Tags consumed by an allocation that splits a free tag.
pub const TAGS_PER_PARTIAL_ALLOCATION: usize = 1;

/// Minimum unused tags an arena must hold before any mutating operation:
/// one span creation (a source import) plus one partial allocation.
pub const MAX_TAGS_PER_OPERATION: usize = TAGS_PER_SPAN_CREATE + TAGS_PER_PARTIAL_ALLOCATION;
