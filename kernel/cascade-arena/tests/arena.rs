//! Hosted arena exercises. The shared tag pool is backed by a leaked,
//! identity-mapped page allocator, so boundary-tag pages are ordinary heap
//! memory.

use cascade_addresses::{DirectMap, PhysicalAddress, PhysicalRange};
use cascade_arena::{AddSpanError, AllocateError, Allocation, AllocationPolicy, Arena, Source, TagKind};
use cascade_pmm::PhysicalPageAllocator;
use std::sync::OnceLock;

#[repr(align(4096))]
struct Frame([u8; 4096]);

fn init_tag_pool() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let frames: Vec<Frame> = (0..64).map(|_| Frame([0; 4096])).collect();
        let slice = Box::leak(frames.into_boxed_slice());
        let range = PhysicalRange::new(PhysicalAddress::from_ptr(slice.as_ptr()), 64 * 4096);

        let pmm = Box::leak(Box::new(PhysicalPageAllocator::new(DirectMap::identity())));
        unsafe { pmm.add_range(range).unwrap() };
        cascade_arena::init_tag_pool(pmm);
    });
}

fn tags_of(arena: &Arena) -> Vec<(usize, usize, TagKind)> {
    let mut tags = Vec::new();
    arena.for_each_tag(|tag| tags.push((tag.base, tag.len, tag.kind)));
    tags
}

/// The walkthrough from the design notes: quantum 0x10, one 4 KiB span,
/// an instant-fit and a best-fit allocation, then full coalescing on free.
#[test]
fn basic_allocate_and_coalesce() {
    init_tag_pool();
    let arena = Arena::new("basic", 0x10, None);
    arena.add_span(0x1000, 0x1000).unwrap();

    let a1 = arena.allocate(0x100, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(a1, Allocation { base: 0x1000, len: 0x100 });

    let a2 = arena.allocate(0x50, AllocationPolicy::BestFit).unwrap();
    assert_eq!(a2, Allocation { base: 0x1100, len: 0x50 });

    assert_eq!(
        tags_of(&arena),
        vec![
            (0x1000, 0x1000, TagKind::Span),
            (0x1000, 0x100, TagKind::Allocated),
            (0x1100, 0x50, TagKind::Allocated),
            (0x1150, 0xEB0, TagKind::Free),
        ]
    );

    arena.deallocate(a1);
    arena.deallocate(a2);
    assert_eq!(
        tags_of(&arena),
        vec![
            (0x1000, 0x1000, TagKind::Span),
            (0x1000, 0x1000, TagKind::Free),
        ]
    );
}

/// Freeing never merges across a span boundary, and a request larger than
/// any single span fails even when the total free space would cover it.
#[test]
fn no_coalescing_across_spans() {
    init_tag_pool();
    let arena = Arena::new("two_spans", 0x10, None);
    arena.add_span(0x0, 0x1000).unwrap();
    arena.add_span(0x2000, 0x1000).unwrap();

    let a = arena.allocate(0x1000, AllocationPolicy::FirstFit).unwrap();
    assert!(a.base == 0x0 || a.base == 0x2000);
    arena.deallocate(a);

    // Both spans are whole again, each tiled by exactly one free tag.
    assert_eq!(
        tags_of(&arena),
        vec![
            (0x0, 0x1000, TagKind::Span),
            (0x0, 0x1000, TagKind::Free),
            (0x2000, 0x1000, TagKind::Span),
            (0x2000, 0x1000, TagKind::Free),
        ]
    );

    assert_eq!(
        arena.allocate(0x1800, AllocationPolicy::InstantFit),
        Err(AllocateError::RequestedLengthUnavailable)
    );
}

static IMPORT_PARENT: Arena = Arena::new("import_parent", 0x1000, None);
static IMPORT_CHILD: Arena = Arena::new("import_child", 0x1000, Some(Source::new(&IMPORT_PARENT)));

/// A child allocation forces an import from the parent; freeing it
/// coalesces the imported span and releases it back.
#[test]
fn source_import_and_release() {
    init_tag_pool();
    IMPORT_PARENT.add_span(0x10_000, 0xF0_000).unwrap();

    let a = IMPORT_CHILD
        .allocate(0x4000, AllocationPolicy::InstantFit)
        .unwrap();
    assert_eq!(a.len, 0x4000);

    // The parent now carries one allocated tag for the imported span.
    let parent_allocs: Vec<_> = tags_of(&IMPORT_PARENT)
        .into_iter()
        .filter(|(_, _, kind)| *kind == TagKind::Allocated)
        .collect();
    assert_eq!(parent_allocs, vec![(a.base, 0x4000, TagKind::Allocated)]);

    // The child tiles its imported span with the allocation.
    assert_eq!(
        tags_of(&IMPORT_CHILD),
        vec![
            (a.base, 0x4000, TagKind::ImportedSpan),
            (a.base, 0x4000, TagKind::Allocated),
        ]
    );

    IMPORT_CHILD.deallocate(a);

    // The release emptied the child and freed the parent's range.
    assert!(tags_of(&IMPORT_CHILD).is_empty());
    assert_eq!(
        tags_of(&IMPORT_PARENT),
        vec![
            (0x10_000, 0xF0_000, TagKind::Span),
            (0x10_000, 0xF0_000, TagKind::Free),
        ]
    );
}

#[test]
fn add_span_validation() {
    init_tag_pool();
    let arena = Arena::new("validation", 0x100, None);

    assert_eq!(arena.add_span(0x1000, 0), Err(AddSpanError::ZeroLength));
    assert_eq!(
        arena.add_span(usize::MAX - 0xFF, 0x200),
        Err(AddSpanError::WouldWrap)
    );
    assert_eq!(arena.add_span(0x1080, 0x1000), Err(AddSpanError::Unaligned));
    assert_eq!(arena.add_span(0x1000, 0x180), Err(AddSpanError::Unaligned));

    arena.add_span(0x1000, 0x1000).unwrap();
    assert_eq!(arena.add_span(0x1800, 0x1000), Err(AddSpanError::Overlap));
    assert_eq!(arena.add_span(0x800, 0x900), Err(AddSpanError::Overlap));

    // A span adjacent to an existing one is fine.
    arena.add_span(0x2000, 0x1000).unwrap();
}

#[test]
fn allocation_is_rounded_to_quantum() {
    init_tag_pool();
    let arena = Arena::new("rounding", 0x100, None);
    arena.add_span(0x10_000, 0x10_000).unwrap();

    assert_eq!(
        arena.allocate(0, AllocationPolicy::InstantFit),
        Err(AllocateError::ZeroLength)
    );

    let a = arena.allocate(0x42, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(a.len, 0x100);
    arena.deallocate(a);
}

#[test]
fn best_fit_prefers_exact_and_tight_tags() {
    init_tag_pool();
    let arena = Arena::new("best_fit", 0x10, None);
    arena.add_span(0x0, 0x10_000).unwrap();

    // Carve the span into free runs of 0x300, 0x200 and a large tail by
    // allocating separators and freeing the middle pieces.
    let hole_a = arena.allocate(0x300, AllocationPolicy::InstantFit).unwrap();
    let sep_a = arena.allocate(0x10, AllocationPolicy::InstantFit).unwrap();
    let hole_b = arena.allocate(0x200, AllocationPolicy::InstantFit).unwrap();
    let sep_b = arena.allocate(0x10, AllocationPolicy::InstantFit).unwrap();
    arena.deallocate(hole_a);
    arena.deallocate(hole_b);

    // Both holes live in freelist[9] (0x200..0x400); best fit must take
    // the exact 0x200 hole, not the first-found 0x300 one.
    let exact = arena.allocate(0x200, AllocationPolicy::BestFit).unwrap();
    assert_eq!(exact, Allocation { base: hole_b.base, len: 0x200 });

    // With only the 0x300 hole and the tail left, best fit for 0x280
    // takes the tighter 0x300 hole.
    let tight = arena.allocate(0x280, AllocationPolicy::BestFit).unwrap();
    assert_eq!(tight.base, hole_a.base);

    arena.deallocate(exact);
    arena.deallocate(tight);
    arena.deallocate(sep_a);
    arena.deallocate(sep_b);
}

#[test]
fn deallocate_base_looks_up_the_allocation_table() {
    init_tag_pool();
    let arena = Arena::new("by_base", 0x10, None);
    arena.add_span(0x5000, 0x1000).unwrap();

    let a = arena.allocate(0x80, AllocationPolicy::InstantFit).unwrap();
    let b = arena.allocate(0x80, AllocationPolicy::InstantFit).unwrap();
    arena.deallocate_base(a.base);
    arena.deallocate_base(b.base);

    assert_eq!(
        tags_of(&arena),
        vec![
            (0x5000, 0x1000, TagKind::Span),
            (0x5000, 0x1000, TagKind::Free),
        ]
    );
}

#[test]
#[should_panic(expected = "deallocate of unknown base")]
fn deallocating_an_unknown_base_panics() {
    init_tag_pool();
    let arena = Arena::new("unknown_base", 0x10, None);
    arena.add_span(0x1000, 0x1000).unwrap();
    arena.deallocate_base(0x1010);
}

#[test]
#[should_panic(expected = "length mismatch")]
fn deallocating_with_a_wrong_length_panics() {
    init_tag_pool();
    let arena = Arena::new("wrong_len", 0x10, None);
    arena.add_span(0x1000, 0x1000).unwrap();
    let a = arena.allocate(0x100, AllocationPolicy::InstantFit).unwrap();
    arena.deallocate(Allocation { base: a.base, len: 0x200 });
}

#[test]
fn exhaustion_reports_unavailable_without_a_source() {
    init_tag_pool();
    let arena = Arena::new("exhaustion", 0x10, None);
    arena.add_span(0x0, 0x100).unwrap();

    let a = arena.allocate(0x100, AllocationPolicy::InstantFit).unwrap();
    assert_eq!(
        arena.allocate(0x10, AllocationPolicy::InstantFit),
        Err(AllocateError::RequestedLengthUnavailable)
    );
    arena.deallocate(a);
}

#[test]
fn destroy_empties_the_arena() {
    init_tag_pool();

    let mut arena = Arena::new("destroyable", 0x10, None);
    arena.add_span(0x1000, 0x1000).unwrap();
    let a = arena.allocate(0x100, AllocationPolicy::FirstFit).unwrap();
    arena.deallocate(a);
    arena.destroy();
    assert!(tags_of(&arena).is_empty());
}

/// Concurrent allocate/free churn on one arena: the per-operation
/// invariant audit runs under the mutex, and every byte must come back.
#[test]
fn parallel_churn_preserves_invariants() {
    init_tag_pool();

    static CHURN: Arena = Arena::new("churn", 0x10, None);
    CHURN.add_span(0x100_000, 0x100_000).unwrap();

    std::thread::scope(|scope| {
        for worker in 0..4 {
            scope.spawn(move || {
                let mut held: Vec<Allocation> = Vec::new();
                for round in 0..2_000usize {
                    let len = 0x10 + (round % 7) * 0x30;
                    let policy = match (worker + round) % 3 {
                        0 => AllocationPolicy::InstantFit,
                        1 => AllocationPolicy::BestFit,
                        _ => AllocationPolicy::FirstFit,
                    };
                    if let Ok(a) = CHURN.allocate(len, policy) {
                        held.push(a);
                    }
                    if round % 3 == 0 {
                        if let Some(a) = held.pop() {
                            CHURN.deallocate(a);
                        }
                    }
                }
                for a in held {
                    CHURN.deallocate(a);
                }
            });
        }
    });

    assert_eq!(
        tags_of(&CHURN),
        vec![
            (0x100_000, 0x100_000, TagKind::Span),
            (0x100_000, 0x100_000, TagKind::Free),
        ]
    );
}
