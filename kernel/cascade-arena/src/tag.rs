//! Boundary tags.

use cascade_arch::STANDARD_PAGE_SIZE;
use cascade_collections::{DoubleNode, SingleNode};
use core::mem::offset_of;
use core::ptr::NonNull;

/// What a boundary tag describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TagKind {
    /// A contiguous range added directly with `add_span`.
    Span,
    /// A span imported from the arena's source.
    ImportedSpan,
    /// A free run, linked into a power-of-two freelist.
    Free,
    /// An allocated run, linked into the allocation hash table.
    Allocated,
}

/// Metadata record for one contiguous run of an arena's space.
///
/// Tags are carved in page-sized batches and live forever; an unused tag
/// is threaded through `unused_node` (which sits at offset 0 so the tag
/// doubles as a plain stack node). A live tag is always on the
/// base-ordered `all_node` chain and on exactly one kind-specific list
/// through `kind_node`.
#[repr(C)]
pub(crate) struct BoundaryTag {
    pub(crate) unused_node: SingleNode,
    pub(crate) all_node: DoubleNode,
    pub(crate) kind_node: DoubleNode,
    pub(crate) base: usize,
    pub(crate) len: usize,
    pub(crate) kind: TagKind,
}

/// Boundary tags carved out of one physical page.
pub(crate) const TAGS_PER_PAGE: usize = STANDARD_PAGE_SIZE / size_of::<BoundaryTag>();

const _: () = assert!(TAGS_PER_PAGE > crate::MAX_TAGS_PER_OPERATION);

impl BoundaryTag {
    pub(crate) const fn empty() -> Self {
        Self {
            unused_node: SingleNode::new(),
            all_node: DoubleNode::new(),
            kind_node: DoubleNode::new(),
            base: 0,
            len: 0,
            kind: TagKind::Free,
        }
    }

    #[inline]
    pub(crate) fn unused_node(tag: NonNull<BoundaryTag>) -> NonNull<SingleNode> {
        // unused_node is the first field
        tag.cast()
    }

    #[inline]
    pub(crate) fn all_node(mut tag: NonNull<BoundaryTag>) -> NonNull<DoubleNode> {
        NonNull::from(unsafe { &mut tag.as_mut().all_node })
    }

    #[inline]
    pub(crate) fn kind_node(mut tag: NonNull<BoundaryTag>) -> NonNull<DoubleNode> {
        NonNull::from(unsafe { &mut tag.as_mut().kind_node })
    }

    /// Recover a tag from its `unused_node`.
    ///
    /// # Safety
    /// `node` must be the `unused_node` of a live [`BoundaryTag`].
    #[inline]
    pub(crate) unsafe fn from_unused_node(node: NonNull<SingleNode>) -> NonNull<BoundaryTag> {
        node.cast()
    }

    /// Recover a tag from its `all_node`.
    ///
    /// # Safety
    /// `node` must be the `all_node` of a live [`BoundaryTag`].
    #[inline]
    pub(crate) unsafe fn from_all_node(node: NonNull<DoubleNode>) -> NonNull<BoundaryTag> {
        unsafe {
            NonNull::new_unchecked(
                node.as_ptr()
                    .cast::<u8>()
                    .sub(offset_of!(BoundaryTag, all_node))
                    .cast::<BoundaryTag>(),
            )
        }
    }

    /// Recover a tag from its `kind_node`.
    ///
    /// # Safety
    /// `node` must be the `kind_node` of a live [`BoundaryTag`].
    #[inline]
    pub(crate) unsafe fn from_kind_node(node: NonNull<DoubleNode>) -> NonNull<BoundaryTag> {
        unsafe {
            NonNull::new_unchecked(
                node.as_ptr()
                    .cast::<u8>()
                    .sub(offset_of!(BoundaryTag, kind_node))
                    .cast::<BoundaryTag>(),
            )
        }
    }
}
