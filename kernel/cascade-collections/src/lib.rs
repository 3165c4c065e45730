//! # Allocation-free containers
//!
//! Intrusive linked lists whose nodes are embedded in the payload they
//! describe, plus a bounded inline string. The allocators are built on
//! these, so none of them may allocate themselves:
//!
//! - [`SinglyLinkedList`]: LIFO free list (page frames, unused boundary
//!   tags).
//! - [`AtomicStack`]: lock-free LIFO for the global unused-tag pool.
//! - [`DoublyLinkedList`]: ordered tag chains, freelists and hash
//!   buckets.
//! - [`Name`]: fixed-capacity, inline UTF-8 string for subsystem names.
//!
//! Because nodes live inside their payloads, a linked node must never be
//! moved; all list operations take `NonNull` handles and leave ownership
//! questions to the caller.

#![cfg_attr(target_os = "none", no_std)]
#![allow(unsafe_code)]

mod atomic_stack;
mod double;
mod name;
mod single;

pub use atomic_stack::AtomicStack;
pub use double::{DoubleIter, DoubleNode, DoublyLinkedList};
pub use name::Name;
pub use single::{SingleNode, SinglyLinkedList};
