//! Simulated SMP bring-up rendezvous: one bootstrap participant and three
//! peers, mirroring the stage-3 barrier.

use cascade_sync::Rendezvous;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

#[test]
fn bootstrap_announces_once_and_only_after_all_peers() {
    const EXECUTORS: usize = 4;

    let rendezvous = Arc::new(Rendezvous::new());
    let announcements = Arc::new(AtomicUsize::new(0));
    let peers_past_barrier = Arc::new(AtomicUsize::new(0));
    let announced = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();

    // Non-bootstrap executors: signal ready, then wait for the bootstrap's
    // own signal before proceeding.
    for _ in 1..EXECUTORS {
        let rendezvous = Arc::clone(&rendezvous);
        let announced = Arc::clone(&announced);
        let peers_past_barrier = Arc::clone(&peers_past_barrier);
        handles.push(thread::spawn(move || {
            rendezvous.signal();
            rendezvous.wait_for(EXECUTORS);
            assert!(
                announced.load(Ordering::SeqCst),
                "peer passed the barrier before the announcement"
            );
            peers_past_barrier.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Bootstrap executor: wait for every peer, announce, signal.
    {
        let rendezvous = Arc::clone(&rendezvous);
        let announcements = Arc::clone(&announcements);
        let announced = Arc::clone(&announced);
        handles.push(thread::spawn(move || {
            rendezvous.wait_for(EXECUTORS - 1);
            announcements.fetch_add(1, Ordering::SeqCst);
            announced.store(true, Ordering::SeqCst);
            rendezvous.signal();
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(announcements.load(Ordering::SeqCst), 1);
    assert_eq!(peers_past_barrier.load(Ordering::SeqCst), EXECUTORS - 1);
    assert_eq!(rendezvous.count(), EXECUTORS);
}
