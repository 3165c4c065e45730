use cascade_sync::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn lock_and_raii() {
    let mutex = Mutex::new(String::from("a"));
    mutex.lock().push('b');
    assert_eq!(mutex.lock().as_str(), "ab");
}

#[test]
fn try_lock_fails_while_held() {
    let mutex = Mutex::new(0u32);
    let guard = mutex.lock();

    let mutex_ref = &mutex;
    thread::scope(|s| {
        s.spawn(|| {
            assert!(mutex_ref.try_lock().is_none());
        });
    });

    drop(guard);
    assert!(mutex.try_lock().is_some());
}

#[test]
fn interrupts_stay_enabled_under_mutex() {
    let mutex = Mutex::new(());
    let _guard = mutex.lock();
    assert!(cascade_arch::interrupts_enabled());
}

#[test]
fn contended_counting() {
    const THREADS: usize = 8;
    const ITERS: usize = 5_000;

    let mutex = Arc::new(Mutex::new(0usize));
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..ITERS {
                    *mutex.lock() += 1;
                    thread::yield_now();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*mutex.lock(), THREADS * ITERS);
}
