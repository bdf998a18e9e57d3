//! Contended mutex behavior for unregistered threads: plain waiting, timed
//! budgets, and the uncontended fast path.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use for_ages::{Mutex, Timer};

/// Hold `mutex` on another thread for `hold`, reporting once it is taken.
fn hold_elsewhere(mutex: &Arc<Mutex<i32>>, hold: Duration) -> thread::JoinHandle<()> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let mutex = Arc::clone(mutex);
    let holder = thread::spawn(move || {
        let mut guard = mutex.lock().unwrap();
        ready_tx.send(()).unwrap();
        thread::sleep(hold);
        *guard += 1;
    });
    ready_rx.recv().unwrap();
    holder
}

#[test]
fn lock_waits_for_the_holder() {
    let mutex = Arc::new(Mutex::new(0));
    let holder = hold_elsewhere(&mutex, Duration::from_millis(400));

    let timer = Timer::start();
    let guard = mutex.lock().unwrap();
    assert!(timer.elapsed() >= Duration::from_millis(300));
    assert_eq!(*guard, 1);
    drop(guard);
    holder.join().unwrap();
}

#[test]
fn timed_lock_times_out_within_budget() {
    let mutex = Arc::new(Mutex::new(0));
    let holder = hold_elsewhere(&mutex, Duration::from_millis(900));

    let timer = Timer::start();
    assert!(mutex.try_lock_for(Duration::from_millis(300)).unwrap().is_none());
    let elapsed = timer.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(900));

    // With a budget past the holder's release the lock is acquired.
    let timer = Timer::start();
    let guard = mutex.try_lock_for(Duration::from_secs(10)).unwrap();
    assert!(guard.is_some());
    assert!(timer.elapsed() < Duration::from_secs(10));
    drop(guard);
    holder.join().unwrap();
}

#[test]
fn short_timed_lock_stays_native() {
    let mutex = Arc::new(Mutex::new(0));
    let holder = hold_elsewhere(&mutex, Duration::from_millis(500));

    let timer = Timer::start();
    assert!(mutex.try_lock_for(Duration::from_millis(50)).unwrap().is_none());
    assert!(timer.elapsed() >= Duration::from_millis(50));
    holder.join().unwrap();
}

#[test]
fn many_lockers_all_get_through() {
    let mutex = Arc::new(Mutex::new(0u32));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                for _ in 0..100 {
                    *mutex.lock().unwrap() += 1;
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(*mutex.lock().unwrap(), 800);
}
