//! Semaphore acquisition under contention, including the timed-acquire
//! windows around another thread's hold.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use for_ages::{Semaphore, Timer};

#[test]
fn timed_acquire_windows_around_a_hold() {
    let sem = Semaphore::new(1);
    let (ready_tx, ready_rx) = mpsc::channel();

    let holder = {
        let sem = sem.clone();
        thread::spawn(move || {
            sem.acquire(1).unwrap();
            ready_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(800));
            sem.release(1);
        })
    };
    ready_rx.recv().unwrap();
    let hold_started = Timer::start();

    // A budget inside the hold window fails on schedule.
    let timer = Timer::start();
    assert!(!sem.try_acquire_for(1, Duration::from_millis(300)).unwrap());
    assert!(timer.elapsed() >= Duration::from_millis(300));
    assert!(hold_started.elapsed() < Duration::from_millis(800));

    // A budget past the release succeeds shortly after it.
    assert!(sem.try_acquire_for(1, Duration::from_secs(10)).unwrap());
    let elapsed = hold_started.elapsed();
    assert!(elapsed >= Duration::from_millis(700));
    assert!(elapsed < Duration::from_secs(5));

    sem.release(1);
    holder.join().unwrap();
}

#[test]
fn blocking_acquire_waits_for_permits() {
    let sem = Semaphore::new(0);
    let releaser = {
        let sem = sem.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(400));
            sem.release(2);
        })
    };

    let timer = Timer::start();
    sem.acquire(2).unwrap();
    assert!(timer.elapsed() >= Duration::from_millis(300));
    assert_eq!(sem.available(), 0);
    sem.release(2);
    releaser.join().unwrap();
}

#[test]
fn release_from_another_handle_unblocks() {
    let sem = Arc::new(Semaphore::new(0));
    let waiter = {
        let sem = Arc::clone(&sem);
        thread::spawn(move || sem.try_acquire_for(1, Duration::from_secs(10)).unwrap())
    };
    thread::sleep(Duration::from_millis(300));
    sem.release(1);
    assert!(waiter.join().unwrap());
}
