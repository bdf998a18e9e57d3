//! Logical wake semantics: `wake_one` lets exactly one registered waiter
//! through, `wake_all` releases the rest, and waiting hands the lock over.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use for_ages::{Mutex, Timer, WaitCondition};

#[test]
fn wake_one_wakes_exactly_one_registered_waiter() {
    let mutex = Arc::new(Mutex::new(()));
    let cond = WaitCondition::new();
    let woken = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let mutex = Arc::clone(&mutex);
            let cond = cond.clone();
            let woken = Arc::clone(&woken);
            for_ages::spawn(move || {
                let guard = mutex.lock()?;
                let guard = cond.wait(guard)?;
                drop(guard);
                woken.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .collect();

    // Let all three get past the unregistered fast path of their wait.
    thread::sleep(Duration::from_millis(600));
    assert_eq!(woken.load(Ordering::SeqCst), 0);

    // Waking under the lock pins every waiter inside its native wait.
    {
        let _guard = mutex.lock().unwrap();
        cond.wake_one();
    }
    thread::sleep(Duration::from_millis(400));
    assert_eq!(woken.load(Ordering::SeqCst), 1);

    {
        let _guard = mutex.lock().unwrap();
        cond.wake_all();
    }
    for waiter in waiters {
        waiter.join().unwrap().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 3);
}

#[test]
fn waiting_releases_the_lock_for_others() {
    let mutex = Arc::new(Mutex::new(0));
    let cond = WaitCondition::new();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        let cond = cond.clone();
        for_ages::spawn(move || {
            let guard = mutex.lock()?;
            let guard = cond.wait(guard)?;
            Ok(*guard)
        })
    };

    // The waiter is asleep holding nothing; the lock must be takeable.
    thread::sleep(Duration::from_millis(400));
    {
        let mut guard = mutex.lock().unwrap();
        *guard = 17;
        cond.wake_all();
    }
    assert_eq!(waiter.join().unwrap().unwrap(), 17);
}

#[test]
fn timed_wait_woken_early_reports_true() {
    let mutex = Arc::new(Mutex::new(()));
    let cond = WaitCondition::new();

    let waiter = {
        let mutex = Arc::clone(&mutex);
        let cond = cond.clone();
        for_ages::spawn(move || {
            let guard = mutex.lock()?;
            let timer = Timer::start();
            let (_guard, woken) = cond.wait_timeout(guard, Duration::from_secs(10))?;
            Ok((woken, timer.elapsed()))
        })
    };

    thread::sleep(Duration::from_millis(500));
    {
        let _guard = mutex.lock().unwrap();
        cond.wake_all();
    }
    let (woken, elapsed) = waiter.join().unwrap().unwrap();
    assert!(woken);
    assert!(elapsed < Duration::from_secs(5));
}

#[test]
fn wake_with_nobody_waiting_is_harmless() {
    let cond = WaitCondition::new();
    cond.wake_one();
    cond.wake_all();
    // A later wait is not satisfied by the stale wakes.
    let timer = Timer::start();
    assert!(!cond.wait_for(Duration::from_millis(250)).unwrap());
    assert!(timer.elapsed() >= Duration::from_millis(250));
}

#[test]
fn rwlock_guards_wait_too() {
    let lock = Arc::new(for_ages::RwLock::new(3));
    let cond = WaitCondition::new();

    let waiter = {
        let lock = Arc::clone(&lock);
        let cond = cond.clone();
        for_ages::spawn(move || {
            let guard = lock.read()?;
            let guard = cond.wait(guard)?;
            Ok(*guard)
        })
    };

    thread::sleep(Duration::from_millis(400));
    // Readers released for the wait: a writer can get in.
    {
        let mut guard = lock.write().unwrap();
        *guard = 4;
        cond.wake_all();
    }
    assert_eq!(waiter.join().unwrap().unwrap(), 4);
}
