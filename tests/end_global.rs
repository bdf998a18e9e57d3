//! Ending the whole program. The global flag is terminal for this process,
//! so this file holds a single test.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use for_ages::{Interrupted, Mutex, Timer, WaitCondition};

#[test]
fn end_interrupts_a_timed_wait_at_the_end_instant() {
    let mutex = Arc::new(Mutex::new(()));
    let cond = WaitCondition::new();

    let (started_tx, started_rx) = mpsc::channel();
    let waiter = {
        let mutex = Arc::clone(&mutex);
        let cond = cond.clone();
        for_ages::spawn(move || {
            let guard = mutex.lock()?;
            started_tx.send(()).unwrap();
            let timer = Timer::start();
            let result = cond.wait_timeout(guard, Duration::from_secs(5));
            Ok((result.err(), timer.elapsed()))
        })
    };
    started_rx.recv().unwrap();

    // End the program roughly one second into the five-second wait.
    thread::sleep(Duration::from_millis(1_000));
    assert!(for_ages::end());
    assert!(!for_ages::end());

    let (err, waited) = waiter.join().unwrap().unwrap();
    assert_eq!(err, Some(Interrupted));
    // Interrupted at the end call, not at the timeout.
    assert!(waited >= Duration::from_millis(800));
    assert!(waited < Duration::from_secs(4));

    // The lock came back consistent: it is free again.
    assert!(mutex.try_lock().is_some());

    // The end is global: a freshly registered thread is interrupted at its
    // first checkpoint, and a new wait fails before sleeping.
    let late = for_ages::spawn(move || {
        for_ages::checkpoint()?;
        Ok(())
    });
    assert_eq!(late.join().unwrap(), Err(Interrupted));

    let timer = Timer::start();
    let sleeper = for_ages::spawn(move || {
        for_ages::sleep(Duration::from_secs(30))?;
        Ok(())
    });
    assert_eq!(sleeper.join().unwrap(), Err(Interrupted));
    assert!(timer.elapsed() < Duration::from_secs(3));

    // Unregistered threads are untouched: ordinary waiting still works.
    assert!(mutex.lock().is_ok());
    assert!(!cond.wait_for(Duration::from_millis(50)).unwrap());
}
