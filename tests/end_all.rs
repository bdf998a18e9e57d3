//! `end_all` frees a whole fleet at once: compute loops, lock waiters and
//! sleepers all terminate with `Interrupted`. Terminal for the process, so
//! this file holds a single test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use for_ages::{Interrupted, Mutex, Timer};

#[test]
fn end_all_terminates_every_worker() {
    let fleet = num_cpus::get().max(4).min(16);
    let ticks = Arc::new(AtomicU64::new(0));
    let shared = Arc::new(Mutex::new(0u64));
    let blocker = Arc::new(Mutex::new(()));
    let held = blocker.lock().unwrap();

    let mut workers = Vec::new();
    for seed in 0..fleet as u64 {
        let ticks = Arc::clone(&ticks);
        let shared = Arc::clone(&shared);
        let blocker = Arc::clone(&blocker);
        workers.push(for_ages::spawn(move || {
            let mut rng = XorShiftRng::seed_from_u64(0x5eed ^ seed);
            if seed % 3 == 0 {
                // These park behind a lock that is never released.
                let _guard = blocker.lock()?;
                unreachable!("the blocker mutex stays held until end_all");
            }
            loop {
                for_ages::proceed_every(256)?;
                *shared.lock()? += 1;
                ticks.fetch_add(1, Ordering::Relaxed);
                if rng.gen_range(0..1_000) == 0 {
                    for_ages::msleep(1)?;
                }
            }
        }));
    }

    // Let the fleet run, then end everything.
    thread::sleep(Duration::from_millis(500));
    assert!(ticks.load(Ordering::Relaxed) > 0);
    assert!(for_ages::end_all());

    let timer = Timer::start();
    for worker in workers {
        assert_eq!(worker.join().unwrap(), Err::<(), _>(Interrupted));
    }
    // Everyone observed the end within a few wait quanta.
    assert!(timer.elapsed() < Duration::from_secs(5));

    // A second end_all has nothing left to change.
    assert!(!for_ages::end_all());
    drop(held);
}
