use memforge::sync::{Atomic, Barrier, Mutex, Shared};
use memforge::MemOrdering::*;
use memforge::{thread, Config};

mod utils;

/// Two threads contending for a mutex around plain (non-atomic) state:
/// mutual exclusion must hold in every enumerated execution, so the
/// guarded accesses never race and both increments survive.
#[test]
fn mutex_mutual_exclusion() {
    let stats = memforge::verify(Config::builder().build(), || {
        let m = Mutex::new();
        let c = Shared::new(0);
        let h1 = thread::spawn(move || {
            let _g = m.lock();
            let v = c.load();
            c.store(v + 1);
        });
        let h2 = thread::spawn(move || {
            let _g = m.lock();
            let v = c.load();
            c.store(v + 1);
        });
        h1.join();
        h2.join();
        memforge::assert(c.load() == 2);
    });
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);
    assert!(stats.warnings.is_empty(), "{:?}", stats.warnings);
    // One execution per acquisition order; the speculative branches that
    // break mutual exclusion are mooted, not reported.
    assert_eq!(stats.execs, 2);
    assert!(stats.moot >= 1);
}

/// CAS-based lock elimination: exactly one of two competing CASes
/// succeeds in every execution.
#[test]
fn cas_winner_is_unique() {
    let stats = memforge::verify(Config::builder().build(), || {
        let x = Atomic::new(0);
        let s1 = Atomic::new(0);
        let s2 = Atomic::new(0);
        let h1 = thread::spawn(move || {
            if x.compare_exchange(0, 1, AcqRel).is_ok() {
                s1.store(1, Relaxed);
            }
        });
        let h2 = thread::spawn(move || {
            if x.compare_exchange(0, 2, AcqRel).is_ok() {
                s2.store(1, Relaxed);
            }
        });
        h1.join();
        h2.join();
        memforge::assert(s1.load(Relaxed) + s2.load(Relaxed) == 1);
    });
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);
    assert_eq!(stats.execs, 2);
}

/// Two fetch-and-adds never lose an update, in either order.
#[test]
fn fai_no_lost_updates() {
    let stats = memforge::verify(Config::builder().build(), || {
        let c = Atomic::new(0);
        let h1 = thread::spawn(move || {
            c.fetch_add(1, AcqRel);
        });
        let h2 = thread::spawn(move || {
            c.fetch_add(1, AcqRel);
        });
        h1.join();
        h2.join();
        memforge::assert(c.load(Acquire) == 2);
    });
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);
    assert_eq!(stats.execs, 2);
}

#[test]
fn swap_returns_previous() {
    let stats = memforge::verify(Config::builder().build(), || {
        let x = Atomic::new(5);
        let old = x.swap(9, AcqRel);
        memforge::assert(old == 5);
        memforge::assert(x.load(Relaxed) == 9);
    });
    assert!(stats.errors.is_empty());
    assert_eq!(stats.execs, 1);
}

/// All participants of a barrier unblock in the same execution; with
/// barrier-aware reduction the arrivals add no exploration of their own.
#[test]
fn barrier_releases_everyone() {
    let run = |bam| {
        let stats = memforge::verify(Config::builder().with_bam(bam).build(), || {
            let b = Barrier::new(2);
            let after = Atomic::new(0);
            let h1 = thread::spawn(move || {
                b.wait();
                after.fetch_add(1, AcqRel);
            });
            let h2 = thread::spawn(move || {
                b.wait();
                after.fetch_add(1, AcqRel);
            });
            h1.join();
            h2.join();
            memforge::assert(after.load(Acquire) == 2);
        });
        assert!(stats.errors.is_empty(), "{:?}", stats.errors);
        assert_eq!(stats.blocked, 0);
        stats.execs
    };
    // Both post-barrier increment orders, times the arrival orders when
    // the reduction is off.
    assert_eq!(run(true), 2);
    assert_eq!(run(false), 4);
}

/// An extra arrival beyond the barrier's capacity blocks instead of
/// crashing or releasing anyone twice.
#[test]
fn barrier_extra_arrival_blocks() {
    let stats = memforge::verify(Config::builder().build(), || {
        let b = Barrier::new(1);
        b.wait();
        b.wait();
    });
    assert_eq!(stats.execs, 0);
    assert_eq!(stats.blocked, 1);
    assert!(stats.errors.is_empty());
}

/// A mutex handed through more threads still serializes all critical
/// sections.
#[test]
fn mutex_three_way() {
    let stats = memforge::verify(Config::builder().build(), || {
        let m = Mutex::new();
        let c = Shared::new(0);
        let handles: Vec<_> = (0..3)
            .map(|_| {
                thread::spawn(move || {
                    let _g = m.lock();
                    let v = c.load();
                    c.store(v + 1);
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        memforge::assert(c.load() == 3);
    });
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);
    assert!(stats.warnings.is_empty(), "{:?}", stats.warnings);
    // 3! acquisition orders.
    assert_eq!(stats.execs, 6);
}
