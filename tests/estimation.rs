use memforge::sync::Atomic;
use memforge::MemOrdering::*;
use memforge::{thread, Config};

mod utils;

/// Two independent coin tosses: every sample observes exactly two
/// alternatives per toss, so the estimate is exact.
#[test]
fn estimate_nondet_pair() {
    let est = memforge::estimate_execs_with_config(
        Config::builder().with_seed(42).build(),
        || {
            let a = memforge::nondet();
            let b = memforge::nondet();
            let _ = (a, b);
        },
        100,
    );
    assert!((est - 4.0).abs() < 1e-9, "estimate was {}", est);
}

/// The estimate tracks the real state-space size of a racy-read model
/// reasonably: the true count is 4 (store buffering under a weak model).
#[test]
fn estimate_store_buffering() {
    let model = || {
        let x = Atomic::new(0);
        let y = Atomic::new(0);
        let t1 = thread::spawn(move || {
            x.store(1, Relaxed);
            let _ = y.load(Relaxed);
        });
        let t2 = thread::spawn(move || {
            y.store(1, Relaxed);
            let _ = x.load(Relaxed);
        });
        t1.join();
        t2.join();
    };

    let est = memforge::estimate_execs_with_config(
        Config::builder().with_seed(7).build(),
        model,
        200,
    );
    assert!(est > 1.0 && est < 16.0, "estimate was {}", est);
}

/// Estimation follows the configured seed deterministically.
#[test]
fn estimation_is_seeded() {
    let model = || {
        let v = memforge::nondet();
        let w = memforge::nondet();
        let _ = (v, w);
    };
    let a = memforge::estimate_execs_with_config(Config::builder().with_seed(3).build(), model, 30);
    let b = memforge::estimate_execs_with_config(Config::builder().with_seed(3).build(), model, 30);
    assert_eq!(a, b);
}
