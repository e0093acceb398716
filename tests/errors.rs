use memforge::sync::{self, Atomic, Shared};
use memforge::MemOrdering::*;
use memforge::{thread, Config, VerificationError};

mod utils;

/// An unsynchronized write/read pair on a plain variable is a data race,
/// with both conflicting events identified.
#[test]
fn race_not_atomic() {
    let stats = memforge::verify(Config::builder().build(), || {
        let x = Shared::new(0);
        thread::spawn(move || x.store(1));
        let _ = x.load();
    });
    assert_eq!(stats.errors.len(), 1);
    let err = &stats.errors[0];
    assert_eq!(err.kind, VerificationError::RaceNotAtomic);
    assert!(err.racy.is_some());
}

/// Properly synchronized plain accesses do not race.
#[test]
fn no_race_after_join() {
    let stats = memforge::verify(Config::builder().build(), || {
        let x = Shared::new(0);
        let h = thread::spawn(move || x.store(1));
        h.join();
        memforge::assert(x.load() == 1);
    });
    assert!(stats.errors.is_empty(), "{:?}", stats.errors);
    assert_eq!(stats.execs, 1);
}

#[test]
fn access_freed_memory() {
    let stats = memforge::verify(Config::builder().build(), || {
        let a = sync::malloc(1);
        sync::store(a, NotAtomic, 7);
        sync::free(a);
        let _ = sync::load(a, NotAtomic);
    });
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].kind, VerificationError::AccessFreed);
}

#[test]
fn double_free() {
    let stats = memforge::verify(Config::builder().build(), || {
        let a = sync::malloc(1);
        sync::store(a, NotAtomic, 7);
        sync::free(a);
        sync::free(a);
    });
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].kind, VerificationError::DoubleFree);
}

#[test]
fn uninitialized_read() {
    let stats = memforge::verify(Config::builder().build(), || {
        let a = sync::malloc(1);
        let _ = sync::load(a, NotAtomic);
    });
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].kind, VerificationError::UninitializedMem);
}

/// Heap memory never freed is warned about once, at the end of a
/// complete execution.
#[test]
fn unfreed_memory_warning() {
    let stats = memforge::verify(Config::builder().build(), || {
        let a = sync::malloc(2);
        sync::store(a, NotAtomic, 1);
    });
    assert!(stats.errors.is_empty());
    assert_eq!(
        stats
            .warnings
            .iter()
            .filter(|w| w.kind == VerificationError::UnfreedMemory)
            .count(),
        1
    );
}

/// A spin loop no other thread can exit: the execution blocks, and the
/// liveness check reports it.
#[test]
fn liveness_violation() {
    let stats = memforge::verify(Config::builder().with_check_liveness(true).build(), || {
        let flag = Atomic::new(0);
        memforge::spin_until(|| flag.load(Acquire) == 1);
    });
    assert_eq!(stats.execs, 0);
    assert_eq!(stats.blocked, 1);
    assert!(stats
        .warnings
        .iter()
        .any(|w| w.kind == VerificationError::Liveness));
}

/// Without the liveness check the same model is just a blocked execution.
#[test]
fn spin_without_liveness_check() {
    let stats = memforge::verify(Config::builder().build(), || {
        let flag = Atomic::new(0);
        memforge::spin_until(|| flag.load(Acquire) == 1);
    });
    assert_eq!(stats.blocked, 1);
    assert!(stats.warnings.is_empty());
}

/// `memforge::assert` records the failure; with keep-going the rest of
/// the state space is still explored.
#[test]
fn assert_keep_going() {
    let stats = memforge::verify(
        Config::builder().with_keep_going_after_error(true).build(),
        || {
            if memforge::nondet() {
                memforge::assert(false);
            }
        },
    );
    assert_eq!(stats.execs, 1);
    assert_eq!(stats.blocked, 1);
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].kind, VerificationError::AssertionFailure);
}

/// Without keep-going, the first assertion failure stops the run.
#[test]
fn assert_halts() {
    let stats = memforge::verify(Config::builder().build(), || {
        memforge::assert(1 + 1 == 3);
    });
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].kind, VerificationError::AssertionFailure);
    assert_eq!(stats.execs, 0);
}

/// A failed assume is not an error; the execution is just blocked.
#[test]
fn assume_blocks_silently() {
    let stats = memforge::verify(Config::builder().build(), || {
        let v = memforge::nondet();
        memforge::assume!(v);
    });
    assert_eq!(stats.execs, 1);
    assert_eq!(stats.blocked, 1);
    assert!(stats.errors.is_empty());
    assert!(stats.warnings.is_empty());
}

/// A panic in model code is reported with the panic message.
#[test]
fn model_panic_is_reported() {
    let stats = memforge::verify(Config::builder().build(), || {
        if memforge::nondet() {
            panic!("boom");
        }
    });
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].kind, VerificationError::Panic);
    assert!(stats.errors[0].msg.contains("boom"));
}
