//! Exploration statistics in one place, rather than scattered counters
//! interspersed with the search logic.
//!
//! Two kinds of values live here: plain counters (explored, blocked, moot
//! executions) and the state-space estimator fed by estimation-mode
//! sampling. The estimator multiplies the branching factors observed along
//! one random execution; since the product can overflow an `f64` for large
//! models, it switches to log space once it crosses a threshold.

use std::collections::HashMap;
use std::fmt;

use log::{debug, warn};

pub(crate) type Key = &'static str;

pub(crate) const EXECS: Key = "execs";
pub(crate) const BLOCKED: Key = "blocked";
pub(crate) const MOOT: Key = "moot";
pub(crate) const EXECS_EST: Key = "execs_est";

/// One random execution's estimate of the state-space size: the product of
/// the number of alternatives at every choice point along the way.
#[derive(Clone, Debug)]
pub(crate) struct StateEstimator {
    val: f64,
    /// Whether `val` is the product itself or its natural log.
    exact: bool,
    threshold: f64,
}

impl StateEstimator {
    pub(crate) fn new() -> Self {
        Self {
            val: 1.0,
            exact: true,
            threshold: 1_000_000.0,
        }
    }

    /// Record a choice point with `branches` alternatives.
    pub(crate) fn sample(&mut self, branches: f64) {
        assert!(branches > 0.0);
        if !self.val.is_finite() {
            return;
        }
        if self.exact {
            let next = self.val * branches;
            if next.is_finite() && next < self.threshold {
                self.val = next;
                return;
            }
            debug!("state estimator switching to log space");
            self.exact = false;
            self.val = self.val.ln();
        }
        let next = self.val + branches.ln();
        if self.val.is_finite() && !next.is_finite() {
            warn!("state estimator overflowed; this sample may be ignored");
        }
        self.val = next;
    }

    pub(crate) fn as_f64(&self) -> f64 {
        if self.exact {
            self.val
        } else {
            self.val.exp()
        }
    }
}

impl fmt::Display for StateEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exact || !self.val.is_finite() {
            write!(f, "{}", self.val)
        } else {
            write!(f, "appx {}", self.val.exp())
        }
    }
}

#[derive(Clone, Debug)]
enum Value {
    U64(u64),
    Estimator(StateEstimator),
}

/// The per-driver telemetry store. Every driver instance owns one; the pool
/// aggregates them through `Stats` after its workers finish.
#[derive(Clone, Debug, Default)]
pub(crate) struct Telemetry {
    inner: HashMap<Key, Value>,
}

impl Telemetry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn counter(&mut self, k: Key) {
        match self.inner.entry(k).or_insert(Value::U64(0)) {
            Value::U64(v) => *v += 1,
            other => panic!("telemetry key {} is not a counter: {:?}", k, other),
        }
    }

    pub(crate) fn read_counter(&self, k: Key) -> u64 {
        match self.inner.get(k) {
            Some(Value::U64(v)) => *v,
            _ => 0,
        }
    }

    pub(crate) fn histogram(&mut self, k: Key, branches: f64) {
        match self
            .inner
            .entry(k)
            .or_insert_with(|| Value::Estimator(StateEstimator::new()))
        {
            Value::Estimator(se) => se.sample(branches),
            other => panic!("telemetry key {} is not an estimator: {:?}", k, other),
        }
    }

    pub(crate) fn read_histogram(&self, k: Key) -> f64 {
        match self.inner.get(k) {
            Some(Value::Estimator(se)) => se.as_f64(),
            _ => 0.0,
        }
    }
}

/// Online mean/variance over the per-sample estimates (Welford's algorithm).
/// Drives the estimation stopping rule: stop early once the relative
/// standard error of the mean falls below a threshold.
#[derive(Clone, Debug, Default)]
pub(crate) struct Welford {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub(crate) fn count(&self) -> u64 {
        self.n
    }

    pub(crate) fn mean(&self) -> f64 {
        self.mean
    }

    fn variance(&self) -> f64 {
        if self.n < 2 {
            f64::INFINITY
        } else {
            self.m2 / (self.n - 1) as f64
        }
    }

    /// Standard error of the mean relative to the mean itself.
    pub(crate) fn rel_std_err(&self) -> f64 {
        if self.mean == 0.0 {
            return f64::INFINITY;
        }
        (self.variance() / self.n as f64).sqrt() / self.mean.abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_stays_exact_for_small_products() {
        let mut se = StateEstimator::new();
        se.sample(3.0);
        se.sample(4.0);
        assert_eq!(se.as_f64(), 12.0);
    }

    #[test]
    fn estimator_survives_huge_products() {
        let mut se = StateEstimator::new();
        for _ in 0..200 {
            se.sample(1e6);
        }
        // 1e6^200 is far beyond f64 in exact form; the log-space value is
        // still meaningful.
        assert!(!se.as_f64().is_nan());
    }

    #[test]
    fn welford_mean_and_deviation() {
        let mut w = Welford::new();
        for x in [2.0, 2.0, 2.0, 2.0] {
            w.push(x);
        }
        assert_eq!(w.mean(), 2.0);
        assert!(w.rel_std_err() < 1e-9);

        let mut w = Welford::new();
        w.push(1.0);
        w.push(3.0);
        assert_eq!(w.mean(), 2.0);
        assert!(w.rel_std_err() > 0.1);
    }

    #[test]
    fn counters_accumulate() {
        let mut t = Telemetry::new();
        t.counter(EXECS);
        t.counter(EXECS);
        t.counter(BLOCKED);
        assert_eq!(t.read_counter(EXECS), 2);
        assert_eq!(t.read_counter(BLOCKED), 1);
        assert_eq!(t.read_counter(MOOT), 0);
    }
}
