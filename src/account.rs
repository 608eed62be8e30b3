//! Per-flow counters and rate arithmetic.
//!
//! An [`Accountant`] belongs to exactly one flow direction. The owning pump
//! bumps its cumulative counters on every successful datagram; periodic
//! interval reports and the final whole-flow average are derived from them.
//!
//! Two snapshot records are kept: one advanced by interval reporting and one
//! advanced by the throttle. They never influence each other, so changing the
//! report interval does not change how quickly the rate cap reacts.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::aggregate::Aggregate;

// ---------------------------------------------------------------------------
// Rates
// ---------------------------------------------------------------------------

/// Throughput and call rate over some period, truncated to whole units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Rates {
    /// Megabits per second.
    pub mbps: u64,
    /// Datagrams per second.
    pub cps: u64,
}

impl Rates {
    /// Compute rates for `bytes` and `calls` moved over `elapsed`.
    ///
    /// Returns `None` when no measurable time has passed.
    pub fn over(bytes: u64, calls: u64, elapsed: Duration) -> Option<Self> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let bits_per_sec = (8 * bytes) as f64 / secs;
        Some(Rates {
            mbps: (bits_per_sec / 1_000_000.0) as u64,
            cps: (calls as f64 / secs) as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// FlowLabel
// ---------------------------------------------------------------------------

/// How a flow direction identifies itself in log lines.
#[derive(Debug, Clone)]
pub struct FlowLabel {
    /// Flow identifier, e.g. `3/8` on the client or `12/0` on the server.
    pub flow: String,
    /// What the direction is doing, e.g. `client send`.
    pub label: &'static str,
    /// Unit of the call rate, e.g. `snd/s`.
    pub unit: &'static str,
}

impl FlowLabel {
    pub fn new(flow: impl Into<String>, label: &'static str, unit: &'static str) -> Self {
        Self {
            flow: flow.into(),
            label,
            unit,
        }
    }
}

impl fmt::Display for FlowLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.flow, self.label)
    }
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    at: Instant,
    bytes: u64,
    calls: u64,
}

/// Cumulative counters for one flow direction.
#[derive(Debug)]
pub struct Accountant {
    label: FlowLabel,
    start: Instant,
    bytes: u64,
    calls: u64,
    report: Mutex<Snapshot>,
    throttle: Mutex<Snapshot>,
}

impl Accountant {
    /// Start a new accountant whose clock begins now.
    pub fn new(label: FlowLabel) -> Self {
        Self::starting_at(label, Instant::now())
    }

    /// Start a new accountant whose clock began at `start`.
    pub fn starting_at(label: FlowLabel, start: Instant) -> Self {
        let origin = Snapshot {
            at: start,
            bytes: 0,
            calls: 0,
        };
        Self {
            label,
            start,
            bytes: 0,
            calls: 0,
            report: Mutex::new(origin),
            throttle: Mutex::new(origin),
        }
    }

    pub fn label(&self) -> &FlowLabel {
        &self.label
    }

    /// When this flow direction started.
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Total bytes counted so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Total datagrams counted so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Count one datagram of `n` bytes.
    ///
    /// When more than `interval` has passed since the last report, the rates
    /// for that stretch are logged, the report snapshot moves to now, and the
    /// rates are returned.
    pub fn update(&mut self, n: usize, interval: Duration) -> Option<Rates> {
        self.calls += 1;
        self.bytes += n as u64;

        let now = Instant::now();
        let mut snap = lock(&self.report);
        let elapsed = now.saturating_duration_since(snap.at);
        if elapsed <= interval {
            return None;
        }

        let rates = Rates::over(self.bytes - snap.bytes, self.calls - snap.calls, elapsed)?;
        info!(
            flow = %self.label.flow,
            kind = "report",
            label = self.label.label,
            mbps = rates.mbps,
            cps = rates.cps,
            "{} report {} rate: {} Mbps {} {}",
            self.label.flow,
            self.label.label,
            rates.mbps,
            rates.cps,
            self.label.unit
        );

        *snap = Snapshot {
            at: now,
            bytes: self.bytes,
            calls: self.calls,
        };
        Some(rates)
    }

    /// Whole-flow rates since `start`, folded into `aggregate`.
    ///
    /// Every call adds to the aggregate again; folding is not idempotent.
    /// Returns `None` (and folds nothing) if no time has passed since `start`.
    pub fn average(&self, start: Instant, aggregate: &Aggregate) -> Option<Rates> {
        let elapsed = Instant::now().saturating_duration_since(start);
        let rates = Rates::over(self.bytes, self.calls, elapsed)?;

        info!(
            flow = %self.label.flow,
            kind = "average",
            label = self.label.label,
            mbps = rates.mbps,
            cps = rates.cps,
            "{} average {} rate: {} Mbps {} {}",
            self.label.flow,
            self.label.label,
            rates.mbps,
            rates.cps,
            self.label.unit
        );

        aggregate.add(rates.mbps, rates.cps);
        Some(rates)
    }

    /// Bytes counted and time elapsed since the throttle mark.
    pub fn throttle_sample(&self, now: Instant) -> (u64, Duration) {
        let mark = lock(&self.throttle);
        (self.bytes - mark.bytes, now.saturating_duration_since(mark.at))
    }

    /// Move the throttle mark to `now`, leaving `owed` bytes still charged
    /// against it.
    pub fn roll_throttle_mark(&self, now: Instant, owed: u64) {
        let mut mark = lock(&self.throttle);
        *mark = Snapshot {
            at: now,
            bytes: self.bytes - owed.min(self.bytes),
            calls: self.calls,
        };
    }
}

/// Lock a snapshot, recovering from poisoning since the data stays valid.
fn lock(m: &Mutex<Snapshot>) -> MutexGuard<'_, Snapshot> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn label() -> FlowLabel {
        FlowLabel::new("0/1", "test recv", "rcv/s")
    }

    #[test]
    fn test_rates_guard_zero_elapsed() {
        assert_eq!(Rates::over(1000, 10, Duration::ZERO), None);
    }

    #[test]
    fn test_rates_truncate() {
        // Just under 1 Mbps and 1.5 calls/s both truncate down.
        let rates = Rates::over(249_999, 3, Duration::from_secs(2)).unwrap();
        assert_eq!(rates, Rates { mbps: 0, cps: 1 });

        let rates = Rates::over(250_000, 10, Duration::from_secs(1)).unwrap();
        assert_eq!(rates, Rates { mbps: 2, cps: 10 });
    }

    #[test]
    fn test_update_counts_exactly() {
        let mut acc = Accountant::new(label());
        for n in [0usize, 1, 1024, 65_507] {
            let (bytes, calls) = (acc.bytes(), acc.calls());
            acc.update(n, Duration::from_secs(3600));
            assert_eq!(acc.bytes(), bytes + n as u64);
            assert_eq!(acc.calls(), calls + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_reports_once_per_interval() {
        let mut acc = Accountant::new(label());
        let interval = Duration::from_secs(1);

        // Half a second in: no report yet.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(acc.update(1000, interval).is_none());

        // Past the interval: exactly one report covering both datagrams.
        tokio::time::advance(Duration::from_millis(1000)).await;
        let rates = acc.update(1000, interval).expect("should report");
        assert_eq!(rates.cps, 1); // 2 calls over 1.5s
        assert_eq!(acc.calls(), 2);

        // Snapshot moved: an immediate follow-up does not report again.
        assert!(acc.update(1000, interval).is_none());
        assert_eq!(acc.bytes(), 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_still_counts_when_reporting() {
        let mut acc = Accountant::new(label());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(acc.update(512, Duration::from_secs(1)).is_some());
        assert_eq!(acc.bytes(), 512);
        assert_eq!(acc.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_skipped_without_elapsed_time() {
        let agg = Aggregate::new();
        let mut acc = Accountant::new(label());
        acc.update(1000, Duration::from_secs(1));

        assert!(acc.average(acc.start(), &agg).is_none());
        assert_eq!(agg.totals().flows, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_folds_on_every_call() {
        let agg = Aggregate::new();
        let mut acc = Accountant::new(label());
        for _ in 0..100 {
            acc.update(1250, Duration::from_secs(60));
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        // 100 * 1250 bytes * 8 = 1 Mbit over one second.
        let first = acc.average(acc.start(), &agg).unwrap();
        let second = acc.average(acc.start(), &agg).unwrap();
        assert_eq!(first, Rates { mbps: 1, cps: 100 });
        assert_eq!(first, second);

        // The counters are unchanged, but the aggregate took both folds.
        assert_eq!(acc.calls(), 100);
        let totals = agg.totals();
        assert_eq!(totals.mbps, 2);
        assert_eq!(totals.cps, 200);
        assert_eq!(totals.flows, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_mark_independent_of_reports() {
        let mut acc = Accountant::new(label());

        tokio::time::advance(Duration::from_millis(50)).await;
        acc.update(4000, Duration::from_millis(10));
        // A report fired, but the throttle mark still sits at the start.
        assert_eq!(
            acc.throttle_sample(Instant::now()),
            (4000, Duration::from_millis(50))
        );

        // Rolling keeps only what is still owed.
        acc.roll_throttle_mark(Instant::now(), 1500);
        assert_eq!(acc.throttle_sample(Instant::now()), (1500, Duration::ZERO));

        // Owing more than was ever counted charges everything.
        acc.roll_throttle_mark(Instant::now(), u64::MAX);
        assert_eq!(acc.throttle_sample(Instant::now()).0, 4000);
    }
}
