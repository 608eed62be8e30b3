//! Process-wide sums of completed flows' average rates.

use std::sync::Mutex;

use serde::Serialize;

/// Running totals for one direction (all receive flows, or all send flows).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    /// Sum of per-flow average throughput, in Mbps.
    pub mbps: u64,
    /// Sum of per-flow average call rate, in calls per second.
    pub cps: u64,
    /// Number of flow averages folded in.
    pub flows: u64,
}

/// Sum of per-flow averages, shared by every pump of one direction.
///
/// Only ever grows. Callers share it through an `Arc` for the lifetime of a
/// client or server session.
#[derive(Debug, Default)]
pub struct Aggregate {
    totals: Mutex<Totals>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one flow's average into the running sums.
    pub fn add(&self, mbps: u64, cps: u64) {
        let mut totals = self
            .totals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        totals.mbps += mbps;
        totals.cps += cps;
        totals.flows += 1;
    }

    /// Current sums.
    pub fn totals(&self) -> Totals {
        *self
            .totals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
