//! Rate-limited send/receive pump.
//!
//! A [`Pump`] drives one flow direction: it performs one I/O operation per
//! iteration through an injected [`Transfer`] capability, counts every
//! successful datagram in its [`Accountant`], holds off while the throttle
//! says the send rate is over the cap, and folds its whole-flow average into
//! a shared [`Aggregate`] when the loop ends.
//!
//! The pump has no timer of its own. Whoever owns the underlying handle ends
//! the flow by closing it, which makes the next transfer fail.

pub mod io;
pub mod throttle;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::{Accountant, FlowLabel, Rates};
use crate::aggregate::Aggregate;
use crate::wire::FlowOptions;

use self::throttle::Throttle;

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// One send or receive operation on a datagram handle.
#[async_trait]
pub trait Transfer: Send {
    /// Move one datagram through `buf`, returning its size.
    ///
    /// Send implementations only read from `buf`.
    async fn transfer(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

// ---------------------------------------------------------------------------
// PumpSummary
// ---------------------------------------------------------------------------

/// What a pump did before it stopped.
#[derive(Debug)]
pub struct PumpSummary {
    pub label: FlowLabel,
    pub bytes: u64,
    pub calls: u64,
    /// Interval reports emitted.
    pub reports: u64,
    /// Whole-flow average, `None` if the pump stopped before any time passed.
    pub average: Option<Rates>,
    /// The transfer error that ended the loop.
    pub stopped_by: std::io::Error,
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

pub struct Pump<T> {
    io: T,
    buf: Vec<u8>,
    accountant: Accountant,
    throttle: Throttle,
    report_interval: Duration,
    aggregate: Arc<Aggregate>,
}

impl<T: Transfer> Pump<T> {
    /// A send pump: random payload of `write_size`, capped at `max_speed_bps`.
    pub fn sender(
        io: T,
        label: FlowLabel,
        opts: &FlowOptions,
        aggregate: Arc<Aggregate>,
    ) -> Self {
        Self {
            io,
            buf: random_payload(opts.write_size),
            accountant: Accountant::new(label),
            throttle: Throttle::new(opts.max_speed_bps),
            report_interval: opts.report_interval,
            aggregate,
        }
    }

    /// A receive pump: reusable buffer of `read_size`, never throttled.
    pub fn receiver(
        io: T,
        label: FlowLabel,
        opts: &FlowOptions,
        aggregate: Arc<Aggregate>,
    ) -> Self {
        Self {
            io,
            buf: vec![0u8; opts.read_size],
            accountant: Accountant::new(label),
            throttle: Throttle::unlimited(),
            report_interval: opts.report_interval,
            aggregate,
        }
    }

    /// Measure from `start` instead of from construction.
    pub fn starting_at(mut self, start: Instant) -> Self {
        self.accountant = Accountant::starting_at(self.accountant.label().clone(), start);
        self
    }

    /// Run until the transfer fails, then fold the average and summarize.
    pub async fn run(mut self) -> PumpSummary {
        let start = self.accountant.start();
        let mut reports = 0u64;

        let stopped_by = loop {
            tokio::task::yield_now().await;

            if let Some(wait) = self.throttle.delay(&self.accountant, Instant::now()) {
                tokio::time::sleep(wait).await;
                continue;
            }

            match self.io.transfer(&mut self.buf).await {
                Ok(n) => {
                    if self.accountant.update(n, self.report_interval).is_some() {
                        reports += 1;
                    }
                }
                Err(e) => {
                    debug!(flow = %self.accountant.label(), error = %e, "pump stopped");
                    break e;
                }
            }
        };

        let average = self.accountant.average(start, &self.aggregate);
        let label = self.accountant.label().clone();
        info!(
            flow = %label.flow,
            label = label.label,
            calls = self.accountant.calls(),
            "Total packets {}: {}",
            label.label,
            self.accountant.calls()
        );

        PumpSummary {
            bytes: self.accountant.bytes(),
            calls: self.accountant.calls(),
            label,
            reports,
            average,
            stopped_by,
        }
    }
}

/// A buffer of `size` bytes from the OS random source.
///
/// Payload content is never inspected; random bytes keep intermediate
/// equipment from compressing or caching it.
pub fn random_payload(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    if let Err(e) = rand::rngs::OsRng.try_fill_bytes(&mut buf) {
        warn!(error = %e, "OS random source failed, using thread rng");
        rand::thread_rng().fill_bytes(&mut buf);
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
