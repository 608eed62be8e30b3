//! Multiplexing UDP server.
//!
//! One task reads the listening socket and routes every datagram through the
//! [`FlowTable`]. A sweep timer reclaims flows whose peers have gone quiet,
//! so a silent peer never keeps its entry alive. In duplex mode each new flow
//! also gets a reverse send pump writing back to the peer on the same socket.

pub mod table;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::FlowLabel;
use crate::aggregate::{Aggregate, Totals};
use crate::pump::io::SendTo;
use crate::pump::{Pump, PumpSummary};

use self::table::{FlowTable, Observed};

// ---------------------------------------------------------------------------
// Settings / report
// ---------------------------------------------------------------------------

/// Server-side parameters, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Address to listen on, including the port.
    pub listen: String,
    /// Write back to every peer while its flow is active.
    pub duplex: bool,
    /// Size of the socket read buffer.
    pub read_size: usize,
    /// How often expired flows are swept out.
    pub sweep_interval: Duration,
}

/// Totals at server shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub received: Totals,
    pub sent: Totals,
    pub flows_opened: u64,
    /// Flows that ran their course while the server was up.
    pub flows_expired: u64,
    /// Flows still active at shutdown.
    pub flows_drained: u64,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct Server {
    socket: Arc<UdpSocket>,
    settings: ServerSettings,
    received: Arc<Aggregate>,
    sent: Arc<Aggregate>,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(settings: ServerSettings) -> Result<Self> {
        if settings.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be non-zero");
        }
        let socket = UdpSocket::bind(&settings.listen)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", settings.listen))?;

        info!(
            listen = %settings.listen,
            duplex = settings.duplex,
            read_size = settings.read_size,
            "server listening"
        );

        Ok(Self {
            socket: Arc::new(socket),
            settings,
            received: Arc::new(Aggregate::new()),
            sent: Arc::new(Aggregate::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("failed to get local address")
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// Flows still active at shutdown are finalized into the receive totals,
    /// and reverse pumps are stopped and awaited before returning.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ServerReport> {
        let mut table = FlowTable::new(self.received.clone());
        let mut buf = vec![0u8; self.settings.read_size];
        let mut writers: JoinSet<PumpSummary> = JoinSet::new();
        let mut expired = 0u64;

        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("shutdown signal received");
                    break;
                }
                _ = sweep.tick() => {
                    let finished = table.sweep(Instant::now());
                    expired += finished.len() as u64;
                    if !finished.is_empty() {
                        debug!(expired = finished.len(), active = table.len(), "swept flow table");
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => match table.observe(peer, &buf[..n], Instant::now()) {
                        Observed::Opened { id, peer, options, start } if self.settings.duplex => {
                            let io = SendTo::new(
                                self.socket.clone(),
                                peer,
                                start + options.total_duration,
                                shutdown.child_token(),
                            );
                            let label = FlowLabel::new(format!("{}/0", id), "server send", "snd/s");
                            let pump = Pump::sender(io, label, &options, self.sent.clone())
                                .starting_at(start);
                            debug!(flow = id, %peer, "starting reverse pump");
                            writers.spawn(pump.run());
                        }
                        Observed::Expired(_) => expired += 1,
                        _ => {}
                    },
                    Err(e) => {
                        warn!(error = %e, "recv_from failed");
                    }
                },
            }

            while let Some(joined) = writers.try_join_next() {
                log_writer(joined);
            }
        }

        let drained = table.drain().len() as u64;
        while let Some(joined) = writers.join_next().await {
            log_writer(joined);
        }

        let report = ServerReport {
            received: self.received.totals(),
            sent: self.sent.totals(),
            flows_opened: table.opened(),
            flows_expired: expired,
            flows_drained: drained,
        };
        info!(
            mbps = report.received.mbps,
            cps = report.received.cps,
            flows = report.received.flows,
            "aggregate reading: {} Mbps {} recv/s",
            report.received.mbps,
            report.received.cps
        );
        if self.settings.duplex {
            info!(
                mbps = report.sent.mbps,
                cps = report.sent.cps,
                flows = report.sent.flows,
                "aggregate writing: {} Mbps {} send/s",
                report.sent.mbps,
                report.sent.cps
            );
        }
        Ok(report)
    }
}

/// Cancel `shutdown` once `signal` fires.
///
/// If the signal cannot be awaited (for example the handler failed to
/// install) the error is logged and the server keeps running.
pub async fn cancel_on<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
        Err(e) => warn!(error = %e, "failed to listen for interrupt"),
    }
}

fn log_writer(joined: Result<PumpSummary, tokio::task::JoinError>) {
    match joined {
        Ok(summary) => debug!(
            flow = %summary.label.flow,
            calls = summary.calls,
            reason = %summary.stopped_by,
            "reverse pump finished"
        ),
        Err(e) => warn!(error = %e, "reverse pump task failed"),
    }
}
