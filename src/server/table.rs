//! Server-side flow table.
//!
//! Maps a peer's address to its flow state. A peer is either absent or has
//! exactly one active flow:
//!
//! - **absent -> active** when a datagram from an unknown peer decodes as
//!   [`FlowOptions`]. Nothing is inserted unless decoding succeeds.
//! - **active -> active** for every later datagram before the flow's total
//!   duration has elapsed; the payload length is counted.
//! - **active -> absent** once the duration has elapsed, either when the
//!   peer's next datagram arrives or when [`FlowTable::sweep`] runs. The
//!   flow's average is folded into the receive aggregate on the way out.
//!
//! The table is owned by the single socket-reading task and needs no locking.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::account::{Accountant, FlowLabel, Rates};
use crate::aggregate::Aggregate;
use crate::wire::{decode_options, FlowOptions, NegotiationError};

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// One active flow from a remote peer.
#[derive(Debug)]
pub struct Flow {
    id: u64,
    peer: SocketAddr,
    options: FlowOptions,
    accountant: Accountant,
}

impl Flow {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn options(&self) -> &FlowOptions {
        &self.options
    }

    pub fn accountant(&self) -> &Accountant {
        &self.accountant
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.accountant.start()) >= self.options.total_duration
    }
}

// ---------------------------------------------------------------------------
// Observed / Finished
// ---------------------------------------------------------------------------

/// What a single inbound datagram did to the table.
#[derive(Debug)]
pub enum Observed {
    /// A new flow was negotiated.
    Opened {
        id: u64,
        peer: SocketAddr,
        options: FlowOptions,
        start: Instant,
    },
    /// The datagram was counted against an active flow.
    Counted,
    /// The peer's flow had run its course and was removed; the datagram was
    /// not counted.
    Expired(Finished),
    /// An unknown peer sent something that is not a negotiation payload.
    Rejected(NegotiationError),
}

/// Final numbers for a flow leaving the table.
#[derive(Debug, Clone)]
pub struct Finished {
    pub id: u64,
    pub peer: SocketAddr,
    pub bytes: u64,
    pub calls: u64,
    pub average: Option<Rates>,
}

// ---------------------------------------------------------------------------
// FlowTable
// ---------------------------------------------------------------------------

pub struct FlowTable {
    flows: HashMap<String, Flow>,
    next_id: u64,
    received: Arc<Aggregate>,
}

impl FlowTable {
    /// An empty table folding finished flows into `received`.
    pub fn new(received: Arc<Aggregate>) -> Self {
        Self {
            flows: HashMap::new(),
            next_id: 0,
            received,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Look up the active flow for a peer identity.
    pub fn get(&self, peer: &str) -> Option<&Flow> {
        self.flows.get(peer)
    }

    /// Number of flows opened over the table's lifetime.
    pub fn opened(&self) -> u64 {
        self.next_id
    }

    /// Route one datagram from `peer` received at `now`.
    pub fn observe(&mut self, peer: SocketAddr, payload: &[u8], now: Instant) -> Observed {
        let slot = match self.flows.entry(peer.to_string()) {
            Entry::Occupied(entry) if entry.get().is_expired(now) => {
                return Observed::Expired(finish(entry.remove(), &self.received));
            }
            Entry::Occupied(entry) => {
                let flow = entry.into_mut();
                flow.accountant.update(payload.len(), flow.options.report_interval);
                return Observed::Counted;
            }
            Entry::Vacant(slot) => slot,
        };

        let options = match decode_options(payload) {
            Ok(options) => options,
            Err(e) => {
                debug!(%peer, error = %e, "discarding datagram from unknown peer");
                return Observed::Rejected(e);
            }
        };

        let id = self.next_id;
        self.next_id += 1;
        let label = FlowLabel::new(format!("{}/0", id), "server recv", "rcv/s");
        slot.insert(Flow {
            id,
            peer,
            options,
            accountant: Accountant::starting_at(label, now),
        });

        info!(
            flow = id,
            %peer,
            report_interval_ms = options.report_interval.as_millis() as u64,
            total_duration_ms = options.total_duration.as_millis() as u64,
            write_size = options.write_size,
            max_speed_bps = options.max_speed_bps,
            "flow opened"
        );

        Observed::Opened {
            id,
            peer,
            options,
            start: now,
        }
    }

    /// Remove every flow whose duration has elapsed by `now`.
    pub fn sweep(&mut self, now: Instant) -> Vec<Finished> {
        let expired: Vec<String> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        let received = &self.received;
        expired
            .into_iter()
            .filter_map(|key| self.flows.remove(&key))
            .map(|flow| finish(flow, received))
            .collect()
    }

    /// Remove and finalize every remaining flow, expired or not.
    pub fn drain(&mut self) -> Vec<Finished> {
        let received = &self.received;
        self.flows
            .drain()
            .map(|(_, flow)| finish(flow, received))
            .collect()
    }
}

/// Fold a departing flow into the receive aggregate.
fn finish(flow: Flow, received: &Aggregate) -> Finished {
    let average = flow.accountant.average(flow.accountant.start(), received);
    info!(
        flow = flow.id,
        peer = %flow.peer,
        calls = flow.accountant.calls(),
        "Total packets server received from {}: {}",
        flow.peer,
        flow.accountant.calls()
    );
    Finished {
        id: flow.id,
        peer: flow.peer,
        bytes: flow.accountant.bytes(),
        calls: flow.accountant.calls(),
        average,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
