//! Client session: parallel outbound flows against one server.
//!
//! Each connection gets its own connected socket. The first datagram carries
//! the negotiated [`FlowOptions`]; after that a send pump (and in duplex mode
//! a receive pump) runs until the session timer closes the handle. The
//! session ends once every connection's pumps have finished.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::FlowLabel;
use crate::aggregate::{Aggregate, Totals};
use crate::pump::io::{ConnectedRecv, ConnectedSend};
use crate::pump::Pump;
use crate::wire::{encode_options, FlowOptions};

/// Client-side parameters, fixed at startup.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Server address, including the port.
    pub target: String,
    /// Local address to bind each connection to.
    pub local: Option<String>,
    /// Number of parallel connections.
    pub connections: usize,
    /// Also receive what the server writes back.
    pub duplex: bool,
    pub options: FlowOptions,
}

/// Totals at the end of a client session.
#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    /// Connections that negotiated and ran.
    pub connections: usize,
    pub sent: Totals,
    /// Only present in duplex mode.
    pub received: Option<Totals>,
}

struct Session {
    options: FlowOptions,
    negotiation: Arc<Vec<u8>>,
    duplex: bool,
    sent: Arc<Aggregate>,
    received: Arc<Aggregate>,
}

/// Run a full client session.
pub async fn run(settings: &ClientSettings) -> Result<ClientReport> {
    let negotiation = encode_options(&settings.options).context("invalid flow options")?;
    let target = resolve(&settings.target).await?;
    let local = match &settings.local {
        Some(addr) => resolve(addr).await?,
        None => unspecified_for(&target),
    };

    info!(
        %target,
        %local,
        connections = settings.connections,
        duplex = settings.duplex,
        "starting client session"
    );

    let session = Arc::new(Session {
        options: settings.options,
        negotiation: Arc::new(negotiation),
        duplex: settings.duplex,
        sent: Arc::new(Aggregate::new()),
        received: Arc::new(Aggregate::new()),
    });

    let mut flows = JoinSet::new();
    for i in 0..settings.connections {
        match dial(local, target).await {
            Ok(socket) => {
                let flow = format!("{}/{}", i, settings.connections);
                flows.spawn(run_connection(socket, flow, session.clone()));
            }
            Err(e) => warn!(connection = i, error = %e, "connection setup failed"),
        }
    }

    let mut connections = 0;
    while let Some(joined) = flows.join_next().await {
        match joined {
            Ok(true) => connections += 1,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "connection task failed"),
        }
    }

    let report = ClientReport {
        connections,
        sent: session.sent.totals(),
        received: session.duplex.then(|| session.received.totals()),
    };
    info!(
        mbps = report.sent.mbps,
        cps = report.sent.cps,
        "aggregate writing: {} Mbps {} send/s",
        report.sent.mbps,
        report.sent.cps
    );
    if let Some(received) = report.received {
        info!(
            mbps = received.mbps,
            cps = received.cps,
            "aggregate reading: {} Mbps {} recv/s",
            received.mbps,
            received.cps
        );
    }
    Ok(report)
}

/// Negotiate and pump one connection. Returns whether it ran.
async fn run_connection(socket: UdpSocket, flow: String, session: Arc<Session>) -> bool {
    if let Err(e) = socket.send(&session.negotiation).await {
        warn!(flow = %flow, error = %e, "failed to send flow options");
        return false;
    }
    debug!(flow = %flow, options = ?session.options, "flow options sent");

    let socket = Arc::new(socket);
    let closed = CancellationToken::new();

    let writer = tokio::spawn(
        Pump::sender(
            ConnectedSend::new(socket.clone(), closed.clone()),
            FlowLabel::new(flow.clone(), "client send", "snd/s"),
            &session.options,
            session.sent.clone(),
        )
        .run(),
    );
    let reader = session.duplex.then(|| {
        tokio::spawn(
            Pump::receiver(
                ConnectedRecv::new(socket.clone(), closed.clone()),
                FlowLabel::new(flow.clone(), "client recv", "rcv/s"),
                &session.options,
                session.received.clone(),
            )
            .run(),
        )
    });

    tokio::time::sleep(session.options.total_duration).await;
    closed.cancel();

    if let Err(e) = writer.await {
        warn!(flow = %flow, error = %e, "send pump task failed");
    }
    if let Some(reader) = reader {
        if let Err(e) = reader.await {
            warn!(flow = %flow, error = %e, "receive pump task failed");
        }
    }
    true
}

async fn dial(local: SocketAddr, target: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(local)
        .await
        .with_context(|| format!("failed to bind UDP socket on {}", local))?;
    socket
        .connect(target)
        .await
        .with_context(|| format!("failed to connect UDP socket to {}", target))?;
    Ok(socket)
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve {}", addr))?
        .next()
        .with_context(|| format!("no addresses found for {}", addr))
}

fn unspecified_for(target: &SocketAddr) -> SocketAddr {
    let ip = match target {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
