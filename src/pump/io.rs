//! [`Transfer`] capabilities over tokio UDP sockets.
//!
//! A tokio socket shared through an `Arc` cannot be closed from the outside,
//! so each capability carries a [`CancellationToken`] that stands for the
//! handle being closed: once it is cancelled every pending or future transfer
//! fails and the owning pump finishes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Transfer;

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed")
}

/// Sends on a connected socket until closed.
pub struct ConnectedSend {
    socket: Arc<UdpSocket>,
    closed: CancellationToken,
}

impl ConnectedSend {
    pub fn new(socket: Arc<UdpSocket>, closed: CancellationToken) -> Self {
        Self { socket, closed }
    }
}

#[async_trait]
impl Transfer for ConnectedSend {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed()),
            sent = self.socket.send(buf) => sent,
        }
    }
}

/// Receives on a connected socket until closed.
pub struct ConnectedRecv {
    socket: Arc<UdpSocket>,
    closed: CancellationToken,
}

impl ConnectedRecv {
    pub fn new(socket: Arc<UdpSocket>, closed: CancellationToken) -> Self {
        Self { socket, closed }
    }
}

#[async_trait]
impl Transfer for ConnectedRecv {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed()),
            received = self.socket.recv(buf) => received,
        }
    }
}

/// Sends to one peer over a shared unconnected socket until `deadline`.
///
/// Used by the server to write back to a peer on its listening socket.
pub struct SendTo {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    deadline: Instant,
    closed: CancellationToken,
}

impl SendTo {
    pub fn new(
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
        deadline: Instant,
        closed: CancellationToken,
    ) -> Self {
        Self {
            socket,
            dest,
            deadline,
            closed,
        }
    }
}

#[async_trait]
impl Transfer for SendTo {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if Instant::now() >= self.deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "flow duration elapsed",
            ));
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed()),
            _ = tokio::time::sleep_until(self.deadline) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "flow duration elapsed",
            )),
            sent = self.socket.send_to(buf, self.dest) => sent,
        }
    }
}
