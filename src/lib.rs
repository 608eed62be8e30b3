//! udpmeter -- UDP throughput and packet-rate meter.
//!
//! A client runs one or more rate-limited send (and optionally receive) pumps
//! per connection; a server demultiplexes every inbound datagram by peer
//! address on a single socket, tracks each peer's flow until its negotiated
//! duration runs out, and can write back to every peer in duplex mode.
//! Per-flow averages are summed into process-wide aggregates.

pub mod account;
pub mod aggregate;
pub mod client;
pub mod config;
pub mod pump;
pub mod server;
pub mod wire;
