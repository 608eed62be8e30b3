//! End-to-end sessions over the loopback interface.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use udpmeter::client::{self, ClientSettings};
use udpmeter::server::{Server, ServerReport, ServerSettings};
use udpmeter::wire::{encode_options, FlowOptions};

fn options() -> FlowOptions {
    FlowOptions {
        report_interval: Duration::from_millis(200),
        total_duration: Duration::from_millis(600),
        read_size: 2048,
        write_size: 512,
        max_speed_bps: 8_000_000,
    }
}

async fn start_server(
    duplex: bool,
) -> (
    std::net::SocketAddr,
    CancellationToken,
    tokio::task::JoinHandle<anyhow::Result<ServerReport>>,
) {
    let server = assert_ok!(
        Server::bind(ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            duplex,
            read_size: 2048,
            sweep_interval: Duration::from_millis(100),
        })
        .await
    );
    let addr = assert_ok!(server.local_addr());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));
    (addr, shutdown, handle)
}

#[tokio::test]
async fn test_parallel_connections_are_tracked_separately() {
    let (addr, shutdown, handle) = start_server(false).await;

    let settings = ClientSettings {
        target: addr.to_string(),
        local: Some("127.0.0.1:0".to_string()),
        connections: 2,
        duplex: false,
        options: options(),
    };
    let report = assert_ok!(client::run(&settings).await);
    assert_eq!(report.connections, 2);
    assert_eq!(report.sent.flows, 2);
    assert!(report.sent.cps > 0);
    assert!(report.received.is_none());

    // Both flows have run their course well before shutdown.
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();

    let server = assert_ok!(assert_ok!(handle.await));
    assert_eq!(server.flows_opened, 2);
    assert_eq!(server.flows_expired, 2);
    assert_eq!(server.flows_drained, 0);
    assert_eq!(server.received.flows, 2);
    assert!(server.received.cps > 0);
    assert_eq!(server.sent.flows, 0);
}

#[tokio::test]
async fn test_duplex_session_writes_back() {
    let (addr, shutdown, handle) = start_server(true).await;

    let settings = ClientSettings {
        target: addr.to_string(),
        local: Some("127.0.0.1:0".to_string()),
        connections: 1,
        duplex: true,
        options: options(),
    };
    let report = assert_ok!(client::run(&settings).await);
    assert_eq!(report.connections, 1);
    let received = report.received.expect("duplex client reports receive totals");
    assert_eq!(received.flows, 1);
    assert!(received.cps > 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();

    let server = assert_ok!(assert_ok!(handle.await));
    assert_eq!(server.flows_opened, 1);
    assert_eq!(server.sent.flows, 1);
    assert!(server.sent.cps > 0);
}

#[tokio::test]
async fn test_sweep_reclaims_silent_peer() {
    let (addr, shutdown, handle) = start_server(false).await;

    // Negotiate a short flow, send a little, then go quiet for good.
    let peer = assert_ok!(UdpSocket::bind("127.0.0.1:0").await);
    assert_ok!(peer.connect(addr).await);
    let opts = FlowOptions {
        total_duration: Duration::from_millis(200),
        ..options()
    };
    assert_ok!(peer.send(&assert_ok!(encode_options(&opts))).await);
    for _ in 0..10 {
        assert_ok!(peer.send(&[0u8; 512]).await);
    }

    // Only the sweep can notice the flow ended.
    tokio::time::sleep(Duration::from_millis(600)).await;
    shutdown.cancel();

    let server = assert_ok!(assert_ok!(handle.await));
    assert_eq!(server.flows_opened, 1);
    assert_eq!(server.flows_expired, 1);
    assert_eq!(server.flows_drained, 0);
    assert_eq!(server.received.flows, 1);
}

#[tokio::test]
async fn test_active_flow_drained_at_shutdown() {
    let (addr, shutdown, handle) = start_server(false).await;

    let peer = assert_ok!(UdpSocket::bind("127.0.0.1:0").await);
    assert_ok!(peer.connect(addr).await);
    let opts = FlowOptions {
        total_duration: Duration::from_secs(60),
        ..options()
    };
    assert_ok!(peer.send(&assert_ok!(encode_options(&opts))).await);
    assert_ok!(peer.send(&[0u8; 512]).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();

    let server = assert_ok!(assert_ok!(handle.await));
    assert_eq!(server.flows_opened, 1);
    assert_eq!(server.flows_expired, 0);
    assert_eq!(server.flows_drained, 1);
    assert_eq!(server.received.flows, 1);
}

#[tokio::test]
async fn test_shutdown_with_no_traffic() {
    let (_addr, shutdown, handle) = start_server(true).await;
    shutdown.cancel();

    let server = assert_ok!(assert_ok!(handle.await));
    assert_eq!(server.flows_opened, 0);
    assert_eq!(server.received.flows, 0);
    assert_eq!(server.sent.flows, 0);
}
