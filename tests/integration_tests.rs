//! Integration tests for reconciliation, connection lifecycle and routing.
//!
//! Every test runs on loopback: the WireGuard device is in memory and a plain
//! UDP socket stands in for WireGuard's listen port.

use meshproxy_core::packet::{Inbound, classify, extract_frame, frame_for_send};
use meshproxy_core::{
    ControlMessage, Demux, Dispatch, EndpointUpdate, Manager, ManagerEvent, PeerUpdate,
    ProxyMode, ProxyRuntime, RelayedPeer, RuntimeOptions,
};
use meshproxy_integration_tests::fixtures::host::{
    TestHost, key, original_endpoint, proxied_peer, recv_timeout, snapshot, wait_until,
};
use meshproxy_transport::{RelayTransport, UdpTransport};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Read framed data (skipping probes) arriving at a fake remote proxy
async fn recv_data(remote: &UdpSocket) -> Option<(Vec<u8>, SocketAddr)> {
    for _ in 0..20 {
        let (datagram, from) = recv_timeout(remote, Duration::from_secs(2)).await?;
        if matches!(classify(&datagram), Ok(Inbound::Data { .. })) {
            return Some((datagram, from));
        }
    }
    None
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_new_proxied_peer_gets_one_loopback_conn() {
    let host = TestHost::with_server(1).await;
    let x = host.add_device_peer(2);
    let mut manager = Manager::new(host.ctx.clone(), None);

    let report = manager.reconcile(snapshot(1, vec![proxied_peer(2, 51722)])).await;

    assert_eq!(report.started, 1);
    assert_eq!(host.ctx.conn_count(), 1);
    let conn = host.conn(&x).unwrap();
    assert!(conn.local_addr.ip().is_loopback());
    assert_eq!(conn.mode, ProxyMode::Direct);
    assert_eq!(conn.remote, "127.0.0.1:51722".parse().unwrap());
    assert_eq!(host.device.endpoint(&x), Some(conn.local_addr));
    assert!(host.ctx.indexes_consistent());

    host.ctx.reset().await;
}

#[tokio::test]
async fn test_peer_missing_from_snapshot_is_removed() {
    let host = TestHost::with_server(1).await;
    let y = host.add_device_peer(3);
    let mut manager = Manager::new(host.ctx.clone(), None);
    manager.reconcile(snapshot(1, vec![proxied_peer(3, 51722)])).await;
    assert!(host.conn(&y).is_some());
    host.ctx.metrics().record_sent("net", &y, 8);
    host.ctx.set_peer_relay_addr(y, "203.0.113.1:49152".parse().unwrap());

    let report = manager.reconcile(snapshot(1, vec![])).await;

    assert_eq!(report.closed, 1);
    assert!(host.conn(&y).is_none());
    assert!(host.ctx.conn_by_hash(&y.hash()).is_none());
    assert!(host.ctx.config(&y).is_none());
    assert!(host.ctx.indexes_consistent());
    assert_eq!(host.device.endpoint(&y), Some(original_endpoint(3)));
    assert!(host.ctx.metrics().get("net", &y).is_none());
    assert!(host.ctx.metrics().snapshot().is_empty());
    assert!(host.ctx.peer_relay_addr(&y).is_none());

    // Frames from Y are no longer routed anywhere
    let (events, _rx) = mpsc::channel(4);
    let demux = Demux::new(
        host.ctx.clone(),
        host.ctx.proxy_server().unwrap(),
        ProxyMode::Direct,
        events,
    );
    let mut frame = b"late".to_vec();
    frame_for_send(&mut frame, &y.hash(), host.ctx.local_hash());
    let from = "127.0.0.1:51722".parse().unwrap();
    assert_eq!(demux.dispatch(&frame, from).await, Dispatch::Dropped);
}

#[tokio::test]
async fn test_remote_change_resets_in_place() {
    let host = TestHost::with_server(1).await;
    let z = host.add_device_peer(4);
    let r1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let r2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let r2_addr = r2.local_addr().unwrap();
    let mut manager = Manager::new(host.ctx.clone(), None);

    manager
        .reconcile(snapshot(1, vec![proxied_peer(4, r1.local_addr().unwrap().port())]))
        .await;
    let before = host.conn(&z).unwrap();

    let report = manager
        .reconcile(snapshot(1, vec![proxied_peer(4, r2_addr.port())]))
        .await;

    assert_eq!(report.reset, 1);
    assert_eq!(report.started, 0);
    assert_eq!(report.closed, 0);
    assert_eq!(host.ctx.conn_count(), 1);

    let after = host.conn(&z).unwrap();
    assert_eq!(after.key, before.key);
    assert_eq!(after.key_hash, before.key_hash);
    assert_eq!(after.remote, r2_addr);
    assert_eq!(host.device.endpoint(&z), Some(after.local_addr));
    assert!(host.ctx.indexes_consistent());

    host.wg_send(&z, b"after-reset").await;
    let (datagram, _) = recv_data(&r2).await.unwrap();
    let (len, sender, receiver) = extract_frame(&datagram, datagram.len()).unwrap();
    assert_eq!(&datagram[..len], b"after-reset");
    assert_eq!(sender, host.key.hash());
    assert_eq!(receiver, z.hash());

    host.ctx.reset().await;
}

#[tokio::test]
async fn test_short_datagram_is_not_a_frame() {
    let datagram = [0u8; 10];
    assert!(extract_frame(&datagram, datagram.len()).is_err());
    assert!(classify(&datagram).is_err());
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let host = TestHost::with_server(1).await;
    host.add_device_peer(2);
    host.add_device_peer(3);
    let mut manager = Manager::new(host.ctx.clone(), None);
    let update = snapshot(2, vec![proxied_peer(2, 51722), proxied_peer(3, 51723)]);

    let first = manager.reconcile(update.clone()).await;
    assert_eq!(first.started, 2);
    let rewrites = host.device.rewrites().len();

    let second = manager.reconcile(update).await;
    assert!(second.is_noop(), "{second:?}");
    assert_eq!(host.device.rewrites().len(), rewrites);
    assert_eq!(host.ctx.conn_count(), 2);

    host.ctx.reset().await;
}

#[tokio::test]
async fn test_proxy_flag_off_closes_conn() {
    let host = TestHost::with_server(1).await;
    let x = host.add_device_peer(2);
    let mut manager = Manager::new(host.ctx.clone(), None);
    manager.reconcile(snapshot(1, vec![proxied_peer(2, 51722)])).await;

    let mut peer = proxied_peer(2, 51722);
    peer.proxy = false;
    let report = manager.reconcile(snapshot(1, vec![peer])).await;

    assert_eq!(report.closed, 1);
    assert!(host.conn(&x).is_none());
    assert_eq!(host.device.endpoint(&x), Some(original_endpoint(2)));
}

#[tokio::test]
async fn test_setup_failure_leaves_peer_unproxied() {
    let host = TestHost::with_server(1).await;
    // Not configured on the device, so the endpoint rewrite fails
    let unknown = key(9);
    let mut manager = Manager::new(host.ctx.clone(), None);

    let report = manager.reconcile(snapshot(1, vec![proxied_peer(9, 51722)])).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.started, 0);
    assert!(host.conn(&unknown).is_none());
    assert!(host.ctx.config(&unknown).is_none());
    assert!(host.ctx.indexes_consistent());
}

#[tokio::test]
async fn test_without_server_nothing_starts() {
    let host = TestHost::new(1).await;
    host.add_device_peer(2);
    let mut manager = Manager::new(host.ctx.clone(), None);

    let report = manager.reconcile(snapshot(1, vec![proxied_peer(2, 51722)])).await;

    assert_eq!(report.failed, 1);
    assert_eq!(host.ctx.conn_count(), 0);
    assert!(host.device.rewrites().is_empty());
}

#[tokio::test]
async fn test_relayed_peer_targets_relay_endpoint() {
    let host = TestHost::with_server(1).await;
    let x = host.add_device_peer(2);
    let relay: SocketAddr = "127.0.0.1:52000".parse().unwrap();
    let mut manager = Manager::new(host.ctx.clone(), None);

    let mut peer = proxied_peer(2, 51722);
    peer.is_relayed = true;
    peer.relay_endpoint = Some(relay);
    manager.reconcile(snapshot(1, vec![peer])).await;

    let conn = host.conn(&x).unwrap();
    assert_eq!(conn.remote, relay);
    assert!(conn.is_relayed);

    host.ctx.reset().await;
}

#[tokio::test]
async fn test_relay_host_tracks_relayed_peers() {
    let host = TestHost::with_server(1).await;
    let relayed = key(7);
    let target: SocketAddr = "127.0.0.1:53000".parse().unwrap();
    let mut manager = Manager::new(host.ctx.clone(), None);

    let mut update = snapshot(1, vec![]);
    update.is_relay = true;
    update.relayed_peers = vec![RelayedPeer {
        public_key: relayed,
        endpoint: target,
    }];
    manager.reconcile(update).await;
    assert_eq!(host.ctx.relayed_by_hash(&relayed.hash()), Some(target));

    manager.reconcile(snapshot(1, vec![])).await;
    assert!(host.ctx.relayed_by_hash(&relayed.hash()).is_none());
}

#[tokio::test]
async fn test_dead_conn_is_repaired() {
    let host = TestHost::with_server(1).await;
    let x = host.add_device_peer(2);
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let update = snapshot(1, vec![proxied_peer(2, remote.local_addr().unwrap().port())]);
    let mut manager = Manager::new(host.ctx.clone(), None);
    manager.reconcile(update.clone()).await;

    // Pull the transport out from under the pump
    host.ctx.proxy_server().unwrap().close().await.unwrap();
    host.wg_send(&x, b"doomed").await;
    let conn = host.conn(&x).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !conn.proxy.is_alive()).await);

    host.install_server().await;
    let report = manager.reconcile(update).await;

    assert_eq!(report.reset, 1);
    assert!(host.conn(&x).unwrap().proxy.is_alive());
    host.wg_send(&x, b"repaired").await;
    let (datagram, _) = recv_data(&remote).await.unwrap();
    let (len, _, _) = extract_frame(&datagram, datagram.len()).unwrap();
    assert_eq!(&datagram[..len], b"repaired");

    host.ctx.reset().await;
}

// ============================================================================
// External clients and endpoint updates
// ============================================================================

fn ext_client(seed: u8) -> PeerUpdate {
    let mut peer = proxied_peer(seed, 0);
    peer.is_ext_client = true;
    peer.endpoint = None;
    peer
}

#[tokio::test]
async fn test_ext_client_waits_until_first_frame() {
    let host = TestHost::with_server(1).await;
    let client = host.add_device_peer(5);
    let mut manager = Manager::new(host.ctx.clone(), None);
    let update = snapshot(1, vec![ext_client(5)]);

    manager.reconcile(update.clone()).await;
    assert!(host.conn(&client).is_none());
    assert_eq!(host.ctx.waiting_count(), 1);

    let (events, mut rx) = mpsc::channel(4);
    let demux = Demux::new(
        host.ctx.clone(),
        host.ctx.proxy_server().unwrap(),
        ProxyMode::Direct,
        events,
    );
    let observed: SocketAddr = "127.0.0.1:54000".parse().unwrap();
    let mut frame = b"handshake".to_vec();
    frame_for_send(&mut frame, &client.hash(), host.ctx.local_hash());
    assert_eq!(demux.dispatch(&frame, observed).await, Dispatch::Promoted);

    manager.handle(rx.recv().await.unwrap()).await;
    let conn = host.conn(&client).unwrap();
    assert_eq!(conn.remote, observed);
    assert_eq!(host.ctx.waiting_count(), 0);

    // The next snapshot keeps the promoted connection as is
    let report = manager.reconcile(update).await;
    assert!(report.is_noop(), "{report:?}");
    assert_eq!(host.conn(&client).unwrap().remote, observed);

    host.ctx.reset().await;
}

#[tokio::test]
async fn test_endpoint_update_moves_conn() {
    let host = TestHost::with_server(1).await;
    let x = host.add_device_peer(2);
    let old = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let new = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let update = snapshot(1, vec![proxied_peer(2, old.local_addr().unwrap().port())]);
    let mut manager = Manager::new(host.ctx.clone(), None);
    manager.reconcile(update.clone()).await;

    manager
        .handle(ManagerEvent::EndpointUpdate {
            key: x,
            port: new.local_addr().unwrap().port(),
        })
        .await;
    assert_eq!(host.conn(&x).unwrap().remote, new.local_addr().unwrap());

    // The announced port sticks across snapshots that still carry the old one
    assert!(manager.reconcile(update).await.is_noop());

    host.wg_send(&x, b"moved").await;
    let (datagram, _) = recv_data(&new).await.unwrap();
    let (len, _, _) = extract_frame(&datagram, datagram.len()).unwrap();
    assert_eq!(&datagram[..len], b"moved");

    host.ctx.reset().await;
}

#[tokio::test]
async fn test_port_mismatch_is_announced() {
    let host = TestHost::with_server(1).await;
    let x = host.add_device_peer(2);
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bound = host.ctx.proxy_server().unwrap().local_addr().unwrap().port();
    let mut manager = Manager::new(host.ctx.clone(), None);

    let mut update = snapshot(3, vec![proxied_peer(2, remote.local_addr().unwrap().port())]);
    update.proxy_listen_port = bound.wrapping_add(1).max(1);
    manager.reconcile(update).await;

    let mut announced = None;
    for _ in 0..20 {
        let Some((datagram, _)) = recv_timeout(&remote, Duration::from_secs(2)).await else {
            break;
        };
        if let Ok(Inbound::Control(ControlMessage::EndpointUpdate(msg))) = classify(&datagram) {
            announced = Some(msg);
            break;
        }
    }

    assert_eq!(
        announced,
        Some(EndpointUpdate {
            epoch: 3,
            sender: host.key,
            receiver: x,
            port: u32::from(bound),
        })
    );

    host.ctx.reset().await;
}

// ============================================================================
// Full runtime
// ============================================================================

#[tokio::test]
async fn test_two_hosts_exchange_packets() {
    let a = TestHost::new(1).await;
    let b = TestHost::new(2).await;
    a.device.add_peer(b.key, Some(original_endpoint(2)));
    b.device.add_peer(a.key, Some(original_endpoint(1)));

    let ra = ProxyRuntime::start(a.ctx.clone(), RuntimeOptions::default())
        .await
        .unwrap();
    let rb = ProxyRuntime::start(b.ctx.clone(), RuntimeOptions::default())
        .await
        .unwrap();

    ra.apply(snapshot(1, vec![proxied_peer(2, rb.server_addr().port())]))
        .await
        .unwrap();
    rb.apply(snapshot(1, vec![proxied_peer(1, ra.server_addr().port())]))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || a.conn(&b.key).is_some()).await);
    assert!(wait_until(Duration::from_secs(2), || b.conn(&a.key).is_some()).await);

    a.wg_send(&b.key, b"\x04\x00\x00\x00a-to-b").await;
    let (payload, from) = b.wg_recv().await.unwrap();
    assert_eq!(payload, b"\x04\x00\x00\x00a-to-b");
    assert_eq!(from, b.conn(&a.key).unwrap().local_addr);

    b.wg_send(&a.key, b"\x04\x00\x00\x00b-to-a").await;
    let (payload, _) = a.wg_recv().await.unwrap();
    assert_eq!(payload, b"\x04\x00\x00\x00b-to-a");

    let metrics = a.ctx.metrics();
    assert_eq!(metrics.get("net", &b.key).unwrap().bytes_sent, 10);
    assert_eq!(metrics.get("net", &b.key).unwrap().bytes_received, 10);

    // Probes are echoed by the other side
    assert!(
        wait_until(Duration::from_secs(3), || {
            metrics.get("net", &b.key).is_some_and(|m| m.connected && m.latency.is_some())
        })
        .await
    );

    ra.shutdown().await;
    rb.shutdown().await;
}

#[tokio::test]
async fn test_runtime_shutdown_and_restart() {
    let host = TestHost::new(1).await;
    let x = host.add_device_peer(2);

    for _ in 0..2 {
        let runtime = ProxyRuntime::start(host.ctx.clone(), RuntimeOptions::default())
            .await
            .unwrap();
        assert!(!runtime.has_turn());
        runtime
            .apply(snapshot(1, vec![proxied_peer(2, 51722)]))
            .await
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || host.conn(&x).is_some()).await);
        assert_ne!(host.device.endpoint(&x), Some(original_endpoint(2)));

        runtime.shutdown().await;

        assert_eq!(host.ctx.conn_count(), 0);
        assert!(host.ctx.proxy_server().is_none());
        assert_eq!(host.ctx.epoch(), 0);
        assert_eq!(host.device.endpoint(&x), Some(original_endpoint(2)));
    }
}

#[tokio::test]
async fn test_restart_rebinds_fixed_port() {
    let port = {
        let scratch = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        scratch.local_addr().unwrap().port()
    };
    let host = TestHost::with_settings(1, |s| s.proxy_listen_port = port).await;
    let x = host.add_device_peer(2);
    let fixed = SocketAddr::from(([127, 0, 0, 1], port));

    for _ in 0..2 {
        let runtime = ProxyRuntime::start(host.ctx.clone(), RuntimeOptions::default())
            .await
            .unwrap();
        assert_eq!(runtime.server_addr(), fixed);
        runtime
            .apply(snapshot(1, vec![proxied_peer(2, 51722)]))
            .await
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || host.conn(&x).is_some()).await);

        // The live server owns the port exclusively
        assert!(UdpTransport::bind(fixed).await.is_err());
        assert!(ProxyRuntime::start(host.ctx.clone(), RuntimeOptions::default())
            .await
            .is_err());

        runtime.shutdown().await;
    }
}

#[tokio::test]
async fn test_runtime_rejects_invalid_settings() {
    let host = TestHost::with_settings(1, |s| s.keepalive_interval = Duration::ZERO).await;
    let result = ProxyRuntime::start(host.ctx.clone(), RuntimeOptions::default()).await;
    assert!(result.is_err());
    assert!(host.ctx.proxy_server().is_none());
}
