//! In-process TURN server.
//!
//! Accepts every request without authentication, hands out a fixed relayed
//! address and reports Send indications on a channel. Data indications can
//! be pushed to the client that allocated.

use meshproxy_turn::stun::{StunAttribute, StunMessage, StunMessageClass, StunMethod};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Relayed address handed to every client
pub const RELAYED: &str = "203.0.113.9:49152";

/// Fake TURN server bound on loopback
pub struct FakeTurnServer {
    /// Server address
    pub addr: SocketAddr,
    socket: Arc<UdpSocket>,
    client: Arc<Mutex<Option<SocketAddr>>>,
    /// `(peer address, data)` of every Send indication
    pub sends: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
    /// Lifetime of every Refresh request
    pub refreshes: mpsc::UnboundedReceiver<u32>,
}

impl FakeTurnServer {
    /// Bind and start answering
    pub async fn start() -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let client = Arc::new(Mutex::new(None));
        let (send_tx, sends) = mpsc::unbounded_channel();
        let (refresh_tx, refreshes) = mpsc::unbounded_channel();

        let server_socket = socket.clone();
        let server_client = client.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let Ok((len, from)) = server_socket.recv_from(&mut buf).await else {
                    break;
                };
                server_client.lock().unwrap().get_or_insert(from);
                let Ok(msg) = StunMessage::decode(&buf[..len]) else {
                    continue;
                };

                let reply = match (msg.method, msg.class) {
                    (StunMethod::Send, StunMessageClass::Indication) => {
                        if let (Some(peer), Some(data)) = (msg.peer_address(), msg.data()) {
                            let _ = send_tx.send((peer, data.to_vec()));
                        }
                        continue;
                    }
                    (StunMethod::Allocate, StunMessageClass::Request) => StunMessage::success_for(&msg)
                        .with(StunAttribute::XorRelayedAddress(RELAYED.parse().unwrap()))
                        .with(StunAttribute::XorMappedAddress(from))
                        .with(StunAttribute::Lifetime(600)),
                    (StunMethod::Refresh, StunMessageClass::Request) => {
                        let lifetime = msg.lifetime().unwrap_or(600);
                        let _ = refresh_tx.send(lifetime);
                        StunMessage::success_for(&msg).with(StunAttribute::Lifetime(lifetime))
                    }
                    (StunMethod::Binding, StunMessageClass::Request) => {
                        StunMessage::success_for(&msg).with(StunAttribute::XorMappedAddress(from))
                    }
                    (_, StunMessageClass::Request) => StunMessage::success_for(&msg),
                    _ => continue,
                };
                let _ = server_socket.send_to(&reply.encode(), from).await;
            }
        });

        Self {
            addr,
            socket,
            client,
            sends,
            refreshes,
        }
    }

    /// Relay `data` from `peer` to the allocating client
    pub async fn push_data(&self, peer: SocketAddr, data: &[u8]) {
        let client = self.client.lock().unwrap().expect("no client yet");
        let indication = StunMessage::new(StunMethod::Data, StunMessageClass::Indication)
            .with(StunAttribute::XorPeerAddress(peer))
            .with(StunAttribute::Data(data.to_vec()))
            .encode();
        self.socket.send_to(&indication, client).await.unwrap();
    }
}
