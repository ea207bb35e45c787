//! Inbound demultiplexer.
//!
//! One task per relay transport reads every datagram and decides where it
//! goes: control messages are handled by tag, data frames addressed to this
//! host are delivered to the connection found by sender hash, frames for a
//! peer this host relays for are forwarded untouched. Anything else is
//! dropped without surfacing an error; lookup misses are expected while
//! reconciliation and traffic race.

use crate::conn::ProxyMode;
use crate::context::ProxyContext;
use crate::manager::ManagerEvent;
use crate::packet::{ControlMessage, Inbound, classify};
use meshproxy_transport::RelayTransport;
use meshproxy_turn::Signal;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Outcome of handling one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to a local connection
    Delivered,
    /// Forwarded to a relayed peer
    Forwarded,
    /// Control message handled
    Control,
    /// Waiting peer promoted
    Promoted,
    /// Dropped
    Dropped,
}

/// Routes inbound datagrams of one transport
pub struct Demux {
    ctx: Arc<ProxyContext>,
    transport: Arc<dyn RelayTransport>,
    mode: ProxyMode,
    events: mpsc::Sender<ManagerEvent>,
}

impl Demux {
    /// Demultiplexer for `transport`, carrying `mode` traffic
    #[must_use]
    pub fn new(
        ctx: Arc<ProxyContext>,
        transport: Arc<dyn RelayTransport>,
        mode: ProxyMode,
        events: mpsc::Sender<ManagerEvent>,
    ) -> Self {
        Self {
            ctx,
            transport,
            mode,
            events,
        }
    }

    /// Read until shutdown or until the transport closes
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let size = self.ctx.settings().max_packet_size + crate::packet::TRAILER_LEN;
        let mut buf = vec![0u8; size];

        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.transport.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, from)) => {
                    self.dispatch(&buf[..len], from).await;
                }
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    warn!("{} transport receive error: {}", self.transport.kind(), e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        debug!("{} demultiplexer stopped", self.transport.kind());
    }

    /// Handle one datagram
    pub async fn dispatch(&self, datagram: &[u8], from: SocketAddr) -> Dispatch {
        match classify(datagram) {
            Ok(Inbound::Control(control)) => self.control(control, datagram, from).await,
            Ok(Inbound::Data {
                payload_len,
                sender,
                receiver,
            }) => {
                if receiver != *self.ctx.local_hash() {
                    return self.forward(datagram, &receiver).await;
                }

                if let Some(conn) = self.ctx.conn_by_hash(&sender) {
                    return match conn.proxy.deliver(&datagram[..payload_len]).await {
                        Ok(()) => Dispatch::Delivered,
                        Err(e) => {
                            debug!("Delivery to {} failed: {}", conn.key.short(), e);
                            Dispatch::Dropped
                        }
                    };
                }

                if let Some(waiting) = self.ctx.waiting_by_hash(&sender) {
                    debug!("First frame from waiting peer {}", waiting.key.short());
                    let promote = ManagerEvent::Promote {
                        key: waiting.key,
                        observed: from,
                        mode: self.mode,
                    };
                    if self.events.send(promote).await.is_ok() {
                        return Dispatch::Promoted;
                    }
                }

                trace!("No connection for sender {}", sender);
                Dispatch::Dropped
            }
            Err(_) => {
                trace!("Dropping {} unframed bytes from {}", datagram.len(), from);
                Dispatch::Dropped
            }
        }
    }

    async fn forward(&self, datagram: &[u8], receiver: &crate::keys::KeyHash) -> Dispatch {
        let Some(target) = self.ctx.relayed_by_hash(receiver) else {
            trace!("Frame for unknown receiver {}", receiver);
            return Dispatch::Dropped;
        };

        match self.transport.send_to(datagram, target).await {
            Ok(_) => Dispatch::Forwarded,
            Err(e) => {
                debug!("Relay forward to {} failed: {}", target, e);
                Dispatch::Dropped
            }
        }
    }

    async fn control(&self, control: ControlMessage, raw: &[u8], from: SocketAddr) -> Dispatch {
        if control.epoch() != self.ctx.epoch() {
            trace!(
                "Control message for epoch {} (current {})",
                control.epoch(),
                self.ctx.epoch()
            );
            return Dispatch::Dropped;
        }

        let local = *self.ctx.local_key();
        match control {
            ControlMessage::Metric(probe) if probe.sender == local => {
                // Our own probe, echoed back
                let rtt = Duration::from_millis(Signal::now_millis().saturating_sub(probe.timestamp_ms));
                let Some(conn) = self.ctx.conn(&probe.receiver) else {
                    return Dispatch::Dropped;
                };
                self.ctx
                    .metrics()
                    .record_latency(&conn.network, &probe.receiver, rtt);
                Dispatch::Control
            }
            ControlMessage::Metric(probe) if probe.receiver == local => {
                if let Err(e) = self.transport.send_to(raw, from).await {
                    debug!("Probe echo to {} failed: {}", from, e);
                }
                Dispatch::Control
            }
            ControlMessage::EndpointUpdate(update) if update.receiver == local => {
                let Ok(port) = u16::try_from(update.port) else {
                    return Dispatch::Dropped;
                };
                let event = ManagerEvent::EndpointUpdate {
                    key: update.sender,
                    port,
                };
                if self.events.send(event).await.is_err() {
                    return Dispatch::Dropped;
                }
                Dispatch::Control
            }
            _ => Dispatch::Dropped,
        }
    }
}
