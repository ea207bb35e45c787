//! Wire protocol for relayed traffic.
//!
//! Relayed WireGuard packets are made self-describing by appending a fixed
//! trailer, so the receiving proxy can route them without touching the
//! encrypted payload:
//!
//! ```text
//! +---------------------+-----------+-------------------+---------------------+
//! | WireGuard packet    | type (5)  | sender KeyHash    | receiver KeyHash    |
//! | (unchanged)         | u32 LE    | 16 bytes          | 16 bytes            |
//! +---------------------+-----------+-------------------+---------------------+
//! ```
//!
//! Control messages exchanged between proxies start with their own type tag
//! and have a fixed length per tag:
//!
//! ```text
//! endpoint update (76): [7][epoch u32][sender key 32][receiver key 32][port u32]
//! metric probe    (84): [6][probe id u32][epoch u32][sender key 32][receiver key 32][timestamp ms u64]
//! ```
//!
//! All integers are little-endian. WireGuard's own message types are 1..=4,
//! so a datagram is only a control message if it starts with tag 6 or 7 and
//! has exactly that tag's length.

use crate::error::FrameError;
use crate::keys::{HASH_LEN, KEY_LEN, KeyHash, PeerKey};

/// Data-relay frame tag
pub const MSG_DATA: u32 = 5;

/// Metric probe tag
pub const MSG_METRIC: u32 = 6;

/// Endpoint update tag
pub const MSG_ENDPOINT_UPDATE: u32 = 7;

/// Data trailer length
pub const TRAILER_LEN: usize = 4 + 2 * HASH_LEN;

/// Endpoint update length
pub const ENDPOINT_UPDATE_LEN: usize = 4 + 4 + 2 * KEY_LEN + 4;

/// Metric probe length
pub const METRIC_PROBE_LEN: usize = 4 + 4 + 4 + 2 * KEY_LEN + 8;

/// Append the data trailer to `buf`.
///
/// Payload bytes are untouched. Spare capacity is reused; otherwise the
/// vector grows.
pub fn frame_for_send(buf: &mut Vec<u8>, sender: &KeyHash, receiver: &KeyHash) {
    buf.reserve(TRAILER_LEN);
    buf.extend_from_slice(&MSG_DATA.to_le_bytes());
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(receiver.as_bytes());
}

/// Write the data trailer after the first `len` bytes of a fixed buffer.
///
/// Returns the framed length.
///
/// # Errors
///
/// Returns `FrameError::BufferTooSmall` if fewer than [`TRAILER_LEN`] bytes
/// remain after `len`
pub fn frame_in_place(
    buf: &mut [u8],
    len: usize,
    sender: &KeyHash,
    receiver: &KeyHash,
) -> Result<usize, FrameError> {
    let end = len + TRAILER_LEN;
    if end > buf.len() {
        return Err(FrameError::BufferTooSmall);
    }

    buf[len..len + 4].copy_from_slice(&MSG_DATA.to_le_bytes());
    buf[len + 4..len + 4 + HASH_LEN].copy_from_slice(sender.as_bytes());
    buf[len + 4 + HASH_LEN..end].copy_from_slice(receiver.as_bytes());
    Ok(end)
}

/// Read the data trailer from the tail of `buf[..len]`.
///
/// Returns the payload length with the trailer stripped, and the sender and
/// receiver hashes.
///
/// # Errors
///
/// Returns `FrameError::FrameNotFound` if the datagram is shorter than the
/// trailer or the tag is not the data tag
pub fn extract_frame(buf: &[u8], len: usize) -> Result<(usize, KeyHash, KeyHash), FrameError> {
    let len = len.min(buf.len());
    if len < TRAILER_LEN {
        return Err(FrameError::FrameNotFound);
    }

    let start = len - TRAILER_LEN;
    let tag = read_u32(&buf[start..start + 4]);
    if tag != MSG_DATA {
        return Err(FrameError::FrameNotFound);
    }

    let sender = read_hash(&buf[start + 4..start + 4 + HASH_LEN]);
    let receiver = read_hash(&buf[start + 4 + HASH_LEN..len]);
    Ok((start, sender, receiver))
}

/// Announces the port a host's proxy server is actually bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointUpdate {
    /// Network epoch the sender is on
    pub epoch: u32,
    /// Announcing host's key
    pub sender: PeerKey,
    /// Addressed host's key
    pub receiver: PeerKey,
    /// Proxy listen port to use from now on
    pub port: u32,
}

/// Latency probe, echoed unchanged by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricProbe {
    /// Probe sequence number
    pub probe_id: u32,
    /// Network epoch the sender is on
    pub epoch: u32,
    /// Probing host's key
    pub sender: PeerKey,
    /// Probed host's key
    pub receiver: PeerKey,
    /// Send time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Proxy-to-proxy control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Endpoint update
    EndpointUpdate(EndpointUpdate),
    /// Metric probe or its echo
    Metric(MetricProbe),
}

impl ControlMessage {
    /// Network epoch carried by the message
    #[must_use]
    pub fn epoch(&self) -> u32 {
        match self {
            Self::EndpointUpdate(m) => m.epoch,
            Self::Metric(m) => m.epoch,
        }
    }

    /// Encode to wire bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::EndpointUpdate(m) => {
                let mut buf = Vec::with_capacity(ENDPOINT_UPDATE_LEN);
                buf.extend_from_slice(&MSG_ENDPOINT_UPDATE.to_le_bytes());
                buf.extend_from_slice(&m.epoch.to_le_bytes());
                buf.extend_from_slice(m.sender.as_bytes());
                buf.extend_from_slice(m.receiver.as_bytes());
                buf.extend_from_slice(&m.port.to_le_bytes());
                buf
            }
            Self::Metric(m) => {
                let mut buf = Vec::with_capacity(METRIC_PROBE_LEN);
                buf.extend_from_slice(&MSG_METRIC.to_le_bytes());
                buf.extend_from_slice(&m.probe_id.to_le_bytes());
                buf.extend_from_slice(&m.epoch.to_le_bytes());
                buf.extend_from_slice(m.sender.as_bytes());
                buf.extend_from_slice(m.receiver.as_bytes());
                buf.extend_from_slice(&m.timestamp_ms.to_le_bytes());
                buf
            }
        }
    }

    /// Decode by leading type tag.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::FrameNotFound` if the tag is not a control tag
    /// and `FrameError::Malformed` if the length does not match the tag
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < 4 {
            return Err(FrameError::FrameNotFound);
        }

        match read_u32(&buf[..4]) {
            MSG_ENDPOINT_UPDATE => {
                if buf.len() != ENDPOINT_UPDATE_LEN {
                    return Err(FrameError::Malformed);
                }
                Ok(Self::EndpointUpdate(EndpointUpdate {
                    epoch: read_u32(&buf[4..8]),
                    sender: read_key(&buf[8..8 + KEY_LEN]),
                    receiver: read_key(&buf[8 + KEY_LEN..8 + 2 * KEY_LEN]),
                    port: read_u32(&buf[8 + 2 * KEY_LEN..]),
                }))
            }
            MSG_METRIC => {
                if buf.len() != METRIC_PROBE_LEN {
                    return Err(FrameError::Malformed);
                }
                let keys = 12;
                let mut ts = [0u8; 8];
                ts.copy_from_slice(&buf[keys + 2 * KEY_LEN..]);
                Ok(Self::Metric(MetricProbe {
                    probe_id: read_u32(&buf[4..8]),
                    epoch: read_u32(&buf[8..12]),
                    sender: read_key(&buf[keys..keys + KEY_LEN]),
                    receiver: read_key(&buf[keys + KEY_LEN..keys + 2 * KEY_LEN]),
                    timestamp_ms: u64::from_le_bytes(ts),
                }))
            }
            _ => Err(FrameError::FrameNotFound),
        }
    }
}

/// What an inbound datagram turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Control message
    Control(ControlMessage),
    /// Framed data; payload is `buf[..payload_len]`
    Data {
        /// Payload length without trailer
        payload_len: usize,
        /// Sender hash
        sender: KeyHash,
        /// Receiver hash
        receiver: KeyHash,
    },
}

/// Classify a datagram: control messages first, then the data trailer.
///
/// # Errors
///
/// Returns `FrameError` for anything that is neither
pub fn classify(buf: &[u8]) -> Result<Inbound, FrameError> {
    match ControlMessage::decode(buf) {
        Ok(control) => return Ok(Inbound::Control(control)),
        Err(FrameError::Malformed) | Err(FrameError::FrameNotFound) => {}
        Err(e) => return Err(e),
    }

    let (payload_len, sender, receiver) = extract_frame(buf, buf.len())?;
    Ok(Inbound::Data {
        payload_len,
        sender,
        receiver,
    })
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

#[inline]
fn read_hash(bytes: &[u8]) -> KeyHash {
    let mut raw = [0u8; HASH_LEN];
    raw.copy_from_slice(&bytes[..HASH_LEN]);
    KeyHash::from_bytes(raw)
}

#[inline]
fn read_key(bytes: &[u8]) -> PeerKey {
    let mut raw = [0u8; KEY_LEN];
    raw.copy_from_slice(&bytes[..KEY_LEN]);
    PeerKey::from_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (PeerKey, PeerKey) {
        (
            PeerKey::from_bytes([0xA1; KEY_LEN]),
            PeerKey::from_bytes([0xB2; KEY_LEN]),
        )
    }

    #[test]
    fn test_layout_sizes() {
        assert_eq!(TRAILER_LEN, 36);
        assert_eq!(ENDPOINT_UPDATE_LEN, 76);
        assert_eq!(METRIC_PROBE_LEN, 84);
    }

    #[test]
    fn test_frame_and_extract() {
        let (a, b) = keys();
        let payload = vec![4u8, 0, 0, 0, 9, 9, 9];
        let mut buf = payload.clone();
        frame_for_send(&mut buf, &a.hash(), &b.hash());

        assert_eq!(buf.len(), payload.len() + TRAILER_LEN);
        assert_eq!(&buf[..payload.len()], payload.as_slice());
        assert_eq!(&buf[payload.len()..payload.len() + 4], &[5, 0, 0, 0]);

        let (len, sender, receiver) = extract_frame(&buf, buf.len()).unwrap();
        assert_eq!(len, payload.len());
        assert_eq!(sender, a.hash());
        assert_eq!(receiver, b.hash());
    }

    #[test]
    fn test_frame_in_place() {
        let (a, b) = keys();
        let mut buf = [0u8; 64];
        buf[..3].copy_from_slice(&[1, 2, 3]);

        let framed = frame_in_place(&mut buf, 3, &a.hash(), &b.hash()).unwrap();
        assert_eq!(framed, 39);
        assert_eq!(extract_frame(&buf, framed).unwrap().0, 3);

        assert_eq!(
            frame_in_place(&mut buf, 40, &a.hash(), &b.hash()),
            Err(FrameError::BufferTooSmall)
        );
    }

    #[test]
    fn test_short_datagram_is_not_a_frame() {
        let buf = [5u8; 10];
        assert_eq!(extract_frame(&buf, 10), Err(FrameError::FrameNotFound));
        assert_eq!(classify(&buf), Err(FrameError::FrameNotFound));
    }

    #[test]
    fn test_wrong_tag_is_not_a_frame() {
        let (a, b) = keys();
        let mut buf = vec![1u8; 8];
        frame_for_send(&mut buf, &a.hash(), &b.hash());
        buf[8] = 9;
        assert_eq!(
            extract_frame(&buf, buf.len()),
            Err(FrameError::FrameNotFound)
        );
    }

    #[test]
    fn test_length_beyond_buffer_is_clamped() {
        let (a, b) = keys();
        let mut buf = vec![1u8; 4];
        frame_for_send(&mut buf, &a.hash(), &b.hash());
        assert_eq!(extract_frame(&buf, 1000).unwrap().0, 4);
    }

    #[test]
    fn test_endpoint_update_roundtrip() {
        let (a, b) = keys();
        let msg = ControlMessage::EndpointUpdate(EndpointUpdate {
            epoch: 3,
            sender: a,
            receiver: b,
            port: 51723,
        });
        let bytes = msg.encode();
        assert_eq!(bytes.len(), ENDPOINT_UPDATE_LEN);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
        assert_eq!(classify(&bytes).unwrap(), Inbound::Control(msg));
        assert_eq!(msg.epoch(), 3);
    }

    #[test]
    fn test_metric_probe_roundtrip() {
        let (a, b) = keys();
        let msg = ControlMessage::Metric(MetricProbe {
            probe_id: 17,
            epoch: 1,
            sender: a,
            receiver: b,
            timestamp_ms: 1_700_000_000_123,
        });
        let bytes = msg.encode();
        assert_eq!(bytes.len(), METRIC_PROBE_LEN);
        assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_control_tag_with_wrong_length_falls_through() {
        let (a, b) = keys();
        // Control tag, but length matches no control layout: treat as data
        let mut buf = vec![6u8, 0, 0, 0, 1];
        frame_for_send(&mut buf, &a.hash(), &b.hash());
        assert_eq!(
            ControlMessage::decode(&buf),
            Err(FrameError::Malformed)
        );
        assert!(matches!(
            classify(&buf).unwrap(),
            Inbound::Data { payload_len: 5, .. }
        ));
    }

    #[test]
    fn test_wireguard_packet_never_control() {
        let mut handshake = vec![0u8; 148];
        handshake[0] = 1;
        assert_eq!(
            ControlMessage::decode(&handshake),
            Err(FrameError::FrameNotFound)
        );
    }
}
