//! STUN/TURN message codec (RFC 5389, RFC 5766)
//!
//! Covers the subset of methods a relay client needs: Binding, Allocate,
//! Refresh, CreatePermission and the Send/Data indications, together with
//! long-term credential MESSAGE-INTEGRITY.
//!
//! MD5 and HMAC-SHA1 appear only where RFC 5389 Section 15.4 requires them:
//! long-term credential key derivation and MESSAGE-INTEGRITY.

use crate::error::StunError;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use zeroize::Zeroizing;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// REQUESTED-TRANSPORT protocol number for UDP
pub const TRANSPORT_UDP: u8 = 17;

/// Largest DATA payload a Send indication can carry.
///
/// Header, IPv6 XOR-PEER-ADDRESS and the DATA attribute header must still fit
/// one UDP datagram (65507 bytes), and the attribute length fits in 16 bits.
pub const MAX_DATA_LEN: usize = 65_456;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

/// STUN/TURN method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMethod {
    /// Binding (0x001)
    Binding,
    /// Allocate (0x003)
    Allocate,
    /// Refresh (0x004)
    Refresh,
    /// Send indication (0x006)
    Send,
    /// Data indication (0x007)
    Data,
    /// CreatePermission (0x008)
    CreatePermission,
}

impl StunMethod {
    /// Method name for logs and errors
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Binding => "Binding",
            Self::Allocate => "Allocate",
            Self::Refresh => "Refresh",
            Self::Send => "Send",
            Self::Data => "Data",
            Self::CreatePermission => "CreatePermission",
        }
    }

    fn code(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Allocate => 0x003,
            Self::Refresh => 0x004,
            Self::Send => 0x006,
            Self::Data => 0x007,
            Self::CreatePermission => 0x008,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0x001 => Some(Self::Binding),
            0x003 => Some(Self::Allocate),
            0x004 => Some(Self::Refresh),
            0x006 => Some(Self::Send),
            0x007 => Some(Self::Data),
            0x008 => Some(Self::CreatePermission),
            _ => None,
        }
    }

    /// Encode method and class into a 16-bit message type
    ///
    /// RFC 5389 Section 6 encoding:
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    fn encode(self, class: StunMessageClass) -> u16 {
        let method = self.code();

        let class_bits = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        let m0_m3 = method & 0x0F;
        let c0 = (class_bits & 0x01) << 4;
        let m4_m6 = (method & 0x70) << 1;
        let c1 = (class_bits & 0x02) << 7;
        let m7_m11 = (method & 0xF80) << 2;

        m0_m3 | c0 | m4_m6 | c1 | m7_m11
    }

    fn decode(msg_type: u16) -> Result<(Self, StunMessageClass), StunError> {
        let c0 = (msg_type >> 4) & 0x01;
        let c1 = (msg_type >> 8) & 0x01;

        let class = match c0 | (c1 << 1) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let m0_m3 = msg_type & 0x0F;
        let m4_m6 = (msg_type >> 1) & 0x70;
        let m7_m11 = (msg_type >> 2) & 0xF80;

        let method =
            Self::from_code(m0_m3 | m4_m6 | m7_m11).ok_or(StunError::InvalidMessageType)?;
        Ok((method, class))
    }
}

/// Long-term credentials (RFC 5389 Section 10.2)
///
/// The password is zeroized on drop.
#[derive(Clone, Debug)]
pub struct StunAuthentication {
    /// Username for authentication
    pub username: String,
    password: Zeroizing<String>,
    /// Realm announced by the server
    pub realm: Option<String>,
}

impl StunAuthentication {
    /// Create new credentials
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            realm,
        }
    }

    /// Same credentials bound to the realm the server challenged with
    #[must_use]
    pub fn with_realm(&self, realm: impl Into<String>) -> Self {
        Self {
            username: self.username.clone(),
            password: self.password.clone(),
            realm: Some(realm.into()),
        }
    }

    /// Derive the HMAC key for MESSAGE-INTEGRITY
    ///
    /// Long-term: MD5(username:realm:password). Short-term: the password.
    fn derive_key(&self) -> Zeroizing<Vec<u8>> {
        if let Some(realm) = &self.realm {
            use md5::Digest;
            let mut hasher = Md5::new();
            hasher.update(self.username.as_bytes());
            hasher.update(b":");
            hasher.update(realm.as_bytes());
            hasher.update(b":");
            hasher.update(self.password.as_bytes());
            Zeroizing::new(hasher.finalize().to_vec())
        } else {
            Zeroizing::new(self.password.as_bytes().to_vec())
        }
    }
}

/// STUN/TURN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001), decode only
    MappedAddress(SocketAddr),
    /// USERNAME (0x0006)
    Username(String),
    /// MESSAGE-INTEGRITY (0x0008)
    MessageIntegrity([u8; 20]),
    /// ERROR-CODE (0x0009)
    ErrorCode {
        /// Numeric code (e.g. 401)
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// LIFETIME (0x000D), seconds
    Lifetime(u32),
    /// XOR-PEER-ADDRESS (0x0012)
    XorPeerAddress(SocketAddr),
    /// DATA (0x0013)
    Data(Vec<u8>),
    /// REALM (0x0014)
    Realm(String),
    /// NONCE (0x0015)
    Nonce(String),
    /// XOR-RELAYED-ADDRESS (0x0016)
    XorRelayedAddress(SocketAddr),
    /// REQUESTED-TRANSPORT (0x0019)
    RequestedTransport(u8),
    /// XOR-MAPPED-ADDRESS (0x0020)
    XorMappedAddress(SocketAddr),
    /// SOFTWARE (0x8022)
    Software(String),
    /// Unknown or unsupported attribute
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => 0x0001,
            Self::Username(_) => 0x0006,
            Self::MessageIntegrity(_) => 0x0008,
            Self::ErrorCode { .. } => 0x0009,
            Self::Lifetime(_) => 0x000D,
            Self::XorPeerAddress(_) => 0x0012,
            Self::Data(_) => 0x0013,
            Self::Realm(_) => 0x0014,
            Self::Nonce(_) => 0x0015,
            Self::XorRelayedAddress(_) => 0x0016,
            Self::RequestedTransport(_) => 0x0019,
            Self::XorMappedAddress(_) => 0x0020,
            Self::Software(_) => 0x8022,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        let value = self.encode_value(transaction_id);

        let mut bytes = Vec::with_capacity(4 + value.len() + 3);
        bytes.extend_from_slice(&self.attr_type().to_be_bytes());
        bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&value);

        let padding = (4 - (value.len() % 4)) % 4;
        bytes.extend(std::iter::repeat_n(0, padding));

        bytes
    }

    fn encode_value(&self, transaction_id: &[u8; 12]) -> Vec<u8> {
        match self {
            Self::XorMappedAddress(addr)
            | Self::XorPeerAddress(addr)
            | Self::XorRelayedAddress(addr) => encode_xor_address(*addr, transaction_id),
            Self::MappedAddress(addr) => {
                let mut value = vec![0, if addr.is_ipv4() { 0x01 } else { 0x02 }];
                value.extend_from_slice(&addr.port().to_be_bytes());
                match addr.ip() {
                    IpAddr::V4(ip) => value.extend_from_slice(&ip.octets()),
                    IpAddr::V6(ip) => value.extend_from_slice(&ip.octets()),
                }
                value
            }
            Self::ErrorCode { code, reason } => {
                let mut value = vec![0, 0, (code / 100) as u8 & 0x07, (code % 100) as u8];
                value.extend_from_slice(reason.as_bytes());
                value
            }
            Self::Lifetime(secs) => secs.to_be_bytes().to_vec(),
            Self::RequestedTransport(proto) => vec![*proto, 0, 0, 0],
            Self::Username(s) | Self::Realm(s) | Self::Nonce(s) | Self::Software(s) => {
                s.as_bytes().to_vec()
            }
            Self::MessageIntegrity(hmac) => hmac.to_vec(),
            Self::Data(data) => data.clone(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    fn decode(attr_type: u16, value: &[u8], transaction_id: &[u8; 12]) -> Result<Self, StunError> {
        let text = || String::from_utf8_lossy(value).to_string();

        match attr_type {
            0x0001 => Ok(Self::MappedAddress(decode_plain_address(value)?)),
            0x0006 => Ok(Self::Username(text())),
            0x0008 => {
                let hmac: [u8; 20] = value
                    .try_into()
                    .map_err(|_| StunError::InvalidAttribute)?;
                Ok(Self::MessageIntegrity(hmac))
            }
            0x0009 => {
                if value.len() < 4 {
                    return Err(StunError::InvalidAttribute);
                }
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                let reason = String::from_utf8_lossy(&value[4..]).to_string();
                Ok(Self::ErrorCode { code, reason })
            }
            0x000D => {
                let secs: [u8; 4] = value
                    .try_into()
                    .map_err(|_| StunError::InvalidAttribute)?;
                Ok(Self::Lifetime(u32::from_be_bytes(secs)))
            }
            0x0012 => Ok(Self::XorPeerAddress(decode_xor_address(
                value,
                transaction_id,
            )?)),
            0x0013 => Ok(Self::Data(value.to_vec())),
            0x0014 => Ok(Self::Realm(text())),
            0x0015 => Ok(Self::Nonce(text())),
            0x0016 => Ok(Self::XorRelayedAddress(decode_xor_address(
                value,
                transaction_id,
            )?)),
            0x0019 => {
                let proto = *value.first().ok_or(StunError::InvalidAttribute)?;
                Ok(Self::RequestedTransport(proto))
            }
            0x0020 => Ok(Self::XorMappedAddress(decode_xor_address(
                value,
                transaction_id,
            )?)),
            0x8022 => Ok(Self::Software(text())),
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

fn xor_key(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut value = vec![0, if addr.is_ipv4() { 0x01 } else { 0x02 }];

    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    value.extend_from_slice(&xor_port.to_be_bytes());

    let key = xor_key(transaction_id);
    match addr.ip() {
        IpAddr::V4(ip) => value.extend(ip.octets().iter().zip(key).map(|(b, k)| b ^ k)),
        IpAddr::V6(ip) => value.extend(ip.octets().iter().zip(key).map(|(b, k)| b ^ k)),
    }

    value
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }

    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let key = xor_key(transaction_id);

    let ip = match value[1] {
        0x01 => {
            let raw: [u8; 4] = value
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            let mut octets = [0u8; 4];
            for i in 0..4 {
                octets[i] = raw[i] ^ key[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            let raw: [u8; 16] = value
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = raw[i] ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };

    Ok(SocketAddr::new(ip, port))
}

fn decode_plain_address(value: &[u8]) -> Result<SocketAddr, StunError> {
    if value.len() < 8 {
        return Err(StunError::InvalidAttribute);
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = match value[1] {
        0x01 => IpAddr::V4(Ipv4Addr::new(value[4], value[5], value[6], value[7])),
        0x02 => {
            let octets: [u8; 16] = value
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::InvalidAttribute)?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };
    Ok(SocketAddr::new(ip, port))
}

/// STUN/TURN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Method
    pub method: StunMethod,
    /// Message class
    pub class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; 12],
    /// Message attributes, in wire order
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a message with a random transaction ID
    #[must_use]
    pub fn new(method: StunMethod, class: StunMessageClass) -> Self {
        let mut transaction_id = [0u8; 12];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut transaction_id);

        Self {
            method,
            class,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a request for `method`
    #[must_use]
    pub fn request(method: StunMethod) -> Self {
        Self::new(method, StunMessageClass::Request)
    }

    /// Create a success response answering `request`
    #[must_use]
    pub fn success_for(request: &StunMessage) -> Self {
        Self {
            method: request.method,
            class: StunMessageClass::SuccessResponse,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Builder-style attribute append
    #[must_use]
    pub fn with(mut self, attr: StunAttribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    fn encode_header(&self, attrs_len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + attrs_len);
        bytes.extend_from_slice(&self.method.encode(self.class).to_be_bytes());
        bytes.extend_from_slice(&(attrs_len as u16).to_be_bytes());
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);
        bytes
    }

    fn encode_attributes(&self, attrs: &[StunAttribute]) -> Vec<u8> {
        attrs
            .iter()
            .flat_map(|attr| attr.encode(&self.transaction_id))
            .collect()
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let attrs = self.encode_attributes(&self.attributes);
        let mut bytes = self.encode_header(attrs.len());
        bytes.extend_from_slice(&attrs);
        bytes
    }

    /// Decode message from bytes
    ///
    /// # Errors
    ///
    /// Returns `StunError` if the header is short, the cookie is wrong or the
    /// method is not one this codec understands
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        // The two top bits are zero for every STUN message
        if msg_type & 0xC000 != 0 || magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        let (method, class) = StunMethod::decode(msg_type)?;

        let end = (HEADER_SIZE + msg_length).min(bytes.len());
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_length = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_length > end {
                break;
            }

            let attr_value = &bytes[offset..offset + attr_length];
            if let Ok(attr) = StunAttribute::decode(attr_type, attr_value, &transaction_id) {
                attributes.push(attr);
            }

            offset += attr_length + (4 - (attr_length % 4)) % 4;
        }

        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }

    /// Quick check used to separate STUN traffic from anything else on a socket
    #[must_use]
    pub fn looks_like_stun(bytes: &[u8]) -> bool {
        bytes.len() >= HEADER_SIZE
            && bytes[0] & 0xC0 == 0
            && u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) == MAGIC_COOKIE
    }

    /// XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes
            .iter()
            .find_map(|attr| match attr {
                StunAttribute::XorMappedAddress(addr) => Some(*addr),
                _ => None,
            })
            .or_else(|| {
                self.attributes.iter().find_map(|attr| match attr {
                    StunAttribute::MappedAddress(addr) => Some(*addr),
                    _ => None,
                })
            })
    }

    /// XOR-RELAYED-ADDRESS
    #[must_use]
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// XOR-PEER-ADDRESS
    #[must_use]
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// DATA payload
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::Data(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// LIFETIME in seconds
    #[must_use]
    pub fn lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    /// ERROR-CODE as (code, reason)
    #[must_use]
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// REALM
    #[must_use]
    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::Realm(realm) => Some(realm.as_str()),
            _ => None,
        })
    }

    /// NONCE
    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::Nonce(nonce) => Some(nonce.as_str()),
            _ => None,
        })
    }

    fn hmac_sha1(key: &[u8], bytes: &[u8]) -> [u8; 20] {
        type HmacSha1 = Hmac<Sha1>;
        // HMAC accepts keys of any length, so this never fails
        let mut mac = match HmacSha1::new_from_slice(key) {
            Ok(mac) => mac,
            Err(_) => return [0u8; 20],
        };
        mac.update(bytes);
        mac.finalize().into_bytes().into()
    }

    /// Append MESSAGE-INTEGRITY (HMAC-SHA1 per RFC 5389 Section 15.4)
    ///
    /// The HMAC covers the header and every attribute before it, with the
    /// header length already accounting for the 24-byte integrity attribute.
    pub fn add_message_integrity(&mut self, auth: &StunAuthentication) {
        self.attributes
            .retain(|attr| !matches!(attr, StunAttribute::MessageIntegrity(_)));

        let attrs = self.encode_attributes(&self.attributes);
        let mut bytes = self.encode_header(attrs.len() + 24);
        bytes.extend_from_slice(&attrs);

        let hmac = Self::hmac_sha1(&auth.derive_key(), &bytes);
        self.attributes.push(StunAttribute::MessageIntegrity(hmac));
    }

    /// Verify MESSAGE-INTEGRITY
    ///
    /// # Errors
    ///
    /// Returns `StunError::MissingAttribute` when absent and
    /// `StunError::AuthenticationFailed` when the HMAC does not match
    pub fn verify_message_integrity(&self, auth: &StunAuthentication) -> Result<(), StunError> {
        let (index, expected) = self
            .attributes
            .iter()
            .enumerate()
            .find_map(|(i, attr)| match attr {
                StunAttribute::MessageIntegrity(hmac) => Some((i, *hmac)),
                _ => None,
            })
            .ok_or(StunError::MissingAttribute)?;

        let attrs = self.encode_attributes(&self.attributes[..index]);
        let mut bytes = self.encode_header(attrs.len() + 24);
        bytes.extend_from_slice(&attrs);

        if Self::hmac_sha1(&auth.derive_key(), &bytes) == expected {
            Ok(())
        } else {
            Err(StunError::AuthenticationFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_encoding() {
        assert_eq!(StunMethod::Binding.encode(StunMessageClass::Request), 0x0001);
        assert_eq!(
            StunMethod::Binding.encode(StunMessageClass::SuccessResponse),
            0x0101
        );
        assert_eq!(StunMethod::Allocate.encode(StunMessageClass::Request), 0x0003);
        assert_eq!(
            StunMethod::Allocate.encode(StunMessageClass::ErrorResponse),
            0x0113
        );
        assert_eq!(StunMethod::Send.encode(StunMessageClass::Indication), 0x0016);
        assert_eq!(StunMethod::Data.encode(StunMessageClass::Indication), 0x0017);
        assert_eq!(
            StunMethod::CreatePermission.encode(StunMessageClass::Request),
            0x0008
        );
    }

    #[test]
    fn test_message_type_decoding() {
        assert_eq!(
            StunMethod::decode(0x0113).unwrap(),
            (StunMethod::Allocate, StunMessageClass::ErrorResponse)
        );
        assert_eq!(
            StunMethod::decode(0x0017).unwrap(),
            (StunMethod::Data, StunMessageClass::Indication)
        );
        assert!(matches!(
            StunMethod::decode(0x000A),
            Err(StunError::InvalidMessageType)
        ));
    }

    #[test]
    fn test_allocate_request_roundtrip() {
        let msg = StunMessage::request(StunMethod::Allocate)
            .with(StunAttribute::RequestedTransport(TRANSPORT_UDP))
            .with(StunAttribute::Lifetime(600));
        let decoded = StunMessage::decode(&msg.encode()).unwrap();

        assert_eq!(decoded.method, StunMethod::Allocate);
        assert_eq!(decoded.class, StunMessageClass::Request);
        assert_eq!(decoded.transaction_id, msg.transaction_id);
        assert_eq!(decoded.lifetime(), Some(600));
        assert!(
            decoded
                .attributes
                .contains(&StunAttribute::RequestedTransport(TRANSPORT_UDP))
        );
    }

    #[test]
    fn test_xor_addresses_v4_and_v6() {
        let v4: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();

        let msg = StunMessage::new(StunMethod::Allocate, StunMessageClass::SuccessResponse)
            .with(StunAttribute::XorRelayedAddress(v4))
            .with(StunAttribute::XorMappedAddress(v6));
        let decoded = StunMessage::decode(&msg.encode()).unwrap();

        assert_eq!(decoded.relayed_address(), Some(v4));
        assert_eq!(decoded.mapped_address(), Some(v6));
    }

    #[test]
    fn test_data_indication_carries_payload() {
        let peer: SocketAddr = "198.51.100.4:49152".parse().unwrap();
        let payload = vec![0xAB; 37];

        let msg = StunMessage::new(StunMethod::Data, StunMessageClass::Indication)
            .with(StunAttribute::XorPeerAddress(peer))
            .with(StunAttribute::Data(payload.clone()));
        let encoded = msg.encode();
        assert_eq!(encoded.len() % 4, 0);

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.peer_address(), Some(peer));
        assert_eq!(decoded.data(), Some(payload.as_slice()));
    }

    #[test]
    fn test_error_code_attribute() {
        let msg = StunMessage::new(StunMethod::Allocate, StunMessageClass::ErrorResponse)
            .with(StunAttribute::ErrorCode {
                code: 401,
                reason: "Unauthorized".to_string(),
            })
            .with(StunAttribute::Realm("mesh".to_string()))
            .with(StunAttribute::Nonce("abc123".to_string()));
        let decoded = StunMessage::decode(&msg.encode()).unwrap();

        assert_eq!(decoded.error_code(), Some((401, "Unauthorized")));
        assert_eq!(decoded.realm(), Some("mesh"));
        assert_eq!(decoded.nonce(), Some("abc123"));
    }

    #[test]
    fn test_message_integrity_long_term() {
        let auth = StunAuthentication::new("host-1", "secret", Some("mesh".to_string()));
        let mut msg = StunMessage::request(StunMethod::Allocate)
            .with(StunAttribute::RequestedTransport(TRANSPORT_UDP))
            .with(StunAttribute::Username("host-1".to_string()));
        msg.add_message_integrity(&auth);

        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.verify_message_integrity(&auth).is_ok());

        let wrong = StunAuthentication::new("host-1", "other", Some("mesh".to_string()));
        assert!(matches!(
            decoded.verify_message_integrity(&wrong),
            Err(StunError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_message_integrity_missing() {
        let auth = StunAuthentication::new("user", "pass", None);
        let msg = StunMessage::request(StunMethod::Refresh);
        assert!(matches!(
            msg.verify_message_integrity(&auth),
            Err(StunError::MissingAttribute)
        ));
    }

    #[test]
    fn test_key_derivation() {
        let short = StunAuthentication::new("user", "pass", None);
        assert_eq!(&*short.derive_key(), b"pass");

        let long = short.with_realm("realm");
        assert_eq!(long.derive_key().len(), 16);
        assert_eq!(long.realm.as_deref(), Some("realm"));
    }

    #[test]
    fn test_decode_rejects_short_and_foreign() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 10]),
            Err(StunError::MessageTooShort)
        ));

        let mut foreign = vec![0u8; 36];
        foreign[0] = 0x05;
        assert!(StunMessage::decode(&foreign).is_err());
        assert!(!StunMessage::looks_like_stun(&foreign));

        let binding = StunMessage::request(StunMethod::Binding).encode();
        assert!(StunMessage::looks_like_stun(&binding));
    }

    #[test]
    fn test_truncated_attribute_is_skipped() {
        let msg = StunMessage::request(StunMethod::Binding)
            .with(StunAttribute::Software("meshproxy".to_string()));
        let mut encoded = msg.encode();
        encoded.truncate(encoded.len() - 4);

        let decoded = StunMessage::decode(&encoded).unwrap();
        assert!(decoded.attributes.is_empty());
    }
}
