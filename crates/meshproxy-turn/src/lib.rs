//! TURN relay client for meshproxy.
//!
//! Provides the STUN/TURN codec, a [`TurnSession`] that holds one allocation
//! and implements [`meshproxy_transport::RelayTransport`], and the control-plane
//! [`Signal`] exchange used to learn a peer's relayed address.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod signal;
pub mod stun;

pub use client::TurnSession;
pub use config::TurnConfig;
pub use error::{Result, SignalError, StunError, TurnError};
pub use signal::{Signal, SignalAction, SignalSink, Signaler};
