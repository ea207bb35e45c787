//! Newline-delimited JSON control channel.
//!
//! The daemon reads peer-list snapshots and inbound signals from stdin, one
//! JSON object per line, and writes outbound signals and periodic metric
//! samples to stdout the same way. Objects carry a `type` tag.

use async_trait::async_trait;
use meshproxy_core::{HostPeerUpdate, MetricSample};
use meshproxy_turn::{Signal, SignalError, SignalSink};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Inbound control line
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlInput {
    /// Full peer list
    Peers(HostPeerUpdate),
    /// Signal from another host
    Signal(Signal),
}

impl ControlInput {
    /// Parse one line
    ///
    /// # Errors
    ///
    /// Returns the JSON error for malformed or unknown input.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Outbound control line
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlOutput {
    /// Signal for another host
    Signal(Signal),
    /// Metrics snapshot
    Metrics {
        /// One entry per peer
        samples: Vec<MetricSample>,
    },
}

/// Serializes control lines onto a writer
pub struct ControlWriter<W> {
    out: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> ControlWriter<W> {
    /// Writer over `out`
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    /// Write one line and flush
    ///
    /// # Errors
    ///
    /// Returns the serialization or I/O error.
    pub async fn write(&self, message: &ControlOutput) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    /// Consume the writer, returning what was written to
    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> SignalSink for ControlWriter<W> {
    async fn send_signal(&self, signal: Signal) -> Result<(), SignalError> {
        self.write(&ControlOutput::Signal(signal))
            .await
            .map_err(|e| SignalError::Delivery(e.to_string()))
    }
}
