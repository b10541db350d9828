//! Core domain types and service traits for modem-relay
//!
//! This module defines the data structures that flow from the modem layer
//! into the relay, and the trait contracts the relay consumes so that the
//! hardware-access layer can be swapped for a fake in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Static description of a modem as reported by the hardware layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// Stable hardware identifier (IMEI-like). Empty until the modem is ready.
    #[serde(default)]
    pub equipment_identifier: String,
    /// Model string reported by the modem firmware.
    #[serde(default)]
    pub model: String,
    /// The modem's own phone number, if known.
    #[serde(default)]
    pub number: String,
}

/// Lifecycle state of an SMS as reported by the modem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmsState {
    Stored,
    Receiving,
    Received,
    Sending,
    Sent,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SmsState {
    /// Whether the message was (or is being) received by the local modem.
    pub fn is_incoming(self) -> bool {
        matches!(self, SmsState::Received | SmsState::Receiving)
    }
}

/// A single SMS event emitted by a modem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Sms {
    /// The remote party's number.
    #[serde(default)]
    pub number: String,
    /// The message body, untrimmed.
    #[serde(default)]
    pub text: String,
    /// Service-centre timestamp, if the modem reported one.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: SmsState,
}

/// A change in the set of present devices.
#[derive(Clone)]
pub enum DeviceEvent {
    Added { path: String, device: Arc<dyn Device> },
    Removed { path: String },
}

impl std::fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::Added { path, device } => f
                .debug_struct("Added")
                .field("path", path)
                .field("device", device.info())
                .finish(),
            DeviceEvent::Removed { path } => {
                f.debug_struct("Removed").field("path", path).finish()
            }
        }
    }
}

/// Errors produced by a device source or one of its devices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("device discovery failed: {0}")]
    Discovery(String),

    #[error("failed to attach to device event bus: {0}")]
    Attach(String),

    #[error("subscription cancelled")]
    Cancelled,

    #[error("device {0} was removed")]
    DeviceRemoved(String),

    #[error("message stream closed: {0}")]
    StreamClosed(String),
}

impl SourceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceError::Cancelled)
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// A single modem that can stream its SMS events.
#[async_trait]
pub trait Device: Send + Sync {
    /// Returns the device's static description.
    fn info(&self) -> &DeviceInfo;

    /// Streams SMS events into `sink` until `cancel` fires or the stream ends.
    ///
    /// # Returns
    /// * `Err(SourceError::Cancelled)` when `cancel` fired
    /// * any other `Err` when the stream ended for another reason
    /// * `Ok(())` when the stream ended cleanly
    async fn subscribe_messages(
        &self,
        cancel: CancellationToken,
        sink: mpsc::Sender<Sms>,
    ) -> Result<(), SourceError>;
}

/// Enumerates modems and reports hot-plug changes.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    /// Lists all currently present devices, keyed by enumeration path.
    async fn list(&self) -> Result<HashMap<String, Arc<dyn Device>>, SourceError>;

    /// Attaches to the add/remove event stream. Dropping the receiver
    /// unsubscribes.
    async fn subscribe(&self) -> Result<mpsc::Receiver<DeviceEvent>, SourceError>;
}
