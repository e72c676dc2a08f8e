use crate::{error::Result, protocol::Frame};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Logical GATT channel of the treadmill console
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Notify + write characteristic carrying queries and responses
    Command,
    /// Write-only characteristic used by the optional handshake
    Handshake,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Handshake => write!(f, "handshake"),
        }
    }
}

/// Event reported by a transport
///
/// All events of one transport are delivered serially on a single channel,
/// in the order the radio produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent<D> {
    /// Adapter became usable or unusable
    AdapterStateChanged {
        /// Whether scanning and connecting are possible
        ready: bool,
    },
    /// A peripheral was seen while scanning
    Discovered {
        /// Transport-specific device handle
        device: D,
        /// Advertised local name, if any
        name: Option<String>,
    },
    /// Link established
    Connected(D),
    /// Notifications enabled on the command channel; writes are now accepted
    Subscribed(D),
    /// Notification received on the command channel
    ValueUpdated {
        /// Device that sent the value
        device: D,
        /// Raw notification payload
        value: Bytes,
    },
    /// Link lost or closed
    Disconnected(D),
}

/// Packet-framed link to treadmill consoles
///
/// Implementations report progress through [`TransportEvent`]s on a channel
/// handed out at construction; the methods here only initiate operations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Device handle type
    type Device: Clone + Eq + fmt::Debug + Send + Sync + 'static;

    /// Begin scanning for peripherals
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Connect and subscribe to the command channel
    ///
    /// Emits [`TransportEvent::Subscribed`] once writes are accepted.
    async fn connect(&self, device: &Self::Device) -> Result<()>;

    /// Tear down the link
    async fn disconnect(&self, device: &Self::Device) -> Result<()>;

    /// Write one request frame
    async fn write(&self, device: &Self::Device, channel: Channel, frame: &Frame) -> Result<()>;
}
