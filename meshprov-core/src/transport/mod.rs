//! The port through which commands reach the device.

pub mod bridge;

use crate::aci::Command;
use crate::error::Result;

/// Outbound half of the device channel.
///
/// `send` queues the command and returns without waiting for the device.
/// Inbound events arrive separately on an `mpsc::Receiver<Event>`.
pub trait Transport: Send + Sync {
    fn send(&self, command: Command) -> Result<()>;
}

pub use bridge::{Bridge, BridgeTasks, BridgeTransport};
