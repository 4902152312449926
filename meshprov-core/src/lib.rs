//! Core library for provisioning and configuring nodes through a serial mesh
//! device.
//!
//! The device answers commands asynchronously on a single event stream. This
//! crate matches those answers back to the operations that asked for them,
//! drives the configuration run that follows provisioning, and keeps the node
//! directory. Front ends (the CLI and the request server) sit on top of
//! [`MeshSession`].

pub mod aci;
pub mod config;
pub mod config_client;
pub mod correlator;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod handles;
pub mod orchestrator;
pub mod provisioner;
pub mod server;
pub mod session;
pub mod signal;
pub mod transport;

// Re-export commonly used types
pub use config::SessionConfig;
pub use directory::{Element, ModelId, Node, NodeDirectory};
pub use error::{MeshError, Result};
pub use orchestrator::ProvisioningReport;
pub use provisioner::AddressAllocator;
pub use session::MeshSession;

#[cfg(test)]
mod tests;
