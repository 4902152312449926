//! Device-key and address-publication handles that bracket every configuration
//! command sequence sent to a node.

use crate::aci::Command;
use crate::correlator::Correlator;
use crate::directory::Node;
use crate::error::{MeshError, Result};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevkeyHandle(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressHandle(pub u16);

impl fmt::Display for DevkeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AddressHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handles acquired for one node.
///
/// Holding a pair keeps every other acquisition in the process waiting, so it
/// must be handed back through [`HandleManager::release`].
pub struct HandlePair {
    pub devkey: DevkeyHandle,
    pub address: AddressHandle,
    pub node_address: u16,
    _gate: OwnedMutexGuard<()>,
}

impl fmt::Debug for HandlePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePair")
            .field("devkey", &self.devkey)
            .field("address", &self.address)
            .field("node_address", &self.node_address)
            .finish()
    }
}

pub struct HandleManager {
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    gate: Arc<Mutex<()>>,
    outstanding: StdMutex<Vec<(DevkeyHandle, AddressHandle)>>,
    subnet_handle: u16,
    timeout: Duration,
}

impl HandleManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        correlator: Arc<Correlator>,
        subnet_handle: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            correlator,
            gate: Arc::new(Mutex::new(())),
            outstanding: StdMutex::new(Vec::new()),
            subnet_handle,
            timeout,
        }
    }

    /// Allocate a device-key handle and an address-publication handle for `node`.
    ///
    /// Waits for any pair held elsewhere to be released first.
    pub async fn acquire(&self, node: &Node) -> Result<HandlePair> {
        let gate = self.gate.clone().lock_owned().await;

        self.transport.send(Command::DevkeyAdd {
            owner_address: node.unicast_address,
            subnet_handle: self.subnet_handle,
            device_key: node.device_key,
        })?;
        if let Err(e) = self.transport.send(Command::AddrPublicationAdd {
            address: node.unicast_address,
        }) {
            if let Some(Ok(devkey)) = self.correlator.devkey().abandon().await {
                let _ = self.send_release(Some(devkey), None);
            }
            return Err(e);
        }

        let (address, devkey) = tokio::join!(
            self.correlator.address().take(self.timeout),
            self.correlator.devkey().take(self.timeout),
        );

        let address = address.and_then(|grant| {
            grant.map_err(|status| MeshError::DeviceStatus {
                command: "AddrPublicationAdd".to_string(),
                status,
            })
        });
        let devkey = devkey.and_then(|grant| {
            grant.map_err(|status| MeshError::DeviceStatus {
                command: "DevkeyAdd".to_string(),
                status,
            })
        });

        match (devkey, address) {
            (Ok(devkey), Ok(address)) => {
                info!(
                    "Got handles for node {node:#06x}: devkey_handle {devkey}, address_handle {address}",
                    node = node.unicast_address
                );
                self.registry().push((devkey, address));
                Ok(HandlePair {
                    devkey,
                    address,
                    node_address: node.unicast_address,
                    _gate: gate,
                })
            }
            (Ok(devkey), Err(e)) => {
                let _ = self.send_release(Some(devkey), None);
                Err(e)
            }
            (Err(e), Ok(address)) => {
                let _ = self.send_release(None, Some(address));
                Err(e)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// Free a pair. The delete commands are not acknowledged.
    pub fn release(&self, pair: HandlePair) -> Result<()> {
        let was_outstanding = {
            let mut registry = self.registry();
            let before = registry.len();
            registry.retain(|entry| *entry != (pair.devkey, pair.address));
            registry.len() != before
        };

        if !was_outstanding {
            debug!(
                "Handles {devkey}/{address} already released",
                devkey = pair.devkey,
                address = pair.address
            );
            return Ok(());
        }

        let sent = self.send_release(Some(pair.devkey), Some(pair.address));
        debug!(
            "Released handles for node {node:#06x}",
            node = pair.node_address
        );
        sent
    }

    /// Handle pairs acquired and not yet released.
    pub fn outstanding(&self) -> Vec<(DevkeyHandle, AddressHandle)> {
        self.registry().clone()
    }

    /// Release every outstanding pair. Used when a session shuts down while a
    /// workflow still holds handles. Returns how many pairs were released.
    pub fn force_release_all(&self) -> usize {
        let stragglers: Vec<_> = self.registry().drain(..).collect();
        for (devkey, address) in &stragglers {
            warn!("Force releasing devkey_handle {devkey}, address_handle {address}");
            let _ = self.send_release(Some(*devkey), Some(*address));
        }
        stragglers.len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Vec<(DevkeyHandle, AddressHandle)>> {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send the delete commands for whichever handles are given. Both are
    /// attempted; the first send failure is returned.
    fn send_release(
        &self,
        devkey: Option<DevkeyHandle>,
        address: Option<AddressHandle>,
    ) -> Result<()> {
        let mut first_failure = None;
        if let Some(devkey_handle) = devkey
            && let Err(e) = self.transport.send(Command::DevkeyDelete { devkey_handle })
        {
            warn!("Failed to release devkey_handle {devkey_handle}: {e}");
            first_failure.get_or_insert(e);
        }
        if let Some(address_handle) = address
            && let Err(e) = self.transport.send(Command::AddrPublicationRemove { address_handle })
        {
            warn!("Failed to release address_handle {address_handle}: {e}");
            first_failure.get_or_insert(e);
        }
        first_failure.map_or(Ok(()), Err)
    }
}
