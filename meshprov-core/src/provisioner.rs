//! Scanning for unprovisioned devices and admitting them to the network.

use crate::aci::{Command, Event};
use crate::config::SessionConfig;
use crate::directory::{Node, NodeDirectory};
use crate::dispatch::EventListener;
use crate::error::{MeshError, Result};
use crate::orchestrator::{ProvisioningFailure, ProvisioningReport, ProvisioningStep};
use crate::signal::WorkflowSignal;
use crate::transport::Transport;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// A block of unicast addresses owned by the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddressRange {
    pub start: u16,
    pub count: u16,
}

impl LocalAddressRange {
    /// First address after the range.
    pub fn end(&self) -> u16 {
        self.start.saturating_add(self.count)
    }
}

/// Hands out disjoint local unicast ranges, one per session.
#[derive(Debug)]
pub struct AddressAllocator {
    next: AtomicU16,
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl AddressAllocator {
    pub fn new(start: u16) -> Self {
        Self {
            next: AtomicU16::new(start),
        }
    }

    pub fn allocate(&self, count: u16) -> LocalAddressRange {
        let start = self.next.fetch_add(count, Ordering::SeqCst);
        LocalAddressRange { start, count }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    address: u16,
    uuid: [u8; 16],
}

#[derive(Debug, Default)]
struct ProvisionerState {
    unprovisioned: Vec<[u8; 16]>,
    pending: Option<Pending>,
}

pub struct Provisioner {
    transport: Arc<dyn Transport>,
    directory: Arc<NodeDirectory>,
    complete: Arc<WorkflowSignal<ProvisioningReport>>,
    local: LocalAddressRange,
    config: SessionConfig,
    state: Mutex<ProvisionerState>,
}

impl Provisioner {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<NodeDirectory>,
        complete: Arc<WorkflowSignal<ProvisioningReport>>,
        local: LocalAddressRange,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            directory,
            complete,
            local,
            config,
            state: Mutex::new(ProvisionerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProvisionerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_range(&self) -> LocalAddressRange {
        self.local
    }

    pub fn scan_start(&self) -> Result<()> {
        info!("Scanning for unprovisioned devices...");
        self.transport.send(Command::ScanStart)
    }

    pub fn scan_stop(&self) -> Result<()> {
        info!("Scan stopped.");
        self.transport.send(Command::ScanStop)
    }

    /// UUIDs seen advertising and not yet provisioned, in discovery order.
    pub fn unprovisioned(&self) -> Vec<[u8; 16]> {
        self.state().unprovisioned.clone()
    }

    /// Start provisioning the device with `uuid`. Returns the unicast address
    /// it will get.
    ///
    /// Nothing changes if the UUID has not been seen advertising.
    pub fn provision(&self, uuid: [u8; 16]) -> Result<u16> {
        let mut state = self.state();
        if !state.unprovisioned.contains(&uuid) {
            return Err(MeshError::DeviceNotFound(hex::encode(uuid)));
        }

        let evicted = self.directory.remove_uuid(&uuid);
        if evicted > 0 {
            debug!("Removed {evicted} stale nodes with UUID {}", hex::encode(uuid));
        }

        let address = self.directory.next_free_address(self.local.end());
        self.transport.send(Command::Provision {
            context_id: 0,
            uuid,
            network_key: self.config.network_key,
            net_key_index: self.config.net_key_index,
            iv_index: self.config.iv_index,
            address,
            iv_update_flag: false,
            key_refresh_flag: false,
            attention_duration_s: 0,
        })?;

        state.unprovisioned.retain(|u| *u != uuid);
        state.pending = Some(Pending { address, uuid });
        info!("Provisioning {} as {address:#06x}", hex::encode(uuid));
        Ok(address)
    }

    fn on_unprovisioned(&self, uuid: [u8; 16]) {
        let mut state = self.state();
        if !state.unprovisioned.contains(&uuid) {
            info!("Received UUID {} from unprovisioned device", hex::encode(uuid));
            state.unprovisioned.push(uuid);
        }
    }

    fn on_complete(&self, address: u16, device_key: [u8; 16]) {
        let pending = self.state().pending.take();
        let uuid = match pending {
            Some(pending) if pending.address == address => pending.uuid,
            Some(pending) => {
                warn!(
                    "Provisioning completed at {address:#06x}, expected {expected:#06x}",
                    expected = pending.address
                );
                pending.uuid
            }
            None => {
                warn!("Provisioning completed at {address:#06x} with nothing pending, ignoring");
                return;
            }
        };
        self.directory.insert(Node::new(uuid, address, device_key));
    }

    fn on_failed(&self, error_code: u8) {
        let Some(pending) = self.state().pending.take() else {
            warn!("Provisioning failed ({error_code}) with nothing pending");
            return;
        };
        let err = MeshError::Transport(format!("provisioning link failed with code {error_code}"));
        warn!("Provisioning {address:#06x}: {err}", address = pending.address);
        self.complete.set(ProvisioningReport::failed(
            pending.address,
            ProvisioningFailure::new(ProvisioningStep::Provision, &err),
        ));
    }
}

impl EventListener for Provisioner {
    fn on_event(&self, event: &Event) {
        match event {
            Event::ProvUnprovisionedReceived { uuid, .. } => self.on_unprovisioned(*uuid),
            Event::ProvComplete {
                address,
                device_key,
                ..
            } => self.on_complete(*address, *device_key),
            Event::ProvFailed { error_code, .. } => self.on_failed(*error_code),
            _ => {}
        }
    }
}
