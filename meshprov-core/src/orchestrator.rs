//! The configuration run that follows a successful provisioning.
//!
//! Triggered once per provisioning-complete event, it takes the new node from
//! bare network membership to a configured node with its application models
//! bound:
//!
//! 1. acquire the device-key and address-publication handles
//! 2. publish-set and application key add
//! 3. settle delay
//! 4. composition data get, bounded wait for the status
//! 5. application key bind for every model from 0x1000 up
//! 6. persist the directory
//! 7. release the handles
//! 8. raise the completion signal
//!
//! Steps 7 and 8 run on every path that got past step 1, so a node that never
//! reports its composition still completes, with the failure recorded.

use crate::aci::Command;
use crate::config::SessionConfig;
use crate::directory::{ModelId, NodeDirectory};
use crate::error::{MeshError, Result};
use crate::handles::{HandleManager, HandlePair};
use crate::signal::WorkflowSignal;
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use strum::Display;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    /// The over-the-air provisioning that precedes the configuration run.
    Provision,
    HandleAcquisition,
    PublishBind,
    SettleDelay,
    CompositionFetch,
    ModelBind,
    Persist,
    Release,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningFailure {
    pub step: ProvisioningStep,
    pub reason: String,
    /// The device stopped answering rather than reporting an error.
    pub unresponsive: bool,
}

impl ProvisioningFailure {
    pub fn new(step: ProvisioningStep, err: &MeshError) -> Self {
        Self {
            step,
            reason: err.to_string(),
            unresponsive: matches!(err, MeshError::DeviceUnresponsive { .. }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundModel {
    pub element_address: u16,
    pub model: ModelId,
}

/// What a provisioning run achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningReport {
    pub unicast_address: u16,
    pub composition_received: bool,
    pub bound_models: Vec<BoundModel>,
    pub failure: Option<ProvisioningFailure>,
}

impl ProvisioningReport {
    pub fn new(unicast_address: u16) -> Self {
        Self {
            unicast_address,
            composition_received: false,
            bound_models: Vec::new(),
            failure: None,
        }
    }

    pub fn failed(unicast_address: u16, failure: ProvisioningFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(unicast_address)
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    handles: Arc<HandleManager>,
    directory: Arc<NodeDirectory>,
    composition: Arc<WorkflowSignal<u16>>,
    complete: Arc<WorkflowSignal<ProvisioningReport>>,
    config: SessionConfig,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        handles: Arc<HandleManager>,
        directory: Arc<NodeDirectory>,
        composition: Arc<WorkflowSignal<u16>>,
        complete: Arc<WorkflowSignal<ProvisioningReport>>,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            handles,
            directory,
            composition,
            complete,
            config,
        }
    }

    /// Run the configuration sequence for the node just provisioned at `address`.
    pub async fn on_provisioned(&self, address: u16) -> ProvisioningReport {
        info!("Node provisioned with address {address:#06x}");
        let mut report = ProvisioningReport::new(address);

        if let Err(failure) = self.run(address, &mut report).await {
            error!(
                "Provisioning run for {address:#06x} failed at {step}: {reason}",
                step = failure.step,
                reason = failure.reason
            );
            report.failure.get_or_insert(failure);
        }

        debug!("{address:#06x}: {step}", step = ProvisioningStep::Complete);
        self.complete.set(report.clone());
        report
    }

    async fn run(
        &self,
        address: u16,
        report: &mut ProvisioningReport,
    ) -> std::result::Result<(), ProvisioningFailure> {
        let step = ProvisioningStep::HandleAcquisition;
        let node = self.directory.find(address).ok_or_else(|| {
            ProvisioningFailure::new(
                step,
                &MeshError::DeviceNotFound(format!("no node at {address:#06x}")),
            )
        })?;
        let pair = self
            .handles
            .acquire(&node)
            .await
            .map_err(|e| ProvisioningFailure::new(step, &e))?;

        let configured = self.configure(&pair, report).await;

        debug!("{address:#06x}: {step}", step = ProvisioningStep::Release);
        if let Err(e) = self.handles.release(pair) {
            warn!("Failed to release handles for {address:#06x}: {e}");
        }
        configured
    }

    async fn configure(
        &self,
        pair: &HandlePair,
        report: &mut ProvisioningReport,
    ) -> std::result::Result<(), ProvisioningFailure> {
        let address = pair.node_address;

        let step = ProvisioningStep::PublishBind;
        debug!("{address:#06x}: {step}");
        self.send(step, Command::PublishSet {
            devkey_handle: pair.devkey,
            address_handle: pair.address,
        })?;
        self.send(step, Command::ConfigAppkeyAdd {
            app_key_index: self.config.app_key_index,
        })?;

        debug!("{address:#06x}: {step}", step = ProvisioningStep::SettleDelay);
        tokio::time::sleep(self.config.settle_delay).await;

        let step = ProvisioningStep::CompositionFetch;
        debug!("{address:#06x}: {step}");
        self.composition.reset();
        self.send(step, Command::CompositionDataGet { page: 0 })?;
        match self
            .composition
            .wait_for(self.config.device_timeout, |src| *src == address)
            .await
        {
            Ok(_) => {
                self.composition.reset();
                report.composition_received = true;
                info!("Received composition data from {address:#06x}");
            }
            Err(e) => {
                warn!("No composition data from {address:#06x}, skipping model binds: {e}");
                report.failure = Some(ProvisioningFailure::new(step, &e));
            }
        }

        if report.composition_received {
            self.bind_models(address, report).await?;
        }

        let step = ProvisioningStep::Persist;
        debug!("{address:#06x}: {step}");
        tokio::time::sleep(self.config.persist_delay).await;
        self.directory
            .store()
            .map_err(|e| ProvisioningFailure::new(step, &e))
    }

    async fn bind_models(
        &self,
        address: u16,
        report: &mut ProvisioningReport,
    ) -> std::result::Result<(), ProvisioningFailure> {
        let step = ProvisioningStep::ModelBind;
        debug!("{address:#06x}: {step}");

        let Some(node) = self.directory.find(address) else {
            return Err(ProvisioningFailure::new(
                step,
                &MeshError::DeviceNotFound(format!("node {address:#06x} left the directory")),
            ));
        };

        for element in &node.elements {
            let element_address = node.element_address(element.index);
            for model in element.models.iter().filter(|m| m.needs_app_binding()) {
                tokio::time::sleep(self.config.bind_pacing).await;
                self.send(step, Command::ModelAppBind {
                    element_address,
                    app_key_index: self.config.app_key_index,
                    model: *model,
                })?;
                report.bound_models.push(BoundModel {
                    element_address,
                    model: *model,
                });
            }
        }
        info!(
            "Bound {count} models on {address:#06x}",
            count = report.bound_models.len()
        );
        Ok(())
    }

    fn send(
        &self,
        step: ProvisioningStep,
        command: Command,
    ) -> std::result::Result<(), ProvisioningFailure> {
        self.transport
            .send(command)
            .map_err(|e| ProvisioningFailure::new(step, &e))
    }
}

/// Wait for the next provisioning run to finish and lower the signal again.
pub async fn await_completion(
    complete: &WorkflowSignal<ProvisioningReport>,
    address: u16,
    timeout: std::time::Duration,
) -> Result<ProvisioningReport> {
    let report = complete
        .wait_for(timeout, |report| report.unicast_address == address)
        .await?;
    complete.reset();
    Ok(report)
}
