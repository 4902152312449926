//! A live session with one device: wires the dispatcher, correlator, handle
//! manager, provisioner and orchestrator together and exposes the operations
//! the front ends call.

use crate::aci::{Command, Event, EventKind, Publish};
use crate::config::SessionConfig;
use crate::config_client::ConfigClient;
use crate::correlator::Correlator;
use crate::directory::{ModelId, Node, NodeDirectory};
use crate::dispatch::{CapturedEvent, EventDispatcher, EventLog};
use crate::error::{MeshError, Result};
use crate::handles::HandleManager;
use crate::orchestrator::{self, Orchestrator, ProvisioningReport};
use crate::provisioner::{AddressAllocator, LocalAddressRange, Provisioner};
use crate::signal::WorkflowSignal;
use crate::transport::{Bridge, BridgeTasks, Transport};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// TTL used for publications configured through [`MeshSession::client_set_publish`].
const PUBLISH_TTL: u8 = 1;

pub struct MeshSession {
    transport: Arc<dyn Transport>,
    directory: Arc<NodeDirectory>,
    dispatcher: Arc<EventDispatcher>,
    handles: Arc<HandleManager>,
    provisioner: Arc<Provisioner>,
    event_log: Arc<EventLog>,
    complete: Arc<WorkflowSignal<ProvisioningReport>>,
    provisioning: Mutex<()>,
    config: SessionConfig,
    dispatch_loop: JoinHandle<()>,
    bridge: std::sync::Mutex<Option<BridgeTasks>>,
}

impl MeshSession {
    /// Build a session over `transport` and start dispatching `events`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<Event>,
        directory: Arc<NodeDirectory>,
        allocator: &AddressAllocator,
        config: SessionConfig,
    ) -> Self {
        let local = allocator.allocate(config.local_element_count);
        debug!(
            "Local unicast range {start:#06x}..{end:#06x}",
            start = local.start,
            end = local.end()
        );

        let dispatcher = Arc::new(EventDispatcher::new(config.max_event_tasks));
        let correlator = Arc::new(Correlator::new(transport.clone()));
        let handles = Arc::new(HandleManager::new(
            transport.clone(),
            correlator.clone(),
            config.subnet_handle,
            config.device_timeout,
        ));
        let composition = Arc::new(WorkflowSignal::new("composition data"));
        let complete = Arc::new(WorkflowSignal::new("provisioning complete"));
        let event_log = Arc::new(EventLog::new());
        let provisioner = Arc::new(Provisioner::new(
            transport.clone(),
            directory.clone(),
            complete.clone(),
            local,
            config.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            transport.clone(),
            handles.clone(),
            directory.clone(),
            composition.clone(),
            complete.clone(),
            config.clone(),
        ));

        // inline listeners first: the node must be in the directory before the
        // configuration run for it starts
        dispatcher.register(event_log.clone());
        dispatcher.register(correlator);
        dispatcher.register(provisioner.clone());
        dispatcher.register(Arc::new(ConfigClient::new(directory.clone(), composition)));
        dispatcher.register_task(&[EventKind::ProvComplete], move |event: Arc<Event>| {
            let orchestrator = orchestrator.clone();
            async move {
                if let Event::ProvComplete { address, .. } = event.as_ref() {
                    orchestrator.on_provisioned(*address).await;
                }
            }
        });

        let dispatch_loop = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(events).await })
        };

        Self {
            transport,
            directory,
            dispatcher,
            handles,
            provisioner,
            event_log,
            complete,
            provisioning: Mutex::new(()),
            config,
            dispatch_loop,
            bridge: std::sync::Mutex::new(None),
        }
    }

    /// Connect to a device bridge and start a session on it.
    pub async fn connect_bridge(
        address: &str,
        directory: Arc<NodeDirectory>,
        allocator: &AddressAllocator,
        config: SessionConfig,
    ) -> Result<Self> {
        let (transport, events, tasks) = Bridge::connect(address).await?.into_parts();
        let session = Self::new(Arc::new(transport), events, directory, allocator, config);
        *session.bridge_tasks() = Some(tasks);
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.directory
    }

    pub fn handles(&self) -> &Arc<HandleManager> {
        &self.handles
    }

    pub fn local_range(&self) -> LocalAddressRange {
        self.provisioner.local_range()
    }

    /// Add the default subnet and application key and claim the local address range.
    pub fn quick_setup(&self) -> Result<()> {
        let local = self.provisioner.local_range();
        self.transport.send(Command::SubnetAdd {
            net_key_index: self.config.net_key_index,
            key: self.config.network_key,
        })?;
        self.transport.send(Command::AppkeyAdd {
            app_key_index: self.config.app_key_index,
            subnet_handle: self.config.subnet_handle,
            key: self.config.app_key,
        })?;
        self.transport.send(Command::AddrLocalUnicastSet {
            start_address: local.start,
            count: local.count,
        })
    }

    pub fn start_scan(&self) -> Result<()> {
        self.provisioner.scan_start()
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.provisioner.scan_stop()
    }

    pub fn unprovisioned_devices(&self) -> Vec<[u8; 16]> {
        self.provisioner.unprovisioned()
    }

    /// Provision the device with `uuid` and wait for its configuration run.
    ///
    /// A run that finishes with a recorded failure is still returned as `Ok`;
    /// only an unknown UUID, a send failure or a run that never finishes is an error.
    pub async fn provision(&self, uuid: [u8; 16]) -> Result<ProvisioningReport> {
        let _one_at_a_time = self.provisioning.lock().await;
        self.complete.reset();
        let address = self.provisioner.provision(uuid)?;
        let report = orchestrator::await_completion(
            &self.complete,
            address,
            self.config.provisioning_timeout,
        )
        .await?;
        if report.is_success() {
            info!("Provisioned {address:#06x}");
        } else {
            warn!("Provisioned {address:#06x} with failures");
        }
        Ok(report)
    }

    /// Reset the node at `address` and drop it from the directory.
    pub async fn unprovision(&self, address: u16) -> Result<()> {
        let node = self.node(address)?;
        self.configure(&node, vec![Command::NodeReset]).await?;
        self.directory.remove(address);
        self.directory.store()?;
        info!("Unprovisioned {address:#06x}");
        Ok(())
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.directory.nodes()
    }

    /// Make a model on the node at `address` publish to `publish_address`.
    pub async fn client_set_publish(
        &self,
        address: u16,
        element: u16,
        model_id: u16,
        publish_address: u16,
    ) -> Result<()> {
        let node = self.node(address)?;
        let model = resolve_model(&node, element, model_id)?;
        let publish = Publish {
            address: publish_address,
            app_key_index: self.config.app_key_index,
            ttl: PUBLISH_TTL,
        };
        self.configure(
            &node,
            vec![Command::ModelPublicationSet {
                element_address: node.element_address(element),
                model,
                publish,
            }],
        )
        .await
    }

    /// Replace the subscriptions of a model on the node at `address` with
    /// `subscribe_address`.
    pub async fn server_set_subscribe(
        &self,
        address: u16,
        element: u16,
        model_id: u16,
        subscribe_address: u16,
    ) -> Result<()> {
        let node = self.node(address)?;
        let model = resolve_model(&node, element, model_id)?;
        let element_address = node.element_address(element);
        self.configure(
            &node,
            vec![
                Command::ModelSubscriptionDeleteAll {
                    element_address,
                    model,
                },
                Command::ModelSubscriptionAdd {
                    element_address,
                    address: subscribe_address,
                    model,
                },
            ],
        )
        .await
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.event_log.events()
    }

    pub fn clear_events(&self) {
        self.event_log.clear();
    }

    pub fn event_filter_add(&self, opcodes: impl IntoIterator<Item = u8>) {
        self.dispatcher.filter_add(opcodes);
    }

    pub fn event_filter_enable(&self) {
        self.dispatcher.filter_enable();
    }

    pub fn event_filter_disable(&self) {
        self.dispatcher.filter_disable();
    }

    pub fn event_filter(&self) -> Vec<u8> {
        self.dispatcher.suppressed()
    }

    /// Free any handles a workflow still holds, then stop dispatching and
    /// drop the bridge connection.
    pub async fn close(&self) {
        let released = self.handles.force_release_all();
        if released > 0 {
            warn!("Released {released} handle pairs left outstanding");
        }
        self.dispatch_loop.abort();
        self.dispatcher.shutdown().await;
        let bridge = self.bridge_tasks().take();
        if let Some(bridge) = bridge {
            bridge.shutdown().await;
        }
        debug!("Session closed");
    }

    fn bridge_tasks(&self) -> std::sync::MutexGuard<'_, Option<BridgeTasks>> {
        self.bridge
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn node(&self, address: u16) -> Result<Node> {
        self.directory
            .find(address)
            .ok_or_else(|| MeshError::DeviceNotFound(format!("no node at {address:#06x}")))
    }

    /// Send `commands` to `node` inside an acquire/release bracket.
    async fn configure(&self, node: &Node, commands: Vec<Command>) -> Result<()> {
        let pair = self.handles.acquire(node).await?;
        let sent = std::iter::once(Command::PublishSet {
            devkey_handle: pair.devkey,
            address_handle: pair.address,
        })
        .chain(commands)
        .try_for_each(|command| self.transport.send(command));
        let released = self.handles.release(pair);
        sent.and(released)
    }
}

/// Find the model a configuration targets.
///
/// Nodes whose composition has not been received are addressed blindly with a
/// SIG model id.
fn resolve_model(node: &Node, element: u16, model_id: u16) -> Result<ModelId> {
    if node.elements.is_empty() {
        return Ok(ModelId::sig(model_id));
    }
    let found = node
        .elements
        .iter()
        .find(|e| e.index == element)
        .ok_or(MeshError::ElementNotFound {
            address: node.unicast_address,
            element,
        })?;
    found
        .models
        .iter()
        .find(|m| m.model_id == model_id)
        .copied()
        .ok_or(MeshError::ModelNotFound {
            address: node.unicast_address,
            element,
            model_id,
        })
}
