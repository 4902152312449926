//! A scripted stand-in for the device and a directory store that counts writes.

use crate::aci::command::opcode;
use crate::aci::{Command, CommandResponse, Event, ReceivedMessage, Status};
use crate::config::SessionConfig;
use crate::directory::{Element, ModelId, Node, NodeDirectory, NodeStore};
use crate::error::MeshError;
use crate::handles::{AddressHandle, DevkeyHandle};
use crate::provisioner::AddressAllocator;
use crate::session::MeshSession;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const DEVICE_KEY: [u8; 16] = [0x5A; 16];

/// Answers handle allocations and provisioning after a configurable delay and
/// replies to composition data requests from a per-node script.
pub struct FakeDevice {
    sent: Mutex<Vec<Command>>,
    events: mpsc::Sender<Event>,
    next_handle: AtomicU16,
    delay_ms: AtomicU64,
    compositions: Mutex<HashMap<u16, Vec<u8>>>,
    target: Mutex<Option<u16>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    address_status: Mutex<Option<Status>>,
    fail_devkey_delete: AtomicBool,
}

impl FakeDevice {
    pub fn new(delay: Duration) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (events, rx) = mpsc::channel(64);
        let device = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            events,
            next_handle: AtomicU16::new(1),
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            compositions: Mutex::new(HashMap::new()),
            target: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            address_status: Mutex::new(None),
            fail_devkey_delete: AtomicBool::new(false),
        });
        (device, rx)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Answer composition data requests to `address` with `message`.
    pub fn script_composition(&self, address: u16, message: Vec<u8>) {
        self.compositions.lock().unwrap().insert(address, message);
    }

    /// Answer address publication requests with `status` instead of a handle.
    pub fn reject_address_publication(&self, status: Status) {
        *self.address_status.lock().unwrap() = Some(status);
    }

    /// Make sending a devkey delete fail as if the link were down.
    pub fn fail_devkey_delete(&self, fail: bool) {
        self.fail_devkey_delete.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Most handle pairs the device ever had allocated at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn inject(&self, event: Event) {
        self.events.send(event).await.unwrap();
    }

    fn reply_later(&self, event: Event) {
        let events = self.events.clone();
        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event).await;
        });
    }

    fn grant(&self, command_opcode: u8, response: CommandResponse) {
        self.reply_later(Event::CmdRsp {
            opcode: command_opcode,
            status: Status::SUCCESS,
            response: Some(response),
        });
    }

    fn next_handle(&self) -> u16 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl Transport for FakeDevice {
    fn send(&self, command: Command) -> crate::error::Result<()> {
        if matches!(command, Command::DevkeyDelete { .. })
            && self.fail_devkey_delete.load(Ordering::SeqCst)
        {
            return Err(MeshError::Transport("link down".to_string()));
        }
        self.sent.lock().unwrap().push(command.clone());
        match command {
            Command::DevkeyAdd { owner_address, .. } => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                *self.target.lock().unwrap() = Some(owner_address);
                self.grant(
                    opcode::DEVKEY_ADD,
                    CommandResponse::DevkeyAdd {
                        devkey_handle: DevkeyHandle(self.next_handle()),
                    },
                );
            }
            Command::AddrPublicationAdd { .. } => {
                let rejected = *self.address_status.lock().unwrap();
                match rejected {
                    Some(status) => self.reply_later(Event::CmdRsp {
                        opcode: opcode::ADDR_PUBLICATION_ADD,
                        status,
                        response: None,
                    }),
                    None => self.grant(
                        opcode::ADDR_PUBLICATION_ADD,
                        CommandResponse::AddrPublicationAdd {
                            address_handle: AddressHandle(self.next_handle()),
                        },
                    ),
                }
            }
            Command::DevkeyDelete { .. } => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Command::Provision { address, .. } => self.reply_later(Event::ProvComplete {
                context_id: 0,
                iv_index: 0,
                net_key_index: 0,
                address,
                device_key: DEVICE_KEY,
            }),
            Command::CompositionDataGet { .. } => {
                let target = *self.target.lock().unwrap();
                let scripted = target.and_then(|src| {
                    self.compositions
                        .lock()
                        .unwrap()
                        .get(&src)
                        .map(|data| (src, data.clone()))
                });
                if let Some((src, data)) = scripted {
                    self.reply_later(Event::MeshMessageReceivedUnicast(ReceivedMessage {
                        src,
                        dst: 1,
                        appkey_handle: 0,
                        subnet_handle: 0,
                        ttl: 5,
                        rssi: -42,
                        data,
                    }));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Composition data status message with one element per entry of `elements`.
pub fn composition_message(elements: &[&[u16]]) -> Vec<u8> {
    let mut message = vec![0x02, 0x00];
    for field in [0x0059u16, 0x0001, 0x0001, 0x0008, 0x0000] {
        message.extend_from_slice(&field.to_le_bytes());
    }
    for models in elements {
        message.extend_from_slice(&0u16.to_le_bytes());
        message.push(models.len() as u8);
        message.push(0);
        for model in *models {
            message.extend_from_slice(&model.to_le_bytes());
        }
    }
    message
}

/// In-memory store that counts how often the directory was persisted.
#[derive(Clone, Default)]
pub struct CountingStore {
    pub initial: Vec<Node>,
    pub saves: Arc<AtomicUsize>,
    pub saved: Arc<Mutex<Vec<Node>>>,
}

impl CountingStore {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl NodeStore for CountingStore {
    fn load(&self) -> crate::error::Result<Vec<Node>> {
        Ok(self.initial.clone())
    }

    fn save(&self, nodes: &[Node]) -> crate::error::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.saved.lock().unwrap() = nodes.to_vec();
        Ok(())
    }
}

pub fn node_with_models(address: u16, uuid: u8, models: &[u16]) -> Node {
    let mut node = Node::new([uuid; 16], address, DEVICE_KEY);
    node.elements.push(Element {
        index: 0,
        location: 0,
        models: models.iter().copied().map(ModelId::sig).collect(),
    });
    node
}

pub struct Harness {
    pub session: Arc<MeshSession>,
    pub device: Arc<FakeDevice>,
    pub store: CountingStore,
}

impl Harness {
    pub fn new(nodes: Vec<Node>) -> anyhow::Result<Self> {
        Self::with_delay(nodes, Duration::from_millis(50))
    }

    pub fn with_delay(nodes: Vec<Node>, delay: Duration) -> anyhow::Result<Self> {
        let store = CountingStore {
            initial: nodes,
            ..CountingStore::default()
        };
        let directory = Arc::new(NodeDirectory::open(store.clone())?);
        let (device, events) = FakeDevice::new(delay);
        let session = MeshSession::new(
            device.clone(),
            events,
            directory,
            &AddressAllocator::new(1),
            SessionConfig::default(),
        );
        Ok(Self {
            session: Arc::new(session),
            device,
            store,
        })
    }

    /// Let the dispatch loop catch up with injected events.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
