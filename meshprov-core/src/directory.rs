//! Durable store of provisioned nodes, their elements and models.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Model identifiers from this value up are bound to the application key
/// after provisioning. Foundation models sit below it.
pub const FIRST_BINDABLE_MODEL_ID: u16 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub model_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<u16>,
}

impl ModelId {
    pub fn sig(model_id: u16) -> Self {
        Self {
            model_id,
            company_id: None,
        }
    }

    pub fn vendor(company_id: u16, model_id: u16) -> Self {
        Self {
            model_id,
            company_id: Some(company_id),
        }
    }

    pub fn needs_app_binding(&self) -> bool {
        self.model_id >= FIRST_BINDABLE_MODEL_ID
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub index: u16,
    #[serde(default)]
    pub location: u16,
    pub models: Vec<ModelId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(with = "hex::serde")]
    pub uuid: [u8; 16],
    pub unicast_address: u16,
    #[serde(with = "hex::serde")]
    pub device_key: [u8; 16],
    #[serde(default)]
    pub elements: Vec<Element>,
}

impl Node {
    pub fn new(uuid: [u8; 16], unicast_address: u16, device_key: [u8; 16]) -> Self {
        Self {
            uuid,
            unicast_address,
            device_key,
            elements: Vec::new(),
        }
    }

    /// Number of unicast addresses the node occupies.
    pub fn address_span(&self) -> u16 {
        self.elements.len().max(1) as u16
    }

    pub fn element_address(&self, element: u16) -> u16 {
        self.unicast_address.wrapping_add(element)
    }
}

/// Backing storage for a [`NodeDirectory`].
pub trait NodeStore: Send + Sync {
    fn load(&self) -> Result<Vec<Node>>;
    fn save(&self, nodes: &[Node]) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    nodes: Vec<Node>,
}

/// JSON file storage. A missing file loads as an empty directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NodeStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Node>> {
        if !self.path.exists() {
            debug!("No directory file at {}, starting empty", self.path.display());
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        let file: DirectoryFile = serde_json::from_str(&text)?;
        Ok(file.nodes)
    }

    fn save(&self, nodes: &[Node]) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = DirectoryFile {
            nodes: nodes.to_vec(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// The set of provisioned nodes.
///
/// All reads and writes go through one lock, so concurrent requests and the
/// provisioning workflow never interleave their mutations.
pub struct NodeDirectory {
    nodes: Mutex<Vec<Node>>,
    store: Box<dyn NodeStore>,
}

impl NodeDirectory {
    /// Open a directory, loading its nodes from `store`.
    pub fn open(store: impl NodeStore + 'static) -> Result<Self> {
        let nodes = store.load()?;
        debug!("Loaded {count} nodes", count = nodes.len());
        Ok(Self {
            nodes: Mutex::new(nodes),
            store: Box::new(store),
        })
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(JsonFileStore::new(path))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.lock().clone()
    }

    pub fn find(&self, unicast_address: u16) -> Option<Node> {
        self.lock()
            .iter()
            .find(|n| n.unicast_address == unicast_address)
            .cloned()
    }

    /// Insert a node, evicting any node sharing its UUID or unicast address.
    pub fn insert(&self, node: Node) {
        let mut nodes = self.lock();
        nodes.retain(|n| n.uuid != node.uuid && n.unicast_address != node.unicast_address);
        nodes.push(node);
    }

    pub fn remove(&self, unicast_address: u16) -> Option<Node> {
        let mut nodes = self.lock();
        let pos = nodes
            .iter()
            .position(|n| n.unicast_address == unicast_address)?;
        Some(nodes.remove(pos))
    }

    /// Drop every node with this UUID. Returns how many were removed.
    pub fn remove_uuid(&self, uuid: &[u8; 16]) -> usize {
        let mut nodes = self.lock();
        let before = nodes.len();
        nodes.retain(|n| &n.uuid != uuid);
        before - nodes.len()
    }

    /// Replace a node's elements. Returns false if no node has that address.
    pub fn set_elements(&self, unicast_address: u16, elements: Vec<Element>) -> bool {
        let mut nodes = self.lock();
        match nodes
            .iter_mut()
            .find(|n| n.unicast_address == unicast_address)
        {
            Some(node) => {
                node.elements = elements;
                true
            }
            None => false,
        }
    }

    /// First unicast address after every known node, never below `floor`.
    pub fn next_free_address(&self, floor: u16) -> u16 {
        self.lock()
            .iter()
            .map(|n| n.unicast_address.saturating_add(n.address_span()))
            .fold(floor, u16::max)
    }

    /// Persist the current node set.
    pub fn store(&self) -> Result<()> {
        let nodes = self.lock();
        self.store.save(&nodes)?;
        debug!("Stored {count} nodes", count = nodes.len());
        Ok(())
    }
}
