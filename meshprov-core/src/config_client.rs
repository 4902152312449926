//! Receiving side of the configuration client: decodes composition data status
//! messages into the node directory.

use crate::aci::access::{self, COMPOSITION_DATA_STATUS, CompositionData};
use crate::aci::{Event, ReceivedMessage};
use crate::directory::NodeDirectory;
use crate::dispatch::EventListener;
use crate::signal::WorkflowSignal;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ConfigClient {
    directory: Arc<NodeDirectory>,
    composition: Arc<WorkflowSignal<u16>>,
}

impl ConfigClient {
    pub fn new(directory: Arc<NodeDirectory>, composition: Arc<WorkflowSignal<u16>>) -> Self {
        Self {
            directory,
            composition,
        }
    }

    fn on_message(&self, message: &ReceivedMessage) {
        if access::opcode_from_message(&message.data) != Some(COMPOSITION_DATA_STATUS) {
            return;
        }

        let composition = match CompositionData::from_status_message(&message.data) {
            Ok(composition) => composition,
            Err(e) => {
                warn!("Bad composition data from {src:#06x}: {e}", src = message.src);
                return;
            }
        };
        debug!(
            "Composition from {src:#06x}: CID {cid:#06x}, PID {pid:#06x}, {count} elements",
            src = message.src,
            cid = composition.company_id,
            pid = composition.product_id,
            count = composition.elements.len()
        );

        if self.directory.set_elements(message.src, composition.elements) {
            info!("Updated elements of {src:#06x}", src = message.src);
        } else {
            warn!("Composition data from unknown node {src:#06x}", src = message.src);
        }
        // the waiting workflow decides whether this source is the one it asked
        self.composition.set(message.src);
    }
}

impl EventListener for ConfigClient {
    fn on_event(&self, event: &Event) {
        if let Event::MeshMessageReceivedUnicast(message) = event {
            self.on_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ModelId, Node, NodeStore};
    use anyhow::Context;

    struct NullStore;

    impl NodeStore for NullStore {
        fn load(&self) -> crate::error::Result<Vec<Node>> {
            Ok(Vec::new())
        }

        fn save(&self, _nodes: &[Node]) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn message(src: u16, data: Vec<u8>) -> Event {
        Event::MeshMessageReceivedUnicast(ReceivedMessage {
            src,
            dst: 1,
            appkey_handle: 0,
            subnet_handle: 0,
            ttl: 4,
            rssi: -40,
            data,
        })
    }

    #[test]
    fn test_composition_populates_node_and_raises_signal() -> anyhow::Result<()> {
        let directory = Arc::new(NodeDirectory::open(NullStore)?);
        directory.insert(Node::new([1; 16], 0x10, [2; 16]));
        let signal = Arc::new(WorkflowSignal::new("composition data"));
        let client = ConfigClient::new(directory.clone(), signal.clone());

        let data = vec![
            0x02, 0x00, 0x59, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x01, 0x00, 0x00, 0x10,
        ];
        client.on_event(&message(0x10, data));

        assert!(signal.is_set());
        let node = directory.find(0x10).context("node missing")?;
        assert_eq!(node.elements.len(), 1);
        assert_eq!(node.elements[0].models, vec![ModelId::sig(0x1000)]);
        Ok(())
    }

    #[test]
    fn test_other_messages_are_ignored() -> anyhow::Result<()> {
        let directory = Arc::new(NodeDirectory::open(NullStore)?);
        let signal: Arc<WorkflowSignal<u16>> = Arc::new(WorkflowSignal::new("composition data"));
        let client = ConfigClient::new(directory, signal.clone());

        client.on_event(&message(0x10, vec![0x80, 0x03, 0x00]));
        assert!(!signal.is_set());
        Ok(())
    }
}
