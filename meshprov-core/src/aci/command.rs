use crate::directory::ModelId;
use crate::handles::{AddressHandle, DevkeyHandle};
use serde::{Deserialize, Serialize};
use strum::Display;

/// ACI command opcodes referenced by command responses.
pub mod opcode {
    pub const SUBNET_ADD: u8 = 0x92;
    pub const APPKEY_ADD: u8 = 0x97;
    pub const DEVKEY_ADD: u8 = 0x9C;
    pub const DEVKEY_DELETE: u8 = 0x9D;
    pub const ADDR_LOCAL_UNICAST_SET: u8 = 0x9F;
    pub const ADDR_PUBLICATION_ADD: u8 = 0xA4;
    pub const ADDR_PUBLICATION_REMOVE: u8 = 0xA6;
    pub const PACKET_SEND: u8 = 0xAB;
    pub const PROV_SCAN_START: u8 = 0x61;
    pub const PROV_SCAN_STOP: u8 = 0x62;
    pub const PROV_PROVISION: u8 = 0x63;
}

/// Publication parameters for a model publication set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub address: u16,
    pub app_key_index: u16,
    pub ttl: u8,
}

/// A command for the device. Each call sends it exactly once; nothing is retried.
///
/// The configuration client messages at the bottom travel to the remote node
/// through the device, addressed with the handles set by [`Command::PublishSet`].
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    SubnetAdd {
        net_key_index: u16,
        #[serde(with = "hex::serde")]
        key: [u8; 16],
    },
    AppkeyAdd {
        app_key_index: u16,
        subnet_handle: u16,
        #[serde(with = "hex::serde")]
        key: [u8; 16],
    },
    AddrLocalUnicastSet {
        start_address: u16,
        count: u16,
    },
    ScanStart,
    ScanStop,
    Provision {
        context_id: u8,
        #[serde(with = "hex::serde")]
        uuid: [u8; 16],
        #[serde(with = "hex::serde")]
        network_key: [u8; 16],
        net_key_index: u16,
        iv_index: u32,
        address: u16,
        iv_update_flag: bool,
        key_refresh_flag: bool,
        attention_duration_s: u8,
    },
    DevkeyAdd {
        owner_address: u16,
        subnet_handle: u16,
        #[serde(with = "hex::serde")]
        device_key: [u8; 16],
    },
    DevkeyDelete {
        devkey_handle: DevkeyHandle,
    },
    AddrPublicationAdd {
        address: u16,
    },
    AddrPublicationRemove {
        address_handle: AddressHandle,
    },

    PublishSet {
        devkey_handle: DevkeyHandle,
        address_handle: AddressHandle,
    },
    ConfigAppkeyAdd {
        app_key_index: u16,
    },
    CompositionDataGet {
        page: u8,
    },
    ModelAppBind {
        element_address: u16,
        app_key_index: u16,
        model: ModelId,
    },
    ModelPublicationSet {
        element_address: u16,
        model: ModelId,
        publish: Publish,
    },
    ModelSubscriptionDeleteAll {
        element_address: u16,
        model: ModelId,
    },
    ModelSubscriptionAdd {
        element_address: u16,
        address: u16,
        model: ModelId,
    },
    NodeReset,
}

impl Command {
    /// The opcode the device echoes in the matching command response.
    pub fn opcode(&self) -> u8 {
        match self {
            Command::SubnetAdd { .. } => opcode::SUBNET_ADD,
            Command::AppkeyAdd { .. } => opcode::APPKEY_ADD,
            Command::AddrLocalUnicastSet { .. } => opcode::ADDR_LOCAL_UNICAST_SET,
            Command::ScanStart => opcode::PROV_SCAN_START,
            Command::ScanStop => opcode::PROV_SCAN_STOP,
            Command::Provision { .. } => opcode::PROV_PROVISION,
            Command::DevkeyAdd { .. } => opcode::DEVKEY_ADD,
            Command::DevkeyDelete { .. } => opcode::DEVKEY_DELETE,
            Command::AddrPublicationAdd { .. } => opcode::ADDR_PUBLICATION_ADD,
            Command::AddrPublicationRemove { .. } => opcode::ADDR_PUBLICATION_REMOVE,
            Command::PublishSet { .. }
            | Command::ConfigAppkeyAdd { .. }
            | Command::CompositionDataGet { .. }
            | Command::ModelAppBind { .. }
            | Command::ModelPublicationSet { .. }
            | Command::ModelSubscriptionDeleteAll { .. }
            | Command::ModelSubscriptionAdd { .. }
            | Command::NodeReset => opcode::PACKET_SEND,
        }
    }
}

/// Name of a command opcode for log output.
pub fn opcode_name(code: u8) -> &'static str {
    match code {
        opcode::SUBNET_ADD => "SubnetAdd",
        opcode::APPKEY_ADD => "AppkeyAdd",
        opcode::DEVKEY_ADD => "DevkeyAdd",
        opcode::DEVKEY_DELETE => "DevkeyDelete",
        opcode::ADDR_LOCAL_UNICAST_SET => "AddrLocalUnicastSet",
        opcode::ADDR_PUBLICATION_ADD => "AddrPublicationAdd",
        opcode::ADDR_PUBLICATION_REMOVE => "AddrPublicationRemove",
        opcode::PACKET_SEND => "PacketSend",
        opcode::PROV_SCAN_START => "ScanStart",
        opcode::PROV_SCAN_STOP => "ScanStop",
        opcode::PROV_PROVISION => "Provision",
        _ => "Unknown",
    }
}
