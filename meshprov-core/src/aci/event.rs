use crate::aci::Status;
use crate::handles::{AddressHandle, DevkeyHandle};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

/// Event opcodes the session interprets.
///
/// Anything else still reaches listeners as [`Event::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum EventKind {
    DeviceStarted = 0x81,
    CmdRsp = 0x84,
    ProvUnprovisionedReceived = 0xC0,
    ProvLinkEstablished = 0xC1,
    ProvLinkClosed = 0xC2,
    ProvCapsReceived = 0xC3,
    ProvComplete = 0xC4,
    ProvFailed = 0xC8,
    MeshMessageReceivedUnicast = 0xD0,
    MeshMessageReceivedSubscription = 0xD1,
    MeshTxComplete = 0xD2,
}

impl EventKind {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        EventKind::iter().find(|kind| kind.opcode() == opcode)
    }

    /// Parse either a symbolic name (`PROV_COMPLETE`) or a hex opcode (`0xc4`).
    pub fn parse_opcode(text: &str) -> Option<u8> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            return u8::from_str_radix(hex, 16).ok();
        }
        EventKind::iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(text))
            .map(EventKind::opcode)
    }
}

/// Decoded payload of a command response, for the commands whose response
/// carries data the session consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandResponse {
    DevkeyAdd { devkey_handle: DevkeyHandle },
    AddrPublicationAdd { address_handle: AddressHandle },
    Raw {
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },
}

/// Unicast or subscription message delivered up from the access layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub src: u16,
    pub dst: u16,
    pub appkey_handle: u16,
    pub subnet_handle: u16,
    pub ttl: u8,
    pub rssi: i8,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

/// An event decoded by the transport. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    DeviceStarted {
        operating_mode: u8,
        hw_error: u8,
        data_credit_available: u8,
    },
    CmdRsp {
        /// Opcode of the command this responds to.
        opcode: u8,
        status: Status,
        #[serde(default)]
        response: Option<CommandResponse>,
    },
    ProvUnprovisionedReceived {
        #[serde(with = "hex::serde")]
        uuid: [u8; 16],
        rssi: i8,
        gatt_supported: bool,
    },
    ProvLinkEstablished {
        context_id: u8,
    },
    ProvLinkClosed {
        context_id: u8,
        close_reason: u8,
    },
    ProvCapsReceived {
        context_id: u8,
        num_elements: u8,
    },
    ProvComplete {
        context_id: u8,
        iv_index: u32,
        net_key_index: u16,
        address: u16,
        #[serde(with = "hex::serde")]
        device_key: [u8; 16],
    },
    ProvFailed {
        context_id: u8,
        error_code: u8,
    },
    MeshMessageReceivedUnicast(ReceivedMessage),
    MeshMessageReceivedSubscription(ReceivedMessage),
    MeshTxComplete {
        token: u32,
    },
    Other {
        opcode: u8,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
    },
}

impl Event {
    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            Event::DeviceStarted { .. } => EventKind::DeviceStarted,
            Event::CmdRsp { .. } => EventKind::CmdRsp,
            Event::ProvUnprovisionedReceived { .. } => EventKind::ProvUnprovisionedReceived,
            Event::ProvLinkEstablished { .. } => EventKind::ProvLinkEstablished,
            Event::ProvLinkClosed { .. } => EventKind::ProvLinkClosed,
            Event::ProvCapsReceived { .. } => EventKind::ProvCapsReceived,
            Event::ProvComplete { .. } => EventKind::ProvComplete,
            Event::ProvFailed { .. } => EventKind::ProvFailed,
            Event::MeshMessageReceivedUnicast(_) => EventKind::MeshMessageReceivedUnicast,
            Event::MeshMessageReceivedSubscription(_) => {
                EventKind::MeshMessageReceivedSubscription
            }
            Event::MeshTxComplete { .. } => EventKind::MeshTxComplete,
            Event::Other { .. } => return None,
        };
        Some(kind)
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Event::Other { opcode, .. } => *opcode,
            other => other.kind().map(EventKind::opcode).unwrap_or_default(),
        }
    }

    /// Human readable event name used in logs.
    pub fn name(&self) -> String {
        match self.kind() {
            Some(kind) => kind.to_string(),
            None => format!("EVENT_{opcode:#04x}", opcode = self.opcode()),
        }
    }
}
