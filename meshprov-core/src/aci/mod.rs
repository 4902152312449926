//! Typed view of the serial command/event protocol.
//!
//! Only the externally observable contract lives here: which commands exist,
//! which events come back and how command-response statuses are named. Binary
//! framing belongs to whatever owns the serial link.

pub mod access;
pub mod command;
pub mod event;
mod status;

pub use command::{Command, Publish};
pub use event::{CommandResponse, Event, EventKind, ReceivedMessage};
pub use status::{Status, StatusCode};
