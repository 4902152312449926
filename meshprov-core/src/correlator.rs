//! Single-slot exchanges that hand asynchronous command responses back to the
//! caller that issued the command.
//!
//! The device answers allocation commands in the order it receives them and
//! the responses carry no request tag. Each exchange therefore counts the
//! requests whose caller gave up waiting; that many of the next responses of
//! its kind belong to nobody and are released on the device.

use crate::aci::command::{self, opcode};
use crate::aci::{Command, CommandResponse, Event, Status};
use crate::dispatch::EventListener;
use crate::error::{MeshError, Result};
use crate::handles::{AddressHandle, DevkeyHandle};
use crate::transport::Transport;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::Display;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Per-node device resources that are allocated by command and correlated by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum HandleKind {
    #[strum(serialize = "device key")]
    Devkey,
    #[strum(serialize = "address publication")]
    Address,
}

/// Outcome of an allocation command: the granted handle or the failing status.
pub type Grant<H> = std::result::Result<H, Status>;

/// What became of a value handed to [`Exchange::put`].
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery<T> {
    Delivered,
    /// Answers a request whose caller stopped waiting.
    Orphaned(T),
    /// The slot still held an unread value.
    Occupied(T),
}

/// A rendezvous slot holding at most one unread value.
///
/// The producer never blocks and never drops: a value that cannot be delivered
/// is handed back in the [`Delivery`]. Takers queue behind each other.
pub struct Exchange<T> {
    kind: HandleKind,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    abandoned: StdMutex<usize>,
}

impl<T: Send> Exchange<T> {
    pub fn new(kind: HandleKind) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            kind,
            tx,
            rx: Mutex::new(rx),
            abandoned: StdMutex::new(0),
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    fn abandoned(&self) -> MutexGuard<'_, usize> {
        self.abandoned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, value: T) -> Result<Delivery<T>> {
        let mut abandoned = self.abandoned();
        if *abandoned > 0 {
            *abandoned -= 1;
            return Ok(Delivery::Orphaned(value));
        }
        match self.tx.try_send(value) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(TrySendError::Full(value)) => Ok(Delivery::Occupied(value)),
            Err(TrySendError::Closed(_)) => Err(MeshError::Transport(format!(
                "{kind} exchange closed",
                kind = self.kind
            ))),
        }
    }

    /// Wait for the value answering one request, at most `timeout`.
    ///
    /// On expiry the request is counted as abandoned, so its answer is never
    /// handed to a later taker.
    pub async fn take(&self, timeout: Duration) -> Result<T> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(MeshError::Transport(format!(
                "{kind} exchange closed",
                kind = self.kind
            ))),
            Err(_) => {
                let mut abandoned = self.abandoned();
                // landed as the timer fired
                if let Ok(value) = rx.try_recv() {
                    return Ok(value);
                }
                *abandoned += 1;
                Err(MeshError::DeviceUnresponsive {
                    waiting_for: format!("{kind} handle", kind = self.kind),
                })
            }
        }
    }

    /// Give up on a request without waiting. Returns its answer if it is
    /// already here.
    pub async fn abandon(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let mut abandoned = self.abandoned();
        match rx.try_recv() {
            Ok(value) => Some(value),
            Err(_) => {
                *abandoned += 1;
                None
            }
        }
    }

    /// Responses still owed to callers that gave up.
    pub fn abandoned_requests(&self) -> usize {
        *self.abandoned()
    }
}

/// Routes allocation responses into their exchanges and frees the handles
/// nobody is waiting for.
pub struct Correlator {
    transport: Arc<dyn Transport>,
    devkey: Exchange<Grant<DevkeyHandle>>,
    address: Exchange<Grant<AddressHandle>>,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            devkey: Exchange::new(HandleKind::Devkey),
            address: Exchange::new(HandleKind::Address),
        }
    }

    pub fn devkey(&self) -> &Exchange<Grant<DevkeyHandle>> {
        &self.devkey
    }

    pub fn address(&self) -> &Exchange<Grant<AddressHandle>> {
        &self.address
    }

    /// Deliver a command response. Returns `Ok(false)` if the response is not
    /// one the correlator tracks.
    pub fn on_command_response(
        &self,
        command_opcode: u8,
        status: Status,
        response: Option<&CommandResponse>,
    ) -> Result<bool> {
        match (command_opcode, response) {
            (opcode::DEVKEY_ADD, Some(CommandResponse::DevkeyAdd { devkey_handle })) => {
                let delivery = self.devkey.put(Ok(*devkey_handle))?;
                self.reclaim(HandleKind::Devkey, delivery, |devkey_handle| {
                    Command::DevkeyDelete { devkey_handle }
                })?;
            }
            (opcode::ADDR_PUBLICATION_ADD, Some(CommandResponse::AddrPublicationAdd { address_handle })) => {
                let delivery = self.address.put(Ok(*address_handle))?;
                self.reclaim(HandleKind::Address, delivery, |address_handle| {
                    Command::AddrPublicationRemove { address_handle }
                })?;
            }
            (opcode::DEVKEY_ADD, _) if !status.is_success() => {
                let delivery = self.devkey.put(Err(status))?;
                self.reclaim(HandleKind::Devkey, delivery, |devkey_handle| {
                    Command::DevkeyDelete { devkey_handle }
                })?;
            }
            (opcode::ADDR_PUBLICATION_ADD, _) if !status.is_success() => {
                let delivery = self.address.put(Err(status))?;
                self.reclaim(HandleKind::Address, delivery, |address_handle| {
                    Command::AddrPublicationRemove { address_handle }
                })?;
            }
            (opcode::DEVKEY_ADD | opcode::ADDR_PUBLICATION_ADD, _) => {
                warn!(
                    "{name} response without a handle",
                    name = command::opcode_name(command_opcode)
                );
                return Ok(false);
            }
            _ => return Ok(false),
        }
        debug!(
            "Correlated {name} response ({status})",
            name = command::opcode_name(command_opcode)
        );
        Ok(true)
    }

    /// Free a granted handle that no caller will take.
    fn reclaim<H>(
        &self,
        kind: HandleKind,
        delivery: Delivery<Grant<H>>,
        delete: impl FnOnce(H) -> Command,
    ) -> Result<()>
    where
        H: fmt::Display + Copy,
    {
        let grant = match delivery {
            Delivery::Delivered => return Ok(()),
            Delivery::Orphaned(grant) => {
                if let Ok(handle) = grant {
                    warn!("Releasing late {kind} handle {handle}");
                }
                grant
            }
            Delivery::Occupied(grant) => {
                if let Ok(handle) = grant {
                    warn!(
                        "{err}, releasing {kind} handle {handle}",
                        err = MeshError::SlotOccupied(kind)
                    );
                }
                grant
            }
        };
        match grant {
            Ok(handle) => self.transport.send(delete(handle)),
            Err(status) => {
                debug!("Ignoring unclaimed {kind} failure ({status})");
                Ok(())
            }
        }
    }
}

impl EventListener for Correlator {
    fn on_event(&self, event: &Event) {
        if let Event::CmdRsp {
            opcode,
            status,
            response,
        } = event
            && let Err(e) = self.on_command_response(*opcode, *status, response.as_ref())
        {
            warn!("Failed to handle {name} response: {e}", name = command::opcode_name(*opcode));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<Command>>,
    }

    impl Transport for Recorder {
        fn send(&self, command: Command) -> Result<()> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }
    }

    fn devkey_granted(handle: u16) -> Event {
        Event::CmdRsp {
            opcode: opcode::DEVKEY_ADD,
            status: Status::SUCCESS,
            response: Some(CommandResponse::DevkeyAdd {
                devkey_handle: DevkeyHandle(handle),
            }),
        }
    }

    #[tokio::test]
    async fn test_take_returns_value_once() -> anyhow::Result<()> {
        let exchange = Exchange::new(HandleKind::Devkey);
        assert_eq!(exchange.put(7u16)?, Delivery::Delivered);
        assert_eq!(exchange.take(Duration::from_secs(1)).await?, 7);
        assert_eq!(exchange.put(8u16)?, Delivery::Delivered);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_put_is_handed_back_not_dropped() -> anyhow::Result<()> {
        let exchange = Exchange::new(HandleKind::Address);
        exchange.put(1u16)?;
        assert_eq!(exchange.put(2u16)?, Delivery::Occupied(2));
        // the first value is still there
        assert_eq!(exchange.take(Duration::from_secs(1)).await?, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_blocks_until_put() -> anyhow::Result<()> {
        let exchange = Arc::new(Exchange::new(HandleKind::Devkey));
        let producer = exchange.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = producer.put(42u16);
        });
        assert_eq!(exchange.take(Duration::from_secs(5)).await?, 42);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_to_abandoned_take_is_orphaned() -> anyhow::Result<()> {
        let exchange: Exchange<u16> = Exchange::new(HandleKind::Devkey);
        let err = exchange.take(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, MeshError::DeviceUnresponsive { .. }));
        assert_eq!(exchange.abandoned_requests(), 1);

        assert_eq!(exchange.put(1)?, Delivery::Orphaned(1));
        assert_eq!(exchange.put(2)?, Delivery::Delivered);
        assert_eq!(exchange.take(Duration::from_secs(1)).await?, 2);
        assert_eq!(exchange.abandoned_requests(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_routes_responses_by_kind() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let correlator = Correlator::new(recorder.clone());
        correlator.on_event(&Event::CmdRsp {
            opcode: opcode::ADDR_PUBLICATION_ADD,
            status: Status::SUCCESS,
            response: Some(CommandResponse::AddrPublicationAdd {
                address_handle: AddressHandle(3),
            }),
        });
        correlator.on_event(&Event::CmdRsp {
            opcode: opcode::DEVKEY_ADD,
            status: Status(0x86),
            response: None,
        });
        // unrelated responses are ignored
        correlator.on_event(&Event::CmdRsp {
            opcode: opcode::SUBNET_ADD,
            status: Status::SUCCESS,
            response: None,
        });

        let timeout = Duration::from_secs(1);
        assert_eq!(correlator.address().take(timeout).await?, Ok(AddressHandle(3)));
        assert_eq!(correlator.devkey().take(timeout).await?, Err(Status(0x86)));
        assert!(recorder.sent.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_grants_are_released() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let correlator = Correlator::new(recorder.clone());

        // nobody takes the first grant, so the second has nowhere to go
        correlator.on_event(&devkey_granted(1));
        correlator.on_event(&devkey_granted(2));

        assert!(correlator.devkey().take(Duration::from_secs(1)).await.is_ok());
        let _ = correlator.devkey().take(Duration::from_secs(1)).await;
        correlator.on_event(&devkey_granted(3));

        assert_eq!(
            *recorder.sent.lock().unwrap(),
            vec![
                Command::DevkeyDelete {
                    devkey_handle: DevkeyHandle(2)
                },
                Command::DevkeyDelete {
                    devkey_handle: DevkeyHandle(3)
                },
            ]
        );
        Ok(())
    }
}
