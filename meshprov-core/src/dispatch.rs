//! Fan-out of inbound events to registered listeners.

use crate::aci::command;
use crate::aci::{Event, EventKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// A listener invoked inline on the dispatch path. Must not block.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TaskHandler = Arc<dyn Fn(Arc<Event>) -> TaskFuture + Send + Sync>;

#[derive(Clone)]
enum Listener {
    Inline(Arc<dyn EventListener>),
    Task {
        kinds: Vec<EventKind>,
        handler: TaskHandler,
    },
}

/// Delivers each event, in transport order, to every listener in registration order.
///
/// Inline listeners run on the dispatch path. Task listeners get their own
/// spawned task per matching event, so long workflows never hold up delivery
/// of the next event. A semaphore bounds how many of those tasks do work at
/// once; the rest wait for a permit inside their task.
pub struct EventDispatcher {
    listeners: RwLock<Vec<Listener>>,
    suppressed: RwLock<HashSet<u8>>,
    filter_enabled: AtomicBool,
    task_permits: Arc<Semaphore>,
    tasks: AsyncMutex<JoinSet<()>>,
}

impl EventDispatcher {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            suppressed: RwLock::new(HashSet::new()),
            filter_enabled: AtomicBool::new(true),
            task_permits: Arc::new(Semaphore::new(max_tasks.max(1))),
            tasks: AsyncMutex::new(JoinSet::new()),
        }
    }

    pub fn register(&self, listener: Arc<dyn EventListener>) {
        self.write_listeners().push(Listener::Inline(listener));
    }

    /// Register a handler that runs on its own task for every event of `kinds`.
    pub fn register_task<F, Fut>(&self, kinds: &[EventKind], handler: F)
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.write_listeners().push(Listener::Task {
            kinds: kinds.to_vec(),
            handler,
        });
    }

    /// Add opcodes to the suppression set.
    pub fn filter_add(&self, opcodes: impl IntoIterator<Item = u8>) {
        self.suppressed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(opcodes);
    }

    pub fn filter_enable(&self) {
        self.filter_enabled.store(true, Ordering::SeqCst);
    }

    pub fn filter_disable(&self) {
        self.filter_enabled.store(false, Ordering::SeqCst);
    }

    pub fn suppressed(&self) -> Vec<u8> {
        let mut opcodes: Vec<u8> = self
            .suppressed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        opcodes.sort_unstable();
        opcodes
    }

    fn is_suppressed(&self, opcode: u8) -> bool {
        self.filter_enabled.load(Ordering::SeqCst)
            && self
                .suppressed
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&opcode)
    }

    fn write_listeners(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Listener>> {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn dispatch(&self, event: Event) {
        if self.is_suppressed(event.opcode()) {
            trace!("Suppressed {name}", name = event.name());
            return;
        }
        debug!("<- {name}", name = event.name());

        let event = Arc::new(event);
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            match listener {
                Listener::Inline(listener) => listener.on_event(&event),
                Listener::Task { kinds, handler } => {
                    if !event.kind().is_some_and(|kind| kinds.contains(&kind)) {
                        continue;
                    }
                    let permits = self.task_permits.clone();
                    let name = event.name();
                    let work = handler(event.clone());
                    let mut tasks = self.tasks.lock().await;
                    while tasks.try_join_next().is_some() {}
                    tasks.spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            warn!("Task pool closed, dropping {name}");
                            return;
                        };
                        work.await;
                    });
                }
            }
        }
    }

    /// Dispatch events until the stream ends.
    pub async fn run(&self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event).await;
        }
        info!("Event stream ended");
    }

    /// Abort listener tasks still running.
    pub async fn shutdown(&self) {
        self.task_permits.close();
        self.tasks.lock().await.shutdown().await;
    }
}

/// An event kept for later inspection.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedEvent {
    pub received_at: DateTime<Utc>,
    pub name: String,
    pub event: Event,
}

/// Logs device starts and command responses, and keeps every other event in an
/// unbounded capture list.
#[derive(Default)]
pub struct EventLog {
    captured: Mutex<Vec<CapturedEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventListener for EventLog {
    fn on_event(&self, event: &Event) {
        match event {
            Event::DeviceStarted { .. } => info!("Device rebooted."),
            Event::CmdRsp { opcode, status, .. } => {
                let name = command::opcode_name(*opcode);
                if status.is_success() {
                    debug!("{name}: Success");
                } else {
                    warn!("{name}: {status}");
                }
            }
            other => {
                trace!("Captured {name}", name = other.name());
                self.captured
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(CapturedEvent {
                        received_at: Utc::now(),
                        name: other.name(),
                        event: other.clone(),
                    });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aci::Status;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u8>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.opcode());
        }
    }

    fn other(opcode: u8) -> Event {
        Event::Other {
            opcode,
            payload: vec![opcode],
        }
    }

    #[tokio::test]
    async fn test_suppressed_opcodes_never_reach_listeners() {
        let dispatcher = EventDispatcher::new(4);
        let recorder = Arc::new(Recorder::default());
        let log = Arc::new(EventLog::new());
        dispatcher.register(recorder.clone());
        dispatcher.register(log.clone());
        dispatcher.filter_add([0xD2, 0x8A]);

        dispatcher.dispatch(other(0x8A)).await;
        dispatcher.dispatch(Event::MeshTxComplete { token: 1 }).await;
        dispatcher.dispatch(other(0x8B)).await;
        dispatcher.dispatch(other(0x8B)).await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0x8B, 0x8B]);
        let captured = log.events();
        assert_eq!(captured.len(), 2);
        assert!(captured.iter().all(|c| c.event.opcode() == 0x8B));
    }

    #[tokio::test]
    async fn test_disabled_filter_lets_everything_through() {
        let dispatcher = EventDispatcher::new(4);
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());
        dispatcher.filter_add([0x8A]);
        dispatcher.filter_disable();

        dispatcher.dispatch(other(0x8A)).await;
        dispatcher.filter_enable();
        dispatcher.dispatch(other(0x8A)).await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec![0x8A]);
    }

    #[tokio::test]
    async fn test_command_responses_are_logged_not_captured() {
        let log = EventLog::new();
        log.on_event(&Event::CmdRsp {
            opcode: 0x9C,
            status: Status(0x85),
            response: None,
        });
        log.on_event(&Event::DeviceStarted {
            operating_mode: 2,
            hw_error: 0,
            data_credit_available: 1,
        });
        assert!(log.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_task_does_not_stall_dispatch() {
        let dispatcher = EventDispatcher::new(4);
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        dispatcher.register_task(&[EventKind::ProvComplete], move |_event| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());

        let complete = Event::ProvComplete {
            context_id: 0,
            iv_index: 0,
            net_key_index: 0,
            address: 0x10,
            device_key: [0; 16],
        };
        dispatcher.dispatch(complete).await;
        dispatcher.dispatch(other(0x8B)).await;

        // both events delivered while the workflow task is still sleeping
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pool_still_delivers_responses() {
        let dispatcher = EventDispatcher::new(1);
        let reply = Arc::new(tokio::sync::Notify::new());
        let answered = Arc::new(AtomicUsize::new(0));

        let (waiting, counter) = (reply.clone(), answered.clone());
        dispatcher.register_task(&[EventKind::ProvComplete], move |_event| {
            let (reply, counter) = (waiting.clone(), counter.clone());
            async move {
                if tokio::time::timeout(Duration::from_secs(10), reply.notified())
                    .await
                    .is_ok()
                {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        struct Replier(Arc<tokio::sync::Notify>);
        impl EventListener for Replier {
            fn on_event(&self, event: &Event) {
                if event.opcode() == 0x8B {
                    self.0.notify_one();
                }
            }
        }
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());
        dispatcher.register(Arc::new(Replier(reply)));

        let complete = Event::ProvComplete {
            context_id: 0,
            iv_index: 0,
            net_key_index: 0,
            address: 0x10,
            device_key: [0; 16],
        };
        let start = tokio::time::Instant::now();
        dispatcher.dispatch(complete.clone()).await;
        dispatcher.dispatch(complete).await;
        dispatcher.dispatch(other(0x8B)).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(recorder.seen.lock().unwrap().len(), 3);

        // the first workflow gets its answer without waiting out its timeout
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(answered.load(Ordering::SeqCst), 1);
    }
}
