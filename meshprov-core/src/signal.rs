use crate::error::{MeshError, Result};
use std::time::Duration;
use tokio::sync::watch;

/// A resettable one-shot flag that carries a value.
///
/// `set` raises it, waiters observe the value, and the step that consumed it
/// calls `reset` so the next cycle starts lowered.
pub struct WorkflowSignal<T> {
    name: &'static str,
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync> WorkflowSignal<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { name, tx }
    }

    pub fn set(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    pub fn reset(&self) {
        self.tx.send_replace(None);
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the signal is raised, at most `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<T> {
        self.wait_for(timeout, |_| true).await
    }

    /// Wait until the signal is raised with a value matching `accept`.
    pub async fn wait_for<F>(&self, timeout: Duration, mut accept: F) -> Result<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|value| value.as_ref().is_some_and(&mut accept)),
        )
        .await;

        match waited {
            Ok(Ok(value)) => value.clone().ok_or_else(|| self.unresponsive()),
            Ok(Err(_)) => Err(MeshError::Transport(format!("{} signal dropped", self.name))),
            Err(_) => Err(self.unresponsive()),
        }
    }

    fn unresponsive(&self) -> MeshError {
        MeshError::DeviceUnresponsive {
            waiting_for: self.name.to_string(),
        }
    }
}
