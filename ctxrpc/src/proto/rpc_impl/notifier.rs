use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::proto::rpc_types::error::{Error, Result};

/// Single-slot wake-up gate.
///
/// `notify` with no pending waiter is remembered, so the next `wait` returns
/// at once; several `notify` calls before a `wait` collapse into one wake-up.
/// `throw` makes the next `wait` fail with the given error.
#[derive(Debug, Default)]
pub struct Notifier {
    notify: Notify,
    reason: Mutex<Option<Error>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait(&self) -> Result<()> {
        if let Some(err) = self.reason.lock().take() {
            return Err(err);
        }
        self.notify.notified().await;
        match self.reason.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub fn throw(&self, reason: Error) {
        *self.reason.lock() = Some(reason);
        self.notify.notify_one();
    }
}
