//! Single-slot cancellable timer.
//!
//! Arming replaces whatever was armed before, so a slot never holds more than
//! one pending deadline. The slot is polled only by its owner's event loop;
//! a disarmed slot can therefore never fire late.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Sleep};

#[derive(Debug, Default)]
pub struct TimerSlot {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, after: Duration) {
        self.sleep = Some(Box::pin(sleep(after)));
    }

    pub fn disarm(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves when the armed deadline passes, disarming the slot.
    ///
    /// Pends forever while disarmed. Cancel-safe.
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(deadline) => {
                deadline.as_mut().await;
                self.sleep = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
