//! Status reporter
//!
//! Each transfer owns one status message that is edited in place as the
//! transfer advances. Updates go through a `watch` channel so they never
//! block the sender; a background task coalesces them into at most one edit
//! per interval. The terminal text travels on a separate oneshot channel and
//! is always delivered exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::error::Error;
use crate::surface::{ChatId, DeliverySurface, MessageRef};

/// Opens status messages on a delivery surface
#[derive(Clone)]
pub struct StatusReporter {
    surface: Arc<dyn DeliverySurface>,
    min_interval: Duration,
}

impl StatusReporter {
    pub fn new(surface: Arc<dyn DeliverySurface>, min_interval: Duration) -> Self {
        Self {
            surface,
            min_interval,
        }
    }

    /// Sends the initial status text and starts the edit task for it.
    ///
    /// If the message cannot be created the handle still works: updates are
    /// dropped and the final text is sent as a new message.
    pub async fn open(&self, chat: ChatId, initial: &str) -> StatusHandle {
        let message = match self.surface.send_status(chat, initial).await {
            Ok(message) => Some(message),
            Err(e) => {
                log::warn!("Could not post status message to chat {chat}: {e}");
                None
            }
        };

        let (update_tx, update_rx) = watch::channel(initial.to_string());
        let (final_tx, final_rx) = oneshot::channel();

        let task = tokio::spawn(run_status(
            Arc::clone(&self.surface),
            chat,
            message,
            initial.to_string(),
            self.min_interval,
            update_rx,
            final_rx,
        ));

        StatusHandle {
            message,
            updater: StatusUpdater {
                tx: Arc::new(update_tx),
            },
            final_tx,
            task,
        }
    }
}

/// Cheap, cloneable sender of intermediate status texts
#[derive(Clone)]
pub struct StatusUpdater {
    tx: Arc<watch::Sender<String>>,
}

impl StatusUpdater {
    /// Replaces the pending text; never blocks
    pub fn update(&self, text: impl Into<String>) {
        self.tx.send_replace(text.into());
    }
}

/// The status message of one transfer
pub struct StatusHandle {
    message: Option<MessageRef>,
    updater: StatusUpdater,
    final_tx: oneshot::Sender<String>,
    task: JoinHandle<Option<MessageRef>>,
}

impl StatusHandle {
    /// Message created by [`StatusReporter::open`], if any
    pub fn message(&self) -> Option<MessageRef> {
        self.message
    }

    pub fn updater(&self) -> StatusUpdater {
        self.updater.clone()
    }

    /// Delivers the terminal text and waits for it to land.
    ///
    /// Returns the message that carries the final text.
    pub async fn finish(self, final_text: impl Into<String>) -> Option<MessageRef> {
        if self.final_tx.send(final_text.into()).is_err() {
            log::warn!("Status task ended before the final update");
        }
        match self.task.await {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Status task failed: {e}");
                None
            }
        }
    }
}

async fn run_status(
    surface: Arc<dyn DeliverySurface>,
    chat: ChatId,
    mut message: Option<MessageRef>,
    initial: String,
    min_interval: Duration,
    mut updates: watch::Receiver<String>,
    mut final_rx: oneshot::Receiver<String>,
) -> Option<MessageRef> {
    let mut shown = initial;
    let mut next_edit = Instant::now() + min_interval;
    let mut pending = false;
    let mut open = true;

    let final_text = loop {
        tokio::select! {
            biased;
            text = &mut final_rx => break text.ok(),
            changed = updates.changed(), if open && !pending => match changed {
                Ok(()) => pending = true,
                Err(_) => open = false,
            },
            _ = tokio::time::sleep_until(next_edit), if pending => {
                pending = false;
                let text = updates.borrow_and_update().clone();
                if text == shown {
                    continue;
                }
                if let Some(target) = message {
                    match surface.edit_message(&target, &text).await {
                        Ok(()) => {}
                        Err(Error::MessageGone) => {
                            log::debug!("Status message {target:?} is gone");
                            message = None;
                        }
                        Err(e) => log::warn!("Status edit failed: {e}"),
                    }
                }
                shown = text;
                next_edit = Instant::now() + min_interval;
            }
        }
    };

    let final_text = final_text?;

    if let Some(target) = message {
        match surface.edit_message(&target, &final_text).await {
            Ok(()) => return Some(target),
            Err(e) => log::debug!("Final status edit failed ({e}), sending a new message"),
        }
    }

    match surface.send_status(chat, &final_text).await {
        Ok(message) => Some(message),
        Err(e) => {
            log::warn!("Could not deliver final status to chat {chat}: {e}");
            None
        }
    }
}
