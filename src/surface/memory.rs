//! In-memory delivery surface
//!
//! Records every operation and can be scripted to fail, which makes it the
//! surface of choice for tests and dry runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use super::{ChatId, DeliverySurface, MessageRef, OutgoingFile, SendStrategy};
use crate::core::error::{Error, Result};

/// One recorded surface operation
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    StatusSent { message: MessageRef, text: String },
    Edited { message: MessageRef, text: String },
    FileSent {
        message: MessageRef,
        strategy: SendStrategy,
        file_name: String,
        bytes: u64,
    },
    Deleted { message: MessageRef },
}

/// Failure to inject into the next send of a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// The platform refuses the file
    Rejected,
    /// The platform is briefly unavailable
    Transient,
    /// The platform asks to wait before trying again
    RateLimited(Duration),
}

#[derive(Default)]
struct State {
    next_id: i64,
    events: Vec<SurfaceEvent>,
    live: HashSet<MessageRef>,
    contents: HashMap<MessageRef, Vec<u8>>,
    scripted: HashMap<SendStrategy, VecDeque<ScriptedFailure>>,
    rejected: HashSet<SendStrategy>,
    delete_attempts: u64,
}

/// Recording surface that keeps everything in memory
#[derive(Default)]
pub struct MemorySurface {
    state: Mutex<State>,
    send_delay: Option<Duration>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Surface that takes `delay` for every file it sends
    pub fn with_send_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            send_delay: Some(delay),
        }
    }

    /// Fails the next send that uses `strategy`
    pub fn fail_next(&self, strategy: SendStrategy, failure: ScriptedFailure) {
        self.state
            .lock()
            .scripted
            .entry(strategy)
            .or_default()
            .push_back(failure);
    }

    /// Rejects every send that uses `strategy`
    pub fn reject_always(&self, strategy: SendStrategy) {
        self.state.lock().rejected.insert(strategy);
    }

    /// Deletes a message as if the user had done it
    pub fn delete_externally(&self, message: &MessageRef) {
        self.state.lock().live.remove(message);
    }

    /// Everything recorded so far, in order
    pub fn events(&self) -> Vec<SurfaceEvent> {
        self.state.lock().events.clone()
    }

    /// Files that were accepted
    pub fn sent_files(&self) -> Vec<(MessageRef, SendStrategy, String, u64)> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                SurfaceEvent::FileSent {
                    message,
                    strategy,
                    file_name,
                    bytes,
                } => Some((*message, *strategy, file_name.clone(), *bytes)),
                _ => None,
            })
            .collect()
    }

    /// Texts written into `message`: the initial send followed by every edit
    pub fn texts_of(&self, message: &MessageRef) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                SurfaceEvent::StatusSent { message: m, text } if m == message => Some(text.clone()),
                SurfaceEvent::Edited { message: m, text } if m == message => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Bytes received for a sent file
    pub fn content_of(&self, message: &MessageRef) -> Option<Vec<u8>> {
        self.state.lock().contents.get(message).cloned()
    }

    /// Whether a message currently exists
    pub fn is_live(&self, message: &MessageRef) -> bool {
        self.state.lock().live.contains(message)
    }

    /// Number of delete calls, successful or not
    pub fn delete_attempts(&self) -> u64 {
        self.state.lock().delete_attempts
    }

    fn allocate(&self, chat: ChatId) -> MessageRef {
        let mut state = self.state.lock();
        state.next_id += 1;
        let message = MessageRef {
            chat_id: chat,
            message_id: state.next_id,
        };
        state.live.insert(message);
        message
    }

    fn take_failure(&self, strategy: SendStrategy) -> Option<ScriptedFailure> {
        let mut state = self.state.lock();
        if state.rejected.contains(&strategy) {
            return Some(ScriptedFailure::Rejected);
        }
        state.scripted.get_mut(&strategy).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl DeliverySurface for MemorySurface {
    async fn send_status(&self, chat: ChatId, text: &str) -> Result<MessageRef> {
        let message = self.allocate(chat);
        self.state.lock().events.push(SurfaceEvent::StatusSent {
            message,
            text: text.to_string(),
        });
        Ok(message)
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.live.contains(message) {
            return Err(Error::MessageGone);
        }
        state.events.push(SurfaceEvent::Edited {
            message: *message,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutgoingFile,
        strategy: SendStrategy,
    ) -> Result<MessageRef> {
        if let Some(failure) = self.take_failure(strategy) {
            return Err(match failure {
                ScriptedFailure::Rejected => {
                    Error::UploadRejected(format!("{strategy:?} refused {}", file.file_name))
                }
                ScriptedFailure::Transient => Error::PlatformTransient("try again later".to_string()),
                ScriptedFailure::RateLimited(retry_after) => Error::RateLimited {
                    retry_after,
                    reason: "Too Many Requests".to_string(),
                },
            });
        }

        let mut reader = tokio::fs::File::open(&file.path).await?;
        let mut content = Vec::with_capacity(file.size as usize);
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            content.extend_from_slice(&buffer[..n]);
            if let Some(ref sent) = file.sent_bytes {
                sent(n as u64);
            }
        }

        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }

        let message = self.allocate(chat);
        let mut state = self.state.lock();
        state.events.push(SurfaceEvent::FileSent {
            message,
            strategy,
            file_name: file.file_name.clone(),
            bytes: content.len() as u64,
        });
        state.contents.insert(message, content);
        Ok(message)
    }

    async fn delete_message(&self, message: &MessageRef) -> Result<()> {
        let mut state = self.state.lock();
        state.delete_attempts += 1;
        if !state.live.remove(message) {
            return Err(Error::MessageGone);
        }
        state.contents.remove(message);
        state.events.push(SurfaceEvent::Deleted { message: *message });
        Ok(())
    }
}
