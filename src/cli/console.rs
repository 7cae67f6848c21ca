//! Console delivery surface for the command-line interface
//!
//! Status messages are spinners on stderr; "sent" files are copied into an
//! outbox directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use media_relay::core::error::{Error, Result};
use media_relay::surface::{ChatId, DeliverySurface, MessageRef, OutgoingFile, SendStrategy};

/// Creates a status spinner for CLI display
pub fn create_status_spinner(text: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(text.replace('\n', " | "));
    pb
}

enum Posted {
    Status(ProgressBar),
    File(PathBuf),
}

/// Delivery surface that renders to the terminal
pub struct ConsoleSurface {
    outbox: PathBuf,
    multi: MultiProgress,
    posted: Mutex<HashMap<MessageRef, Posted>>,
    next_id: AtomicI64,
}

impl ConsoleSurface {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
            multi: MultiProgress::new(),
            posted: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    fn next_ref(&self, chat: ChatId) -> MessageRef {
        MessageRef {
            chat_id: chat,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl DeliverySurface for ConsoleSurface {
    async fn send_status(&self, chat: ChatId, text: &str) -> Result<MessageRef> {
        let message = self.next_ref(chat);
        let pb = self.multi.add(create_status_spinner(text));
        pb.tick();
        self.posted.lock().insert(message, Posted::Status(pb));
        Ok(message)
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()> {
        match self.posted.lock().get(message) {
            Some(Posted::Status(pb)) => {
                pb.set_message(text.replace('\n', " | "));
                pb.tick();
                Ok(())
            }
            Some(Posted::File(_)) => Err(Error::InvalidInput("files have no text".to_string())),
            None => Err(Error::MessageGone),
        }
    }

    async fn send_file(
        &self,
        chat: ChatId,
        file: &OutgoingFile,
        strategy: SendStrategy,
    ) -> Result<MessageRef> {
        tokio::fs::create_dir_all(&self.outbox).await?;
        let message = self.next_ref(chat);
        let target = self
            .outbox
            .join(format!("{}-{}", message.message_id, file.file_name));

        let mut reader = tokio::fs::File::open(&file.path).await?;
        let mut writer = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await?;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await?;
            if let Some(ref sent) = file.sent_bytes {
                sent(n as u64);
            }
        }
        writer.flush().await?;

        let _ = self.multi.println(format!(
            "📁 {} saved to {} ({strategy:?})",
            file.file_name,
            target.display()
        ));
        self.posted.lock().insert(message, Posted::File(target));
        Ok(message)
    }

    async fn delete_message(&self, message: &MessageRef) -> Result<()> {
        let removed = self.posted.lock().remove(message);
        match removed {
            Some(Posted::Status(pb)) => {
                pb.finish_and_clear();
                Ok(())
            }
            Some(Posted::File(path)) => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => log::info!("Expired {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(())
            }
            None => Err(Error::MessageGone),
        }
    }
}
