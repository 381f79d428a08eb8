use std::path::PathBuf;

use async_trait::async_trait;
use mailforge_common::{events::SessionInfo, message::Message};
use tracing::debug;

use crate::{MessageStore, Result};

/// One-file-per-message store. Each message lands as `<ulid>.eml` under the
/// configured directory; the ulid filename keeps a directory listing sorted
/// by arrival time and makes the write idempotent per message id.
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &std::path::Path {
        &self.directory
    }

    fn path_for(&self, message: &Message) -> PathBuf {
        self.directory.join(format!("{}.eml", message.id()))
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn save(&self, session: &SessionInfo, message: &Message) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;

        let path = self.path_for(message);
        tokio::fs::write(&path, message.to_wire()).await?;

        debug!(
            message_id = %message.id(),
            session_id = %session.id,
            path = %path.display(),
            "message persisted"
        );

        Ok(())
    }
}
