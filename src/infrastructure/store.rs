//! # File Session Store
//!
//! One JSON file per conversation under a directory. Commits write a temporary file next to
//! the target, flush it to disk and rename it into place, so neither a reader nor a crash ever
//! leaves a half-written session behind.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::domain::errors::StorageError;
use crate::domain::session::Session;
use crate::domain::traits::SessionStore;
use crate::domain::types::ChatId;

pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Creates the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: ChatId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Writes and flushes to disk, so the rename can only ever expose a complete blob.
    async fn write_synced(path: &Path, blob: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(blob).await?;
        file.sync_all().await
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, id: ChatId) -> Result<Option<Session>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, id: ChatId, session: &Session) -> Result<(), StorageError> {
        let blob = serde_json::to_vec_pretty(session)?;
        let target = self.path_for(id);
        let temp = self.dir.join(format!(".{id}.json.tmp"));

        if let Err(e) = Self::write_synced(&temp, &blob).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        debug!("Session {} committed ({} bytes)", id, blob.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::Holding;
    use crate::domain::types::UserId;

    #[tokio::test]
    async fn test_missing_session_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        assert!(store.load(ChatId(42)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path().join("sessions")).await.unwrap();

        let mut session = Session::new(ChatId(-7), Some(UserId(1)));
        session.set("category", "Clubs");
        session.control.holding = Holding::Forever;
        store.commit(ChatId(-7), &session).await.unwrap();

        session.set("category", "Events");
        store.commit(ChatId(-7), &session).await.unwrap();

        let loaded = store.load(ChatId(-7)).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        let files: Vec<_> = std::fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, ["-7.json"]);
    }

    #[tokio::test]
    async fn test_commit_overwrites_stale_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join(".3.json.tmp"), "leftover from a crash").unwrap();

        let mut session = Session::new(ChatId(3), None);
        session.set("title", "Fix the door");
        store.commit(ChatId(3), &session).await.unwrap();

        assert_eq!(store.load(ChatId(3)).await.unwrap().unwrap(), session);
        assert!(!dir.path().join(".3.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("5.json"), "{not json").unwrap();
        assert!(matches!(
            store.load(ChatId(5)).await,
            Err(StorageError::Serialization(_))
        ));
    }
}
