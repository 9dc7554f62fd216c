//! # Redis Session Store
//!
//! Session blobs as JSON strings under `<prefix><chat id>`. `SET` replaces the whole value,
//! which gives the same all-or-nothing commit as the file store.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::domain::errors::StorageError;
use crate::domain::session::Session;
use crate::domain::traits::SessionStore;
use crate::domain::types::ChatId;

fn backend(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct RedisSessionStore {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let connection = ConnectionManager::new(client).await.map_err(backend)?;
        info!("Connected to redis session store");
        Ok(Self {
            connection,
            prefix: prefix.into(),
        })
    }

    fn key(&self, id: ChatId) -> String {
        format!("{}{}", self.prefix, id)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn load(&self, id: ChatId) -> Result<Option<Session>, StorageError> {
        let mut connection = self.connection.clone();
        let blob: Option<String> = connection.get(self.key(id)).await.map_err(backend)?;
        blob.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    async fn commit(&self, id: ChatId, session: &Session) -> Result<(), StorageError> {
        let blob = serde_json::to_string(session)?;
        let mut connection = self.connection.clone();
        let _: () = connection.set(self.key(id), blob).await.map_err(backend)?;
        Ok(())
    }
}
