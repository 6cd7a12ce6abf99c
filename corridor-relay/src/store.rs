use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use corridor_core::{ClipboardItem, Token};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Durable part of a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredRoom {
    pub token: Token,
    pub history: Vec<ClipboardItem>,
    pub last_activity: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failed: {0}")]
    Io(#[from] io::Error),
    #[error("stored room is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value persistence for rooms, keyed by token.
#[async_trait]
pub trait RoomStore: Send + Sync + fmt::Debug + 'static {
    async fn load(&self, token: &Token) -> Result<Option<StoredRoom>, StoreError>;
    async fn save(&self, room: &StoredRoom) -> Result<(), StoreError>;
}

#[must_use]
pub fn storage_key(token: &Token) -> String {
    format!("room:{token}")
}

#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    rooms: Mutex<HashMap<String, StoredRoom>>,
}

impl MemoryRoomStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn load(&self, token: &Token) -> Result<Option<StoredRoom>, StoreError> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rooms.get(&storage_key(token)).cloned())
    }

    async fn save(&self, room: &StoredRoom) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.insert(storage_key(&room.token), room.clone());
        Ok(())
    }
}

/// One JSON file per room. File names are the SHA-256 of the storage key so
/// tokens never show up in directory listings.
#[derive(Debug, Clone)]
pub struct FileRoomStore {
    dir: PathBuf,
}

impl FileRoomStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn room_path(&self, token: &Token) -> PathBuf {
        let digest = Sha256::digest(storage_key(token).as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

#[async_trait]
impl RoomStore for FileRoomStore {
    async fn load(&self, token: &Token) -> Result<Option<StoredRoom>, StoreError> {
        let path = self.room_path(token);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn save(&self, room: &StoredRoom) -> Result<(), StoreError> {
        let path = self.room_path(&room.token);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec(room)?;
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
