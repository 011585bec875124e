use async_trait::async_trait;

use crate::storage::error::StorageError;
use crate::storage::store::QueueStore;

/// Queue blobs kept in a dedicated Sled tree.
pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    const TREE_NAME: &'static str = "__offline_queue__";

    /// Open or create the queue tree for the given database.
    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db
            .open_tree(Self::TREE_NAME)
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        Ok(Self { tree })
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::SledError(e.to_string()))?;
        Self::new(&db)
    }
}

#[async_trait]
impl QueueStore for SledStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .tree
            .get(key.as_bytes())
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.tree
            .insert(key.as_bytes(), bytes)
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        self.tree
            .flush_async()
            .await
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.tree
            .remove(key.as_bytes())
            .map_err(|e| StorageError::SledError(e.to_string()))?;
        Ok(())
    }
}
