use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Sled error: {0}")]
    SledError(String),

    #[error("Offline queue is full ({0} actions)")]
    QueueFull(usize),
}
