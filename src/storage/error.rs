use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not exist: {0}")]
    FileNotExist(String),

    #[error("task not persisted: {0}")]
    TaskNotPersisted(String),

    #[error("convert failed: {0}")]
    ConvertFailed(String),
}

impl StorageError {
    /// True when the underlying cause is a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::FileNotExist(_) | Self::TaskNotPersisted(_) => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
