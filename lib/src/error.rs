use std::path::PathBuf;

use thiserror::Error;

use crate::guid::Sha1;

#[derive(Error, Debug)]
pub enum FrostpackError {
    #[error("Invalid format in '{}' at offset {offset:#x}: {message}", .path.display())]
    InvalidFormat {
        path: PathBuf,
        offset: u64,
        message: String,
    },
    #[error("Missing dependency: {0}")]
    MissingDependency(String),
    #[error("No catalog entry for SHA-1 {0}")]
    MissingCatalogEntry(Sha1),
    #[error("{0}")]
    Custom(String),
    #[error("Additional context for error: {0}, {1}")]
    Frostpack(String, #[source] Box<FrostpackError>),
    #[error("I/O error: {0}, {1}")]
    Io(String, #[source] std::io::Error),
    #[error("binrw error: {0}, {1}")]
    BinRW(String, #[source] binrw::Error),
}

impl FrostpackError {
    pub fn add_context(self, message: impl Into<String>) -> Self {
        Self::Frostpack(message.into(), Box::new(self))
    }

    pub(crate) fn invalid_format(
        path: impl Into<PathBuf>,
        offset: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidFormat {
            path: path.into(),
            offset,
            message: message.into(),
        }
    }
}
