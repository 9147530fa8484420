use std::path::PathBuf;
use thiserror::Error;

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sync with {url} failed: {message}")]
    Sync { url: String, message: String },

    #[error("no catalog at {}; refresh the mod list first", root.display())]
    Unavailable { root: PathBuf },

    #[error("invalid metadata in mods/{folder}: {message}")]
    MetadataParse { folder: String, message: String },

    #[error("none of the {} catalog entries could be read", failures.len())]
    NoValidEntries { failures: Vec<EntryFailure> },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One catalog entry that was dropped from a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub folder: String,
    pub message: String,
}

impl CatalogError {
    pub fn sync(url: &str, err: impl std::fmt::Display) -> Self {
        CatalogError::Sync {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CatalogError::Io {
            path: path.into(),
            source,
        }
    }
}
