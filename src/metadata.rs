use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fs, io, path::Path};
use thiserror::Error;

pub const META_FILE: &str = "meta.json";

/// Contents of a catalog entry's `meta.json`.
///
/// Field names follow the catalog's own spelling. Anything the catalog adds
/// that is not listed here lands in `extra` and is written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogMeta {
    pub title: String,
    pub author: String,
    pub repo: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    pub categories: Vec<String>,
    #[serde(rename = "requires-steamodded")]
    pub requires_steamodded: bool,
    #[serde(rename = "requires-talisman")]
    pub requires_talisman: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(
        rename = "automatic-version-check",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub automatic_version_check: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("{META_FILE} not found")]
    Missing,
    #[error("read {META_FILE}: {0}")]
    Read(#[source] io::Error),
    #[error("parse {META_FILE}: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("title is empty")]
    EmptyTitle,
}

impl CatalogMeta {
    pub fn parse(bytes: &[u8]) -> Result<Self, MetaError> {
        let meta: CatalogMeta = serde_json::from_slice(bytes).map_err(MetaError::Parse)?;
        if meta.title.trim().is_empty() {
            return Err(MetaError::EmptyTitle);
        }
        Ok(meta)
    }

    pub fn read(entry_dir: &Path) -> Result<Self, MetaError> {
        let path = entry_dir.join(META_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(MetaError::Missing),
            Err(err) => return Err(MetaError::Read(err)),
        };
        Self::parse(&bytes)
    }

    pub fn categories_label(&self) -> String {
        if self.categories.is_empty() {
            "N/A".to_string()
        } else {
            self.categories.join(", ")
        }
    }

    /// Numeric `major.minor.patch` view of `version`, if it has one.
    pub fn version_triple(&self) -> Option<(u64, u64, u64)> {
        let raw = self.version.as_deref()?.trim();
        let raw = raw
            .trim_start_matches(['v', 'V'])
            .split(['-', '+'])
            .next()?;
        let mut parts = raw.split('.').map(|part| part.trim().parse::<u64>().ok());
        let major = parts.next().flatten()?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some((major, minor, patch))
    }
}
