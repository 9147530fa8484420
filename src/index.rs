use crate::{
    error::{CatalogError, CatalogResult, EntryFailure},
    metadata::CatalogMeta,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MODS_DIR: &str = "mods";

/// Keys the indexer owns on a record. A `meta.json` that sets them does not
/// get to override what the indexer derives from disk.
const RESERVED_KEYS: [&str; 4] = ["folderName", "imageB64", "description", "installed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SidecarKind {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SidecarField {
    Thumbnail,
    Description,
}

#[derive(Debug, Clone, Copy)]
struct Sidecar {
    file: &'static str,
    field: SidecarField,
    kind: SidecarKind,
}

const SIDECARS: &[Sidecar] = &[
    Sidecar {
        file: "thumbnail.jpg",
        field: SidecarField::Thumbnail,
        kind: SidecarKind::Binary,
    },
    Sidecar {
        file: "description.md",
        field: SidecarField::Description,
        kind: SidecarKind::Text,
    },
];

/// One catalog entry, as handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModRecord {
    #[serde(flatten)]
    pub meta: CatalogMeta,
    #[serde(rename = "folderName")]
    pub folder_name: String,
    #[serde(rename = "imageB64", skip_serializing_if = "Option::is_none")]
    pub image_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub installed: bool,
}

impl ModRecord {
    fn from_meta(mut meta: CatalogMeta, folder_name: String) -> Self {
        let mut description = None;
        for key in RESERVED_KEYS {
            if let Some(value) = meta.extra.remove(key) {
                if key == "description" {
                    if let Value::String(text) = value {
                        description = Some(text);
                    }
                }
            }
        }
        Self {
            meta,
            folder_name,
            image_b64: None,
            description,
            installed: false,
        }
    }

    pub fn title(&self) -> &str {
        &self.meta.title
    }

    pub fn thumbnail_bytes(&self) -> Option<Vec<u8>> {
        let encoded = self.image_b64.as_deref()?;
        BASE64.decode(encoded).ok()
    }

    fn attach(&mut self, field: SidecarField, value: String) {
        match field {
            SidecarField::Thumbnail => self.image_b64 = Some(value),
            SidecarField::Description => self.description = Some(value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub records: Vec<ModRecord>,
    pub failures: Vec<EntryFailure>,
}

#[derive(Debug, Clone)]
struct CachedSidecar {
    modified: Option<SystemTime>,
    len: u64,
    encoded: String,
}

/// Walks `<mirror>/mods` and turns each entry folder into a [`ModRecord`].
#[derive(Debug, Default)]
pub struct Indexer {
    cache: Option<Mutex<HashMap<PathBuf, CachedSidecar>>>,
}

impl Indexer {
    pub fn new(cache_thumbnails: bool) -> Self {
        Self {
            cache: cache_thumbnails.then(|| Mutex::new(HashMap::new())),
        }
    }

    pub fn scan(&self, mirror_root: &Path) -> CatalogResult<ScanReport> {
        self.walk(mirror_root, true)
    }

    /// Same entries and failures as [`Indexer::scan`], but sidecar files are
    /// not read and the thumbnail cache is left alone.
    pub fn scan_metadata(&self, mirror_root: &Path) -> CatalogResult<ScanReport> {
        self.walk(mirror_root, false)
    }

    fn walk(&self, mirror_root: &Path, with_sidecars: bool) -> CatalogResult<ScanReport> {
        let mods_dir = mirror_root.join(MODS_DIR);
        if !mods_dir.is_dir() {
            return Err(CatalogError::io(
                mods_dir,
                io::Error::new(io::ErrorKind::NotFound, "catalog has no mods directory"),
            ));
        }

        let mut report = ScanReport::default();
        let mut candidates = 0usize;
        let mut seen_binaries = HashSet::new();

        for entry in WalkDir::new(&mods_dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("walk mods directory"));
                    return Err(CatalogError::io(mods_dir, source));
                }
                Err(err) => {
                    warn!("Skipping unreadable catalog path: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            candidates += 1;

            let folder = entry.file_name().to_string_lossy().into_owned();
            let read = if with_sidecars {
                self.read_entry(entry.path(), folder.clone(), &mut seen_binaries)
            } else {
                read_meta(entry.path(), folder.clone())
                    .map(|meta| ModRecord::from_meta(meta, folder.clone()))
            };
            match read {
                Ok(record) => report.records.push(record),
                Err(err) => {
                    warn!("Dropping catalog entry: {err}");
                    let message = match err {
                        CatalogError::MetadataParse { message, .. } => message,
                        other => other.to_string(),
                    };
                    report.failures.push(EntryFailure { folder, message });
                }
            }
        }

        if with_sidecars {
            self.prune_cache(&seen_binaries);
        }

        if candidates > 0 && report.records.is_empty() {
            return Err(CatalogError::NoValidEntries {
                failures: report.failures,
            });
        }

        info!(
            "Indexed {} catalog entries ({} skipped)",
            report.records.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn read_entry(
        &self,
        entry_dir: &Path,
        folder: String,
        seen_binaries: &mut HashSet<PathBuf>,
    ) -> CatalogResult<ModRecord> {
        let meta = read_meta(entry_dir, folder.clone())?;
        let mut record = ModRecord::from_meta(meta, folder);

        for sidecar in SIDECARS {
            let path = entry_dir.join(sidecar.file);
            if !path.is_file() {
                continue;
            }
            let value = match sidecar.kind {
                SidecarKind::Text => fs::read(&path)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
                SidecarKind::Binary => {
                    seen_binaries.insert(path.clone());
                    self.read_binary(&path)
                }
            };
            match value {
                Ok(value) => record.attach(sidecar.field, value),
                Err(err) => warn!("Ignoring unreadable {}: {err}", path.display()),
            }
        }

        Ok(record)
    }

    fn read_binary(&self, path: &Path) -> io::Result<String> {
        let Some(cache) = &self.cache else {
            return fs::read(path).map(|bytes| BASE64.encode(bytes));
        };

        let meta = fs::metadata(path)?;
        let modified = meta.modified().ok();
        let len = meta.len();
        if let Some(hit) = lock(cache).get(path) {
            if hit.modified.is_some() && hit.modified == modified && hit.len == len {
                debug!("Thumbnail cache hit: {}", path.display());
                return Ok(hit.encoded.clone());
            }
        }

        let encoded = BASE64.encode(fs::read(path)?);
        lock(cache).insert(
            path.to_path_buf(),
            CachedSidecar {
                modified,
                len,
                encoded: encoded.clone(),
            },
        );
        Ok(encoded)
    }

    fn prune_cache(&self, seen: &HashSet<PathBuf>) {
        if let Some(cache) = &self.cache {
            lock(cache).retain(|path, _| seen.contains(path));
        }
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.as_ref().map(|cache| lock(cache).len()).unwrap_or(0)
    }
}

fn read_meta(entry_dir: &Path, folder: String) -> CatalogResult<CatalogMeta> {
    CatalogMeta::read(entry_dir).map_err(|err| CatalogError::MetadataParse {
        folder,
        message: err.to_string(),
    })
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{meta_json, write_entry};
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn titles(report: &ScanReport) -> Vec<String> {
        let mut titles: Vec<String> = report
            .records
            .iter()
            .map(|record| record.title().to_string())
            .collect();
        titles.sort();
        titles
    }

    #[test]
    fn scan_is_idempotent() {
        let temp = TempDir::new().unwrap();
        write_entry(temp.path(), "alpha", Some(&meta_json("Alpha", &["Content"])));
        let beta = write_entry(temp.path(), "beta", Some(&meta_json("Beta", &["Joker"])));
        fs::write(beta.join("thumbnail.jpg"), [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();

        let indexer = Indexer::new(true);
        let first = indexer.scan(temp.path()).unwrap();
        let second = indexer.scan(temp.path()).unwrap();
        assert_eq!(titles(&first), titles(&second));

        let mut first = first.records;
        let mut second = second.records;
        first.sort_by(|a, b| a.folder_name.cmp(&b.folder_name));
        second.sort_by(|a, b| a.folder_name.cmp(&b.folder_name));
        assert_eq!(first, second);
    }

    #[test]
    fn broken_entry_is_isolated() {
        let temp = TempDir::new().unwrap();
        write_entry(temp.path(), "one", Some(&meta_json("One", &[])));
        write_entry(temp.path(), "two", Some(&meta_json("Two", &[])));
        write_entry(temp.path(), "malformed", Some("{ \"title\": "));
        write_entry(temp.path(), "empty", None);

        let report = Indexer::new(false).scan(temp.path()).unwrap();
        assert_eq!(titles(&report), vec!["One", "Two"]);

        let mut failed: Vec<&str> = report
            .failures
            .iter()
            .map(|failure| failure.folder.as_str())
            .collect();
        failed.sort();
        assert_eq!(failed, vec!["empty", "malformed"]);
        assert!(report
            .records
            .iter()
            .all(|record| record.folder_name != "malformed" && record.folder_name != "empty"));
    }

    #[test]
    fn entry_without_sidecars_has_no_optional_fields() {
        let temp = TempDir::new().unwrap();
        write_entry(temp.path(), "plain", Some(&meta_json("Plain", &["Misc"])));

        let report = Indexer::new(true).scan(temp.path()).unwrap();
        let record = &report.records[0];
        assert_eq!(record.folder_name, "plain");
        assert_eq!(record.image_b64, None);
        assert_eq!(record.description, None);
        assert!(!record.installed);

        let json = serde_json::to_value(record).unwrap();
        assert!(json.get("imageB64").is_none());
        assert!(json.get("description").is_none());
        assert_eq!(json["folderName"], "plain");
        assert_eq!(json["downloadURL"], "https://example.com/Plain.zip");
    }

    #[test]
    fn entry_with_all_files_round_trips_thumbnail() {
        let temp = TempDir::new().unwrap();
        let dir = write_entry(temp.path(), "full", Some(&meta_json("Full", &["Content"])));
        let thumbnail: Vec<u8> = (0u8..=255).collect();
        fs::write(dir.join("thumbnail.jpg"), &thumbnail).unwrap();
        fs::write(dir.join("description.md"), "# Full\n\nDoes **everything**.").unwrap();

        let report = Indexer::new(false).scan(temp.path()).unwrap();
        let record = &report.records[0];
        assert_eq!(record.thumbnail_bytes(), Some(thumbnail));
        assert_eq!(
            record.description.as_deref(),
            Some("# Full\n\nDoes **everything**.")
        );
    }

    #[test]
    fn non_directory_siblings_are_ignored() {
        let temp = TempDir::new().unwrap();
        write_entry(temp.path(), "real", Some(&meta_json("Real", &[])));
        fs::write(temp.path().join("mods").join("README.md"), "index").unwrap();

        let report = Indexer::new(false).scan(temp.path()).unwrap();
        assert_eq!(titles(&report), vec!["Real"]);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn every_entry_failing_is_an_error() {
        let temp = TempDir::new().unwrap();
        write_entry(temp.path(), "bad", Some("not json"));
        write_entry(temp.path(), "worse", None);

        let err = Indexer::new(false).scan(temp.path()).unwrap_err();
        match err {
            CatalogError::NoValidEntries { failures } => assert_eq!(failures.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_catalog_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("mods")).unwrap();
        let report = Indexer::new(false).scan(temp.path()).unwrap();
        assert!(report.records.is_empty());
    }

    #[test]
    fn missing_mods_dir_is_io_error() {
        let temp = TempDir::new().unwrap();
        let err = Indexer::new(false).scan(temp.path()).unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }

    #[test]
    fn reserved_keys_in_meta_do_not_override_disk() {
        let temp = TempDir::new().unwrap();
        let mut raw: Value = serde_json::from_str(&meta_json("Sneaky", &[])).unwrap();
        raw["folderName"] = Value::from("elsewhere");
        raw["installed"] = Value::from(true);
        raw["description"] = Value::from("inline description");
        raw["homepage"] = Value::from("https://example.com");
        write_entry(temp.path(), "sneaky", Some(&raw.to_string()));

        let report = Indexer::new(false).scan(temp.path()).unwrap();
        let record = &report.records[0];
        assert_eq!(record.folder_name, "sneaky");
        assert!(!record.installed);
        assert_eq!(record.description.as_deref(), Some("inline description"));
        assert_eq!(
            record.meta.extra.get("homepage"),
            Some(&Value::from("https://example.com"))
        );
        assert!(!record.meta.extra.contains_key("folderName"));
    }

    #[test]
    fn thumbnail_cache_tracks_file_changes() {
        let temp = TempDir::new().unwrap();
        let dir = write_entry(temp.path(), "art", Some(&meta_json("Art", &[])));
        let thumb = dir.join("thumbnail.jpg");
        fs::write(&thumb, [1u8, 2, 3]).unwrap();

        let indexer = Indexer::new(true);
        let first = indexer.scan(temp.path()).unwrap();
        assert_eq!(first.records[0].thumbnail_bytes(), Some(vec![1, 2, 3]));
        assert_eq!(indexer.cached_len(), 1);

        fs::write(&thumb, [9u8, 8, 7, 6]).unwrap();
        let second = indexer.scan(temp.path()).unwrap();
        assert_eq!(second.records[0].thumbnail_bytes(), Some(vec![9, 8, 7, 6]));

        fs::remove_file(&thumb).unwrap();
        let third = indexer.scan(temp.path()).unwrap();
        assert_eq!(third.records[0].image_b64, None);
        assert_eq!(indexer.cached_len(), 0);
    }

    #[test]
    fn metadata_scan_skips_sidecars_and_cache() {
        let temp = TempDir::new().unwrap();
        let dir = write_entry(temp.path(), "art", Some(&meta_json("Art", &[])));
        fs::write(dir.join("thumbnail.jpg"), [1u8, 2, 3]).unwrap();
        fs::write(dir.join("description.md"), "# Art").unwrap();
        write_entry(temp.path(), "broken", Some("{"));

        let indexer = Indexer::new(true);
        indexer.scan(temp.path()).unwrap();
        assert_eq!(indexer.cached_len(), 1);

        fs::remove_file(dir.join("thumbnail.jpg")).unwrap();
        let report = indexer.scan_metadata(temp.path()).unwrap();
        assert_eq!(titles(&report), vec!["Art"]);
        assert_eq!(report.records[0].image_b64, None);
        assert_eq!(report.records[0].description, None);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(indexer.cached_len(), 1);
    }
}
