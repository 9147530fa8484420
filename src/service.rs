use crate::{
    config::AppConfig,
    error::{CatalogError, CatalogResult},
    index::{self, Indexer, ModRecord, ScanReport},
    mirror::{MirrorManager, SyncOutcome},
};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Read API over the catalog mirror, built once at startup and handed to
/// whatever front end is running.
///
/// Syncs are serialized: a second caller blocks until the running one
/// finishes, then performs its own (usually up-to-date) sync.
#[derive(Debug)]
pub struct CatalogService {
    mirror: MirrorManager,
    indexer: Indexer,
    sync_lock: Mutex<()>,
}

impl CatalogService {
    pub fn new(mirror: MirrorManager, indexer: Indexer) -> Self {
        Self {
            mirror,
            indexer,
            sync_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mirror = MirrorManager::new(
            config.mirror_root(),
            config.catalog_url.clone(),
            config.branch.clone(),
        )
        .with_timeout(config.sync_timeout());
        Self::new(mirror, Indexer::new(config.cache_thumbnails))
    }

    pub fn mirror(&self) -> &MirrorManager {
        &self.mirror
    }

    pub fn modlist_exists(&self) -> bool {
        self.mirror.exists()
    }

    pub fn refresh_mod_list(&self) -> CatalogResult<SyncOutcome> {
        let _guard = self.sync_guard();
        self.mirror.sync()
    }

    /// Syncs and re-indexes without letting another sync run in between.
    pub fn refresh(&self) -> CatalogResult<(SyncOutcome, ScanReport)> {
        let _guard = self.sync_guard();
        let outcome = self.mirror.sync()?;
        let report = self.scan()?;
        Ok((outcome, report))
    }

    /// Fresh snapshot of every readable catalog entry. Entries whose metadata
    /// cannot be read are left out; see [`CatalogService::scan`] to get them.
    pub fn get_mod_list(&self) -> CatalogResult<Vec<ModRecord>> {
        self.scan().map(|report| report.records)
    }

    pub fn scan(&self) -> CatalogResult<ScanReport> {
        self.ensure_available()?;
        self.indexer.scan(self.mirror.root())
    }

    /// Number of readable entries, without loading thumbnails or descriptions.
    pub fn count_mods(&self) -> CatalogResult<usize> {
        self.ensure_available()?;
        let report = self.indexer.scan_metadata(self.mirror.root())?;
        Ok(report.records.len())
    }

    fn ensure_available(&self) -> CatalogResult<()> {
        if self.mirror.exists() {
            return Ok(());
        }
        debug!("Catalog requested before first sync");
        Err(CatalogError::Unavailable {
            root: self.mirror.root().to_path_buf(),
        })
    }

    /// Startup policy: sync only when no mirror exists, then list.
    pub fn load(&self) -> CatalogResult<ScanReport> {
        let _guard = self.sync_guard();
        if !self.modlist_exists() {
            self.mirror.sync()?;
        }
        self.scan()
    }

    fn sync_guard(&self) -> MutexGuard<'_, ()> {
        index::lock(&self.sync_lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{index::fixtures::meta_json, mirror::fixtures::RemoteCatalog};
    use pretty_assertions::assert_eq;
    use std::{fs, sync::Arc, thread};
    use tempfile::TempDir;

    fn service_for(temp: &TempDir, url: String) -> CatalogService {
        let mut config = AppConfig::defaults(temp.path().join("data"));
        config.catalog_url = url;
        CatalogService::from_config(&config)
    }

    #[test]
    fn listing_before_sync_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let service = service_for(&temp, "unused".to_string());

        assert!(!service.modlist_exists());
        let err = service.get_mod_list().unwrap_err();
        assert!(matches!(err, CatalogError::Unavailable { .. }));
        assert!(matches!(
            service.count_mods().unwrap_err(),
            CatalogError::Unavailable { .. }
        ));
        assert!(!service.mirror().root().exists());
    }

    #[test]
    fn absent_mirror_to_listing_end_to_end() {
        let temp = TempDir::new().unwrap();
        let remote = RemoteCatalog::init(&temp.path().join("remote"));
        remote.write("mods/alpha-mod/meta.json", meta_json("Alpha", &["Content"]).as_bytes());
        remote.write("mods/beta-mod/meta.json", meta_json("Beta", &["Joker"]).as_bytes());
        remote.write("mods/beta-mod/thumbnail.jpg", &[0xFF, 0xD8, 0xFF]);
        remote.write("mods/broken/meta.json", b"{");
        remote.commit("catalog");

        let service = service_for(&temp, remote.url());
        assert!(!service.modlist_exists());
        assert!(matches!(
            service.refresh_mod_list().unwrap(),
            SyncOutcome::Cloned { .. }
        ));
        assert!(service.modlist_exists());

        let mut records = service.get_mod_list().unwrap();
        records.sort_by(|a, b| a.title().cmp(b.title()));
        let pairs: Vec<(&str, &str)> = records
            .iter()
            .map(|record| (record.title(), record.folder_name.as_str()))
            .collect();
        assert_eq!(pairs, vec![("Alpha", "alpha-mod"), ("Beta", "beta-mod")]);
        assert_eq!(records[1].thumbnail_bytes(), Some(vec![0xFF, 0xD8, 0xFF]));

        let report = service.scan().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].folder, "broken");
        assert_eq!(service.count_mods().unwrap(), 2);
    }

    #[test]
    fn installed_flag_resets_on_next_listing() {
        let temp = TempDir::new().unwrap();
        let service = service_for(&temp, "unused".to_string());
        let entry = service.mirror().root().join("mods").join("alpha");
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join("meta.json"), meta_json("Alpha", &[])).unwrap();

        let mut first = service.get_mod_list().unwrap();
        first[0].installed = true;

        let second = service.get_mod_list().unwrap();
        assert!(!second[0].installed);
    }

    #[test]
    fn load_skips_sync_when_mirror_exists() {
        let temp = TempDir::new().unwrap();
        // The remote URL is unreachable, so any sync attempt would fail.
        let service = service_for(&temp, temp.path().join("nowhere").display().to_string());
        let entry = service.mirror().root().join("mods").join("local");
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join("meta.json"), meta_json("Local", &[])).unwrap();

        let report = service.load().unwrap();
        assert_eq!(report.records.len(), 1);
        assert!(matches!(
            service.refresh_mod_list().unwrap_err(),
            CatalogError::Sync { .. }
        ));
    }

    #[test]
    fn concurrent_first_syncs_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let remote = RemoteCatalog::init(&temp.path().join("remote"));
        for n in 0..50 {
            let path = format!("mods/mod-{n:02}/meta.json");
            remote.write(&path, meta_json(&format!("Mod {n}"), &["Misc"]).as_bytes());
        }
        remote.commit("catalog");

        let service = Arc::new(service_for(&temp, remote.url()));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let service = Arc::clone(&service);
                thread::spawn(move || service.refresh())
            })
            .collect();
        let mut outcomes: Vec<&str> = Vec::new();
        for worker in workers {
            let (outcome, report) = worker.join().unwrap().unwrap();
            assert_eq!(report.records.len(), 50);
            outcomes.push(outcome.label());
        }
        outcomes.sort();

        assert_eq!(outcomes, vec!["cloned", "up_to_date"]);
        assert!(service.modlist_exists());
        assert!(!temp.path().join("data").join("modrepo.partial").exists());
    }
}
