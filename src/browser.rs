use crate::{
    error::{CatalogResult, EntryFailure},
    index::{ModRecord, ScanReport},
    mirror::SyncOutcome,
    search,
    service::CatalogService,
};
use std::{
    sync::{
        mpsc::{self, Receiver, TryRecvError},
        Arc,
    },
    thread,
};
use tracing::{info, warn};

type RefreshResult = CatalogResult<(SyncOutcome, ScanReport)>;

/// What a front end holds between user actions: the last catalog snapshot,
/// the search box contents and the session-only install toggles.
pub struct Browser {
    service: Arc<CatalogService>,
    records: Vec<ModRecord>,
    failures: Vec<EntryFailure>,
    filter: String,
    status: String,
    refresh_rx: Option<Receiver<RefreshResult>>,
}

impl Browser {
    pub fn new(service: Arc<CatalogService>) -> Self {
        Self {
            service,
            records: Vec::new(),
            failures: Vec::new(),
            filter: String::new(),
            status: "Loading mods...".to_string(),
            refresh_rx: None,
        }
    }

    pub fn service(&self) -> &CatalogService {
        &self.service
    }

    /// Syncs only if there is no mirror yet, then lists.
    pub fn startup(&mut self) -> CatalogResult<()> {
        match self.service.load() {
            Ok(report) => {
                self.apply_report(report);
                Ok(())
            }
            Err(err) => {
                self.status = format!("Catalog unavailable: {err}");
                Err(err)
            }
        }
    }

    /// Always syncs, then re-lists. On failure the current list stays.
    ///
    /// If a background refresh is running, its result is awaited and applied
    /// instead of starting a second sync.
    pub fn refresh(&mut self) -> CatalogResult<SyncOutcome> {
        if let Some(rx) = self.refresh_rx.take() {
            match rx.recv() {
                Ok(result) => return self.apply_refresh(result),
                Err(_) => warn!("Refresh worker stopped unexpectedly; refreshing again"),
            }
        }
        let result = run_refresh(&self.service);
        self.apply_refresh(result)
    }

    /// Starts a refresh on a worker thread. Returns false if one is already
    /// running.
    pub fn spawn_refresh(&mut self) -> bool {
        if self.refresh_rx.is_some() {
            return false;
        }
        let (tx, rx) = mpsc::channel();
        let service = Arc::clone(&self.service);
        thread::spawn(move || {
            let _ = tx.send(run_refresh(&service));
        });
        self.refresh_rx = Some(rx);
        self.status = "Refreshing mods...".to_string();
        true
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.refresh_rx.is_some()
    }

    /// Applies a finished background refresh, if there is one.
    pub fn poll(&mut self) -> Option<CatalogResult<SyncOutcome>> {
        let rx = self.refresh_rx.as_ref()?;
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => {
                self.refresh_rx = None;
                self.status = "Refresh worker stopped unexpectedly".to_string();
                return None;
            }
        };
        self.refresh_rx = None;
        Some(self.apply_refresh(result))
    }

    pub fn records(&self) -> &[ModRecord] {
        &self.records
    }

    pub fn failures(&self) -> &[EntryFailure] {
        &self.failures
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn set_filter(&mut self, value: &str) {
        self.filter = value.trim().to_string();
    }

    pub fn visible(&self) -> Vec<&ModRecord> {
        self.records
            .iter()
            .filter(|record| search::record_matches(&self.filter, record))
            .collect()
    }

    /// Looks a record up by title, falling back to its folder name.
    pub fn find(&self, key: &str) -> Option<&ModRecord> {
        self.records
            .iter()
            .find(|record| record.title() == key)
            .or_else(|| self.records.iter().find(|record| record.folder_name == key))
    }

    /// Flips the session-only install flag. Nothing is written to disk.
    pub fn toggle_installed(&mut self, title: &str) -> Option<bool> {
        let record = self.records.iter_mut().find(|record| record.title() == title)?;
        record.installed = !record.installed;
        Some(record.installed)
    }

    fn apply_refresh(&mut self, result: RefreshResult) -> CatalogResult<SyncOutcome> {
        match result {
            Ok((outcome, report)) => {
                info!("{}", outcome.describe());
                self.apply_report(report);
                Ok(outcome)
            }
            Err(err) => {
                warn!("Refresh failed, keeping previous list: {err}");
                self.status = format!("Refresh failed: {err}");
                Err(err)
            }
        }
    }

    fn apply_report(&mut self, report: ScanReport) {
        self.records = report.records;
        self.failures = report.failures;
        self.status = if self.failures.is_empty() {
            format!("{} mods", self.records.len())
        } else {
            format!(
                "{} mods ({} unreadable)",
                self.records.len(),
                self.failures.len()
            )
        };
    }
}

fn run_refresh(service: &CatalogService) -> RefreshResult {
    service.refresh()
}
