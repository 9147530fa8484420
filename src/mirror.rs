use crate::error::{CatalogError, CatalogResult};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    ErrorCode, FetchOptions, Oid, RemoteCallbacks, Repository, Status, StatusOptions,
};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, error, info, warn};

const REMOTE_NAME: &str = "origin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Cloned { revision: String },
    FastForwarded { from: String, to: String },
    UpToDate { revision: String },
}

impl SyncOutcome {
    pub fn revision(&self) -> &str {
        match self {
            SyncOutcome::Cloned { revision } | SyncOutcome::UpToDate { revision } => revision,
            SyncOutcome::FastForwarded { to, .. } => to,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Cloned { .. } => "cloned",
            SyncOutcome::FastForwarded { .. } => "fast_forwarded",
            SyncOutcome::UpToDate { .. } => "up_to_date",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SyncOutcome::Cloned { revision } => format!("Cloned catalog at {revision}"),
            SyncOutcome::FastForwarded { from, to } => format!("Updated catalog {from} -> {to}"),
            SyncOutcome::UpToDate { revision } => format!("Catalog already up to date ({revision})"),
        }
    }
}

/// Written next to the mirror after each successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub revision: String,
    pub outcome: String,
    pub synced_at: String,
}

/// Owns the local checkout of the remote catalog repository.
#[derive(Debug, Clone)]
pub struct MirrorManager {
    root: PathBuf,
    url: String,
    branch: String,
    timeout: Option<Duration>,
}

impl MirrorManager {
    pub fn new(root: impl Into<PathBuf>, url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url: url.into(),
            branch: branch.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Clones the catalog when no mirror exists yet, otherwise fast-forwards
    /// the tracked branch in place. A failure leaves the previous mirror as it
    /// was.
    pub fn sync(&self) -> CatalogResult<SyncOutcome> {
        let outcome = if self.exists() {
            self.pull()?
        } else {
            self.clone_fresh()?
        };
        info!("{}", outcome.describe());
        if let Err(err) = self.write_record(&outcome) {
            warn!("Failed to record sync state: {err}");
        }
        Ok(outcome)
    }

    pub fn revision(&self) -> Option<String> {
        if !self.exists() {
            return None;
        }
        let repo = Repository::open(&self.root).ok()?;
        head_revision(&repo).ok()
    }

    pub fn last_sync(&self) -> Option<SyncRecord> {
        let raw = fs::read_to_string(self.record_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn record_path(&self) -> PathBuf {
        self.sibling_path(".sync.json")
    }

    fn staging_path(&self) -> PathBuf {
        self.sibling_path(".partial")
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self
            .root
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from("modrepo"));
        name.push(suffix);
        self.root.with_file_name(name)
    }

    fn clone_fresh(&self) -> CatalogResult<SyncOutcome> {
        let staging = self.staging_path();
        if staging.exists() {
            debug!("Removing stale staging dir {}", staging.display());
            fs::remove_dir_all(&staging).map_err(|err| CatalogError::io(&staging, err))?;
        }
        if let Some(parent) = self.root.parent() {
            fs::create_dir_all(parent).map_err(|err| CatalogError::io(parent, err))?;
        }

        info!("Cloning {} ({}) into {}", self.url, self.branch, self.root.display());
        let deadline = self.deadline();
        let cloned = RepoBuilder::new()
            .branch(&self.branch)
            .fetch_options(fetch_options(deadline))
            .clone(&self.url, &staging);
        let repo = match cloned {
            Ok(repo) => repo,
            Err(err) => {
                error!("Clone of {} failed: {err}", self.url);
                let _ = fs::remove_dir_all(&staging);
                return Err(self.transfer_error(err, deadline));
            }
        };
        let revision = head_revision(&repo).map_err(|err| CatalogError::sync(&self.url, err))?;
        drop(repo);

        if let Err(err) = fs::rename(&staging, &self.root) {
            let _ = fs::remove_dir_all(&staging);
            return Err(CatalogError::io(&self.root, err));
        }
        Ok(SyncOutcome::Cloned { revision })
    }

    fn pull(&self) -> CatalogResult<SyncOutcome> {
        debug!("Updating catalog mirror at {}", self.root.display());
        let repo = Repository::open(&self.root).map_err(|err| {
            error!("Failed to open mirror {}: {err}", self.root.display());
            CatalogError::sync(&self.url, format!("open mirror: {err}"))
        })?;
        self.ensure_clean(&repo)?;
        let before = head_revision(&repo).ok();

        let mut remote = match repo.find_remote(REMOTE_NAME) {
            Ok(remote) if remote.url() == Some(self.url.as_str()) => remote,
            _ => {
                debug!("Fetching from {} without the stored remote", self.url);
                repo.remote_anonymous(&self.url)
                    .map_err(|err| CatalogError::sync(&self.url, err))?
            }
        };

        let deadline = self.deadline();
        let mut options = fetch_options(deadline);
        remote
            .fetch(&[self.branch.as_str()], Some(&mut options), None)
            .map_err(|err| {
                error!("Fetch of {} failed: {err}", self.url);
                self.transfer_error(err, deadline)
            })?;
        debug!("Fetch complete for {}", self.root.display());

        let fetch_head = repo
            .find_reference("FETCH_HEAD")
            .map_err(|err| CatalogError::sync(&self.url, err))?;
        let fetch_commit = repo
            .reference_to_annotated_commit(&fetch_head)
            .map_err(|err| CatalogError::sync(&self.url, err))?;
        let (analysis, _) = repo
            .merge_analysis(&[&fetch_commit])
            .map_err(|err| CatalogError::sync(&self.url, err))?;

        if analysis.is_up_to_date() {
            let revision = before.unwrap_or_else(|| short_id(fetch_commit.id()));
            return Ok(SyncOutcome::UpToDate { revision });
        }

        if analysis.is_fast_forward() || analysis.is_unborn() {
            self.fast_forward(&repo, fetch_commit.id())
                .map_err(|err| CatalogError::sync(&self.url, format!("fast-forward: {err}")))?;
            let to = short_id(fetch_commit.id());
            let from = before.unwrap_or_else(|| "unborn".to_string());
            return Ok(SyncOutcome::FastForwarded { from, to });
        }

        warn!(
            "Mirror {} has diverged from {}; refusing to merge",
            self.root.display(),
            self.url
        );
        Err(CatalogError::sync(
            &self.url,
            format!("local branch '{}' has diverged from the remote", self.branch),
        ))
    }

    fn fast_forward(&self, repo: &Repository, target: Oid) -> Result<(), git2::Error> {
        let local = format!("refs/heads/{}", self.branch);
        let commit = repo.find_commit(target)?;
        // Working tree first: if checkout fails the branch still names the old revision.
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().safe()))?;

        let message = format!("pokerface: fast-forward {} to {}", self.branch, short_id(target));
        match repo.find_reference(&local) {
            Ok(mut reference) => {
                reference.set_target(target, &message)?;
            }
            Err(_) => {
                repo.reference(&local, target, true, &message)?;
            }
        }
        repo.set_head(&local)?;
        Ok(())
    }

    fn ensure_clean(&self, repo: &Repository) -> CatalogResult<()> {
        let mut options = StatusOptions::new();
        options.include_untracked(false).include_ignored(false);
        let statuses = repo
            .statuses(Some(&mut options))
            .map_err(|err| CatalogError::sync(&self.url, err))?;
        let dirty: Vec<String> = statuses
            .iter()
            .filter(|entry| entry.status() != Status::CURRENT)
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        warn!("Mirror has {} locally modified file(s)", dirty.len());
        Err(CatalogError::sync(
            &self.url,
            format!(
                "mirror has local modifications ({}); remove {} to start over",
                dirty.join(", "),
                self.root.display()
            ),
        ))
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }

    fn transfer_error(&self, err: git2::Error, deadline: Option<Instant>) -> CatalogError {
        let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        match self.timeout {
            Some(timeout) if expired || err.code() == ErrorCode::Timeout => CatalogError::sync(
                &self.url,
                format!("timed out after {}s", timeout.as_secs()),
            ),
            _ => CatalogError::sync(&self.url, err),
        }
    }

    fn write_record(&self, outcome: &SyncOutcome) -> anyhow::Result<()> {
        use anyhow::Context;

        let synced_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("format sync time")?;
        let record = SyncRecord {
            revision: outcome.revision().to_string(),
            outcome: outcome.label().to_string(),
            synced_at,
        };
        let path = self.record_path();
        let raw = serde_json::to_string_pretty(&record).context("serialize sync record")?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, raw).context("write sync record temp")?;
        fs::rename(&temp, &path).context("finalize sync record")?;
        Ok(())
    }
}

/// Applies `timeout` to libgit2's socket connect and read timeouts, so a
/// server that accepts the connection and then goes quiet is dropped even
/// though no transfer progress is ever reported. `None` clears them.
///
/// The setting is process wide. Call it once, before any sync thread starts.
pub fn configure_transport(timeout: Option<Duration>) -> Result<(), git2::Error> {
    let millis = timeout
        .map(|timeout| i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX))
        .unwrap_or(0);
    // SAFETY: these write plain libgit2 globals; callers run this before any
    // other thread is using libgit2.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)?;
        git2::opts::set_server_timeout_in_milliseconds(millis)?;
    }
    debug!("Git transport timeout set to {millis}ms");
    Ok(())
}

fn fetch_options(deadline: Option<Instant>) -> FetchOptions<'static> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(deadline) = deadline {
        callbacks.transfer_progress(move |_| Instant::now() < deadline);
    }
    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

fn head_revision(repo: &Repository) -> Result<String, git2::Error> {
    let commit = repo.head()?.peel_to_commit()?;
    Ok(short_id(commit.id()))
}

fn short_id(oid: Oid) -> String {
    let mut id = oid.to_string();
    id.truncate(12);
    id
}
