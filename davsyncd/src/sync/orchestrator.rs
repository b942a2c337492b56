use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use davsync_core::DavError;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::engine::{LevelOutcome, SyncEngine};
use super::local_fs;
use super::paths::{ROOT, ancestors, join, local_path_for, split};
use super::reconcile::EntryType;
use super::remote::RemoteStore;
use super::state_store::{SyncStateStore, state_file_path};
use crate::sync_log::SyncLog;

pub const LOCK_FILE_NAME: &str = ".davsync-running";
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

const YEAR_PATTERN: &str = r"^\d{4}$";
const MONTH_PATTERN: &str = r"^\d{1,2}$";

/// Creates the remote root below the server base before the first run.
pub struct Bootstrap<'a> {
    /// Remote addressing the server base rather than the remote root.
    pub base: &'a dyn RemoteStore,
    pub remote_root: String,
    /// Pause after each created component; some servers only list a new
    /// collection after a short while.
    pub settle_delay: Duration,
}

pub struct SyncJob<'a> {
    pub sync_root: &'a Path,
    pub remote: &'a dyn RemoteStore,
    pub bootstrap: Option<Bootstrap<'a>>,
    pub log: &'a SyncLog,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Every level was listed remotely because the previous run never
    /// finished.
    pub full: bool,
    pub cancelled: bool,
    pub bootstrapped: bool,
    pub actions: usize,
    pub failures: usize,
    pub conflicts: usize,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        self.failures == 0 && !self.cancelled
    }

    fn aborted(mut self) -> Self {
        self.failures += 1;
        self
    }

    fn absorb(&mut self, outcome: &LevelOutcome) {
        self.actions += outcome.actions;
        self.failures += outcome.failures;
        self.conflicts += outcome.conflicts;
    }
}

pub fn lock_file_path(sync_root: &Path) -> PathBuf {
    sync_root.join(LOCK_FILE_NAME)
}

/// Runs one synchronization of `job.sync_root`: root, then year
/// directories, then month directories. Never fails; problems are logged and
/// counted in the report.
pub async fn run(job: SyncJob<'_>) -> SyncReport {
    let log = job.log;
    let mut report = SyncReport::default();

    if let Err(err) = tokio::fs::create_dir_all(job.sync_root).await {
        log.error(format!(
            "cannot create sync directory {}: {err}",
            job.sync_root.display()
        ));
        return report.aborted();
    }
    match acquire_lock(job.sync_root).await {
        Ok(true) => {}
        Ok(false) => {
            log.warning("previous sync did not finish; running a full sync");
            report.full = true;
        }
        Err(err) => log.warning(format!("cannot create lock marker: {err}")),
    }

    if let Some(bootstrap) = &job.bootstrap {
        if let Err(err) = create_remote_root(bootstrap, log).await {
            log.error(format!(
                "cannot create remote directory {}: {err}",
                bootstrap.remote_root
            ));
            return report.aborted();
        }
        report.bootstrapped = true;
    }

    let filters = (Regex::new(YEAR_PATTERN), Regex::new(MONTH_PATTERN));
    let (year_filter, month_filter) = match filters {
        (Ok(year), Ok(month)) => (year, month),
        (Err(err), _) | (_, Err(err)) => {
            log.error(format!("invalid directory filter: {err}"));
            return report.aborted();
        }
    };
    let Some(store) = open_store(job.sync_root, log).await else {
        return report.aborted();
    };
    let engine = SyncEngine::new(job.remote, &store, job.sync_root, log);
    let mut levels: Vec<(String, LevelOutcome)> = Vec::new();

    let root = engine.sync_directory(ROOT, Some(&year_filter), false).await;
    report.absorb(&root);
    let root_changed = root.changed.clone();
    levels.push((ROOT.to_string(), root));

    let mut months: Vec<(String, bool)> = Vec::new();
    for year in local_subdirectories(job.sync_root, ROOT, &year_filter, log).await {
        if job.cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let path = join(ROOT, &year);
        let push_only = !(report.full || root_changed.contains(&year));
        let outcome = engine
            .sync_directory(&path, Some(&month_filter), push_only)
            .await;
        report.absorb(&outcome);
        for month in local_subdirectories(job.sync_root, &path, &month_filter, log).await {
            let push_only = !(report.full || outcome.changed.contains(&month));
            months.push((join(&path, &month), push_only));
        }
        levels.push((path, outcome));
    }

    for (path, push_only) in months {
        if report.cancelled {
            break;
        }
        if job.cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let outcome = engine.sync_directory(&path, None, push_only).await;
        report.absorb(&outcome);
        levels.push((path, outcome));
    }

    if !report.cancelled {
        settle_baselines(&engine, &levels, log).await;
    }
    store.close().await;

    if !report.cancelled
        && let Err(err) = release_lock(job.sync_root).await
    {
        log.warning(format!("cannot remove lock marker: {err}"));
    }
    log.debug(format!(
        "sync finished: {} actions, {} failures, {} conflicts{}",
        report.actions,
        report.failures,
        report.conflicts,
        if report.cancelled { ", cancelled" } else { "" }
    ));
    report
}

/// Returns `false` when the marker was already present.
async fn acquire_lock(sync_root: &Path) -> io::Result<bool> {
    match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_file_path(sync_root))
        .await
    {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

async fn release_lock(sync_root: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(lock_file_path(sync_root)).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

async fn create_remote_root(bootstrap: &Bootstrap<'_>, log: &SyncLog) -> Result<(), DavError> {
    let mut path = ROOT.to_string();
    for component in bootstrap.remote_root.split('/').filter(|c| !c.is_empty()) {
        path = join(&path, component);
        if bootstrap.base.change_tag(&path).await?.is_some() {
            continue;
        }
        bootstrap.base.create_directory(&path).await?;
        log.debug(format!("created remote directory {path}"));
        tokio::time::sleep(bootstrap.settle_delay).await;
    }
    Ok(())
}

/// Opens the state store, recreating it once when the file is unusable.
async fn open_store(sync_root: &Path, log: &SyncLog) -> Option<SyncStateStore> {
    let err = match SyncStateStore::open(sync_root).await {
        Ok(store) => return Some(store),
        Err(err) => err,
    };
    log.warning(format!("sync state unreadable, starting over: {err}"));
    let path = state_file_path(sync_root);
    if let Err(err) = tokio::fs::remove_file(&path).await
        && err.kind() != io::ErrorKind::NotFound
    {
        log.error(format!("cannot remove {}: {err}", path.display()));
        return None;
    }
    match SyncStateStore::open(sync_root).await {
        Ok(store) => Some(store),
        Err(err) => {
            log.error(format!("cannot open sync state: {err}"));
            None
        }
    }
}

async fn local_subdirectories(
    sync_root: &Path,
    parent: &str,
    filter: &Regex,
    log: &SyncLog,
) -> Vec<String> {
    let listing = match local_path_for(sync_root, parent) {
        Ok(dir) => local_fs::list_directory(&dir).await,
        Err(err) => Err(io::Error::new(io::ErrorKind::InvalidInput, err)),
    };
    match listing {
        Ok(entries) => entries
            .into_iter()
            .filter(|entry| entry.entry_type == EntryType::Directory)
            .map(|entry| entry.name)
            .filter(|name| filter.is_match(name))
            .collect(),
        Err(err) => {
            log.warning(format!("cannot list local directory {parent}: {err}"));
            Vec::new()
        }
    }
}

/// The engine's own writes change the mtime and change tag of the
/// directories it touched and of their ancestors. Store the new values for
/// levels that finished cleanly; clear the change tag below failed levels so
/// the next run lists them again.
///
/// A directory's row lives in its parent's level. When that level failed, the
/// row keeps its old change tag: the current tag may already cover remote
/// changes this run never listed.
async fn settle_baselines(
    engine: &SyncEngine<'_>,
    levels: &[(String, LevelOutcome)],
    log: &SyncLog,
) {
    let failed: BTreeSet<&str> = levels
        .iter()
        .filter(|(_, outcome)| !outcome.success())
        .map(|(path, _)| path.as_str())
        .collect();
    let mut stale = BTreeSet::new();
    for path in &failed {
        stale.insert(path.to_string());
        stale.extend(ancestors(path));
    }

    let mut refresh = BTreeSet::new();
    for (path, outcome) in levels {
        if outcome.actions == 0 {
            continue;
        }
        let clean_below = levels
            .iter()
            .filter(|(other, _)| is_within(other, path))
            .all(|(_, other)| other.success());
        if clean_below {
            refresh.insert(path.clone());
            refresh.extend(ancestors(path));
        }
    }
    refresh.remove(ROOT);
    stale.remove(ROOT);

    for path in refresh.difference(&stale) {
        if split(path).is_some_and(|(parent, _)| failed.contains(parent.as_str())) {
            continue;
        }
        if let Err(err) = engine.refresh_baseline(path).await {
            log.warning(format!("cannot refresh state of {path}: {err}"));
        }
    }
    for path in &stale {
        if let Err(err) = engine.invalidate_baseline(path).await {
            log.warning(format!("cannot reset state of {path}: {err}"));
        }
    }
}

fn is_within(path: &str, dir: &str) -> bool {
    dir == ROOT || path == dir || path.starts_with(&join(dir, ""))
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
