use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use davsync_core::{ApiErrorClass, DavError};
use regex::Regex;
use thiserror::Error;

use super::local_fs;
use super::paths::{PathError, local_path_for, split};
use super::reconcile::{EntryDecision, EntryType, SyncEntry, build_entries, resolve_entry};
use super::remote::RemoteStore;
use super::state_store::{StateStoreError, SyncStateStore};
use crate::sync_log::SyncLog;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Remote(#[from] DavError),
    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("server returned no change tag for {0}")]
    MissingChangeTag(String),
}

/// What happened while reconciling one directory level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelOutcome {
    pub actions: usize,
    pub failures: usize,
    pub conflicts: usize,
    /// Names of entries on which an action was executed.
    pub changed: BTreeSet<String>,
}

impl LevelOutcome {
    pub fn success(&self) -> bool {
        self.failures == 0
    }

    pub fn failed() -> Self {
        Self {
            failures: 1,
            ..Self::default()
        }
    }
}

pub struct SyncEngine<'a> {
    remote: &'a dyn RemoteStore,
    store: &'a SyncStateStore,
    sync_root: &'a Path,
    log: &'a SyncLog,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        remote: &'a dyn RemoteStore,
        store: &'a SyncStateStore,
        sync_root: &'a Path,
        log: &'a SyncLog,
    ) -> Self {
        Self {
            remote,
            store,
            sync_root,
            log,
        }
    }

    /// Reconciles the immediate children of `parent`. Entry actions are
    /// independent: a failure is logged and the remaining entries still run.
    pub async fn sync_directory(
        &self,
        parent: &str,
        dir_filter: Option<&Regex>,
        push_only: bool,
    ) -> LevelOutcome {
        self.log.debug(format!(
            "syncing {parent}{}",
            if push_only { " (push only)" } else { "" }
        ));
        let entries = match self.collect_entries(parent, dir_filter, push_only).await {
            Ok(entries) => entries,
            Err(err) => {
                self.log
                    .warning(format!("skipping {parent}: {err}{}", failure_hint(&err)));
                return LevelOutcome::failed();
            }
        };

        let mut outcome = LevelOutcome::default();
        for entry in entries.values() {
            let decision = resolve_entry(entry);
            match decision {
                EntryDecision::NoOp => {}
                EntryDecision::TypeConflict => {
                    self.log.warning(format!(
                        "{} is a {} locally but a {} remotely; leaving both untouched",
                        entry.path(),
                        type_name(entry.local_type),
                        type_name(entry.remote_type),
                    ));
                    outcome.conflicts += 1;
                }
                _ => match self.apply(entry, decision, push_only).await {
                    Ok(()) => {
                        outcome.actions += 1;
                        outcome.changed.insert(entry.entry.clone());
                    }
                    Err(err) => {
                        self.log.warning(format!(
                            "{} of {} failed: {err}{}",
                            decision.as_str(),
                            entry.path(),
                            failure_hint(&err)
                        ));
                        outcome.failures += 1;
                    }
                },
            }
        }
        outcome
    }

    async fn collect_entries(
        &self,
        parent: &str,
        dir_filter: Option<&Regex>,
        push_only: bool,
    ) -> Result<BTreeMap<String, SyncEntry>, EngineError> {
        let local_dir = local_path_for(self.sync_root, parent)?;
        let local = local_fs::list_directory(&local_dir).await?;
        let remote = if push_only {
            None
        } else {
            Some(self.remote.list(parent).await?)
        };
        let previous = match self.store.records(parent).await {
            Ok(records) => records,
            Err(err) => {
                self.log
                    .warning(format!("stored state of {parent} unavailable: {err}"));
                Vec::new()
            }
        };
        Ok(build_entries(parent, previous, local, remote, dir_filter))
    }

    async fn apply(
        &self,
        entry: &SyncEntry,
        decision: EntryDecision,
        push_only: bool,
    ) -> Result<(), EngineError> {
        let path = entry.path();
        let local = local_path_for(self.sync_root, &path)?;
        match decision {
            EntryDecision::Pull => self.pull(entry, &path, &local).await,
            EntryDecision::DeleteLocal => {
                local_fs::remove_path(&local).await?;
                self.forget(entry, &path).await?;
                self.log.debug(format!("removed {path} locally"));
                Ok(())
            }
            EntryDecision::Push => self.push(entry, &path, &local, push_only).await,
            EntryDecision::DeleteRemote => {
                self.remote.delete(&path).await?;
                self.forget(entry, &path).await?;
                self.log.debug(format!("removed {path} remotely"));
                Ok(())
            }
            EntryDecision::NoOp | EntryDecision::TypeConflict => Ok(()),
        }
    }

    async fn pull(&self, entry: &SyncEntry, path: &str, local: &Path) -> Result<(), EngineError> {
        if entry.remote_type == EntryType::Directory {
            tokio::fs::create_dir_all(local).await?;
        } else {
            if entry.local_type == EntryType::File && entry.local_changed() {
                self.log.warning(format!(
                    "{path} changed on both sides; local edits are replaced by the remote version"
                ));
            }
            self.remote.download(path, local).await?;
        }
        let modified = local_fs::modified_at(local).await?;
        self.store
            .upsert(&entry.parent, &entry.entry, modified, entry.etag.as_deref())
            .await?;
        self.log.debug(format!("pulled {path}"));
        Ok(())
    }

    async fn push(
        &self,
        entry: &SyncEntry,
        path: &str,
        local: &Path,
        push_only: bool,
    ) -> Result<(), EngineError> {
        let etag = if entry.local_type == EntryType::Directory {
            let exists = entry.remote_type == EntryType::Directory
                || (push_only && entry.previous_etag.is_some());
            if !exists {
                self.remote.create_directory(path).await?;
            }
            self.remote.change_tag(path).await?
        } else {
            let etag = match self.remote.upload(local, path).await? {
                Some(etag) => Some(etag),
                None => self.remote.change_tag(path).await?,
            };
            Some(etag.ok_or_else(|| EngineError::MissingChangeTag(path.to_string()))?)
        };
        // The mtime observed before the transfer, so edits made meanwhile
        // still count as local changes next time.
        self.store
            .upsert(
                &entry.parent,
                &entry.entry,
                entry.last_modified,
                etag.as_deref(),
            )
            .await?;
        self.log.debug(format!("pushed {path}"));
        Ok(())
    }

    async fn forget(&self, entry: &SyncEntry, path: &str) -> Result<(), EngineError> {
        self.store.remove_subtree(path).await?;
        self.store.remove(&entry.parent, &entry.entry).await?;
        Ok(())
    }

    /// Stores the current local mtime and remote change tag of the directory
    /// `path`, so changes made by this run are not seen as external ones.
    pub async fn refresh_baseline(&self, path: &str) -> Result<(), EngineError> {
        let Some((parent, name)) = split(path) else {
            return Ok(());
        };
        let Some(record) = self.store.record(&parent, &name).await? else {
            return Ok(());
        };
        let local = local_path_for(self.sync_root, path)?;
        let Some(modified) = local_fs::modified_at(&local).await? else {
            return Ok(());
        };
        let etag = self.remote.change_tag(path).await?;
        if record.modified == Some(modified) && record.etag == etag {
            return Ok(());
        }
        self.store
            .upsert(&parent, &name, Some(modified), etag.as_deref())
            .await?;
        Ok(())
    }

    /// Forgets the stored change tag of the directory `path` so the next run
    /// lists it remotely again.
    pub async fn invalidate_baseline(&self, path: &str) -> Result<(), EngineError> {
        let Some((parent, name)) = split(path) else {
            return Ok(());
        };
        let Some(record) = self.store.record(&parent, &name).await? else {
            return Ok(());
        };
        if record.etag.is_none() {
            return Ok(());
        }
        self.store
            .upsert(&parent, &name, record.modified, None)
            .await?;
        Ok(())
    }
}

/// Appended to failure warnings so the log tells a rejected login from a
/// hiccup that the next run will retry.
fn failure_hint(err: &EngineError) -> &'static str {
    let EngineError::Remote(err) = err else {
        return "";
    };
    if err.is_not_found() {
        return "; gone on the server";
    }
    match err.classification() {
        Some(ApiErrorClass::Auth) => "; check username and password",
        Some(ApiErrorClass::RateLimit) => "; server is throttling, retrying next run",
        _ if err.is_retryable() => "; retrying next run",
        _ => "",
    }
}

fn type_name(entry_type: EntryType) -> &'static str {
    match entry_type {
        EntryType::Absent => "missing entry",
        EntryType::File => "file",
        EntryType::Directory => "directory",
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
