use std::collections::BTreeMap;

use regex::Regex;

use super::local_fs::LocalEntry;
use super::paths::{is_hidden, join};
use super::remote::RemoteEntry;
use super::state_store::StateRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryType {
    #[default]
    Absent,
    File,
    Directory,
}

/// One name under one directory, merged from the stored baseline and the
/// live local and remote listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncEntry {
    pub parent: String,
    pub entry: String,
    pub local_type: EntryType,
    pub remote_type: EntryType,
    pub last_modified: Option<i64>,
    pub previous_last_modified: Option<i64>,
    pub etag: Option<String>,
    pub previous_etag: Option<String>,
}

impl SyncEntry {
    pub fn path(&self) -> String {
        join(&self.parent, &self.entry)
    }

    pub fn local_present(&self) -> bool {
        self.local_type != EntryType::Absent
    }

    pub fn remote_present(&self) -> bool {
        self.remote_type != EntryType::Absent || self.etag.is_some()
    }

    pub fn local_changed(&self) -> bool {
        self.local_present()
            && (self.previous_last_modified.is_none()
                || self.last_modified != self.previous_last_modified)
    }

    pub fn is_directory(&self) -> bool {
        self.local_type == EntryType::Directory || self.remote_type == EntryType::Directory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    NoOp,
    Pull,
    DeleteLocal,
    Push,
    DeleteRemote,
    TypeConflict,
}

impl EntryDecision {
    pub fn is_action(&self) -> bool {
        !matches!(self, EntryDecision::NoOp | EntryDecision::TypeConflict)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryDecision::NoOp => "no-op",
            EntryDecision::Pull => "pull",
            EntryDecision::DeleteLocal => "delete-local",
            EntryDecision::Push => "push",
            EntryDecision::DeleteRemote => "delete-remote",
            EntryDecision::TypeConflict => "type-conflict",
        }
    }
}

/// First matching rule wins; the remote side takes precedence when both
/// sides changed.
pub fn resolve_entry(entry: &SyncEntry) -> EntryDecision {
    if entry.local_present()
        && entry.remote_type != EntryType::Absent
        && entry.local_type != entry.remote_type
    {
        return EntryDecision::TypeConflict;
    }
    if entry.remote_present() && entry.etag != entry.previous_etag {
        return EntryDecision::Pull;
    }
    if !entry.remote_present() && entry.previous_etag.is_some() {
        return EntryDecision::DeleteLocal;
    }
    if entry.local_changed() {
        return EntryDecision::Push;
    }
    if !entry.local_present() && entry.previous_last_modified.is_some() {
        return EntryDecision::DeleteRemote;
    }
    EntryDecision::NoOp
}

/// Merges baseline rows with the live listings, keyed by name.
///
/// `remote` is `None` in push-only mode: every entry then keeps its stored
/// change tag so only local-driven rules can fire. Directories whose name
/// does not match `dir_filter` are left out of the level entirely.
pub fn build_entries(
    parent: &str,
    previous: Vec<StateRecord>,
    local: Vec<LocalEntry>,
    remote: Option<Vec<RemoteEntry>>,
    dir_filter: Option<&Regex>,
) -> BTreeMap<String, SyncEntry> {
    let mut entries: BTreeMap<String, SyncEntry> = BTreeMap::new();

    for record in previous {
        if is_hidden(&record.entry) {
            continue;
        }
        let entry = entries
            .entry(record.entry.clone())
            .or_insert_with(|| blank(parent, &record.entry));
        entry.previous_last_modified = record.modified;
        entry.previous_etag = record.etag;
    }

    for item in local {
        if is_hidden(&item.name) {
            continue;
        }
        let entry = entries
            .entry(item.name.clone())
            .or_insert_with(|| blank(parent, &item.name));
        entry.local_type = item.entry_type;
        entry.last_modified = Some(item.modified);
    }

    match remote {
        Some(listing) => {
            for item in listing {
                if is_hidden(&item.name) {
                    continue;
                }
                let entry = entries
                    .entry(item.name.clone())
                    .or_insert_with(|| blank(parent, &item.name));
                entry.remote_type = item.entry_type;
                entry.etag = item.etag;
            }
        }
        None => {
            for entry in entries.values_mut() {
                entry.etag = entry.previous_etag.clone();
            }
        }
    }

    entries.retain(|name, entry| match dir_filter {
        Some(filter) if entry.is_directory() => filter.is_match(name),
        _ => true,
    });
    entries
}

fn blank(parent: &str, name: &str) -> SyncEntry {
    SyncEntry {
        parent: parent.to_string(),
        entry: name.to_string(),
        ..SyncEntry::default()
    }
}
