use std::fs::Metadata;
use std::io;
use std::path::Path;

use time::OffsetDateTime;

use super::paths::is_hidden;
use super::reconcile::EntryType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub modified: i64,
}

/// Immediate children of `dir`, hidden names and symlinks excluded. A missing
/// directory lists as empty.
pub async fn list_directory(dir: &Path) -> io::Result<Vec<LocalEntry>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_hidden(&name) {
            continue;
        }
        let meta = entry.metadata().await?;
        let entry_type = if meta.is_dir() {
            EntryType::Directory
        } else if meta.is_file() {
            EntryType::File
        } else {
            continue;
        };
        out.push(LocalEntry {
            name,
            entry_type,
            modified: modified_millis(&meta)?,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub fn modified_millis(meta: &Metadata) -> io::Result<i64> {
    let modified = OffsetDateTime::from(meta.modified()?);
    Ok((modified.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Modification time of `path`, `None` when it does not exist.
pub async fn modified_at(path: &Path) -> io::Result<Option<i64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(modified_millis(&meta)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
