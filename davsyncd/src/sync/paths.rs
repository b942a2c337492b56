use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub const ROOT: &str = "/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps a sync-relative path ("/2024/3/item.json") under the local root.
pub fn local_path_for(sync_root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = sync_root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

pub fn join(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{parent}/{name}")
}

/// Splits "/2024/3" into ("/2024", "3"); the root has no parent.
pub fn split(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    let parent = if parent.is_empty() { ROOT } else { parent };
    Some((parent.to_string(), name.to_string()))
}

/// Every ancestor of `path` below the root, nearest first.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = path.to_string();
    while let Some((parent, _)) = split(&current) {
        if parent == ROOT {
            break;
        }
        out.push(parent.clone());
        current = parent;
    }
    out
}

/// Dot files (state store, lock marker, partial downloads) never sync.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}
