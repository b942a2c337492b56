use std::path::{Path, PathBuf};

use davsync_core::ServerType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

pub const SETTINGS_FILE_NAME: &str = ".davsync.json";
pub const SYNCHRONIZER_TYPE: &str = "WebDAVSynchronizer";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizerSettings {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "Uuid::new_v4")]
    pub uid: Uuid,
    #[serde(default)]
    pub url: Option<Url>,
    #[serde(default, with = "server_type")]
    pub server_type: ServerType,
    #[serde(default = "default_remote_directory")]
    pub remote_directory: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub disable_certificate_check: bool,
    #[serde(default)]
    pub create_dirs: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
}

impl Default for SynchronizerSettings {
    fn default() -> Self {
        Self {
            kind: SYNCHRONIZER_TYPE.to_string(),
            uid: Uuid::new_v4(),
            url: None,
            server_type: ServerType::Generic,
            remote_directory: default_remote_directory(),
            username: String::new(),
            disable_certificate_check: false,
            create_dirs: false,
            last_sync: None,
        }
    }
}

fn default_remote_directory() -> String {
    "/".to_string()
}

mod server_type {
    use davsync_core::ServerType;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &ServerType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ServerType, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

pub fn settings_file_path(directory: &Path) -> PathBuf {
    directory.join(SETTINGS_FILE_NAME)
}

/// Reads the settings stored in `directory`. A missing file or one written
/// for another synchronizer type yields `None`.
pub fn load(directory: &Path) -> Result<Option<SynchronizerSettings>, SettingsError> {
    let Some(raw) = read_map(&settings_file_path(directory))? else {
        return Ok(None);
    };
    if raw.get("type").and_then(Value::as_str) != Some(SYNCHRONIZER_TYPE) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(Value::Object(raw))?))
}

/// Writes `settings` over the existing file, keeping keys this version does
/// not know about. Returns `false` when the file already held these values.
pub fn save(directory: &Path, settings: &SynchronizerSettings) -> Result<bool, SettingsError> {
    let path = settings_file_path(directory);
    let existing = read_map(&path)?;
    let mut merged = existing.clone().unwrap_or_default();
    if let Value::Object(values) = serde_json::to_value(settings)? {
        merged.extend(values);
    }
    if existing.as_ref() == Some(&merged) {
        return Ok(false);
    }
    let bytes = serde_json::to_vec_pretty(&Value::Object(merged))?;
    std::fs::write(&path, bytes)?;
    Ok(true)
}

fn read_map(path: &Path) -> Result<Option<Map<String, Value>>, SettingsError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&bytes)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Ok(None),
    }
}
