use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use davsync_core::{
    DEFAULT_INACTIVITY_TIMEOUT, DavClient, DavConfig, DavError, ResourceType, ServerType,
};
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::settings::{self, SettingsError, SynchronizerSettings};
use crate::storage::{SecretStore, SecretStoreError};
use crate::sync::orchestrator::{self, Bootstrap, DEFAULT_SETTLE_DELAY, SyncJob, SyncReport};
use crate::sync::paths::join;
use crate::sync_log::{SyncLog, log_file_path};

const LIBRARY_SUFFIX: &str = ".otl";
const LIBRARY_FILE_NAME: &str = "library.json";
const LIBRARY_SEARCH_DIRS: [&str; 2] = ["/", "/OpenTodoList"];

#[derive(Debug, Error)]
pub enum SynchronizerError {
    #[error("no server url configured")]
    MissingUrl,
    #[error("remote error: {0}")]
    Dav(#[from] DavError),
}

/// A library found on the server by [`Synchronizer::find_existing_libraries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingLibrary {
    pub name: String,
    /// Path of the library directory relative to the remote root.
    pub path: String,
    pub uid: Option<Uuid>,
}

#[derive(Deserialize)]
struct LibraryFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: Option<Uuid>,
}

/// Keeps one sync directory in step with a WebDAV folder and exposes the
/// state a front end needs: validation, running flags, settings and log.
pub struct Synchronizer {
    directory: PathBuf,
    settings: Mutex<SynchronizerSettings>,
    password: Mutex<String>,
    secrets: Arc<dyn SecretStore>,
    log: SyncLog,
    validating: AtomicBool,
    valid: AtomicBool,
    synchronizing: AtomicBool,
    finding_libraries: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    existing_libraries: Mutex<Vec<ExistingLibrary>>,
    settle_delay: Duration,
    inactivity_timeout: Duration,
}

impl Synchronizer {
    pub fn new(directory: impl Into<PathBuf>, secrets: Arc<dyn SecretStore>) -> Self {
        Self::with_settings(directory.into(), SynchronizerSettings::default(), secrets)
    }

    /// Restores the synchronizer whose settings live in `directory`; `None`
    /// when there are none or they belong to another synchronizer type.
    pub fn from_directory(
        directory: impl Into<PathBuf>,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Option<Self>, SettingsError> {
        let directory = directory.into();
        let Some(settings) = settings::load(&directory)? else {
            return Ok(None);
        };
        let synchronizer = Self::with_settings(directory, settings, secrets);
        if let Err(err) = synchronizer.log.load(&log_file_path(&synchronizer.directory)) {
            tracing::warn!("cannot read previous sync log: {err}");
        }
        Ok(Some(synchronizer))
    }

    fn with_settings(
        directory: PathBuf,
        settings: SynchronizerSettings,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            directory,
            settings: Mutex::new(settings),
            password: Mutex::new(String::new()),
            secrets,
            log: SyncLog::default(),
            validating: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            synchronizing: AtomicBool::new(false),
            finding_libraries: AtomicBool::new(false),
            cancel: Mutex::new(None),
            existing_libraries: Mutex::new(Vec::new()),
            settle_delay: DEFAULT_SETTLE_DELAY,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn uid(&self) -> Uuid {
        lock(&self.settings).uid
    }

    pub fn settings(&self) -> SynchronizerSettings {
        lock(&self.settings).clone()
    }

    pub fn log(&self) -> &SyncLog {
        &self.log
    }

    pub fn last_sync(&self) -> Option<OffsetDateTime> {
        lock(&self.settings).last_sync
    }

    pub fn is_validating(&self) -> bool {
        self.validating.load(Ordering::SeqCst)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn is_synchronizing(&self) -> bool {
        self.synchronizing.load(Ordering::SeqCst)
    }

    pub fn is_finding_libraries(&self) -> bool {
        self.finding_libraries.load(Ordering::SeqCst)
    }

    pub fn existing_libraries(&self) -> Vec<ExistingLibrary> {
        lock(&self.existing_libraries).clone()
    }

    pub fn set_url(&self, url: Option<Url>) {
        self.update_connection(|settings| settings.url = url);
    }

    pub fn set_username(&self, username: impl Into<String>) {
        let username = username.into();
        self.update_connection(|settings| settings.username = username);
    }

    pub fn set_server_type(&self, server_type: ServerType) {
        self.update_connection(|settings| settings.server_type = server_type);
    }

    pub fn set_disable_certificate_check(&self, disable: bool) {
        self.update_connection(|settings| settings.disable_certificate_check = disable);
    }

    pub fn set_remote_directory(&self, remote_directory: impl Into<String>) {
        lock(&self.settings).remote_directory = remote_directory.into();
    }

    pub fn set_create_dirs(&self, create_dirs: bool) {
        lock(&self.settings).create_dirs = create_dirs;
    }

    pub fn set_password(&self, password: impl Into<String>) {
        *lock(&self.password) = password.into();
        self.valid.store(false, Ordering::SeqCst);
    }

    fn update_connection(&self, apply: impl FnOnce(&mut SynchronizerSettings)) {
        apply(&mut *lock(&self.settings));
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Key under which the password is kept in the secret store.
    pub fn secrets_key(&self) -> String {
        self.uid().to_string()
    }

    pub fn secret(&self) -> String {
        lock(&self.password).clone()
    }

    pub fn set_secret(&self, secret: impl Into<String>) {
        self.set_password(secret);
    }

    /// Loads the password from the secret store; `false` when none is stored.
    pub fn load_secret(&self) -> Result<bool, SecretStoreError> {
        match self.secrets.get_secret(&self.secrets_key())? {
            Some(secret) => {
                self.set_password(secret);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn store_secret(&self) -> Result<(), SecretStoreError> {
        self.secrets.set_secret(&self.secrets_key(), &self.secret())
    }

    pub fn forget_secret(&self) -> Result<(), SecretStoreError> {
        self.secrets.delete_secret(&self.secrets_key())
    }

    /// Writes the settings sidecar; `false` when nothing changed on disk.
    pub fn save(&self) -> Result<bool, SettingsError> {
        settings::save(&self.directory, &self.settings())
    }

    pub fn restore(&self) -> Result<(), SettingsError> {
        if let Some(settings) = settings::load(&self.directory)? {
            *lock(&self.settings) = settings;
            self.valid.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn save_log(&self) -> Result<(), crate::sync_log::SyncLogError> {
        self.log.save(&log_file_path(&self.directory))
    }

    /// Client addressing the configured remote directory.
    pub fn client(&self) -> Result<DavClient, SynchronizerError> {
        let settings = self.settings();
        let url = settings.url.ok_or(SynchronizerError::MissingUrl)?;
        let mut config = DavConfig::new(url);
        config.server_type = settings.server_type;
        config.username = settings.username;
        config.password = self.secret();
        config.remote_root = settings.remote_directory;
        config.disable_certificate_check = settings.disable_certificate_check;
        config.inactivity_timeout = self.inactivity_timeout;
        Ok(DavClient::new(config)?)
    }

    /// Checks that the server answers with the current connection settings.
    pub async fn validate(&self) -> bool {
        self.validating.store(true, Ordering::SeqCst);
        self.valid.store(false, Ordering::SeqCst);

        let result = match self.client() {
            Ok(client) => client
                .with_remote_root("")
                .check_connection()
                .await
                .map_err(SynchronizerError::from),
            Err(err) => Err(err),
        };
        let valid = match result {
            Ok(()) => {
                self.log.debug("connection to server verified");
                true
            }
            Err(err) => {
                self.log.warning(format!("connection check failed: {err}"));
                false
            }
        };

        self.valid.store(valid, Ordering::SeqCst);
        self.validating.store(false, Ordering::SeqCst);
        valid
    }

    /// Runs one sync. Returns `None` when a sync is already in progress.
    pub async fn synchronize(&self) -> Option<SyncReport> {
        if self.synchronizing.swap(true, Ordering::SeqCst) {
            return None;
        }
        let cancel = CancellationToken::new();
        *lock(&self.cancel) = Some(cancel.clone());

        let report = self.run_sync(cancel).await;

        *lock(&self.cancel) = None;
        self.synchronizing.store(false, Ordering::SeqCst);
        Some(report)
    }

    /// Asks the running sync to stop before its next directory.
    pub fn stop_sync(&self) {
        if let Some(cancel) = lock(&self.cancel).as_ref() {
            cancel.cancel();
        }
    }

    async fn run_sync(&self, cancel: CancellationToken) -> SyncReport {
        let remote = match self.client() {
            Ok(client) => client,
            Err(err) => {
                self.log.error(format!("cannot start sync: {err}"));
                return SyncReport {
                    failures: 1,
                    ..SyncReport::default()
                };
            }
        };
        let base = remote.with_remote_root("");
        let settings = self.settings();
        let bootstrap = settings.create_dirs.then(|| Bootstrap {
            base: &base,
            remote_root: settings.remote_directory.clone(),
            settle_delay: self.settle_delay,
        });

        let report = orchestrator::run(SyncJob {
            sync_root: &self.directory,
            remote: &remote,
            bootstrap,
            log: &self.log,
            cancel,
        })
        .await;

        let mut dirty = false;
        if report.bootstrapped {
            lock(&self.settings).create_dirs = false;
            dirty = true;
        }
        if report.success() {
            lock(&self.settings).last_sync = Some(OffsetDateTime::now_utc());
            dirty = true;
        }
        if dirty && let Err(err) = self.save() {
            self.log.warning(format!("cannot save settings: {err}"));
        }
        if let Err(err) = self.save_log() {
            tracing::warn!("cannot save sync log: {err}");
        }
        report
    }

    /// Looks for libraries (`*.otl` directories) below the remote directory
    /// in a background task. Returns `None` while a search is running.
    pub fn find_existing_libraries(self: &Arc<Self>) -> Option<JoinHandle<Vec<ExistingLibrary>>> {
        if self.finding_libraries.swap(true, Ordering::SeqCst) {
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let libraries = match this.client() {
                Ok(client) => discover_libraries(&client).await,
                Err(err) => {
                    tracing::warn!("cannot search for libraries: {err}");
                    Vec::new()
                }
            };
            *lock(&this.existing_libraries) = libraries.clone();
            this.finding_libraries.store(false, Ordering::SeqCst);
            libraries
        }))
    }
}

async fn discover_libraries(client: &DavClient) -> Vec<ExistingLibrary> {
    let mut candidates = Vec::new();
    for dir in LIBRARY_SEARCH_DIRS {
        match client.list_directory(dir).await {
            Ok(resources) => candidates.extend(
                resources
                    .into_iter()
                    .filter(|resource| resource.resource_type == ResourceType::Dir)
                    .filter(|resource| resource.name.ends_with(LIBRARY_SUFFIX))
                    .map(|resource| join(dir, &resource.name)),
            ),
            Err(err) => tracing::debug!("no libraries listed in {dir}: {err}"),
        }
    }

    let mut libraries = Vec::new();
    for path in candidates {
        let bytes = match client.download_bytes(&join(&path, LIBRARY_FILE_NAME)).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!("skipping {path}: {err}");
                continue;
            }
        };
        match serde_json::from_slice::<LibraryFile>(&bytes) {
            Ok(file) => libraries.push(ExistingLibrary {
                name: file.name,
                path,
                uid: file.uid,
            }),
            Err(err) => tracing::debug!("skipping {path}: invalid {LIBRARY_FILE_NAME}: {err}"),
        }
    }
    libraries
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "synchronizer_tests.rs"]
mod tests;
