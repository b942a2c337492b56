use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use davsync_core::ServerType;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::storage::{KeyringSecretStore, SecretStore};
use crate::sync::orchestrator::SyncReport;
use crate::synchronizer::{ExistingLibrary, Synchronizer};

const DEFAULT_SYNC_DIR_NAME: &str = "Tasks";
const DEFAULT_REMOTE_DIR: &str = "/";
const DEFAULT_POLL_SECS: u64 = 300;

/// Daemon configuration. Everything except the sync root, poll interval and
/// password only seeds a new settings file; an existing `.davsync.json` wins.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub sync_root: PathBuf,
    pub poll_interval: Duration,
    pub url: Option<Url>,
    pub username: String,
    pub password: Option<String>,
    pub remote_directory: String,
    pub server_type: ServerType,
    pub disable_certificate_check: bool,
    pub create_dirs: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&home, &vars)
    }

    pub fn from_vars(home: &Path, vars: &HashMap<String, String>) -> anyhow::Result<Self> {
        let sync_root = read_string(vars, "DAVSYNC_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let poll_interval =
            Duration::from_secs(read_u64(vars, "DAVSYNC_POLL_SECS", DEFAULT_POLL_SECS));
        let url = read_string(vars, "DAVSYNC_URL")
            .map(|value| Url::parse(&value).with_context(|| format!("invalid DAVSYNC_URL: {value}")))
            .transpose()?;
        let server_type = read_string(vars, "DAVSYNC_SERVER_TYPE")
            .map(|value| value.parse::<ServerType>())
            .transpose()
            .context("invalid DAVSYNC_SERVER_TYPE")?
            .unwrap_or_default();

        Ok(Self {
            sync_root,
            poll_interval,
            url,
            username: read_string(vars, "DAVSYNC_USERNAME").unwrap_or_default(),
            password: read_string(vars, "DAVSYNC_PASSWORD"),
            remote_directory: read_string(vars, "DAVSYNC_REMOTE_DIR")
                .unwrap_or_else(|| DEFAULT_REMOTE_DIR.to_string()),
            server_type,
            disable_certificate_check: read_bool(vars, "DAVSYNC_INSECURE", false),
            create_dirs: read_bool(vars, "DAVSYNC_CREATE_DIRS", false),
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    synchronizer: Arc<Synchronizer>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        Self::bootstrap_with_secrets(config, Arc::new(KeyringSecretStore::default())).await
    }

    pub async fn bootstrap_with_secrets(
        config: DaemonConfig,
        secrets: Arc<dyn SecretStore>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;

        let synchronizer = match Synchronizer::from_directory(&config.sync_root, secrets.clone())
            .context("failed to read synchronizer settings")?
        {
            Some(existing) => existing,
            None => {
                let url = config.url.clone().with_context(|| {
                    format!(
                        "no settings in {:?} and DAVSYNC_URL is not set",
                        config.sync_root
                    )
                })?;
                info!(sync_root = %config.sync_root.display(), "creating new synchronizer settings");
                let created = Synchronizer::new(&config.sync_root, secrets);
                created.set_url(Some(url));
                created.set_username(config.username.clone());
                created.set_server_type(config.server_type);
                created.set_remote_directory(config.remote_directory.clone());
                created.set_disable_certificate_check(config.disable_certificate_check);
                created.set_create_dirs(config.create_dirs);
                created
            }
        };

        match &config.password {
            Some(password) => {
                synchronizer.set_password(password.clone());
                if let Err(err) = synchronizer.store_secret() {
                    warn!("cannot store password in keyring: {err}");
                }
            }
            None => match synchronizer.load_secret() {
                Ok(true) => {}
                Ok(false) => warn!("no stored password, connecting without one"),
                Err(err) => warn!("cannot read password from keyring: {err}"),
            },
        }
        synchronizer
            .save()
            .context("failed to save synchronizer settings")?;

        Ok(Self {
            config,
            synchronizer: Arc::new(synchronizer),
        })
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    /// Syncs every poll interval until ctrl-c. A sync in flight is asked to
    /// stop and finishes its current directory first.
    pub async fn run(self) -> anyhow::Result<()> {
        let settings = self.synchronizer.settings();
        info!(
            sync_root = %self.config.sync_root.display(),
            remote_directory = %settings.remote_directory,
            poll_secs = self.config.poll_interval.as_secs(),
            "daemon started"
        );

        let shutdown = CancellationToken::new();
        let worker = {
            let synchronizer = Arc::clone(&self.synchronizer);
            let shutdown = shutdown.clone();
            let interval = self.config.poll_interval;
            tokio::spawn(async move {
                while !shutdown.is_cancelled() {
                    if let Some(report) = synchronizer.synchronize().await {
                        log_report(&report);
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            })
        };

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown requested");
        shutdown.cancel();
        self.synchronizer.stop_sync();
        worker.await.context("sync worker failed")?;
        Ok(())
    }

    pub async fn run_once(&self) -> anyhow::Result<SyncReport> {
        let report = self
            .synchronizer
            .synchronize()
            .await
            .context("a sync is already running")?;
        log_report(&report);
        Ok(report)
    }

    pub async fn validate(&self) -> bool {
        self.synchronizer.validate().await
    }

    pub async fn find_libraries(&self) -> anyhow::Result<Vec<ExistingLibrary>> {
        let handle = self
            .synchronizer
            .find_existing_libraries()
            .context("library search already running")?;
        handle.await.context("library search failed")
    }
}

/// Removes the stored password of the synchronizer in `sync_root`. Returns
/// `false` when the directory holds no settings.
pub fn logout(config: &DaemonConfig, secrets: Arc<dyn SecretStore>) -> anyhow::Result<bool> {
    let Some(synchronizer) = Synchronizer::from_directory(&config.sync_root, secrets)
        .context("failed to read synchronizer settings")?
    else {
        return Ok(false);
    };
    synchronizer
        .forget_secret()
        .context("failed to remove stored password")?;
    Ok(true)
}

fn log_report(report: &SyncReport) {
    if report.cancelled {
        info!(actions = report.actions, "sync cancelled");
    } else if report.success() {
        info!(
            actions = report.actions,
            conflicts = report.conflicts,
            full = report.full,
            "sync finished"
        );
    } else {
        warn!(
            actions = report.actions,
            failures = report.failures,
            conflicts = report.conflicts,
            "sync finished with failures"
        );
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
