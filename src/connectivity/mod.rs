//! Online/offline and "new version available" signals.
//!
//! The chat session never reads these. Front ends gate sending on
//! `is_offline` and offer an update when `update_available` flips.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::routes::version::{VERSION, VersionResponse};
use crate::core::AppConfig;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// What to check and how often.
#[derive(Clone, Debug)]
pub struct CheckTargets {
    /// Any HTTP response from here counts as being online
    pub provider_url: String,
    /// Playground server whose `/api/version` is compared with ours
    pub server_url: Option<String>,
    pub interval: Duration,
}

impl CheckTargets {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            provider_url: config.openai_api_hostname.clone(),
            server_url: config.server_url.clone(),
            interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct ConnectivityWatcher {
    offline: Arc<watch::Sender<bool>>,
    update_available: Arc<watch::Sender<bool>>,
    update_requested: Arc<Notify>,
}

impl Default for ConnectivityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityWatcher {
    /// Starts out online with no update pending.
    pub fn new() -> Self {
        let (offline, _) = watch::channel(false);
        let (update_available, _) = watch::channel(false);
        Self {
            offline: Arc::new(offline),
            update_available: Arc::new(update_available),
            update_requested: Arc::new(Notify::new()),
        }
    }

    pub fn is_offline(&self) -> bool {
        *self.offline.borrow()
    }

    pub fn update_available(&self) -> bool {
        *self.update_available.borrow()
    }

    pub fn subscribe_offline(&self) -> watch::Receiver<bool> {
        self.offline.subscribe()
    }

    pub fn subscribe_update(&self) -> watch::Receiver<bool> {
        self.update_available.subscribe()
    }

    pub fn set_offline(&self, offline: bool) {
        let changed = self.offline.send_if_modified(|current| {
            let changed = *current != offline;
            *current = offline;
            changed
        });
        if changed {
            if offline {
                tracing::warn!("Connection lost, working offline");
            } else {
                tracing::info!("Back online");
            }
        }
    }

    pub fn set_update_available(&self, available: bool) {
        let changed = self.update_available.send_if_modified(|current| {
            let changed = *current != available;
            *current = available;
            changed
        });
        if changed && available {
            tracing::info!("A new version is available");
        }
    }

    /// Apply a pending update. Returns false when there is none.
    pub fn trigger_update(&self) -> bool {
        if !self.update_available() {
            return false;
        }
        self.set_update_available(false);
        self.update_requested.notify_one();
        tracing::info!("Update requested");
        true
    }

    /// Resolves once `trigger_update` applied an update.
    pub async fn update_requested(&self) {
        self.update_requested.notified().await
    }

    /// Run a single round of checks and update both signals.
    pub async fn check_once(&self, client: &reqwest::Client, targets: &CheckTargets) {
        let reachable = client
            .get(&targets.provider_url)
            .timeout(CHECK_TIMEOUT)
            .send()
            .await;
        match reachable {
            Ok(_) => self.set_offline(false),
            Err(e) => {
                tracing::debug!("Provider check failed: {}", e);
                self.set_offline(true);
            }
        }

        let Some(server_url) = &targets.server_url else {
            return;
        };
        match fetch_version(client, server_url).await {
            Ok(remote) => self.set_update_available(remote != VERSION),
            Err(e) => tracing::debug!("Version check failed: {}", e),
        }
    }

    /// Check in the background every `targets.interval` until `cancel`
    /// fires.
    pub fn spawn_checks(&self, targets: CheckTargets, cancel: CancellationToken) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut interval = tokio::time::interval(targets.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => watcher.check_once(&client, &targets).await,
                }
            }
        })
    }
}

async fn fetch_version(client: &reqwest::Client, server_url: &str) -> Result<String, reqwest::Error> {
    let url = format!("{}/api/version", server_url.trim_end_matches('/'));
    let resp: VersionResponse = client
        .get(url)
        .timeout(CHECK_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(resp.version)
}
