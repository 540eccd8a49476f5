//! Startup state machine.
//!
//! Two workers run side by side: the local worker copies the embedded bundle
//! into the store and picks the best cached update, the remote worker asks the
//! update server for something newer and downloads it. The decision waits for
//! the remote worker at most `launch_wait`; whatever finishes later is reported
//! through [`LoaderTaskCallback::on_background_update_finished`].

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use ota_domain::{Manifest, SelectionPolicy, Update, UpdateId, UpdateStatus};
use serde::Serialize;
use strum::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::core::config::{CheckOnLaunch, Config};
use crate::core::errors::{ErrorKind, UpdatesError};
use crate::core::events::NetworkMonitor;
use crate::core::launcher::{launcher_for, EmbeddedLauncher, EmergencyReason, LaunchedContent};
use crate::core::loader::{
    load_embedded_update, AssetFetcher, EmbeddedBundle, ManifestSource, RemoteLoader,
};
use crate::core::store::Database;

/// Extra time the local worker gets after the remote budget expires.
pub const LOCAL_LAUNCH_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackgroundUpdateStatus {
    Error,
    UpdateAvailable,
    NoUpdateAvailable,
}

/// Observer of one loader task run. All methods are called from the task's
/// own threads.
pub trait LoaderTaskCallback: Send + Sync {
    fn on_failure(&self, error: &anyhow::Error);

    /// Return `false` to skip this cached candidate.
    fn on_cached_update_loaded(&self, _update: &Update) -> bool {
        true
    }

    fn on_remote_manifest_loaded(&self, _manifest: &Manifest) {}

    fn on_success(&self, launch: LaunchedContent, is_up_to_date: bool);

    fn on_background_update_finished(
        &self,
        _status: BackgroundUpdateStatus,
        _update: Option<&Update>,
        _error: Option<&anyhow::Error>,
    ) {
    }
}

enum RemoteOutcome {
    Skipped,
    NoUpdate,
    Loaded(Update),
    Failed(anyhow::Error),
}

enum Message {
    Local(Result<Option<LaunchedContent>>),
    Remote(RemoteOutcome),
}

pub struct LoaderTask {
    config: Config,
    database: Database,
    policy: SelectionPolicy,
    manifest_source: Arc<dyn ManifestSource>,
    asset_fetcher: Arc<dyn AssetFetcher>,
    network: Arc<dyn NetworkMonitor>,
}

impl LoaderTask {
    pub fn new(
        config: Config,
        database: Database,
        policy: SelectionPolicy,
        manifest_source: Arc<dyn ManifestSource>,
        asset_fetcher: Arc<dyn AssetFetcher>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Self {
        Self {
            config,
            database,
            policy,
            manifest_source,
            asset_fetcher,
            network,
        }
    }

    /// Run on a dedicated background thread.
    pub fn start(self, callback: Arc<dyn LoaderTaskCallback>) -> Result<thread::JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("ota-loader-task".into())
            .spawn(move || self.run(callback.as_ref()))?;
        Ok(handle)
    }

    /// Run to completion on the calling thread, including background work
    /// that outlives the launch decision.
    pub fn run(&self, callback: &dyn LoaderTaskCallback) {
        let started = Instant::now();
        let deadline = started + self.config.launch_wait();
        let hard_deadline = deadline + LOCAL_LAUNCH_SLACK;
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            let local_tx = tx.clone();
            scope.spawn(move || {
                let result = self.load_local(callback);
                let _ = local_tx.send(Message::Local(result));
            });
            let remote_tx = tx;
            scope.spawn(move || {
                let outcome = self.check_remote(callback);
                let _ = remote_tx.send(Message::Remote(outcome));
            });

            let mut local = None;
            let mut remote = None;
            loop {
                let now = Instant::now();
                if local.is_some() && (remote.is_some() || now >= deadline) {
                    break;
                }
                if now >= hard_deadline {
                    warn!("local launch candidate not ready in time");
                    break;
                }
                let wait_until = if remote.is_none() && now < deadline {
                    deadline
                } else {
                    hard_deadline
                };
                match rx.recv_timeout(wait_until.saturating_duration_since(now)) {
                    Ok(Message::Local(result)) => local = Some(result),
                    Ok(Message::Remote(outcome)) => remote = Some(outcome),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            let remote_in_time = remote.is_some();
            let (content, is_up_to_date) = self.decide(callback, local, remote.as_ref());
            if let Some(update) = content.reapable_update() {
                if let Err(err) = self.database.mark_update_launched(&update.id) {
                    warn!(update = %update.id, error = %format!("{err:#}"), "failed to record launch");
                }
            }
            info!(
                update = ?content.launched_update.as_ref().map(|u| u.id.as_str()),
                emergency = ?content.emergency,
                is_up_to_date,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "launch decided"
            );
            callback.on_success(content, is_up_to_date);

            if remote_in_time {
                return;
            }
            while let Ok(message) = rx.recv() {
                if let Message::Remote(outcome) = message {
                    report_background(callback, outcome);
                    break;
                }
            }
        });
    }

    fn decide(
        &self,
        callback: &dyn LoaderTaskCallback,
        local: Option<Result<Option<LaunchedContent>>>,
        remote: Option<&RemoteOutcome>,
    ) -> (LaunchedContent, bool) {
        let embedded_dir = self.config.embedded_dir();
        if let Some(RemoteOutcome::Loaded(update)) = remote {
            match self.launch_best_cached(callback) {
                Ok(Some(content)) => {
                    let is_fresh = content
                        .launched_update
                        .as_ref()
                        .is_some_and(|launched| launched.id == update.id);
                    if !is_fresh {
                        debug!(update = %update.id, "launcher policy kept another candidate");
                    }
                    return (content, is_fresh);
                }
                Ok(None) => debug!(update = %update.id, "no candidate after remote load"),
                Err(err) => warn!(
                    update = %update.id,
                    error = %format!("{err:#}"),
                    "launch after remote load failed"
                ),
            }
        }
        // Embedded-only launches are emergencies unless a remote check completed in time.
        let remote_checked = matches!(
            remote,
            Some(RemoteOutcome::Skipped | RemoteOutcome::NoUpdate | RemoteOutcome::Loaded(_))
        );
        let is_up_to_date = matches!(remote, Some(RemoteOutcome::NoUpdate));
        match local {
            Some(Ok(Some(mut content))) => {
                let embedded_only = content
                    .launched_update
                    .as_ref()
                    .map_or(true, |update| update.status == UpdateStatus::Embedded);
                if embedded_only && !remote_checked {
                    content.emergency = Some(EmergencyReason::NoLaunchableUpdate);
                }
                (content, is_up_to_date)
            }
            Some(Ok(None)) => {
                let content =
                    EmbeddedLauncher::emergency(embedded_dir, EmergencyReason::NoLaunchableUpdate)
                        .resolve();
                (content, false)
            }
            Some(Err(err)) => {
                callback.on_failure(&err);
                let reason = if UpdatesError::classify(&err) == ErrorKind::Storage {
                    EmergencyReason::UpdatesDirectoryUnavailable
                } else {
                    EmergencyReason::LoaderTaskFailed
                };
                (EmbeddedLauncher::emergency(embedded_dir, reason).resolve(), false)
            }
            None => {
                let err = anyhow::anyhow!("no local launch candidate within the launch budget");
                callback.on_failure(&err);
                let content =
                    EmbeddedLauncher::emergency(embedded_dir, EmergencyReason::LoaderTaskFailed)
                        .resolve();
                (content, false)
            }
        }
    }

    /// Copy the embedded bundle in, then launch the best cached candidate.
    fn load_local(&self, callback: &dyn LoaderTaskCallback) -> Result<Option<LaunchedContent>> {
        let scope_key = self.config.scope_key();
        match EmbeddedBundle::load(self.config.embedded_dir()) {
            Ok(bundle) => {
                if let Err(err) = load_embedded_update(&self.database, &bundle, scope_key) {
                    warn!(error = %format!("{err:#}"), "failed to copy embedded update");
                }
            }
            Err(err) => warn!(%err, "no embedded update available"),
        }
        self.launch_best_cached(callback)
    }

    /// Walk the cached candidates in policy order, skipping vetoed ones and
    /// demoting those whose files fail verification.
    fn launch_best_cached(
        &self,
        callback: &dyn LoaderTaskCallback,
    ) -> Result<Option<LaunchedContent>> {
        let scope_key = self.config.scope_key();
        let filters = self.config.filters();
        let mut skipped: Vec<UpdateId> = Vec::new();
        loop {
            let candidates: Vec<Update> = self
                .database
                .launchable_updates(scope_key)?
                .into_iter()
                .filter(|update| !skipped.contains(&update.id))
                .collect();
            let Some(selected) = self.policy.select_update_to_launch(&candidates, &filters) else {
                debug!("no cached update to launch");
                return Ok(None);
            };
            if !callback.on_cached_update_loaded(selected) {
                debug!(update = %selected.id, "cached update vetoed");
                skipped.push(selected.id.clone());
                continue;
            }
            match launcher_for(selected, self.config.embedded_dir()).launch(Some(&self.database)) {
                Ok(content) => return Ok(Some(content)),
                Err(err) if UpdatesError::classify(&err) == ErrorKind::Integrity => {
                    warn!(update = %selected.id, %err, "cached update failed verification");
                    skipped.push(selected.id.clone());
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn should_check_remote(&self) -> bool {
        match self.config.check_on_launch() {
            CheckOnLaunch::Never => false,
            CheckOnLaunch::WifiOnly => !self.network.is_metered(),
            CheckOnLaunch::Always => true,
        }
    }

    fn check_remote(&self, callback: &dyn LoaderTaskCallback) -> RemoteOutcome {
        if !self.should_check_remote() {
            debug!(policy = %self.config.check_on_launch(), "skipping remote check");
            return RemoteOutcome::Skipped;
        }
        match self.load_remote(callback) {
            Ok(Some(update)) => RemoteOutcome::Loaded(update),
            Ok(None) => RemoteOutcome::NoUpdate,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "remote update check failed");
                RemoteOutcome::Failed(err)
            }
        }
    }

    fn load_remote(&self, callback: &dyn LoaderTaskCallback) -> Result<Option<Update>> {
        let Some(manifest) = self.manifest_source.fetch_manifest()? else {
            return Ok(None);
        };
        callback.on_remote_manifest_loaded(&manifest);

        let scope_key = self.config.scope_key();
        let filters = self.config.filters();
        let mut candidates = self.database.launchable_updates(scope_key)?;
        if let Ok(bundle) = EmbeddedBundle::load(self.config.embedded_dir()) {
            let embedded = bundle.update(scope_key);
            if !candidates.iter().any(|update| update.id == embedded.id) {
                candidates.push(embedded);
            }
        }
        let best_local = self.policy.select_update_to_launch(&candidates, &filters);
        let candidate = manifest.to_update(scope_key, UpdateStatus::Pending);
        if !self
            .policy
            .should_load_new_update(&candidate, best_local, &filters)
        {
            debug!(update = %manifest.id, "remote update is not newer");
            return Ok(None);
        }
        let update = RemoteLoader::new(&self.database, self.asset_fetcher.as_ref())
            .with_parallelism(self.config.max_parallel_downloads())
            .load(&manifest, scope_key)?;
        Ok(Some(update))
    }
}

fn report_background(callback: &dyn LoaderTaskCallback, outcome: RemoteOutcome) {
    match outcome {
        RemoteOutcome::Loaded(update) => callback.on_background_update_finished(
            BackgroundUpdateStatus::UpdateAvailable,
            Some(&update),
            None,
        ),
        RemoteOutcome::NoUpdate | RemoteOutcome::Skipped => callback.on_background_update_finished(
            BackgroundUpdateStatus::NoUpdateAvailable,
            None,
            None,
        ),
        RemoteOutcome::Failed(err) => callback.on_background_update_finished(
            BackgroundUpdateStatus::Error,
            None,
            Some(&err),
        ),
    }
}

#[cfg(test)]
mod tests;
