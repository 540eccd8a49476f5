//! The process-wide entry point hosts talk to.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ota_domain::{Manifest, SelectionPolicy, Update, UpdateStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::errors::UpdatesError;
use crate::core::events::{
    BundleSwapper, EventSink, LoggingBundleSwapper, LoggingEventSink, NetworkMonitor,
    UnmeteredNetwork, UpdatesEvent,
};
use crate::core::launcher::{launcher_for, EmbeddedLauncher, EmergencyReason, LaunchedContent};
use crate::core::loader::{
    build_http_client, AssetFetcher, HttpAssetFetcher, HttpManifestSource, ManifestSource,
    RemoteLoader,
};
use crate::core::loader_task::{
    BackgroundUpdateStatus, LoaderTask, LoaderTaskCallback, LOCAL_LAUNCH_SLACK,
};
use crate::core::reaper::reap_unused_updates;
use crate::core::signal::LaunchSignal;
use crate::core::store::{Database, IntegritySummary, ReapSummary};

/// Collaborators the controller is built with.
#[derive(Clone)]
pub struct ControllerDeps {
    pub manifest_source: Arc<dyn ManifestSource>,
    pub asset_fetcher: Arc<dyn AssetFetcher>,
    pub bundle_swapper: Arc<dyn BundleSwapper>,
    pub events: Arc<dyn EventSink>,
    pub network: Arc<dyn NetworkMonitor>,
}

impl ControllerDeps {
    /// HTTP transport plus logging host hooks.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built or request headers are invalid.
    pub fn http(config: &Config) -> Result<Self> {
        let client = build_http_client()?;
        let manifest_source: Arc<dyn ManifestSource> = if config.update_url().is_some() {
            Arc::new(HttpManifestSource::from_config(config, client.clone())?)
        } else {
            Arc::new(NoManifestSource)
        };
        Ok(Self {
            manifest_source,
            asset_fetcher: Arc::new(HttpAssetFetcher::new(client)),
            bundle_swapper: Arc::new(LoggingBundleSwapper),
            events: Arc::new(LoggingEventSink),
            network: Arc::new(UnmeteredNetwork),
        })
    }
}

struct NoManifestSource;

impl ManifestSource for NoManifestSource {
    fn fetch_manifest(&self) -> Result<Option<Manifest>> {
        Err(UpdatesError::Disabled.into())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub is_available: bool,
    pub manifest: Option<Manifest>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    pub is_new: bool,
    pub manifest: Option<Manifest>,
}

struct Inner {
    config: Config,
    database: Option<Database>,
    deps: ControllerDeps,
    policy: RwLock<SelectionPolicy>,
    launched: RwLock<Option<Arc<LaunchedContent>>>,
    signal: LaunchSignal,
    initialized: AtomicBool,
    reloading: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the update lifecycle of one process.
#[derive(Clone)]
pub struct UpdatesController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for UpdatesController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdatesController")
            .field("enabled", &self.inner.config.enabled())
            .field("database", &self.inner.database)
            .finish_non_exhaustive()
    }
}

impl UpdatesController {
    /// Build a controller. An unusable updates directory is not an error here:
    /// the controller will launch the embedded bundle in emergency mode.
    #[must_use]
    pub fn new(config: Config, deps: ControllerDeps) -> Self {
        let database = if config.enabled() {
            match Database::open(config.updates_dir()) {
                Ok(db) => Some(db),
                Err(err) => {
                    warn!(
                        dir = %config.updates_dir().display(),
                        error = %format!("{err:#}"),
                        "update database unavailable"
                    );
                    None
                }
            }
        } else {
            None
        };
        Self {
            inner: Arc::new(Inner {
                config,
                database,
                deps,
                policy: RwLock::new(SelectionPolicy::default()),
                launched: RwLock::new(None),
                signal: LaunchSignal::default(),
                initialized: AtomicBool::new(false),
                reloading: AtomicBool::new(false),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn database(&self) -> Option<&Database> {
        self.inner.database.as_ref()
    }

    /// Start deciding what to launch. Later calls do nothing.
    pub fn initialize(&self) -> Result<()> {
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("updates controller already initialized");
            return Ok(());
        }
        let config = &self.inner.config;
        if !config.enabled() {
            info!("updates disabled; launching embedded bundle");
            self.inner
                .adopt_initial(EmbeddedLauncher::new(config.embedded_dir()).resolve());
            return Ok(());
        }
        let Some(database) = self.inner.database.clone() else {
            self.inner.adopt_initial(
                EmbeddedLauncher::emergency(
                    config.embedded_dir(),
                    EmergencyReason::DatabaseUnavailable,
                )
                .resolve(),
            );
            return Ok(());
        };

        let task = LoaderTask::new(
            config.clone(),
            database,
            self.inner.current_policy(),
            Arc::clone(&self.inner.deps.manifest_source),
            Arc::clone(&self.inner.deps.asset_fetcher),
            Arc::clone(&self.inner.deps.network),
        );
        let callback = Arc::new(ControllerCallback {
            inner: Arc::clone(&self.inner),
        });
        match task.start(callback) {
            Ok(handle) => {
                self.inner.track(handle);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to start loader task");
                self.inner.adopt_initial(
                    EmbeddedLauncher::emergency(
                        config.embedded_dir(),
                        EmergencyReason::LoaderTaskFailed,
                    )
                    .resolve(),
                );
                Err(err.context("failed to start loader task"))
            }
        }
    }

    /// Wait for the loader task and reaper threads started so far, including
    /// downloads that outlived the launch decision.
    ///
    /// Returns `false` if some are still running at `timeout`; they are left
    /// to finish on their own.
    pub fn wait_for_background(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let (finished, idle) = {
                let mut handles = self
                    .inner
                    .background
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let (finished, running): (Vec<_>, Vec<_>) =
                    handles.drain(..).partition(JoinHandle::is_finished);
                *handles = running;
                (finished, handles.is_empty())
            };
            for handle in finished {
                let name = handle.thread().name().unwrap_or("background").to_string();
                if handle.join().is_err() {
                    warn!(thread = %name, "background thread panicked");
                }
            }
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(?timeout, "background update work still running");
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// The content for this run, waiting for the loader task if needed.
    ///
    /// Waits at most the launch budget plus slack, then falls back to the
    /// embedded bundle.
    #[must_use]
    pub fn launched_content(&self) -> Arc<LaunchedContent> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            if let Err(err) = self.initialize() {
                warn!(error = %format!("{err:#}"), "implicit initialization failed");
            }
        }
        let budget = self.inner.config.launch_wait() + LOCAL_LAUNCH_SLACK + Duration::from_secs(1);
        if !self.inner.signal.wait(budget) {
            warn!(?budget, "timed out waiting for launch decision");
            self.inner.adopt_initial(
                EmbeddedLauncher::emergency(
                    self.inner.config.embedded_dir(),
                    EmergencyReason::LoaderTaskFailed,
                )
                .resolve(),
            );
        }
        self.inner
            .active()
            .unwrap_or_else(|| Arc::new(EmbeddedLauncher::new(self.inner.config.embedded_dir()).resolve()))
    }

    /// The active content without waiting or initializing.
    #[must_use]
    pub fn active_content(&self) -> Option<Arc<LaunchedContent>> {
        self.inner.active()
    }

    #[must_use]
    pub fn launch_asset_file(&self) -> Option<PathBuf> {
        self.launched_content().launch_asset_file.clone()
    }

    #[must_use]
    pub fn bundle_asset_name(&self) -> Option<String> {
        self.launched_content().bundle_asset_name.clone()
    }

    #[must_use]
    pub fn local_assets(&self) -> BTreeMap<String, PathBuf> {
        self.launched_content().local_assets.clone()
    }

    #[must_use]
    pub fn launched_update(&self) -> Option<Update> {
        self.launched_content().launched_update.clone()
    }

    #[must_use]
    pub fn is_emergency_launch(&self) -> bool {
        self.launched_content().is_emergency_launch()
    }

    /// Ask the update server whether something newer than the running update exists.
    pub fn check_for_update(&self) -> Result<CheckResult> {
        self.ensure_enabled()?;
        let Some(manifest) = self.fetch_manifest()? else {
            self.inner.emit(UpdatesEvent::NoUpdateAvailable);
            return Ok(CheckResult {
                is_available: false,
                manifest: None,
            });
        };
        let is_available = self.is_newer(&manifest);
        if is_available {
            self.inner.emit(UpdatesEvent::UpdateAvailable {
                manifest: serde_json::to_value(&manifest).unwrap_or_default(),
            });
        } else {
            self.inner.emit(UpdatesEvent::NoUpdateAvailable);
        }
        Ok(CheckResult {
            is_available,
            manifest: Some(manifest),
        })
    }

    /// Download the newest update into the store without launching it.
    pub fn fetch_update(&self) -> Result<FetchResult> {
        self.ensure_enabled()?;
        let db = self.require_database()?;
        let Some(manifest) = self.fetch_manifest()? else {
            return Ok(FetchResult {
                is_new: false,
                manifest: None,
            });
        };
        if !self.is_newer(&manifest) {
            return Ok(FetchResult {
                is_new: false,
                manifest: Some(manifest),
            });
        }
        let loaded = RemoteLoader::new(db, self.inner.deps.asset_fetcher.as_ref())
            .with_parallelism(self.inner.config.max_parallel_downloads())
            .load(&manifest, self.inner.config.scope_key());
        match loaded {
            Ok(update) => {
                info!(update = %update.id, "update fetched");
                self.inner.emit(UpdatesEvent::UpdateAvailable {
                    manifest: update.metadata.clone(),
                });
                Ok(FetchResult {
                    is_new: true,
                    manifest: Some(manifest),
                })
            }
            Err(err) => {
                self.inner.emit(UpdatesEvent::Error {
                    message: format!("{err:#}"),
                });
                Err(err)
            }
        }
    }

    /// Switch the running content to the best stored update.
    ///
    /// The candidate is fully launched and handed to the bundle swapper before
    /// it replaces the active content; on any failure the previous content
    /// stays active.
    pub fn reload(&self) -> Result<()> {
        if self
            .inner
            .reloading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(UpdatesError::ReloadInProgress.into());
        }
        let _guard = ReloadGuard(&self.inner.reloading);

        self.ensure_enabled()?;
        let db = self.require_database()?;
        let config = &self.inner.config;
        let candidates = db.launchable_updates(config.scope_key())?;
        let policy = self.inner.current_policy();
        let selected = policy
            .select_update_to_launch(&candidates, &config.filters())
            .ok_or_else(|| UpdatesError::LaunchFailed("no launchable update is stored".to_string()))?;
        let content = launcher_for(selected, config.embedded_dir())
            .launch(Some(db))
            .with_context(|| format!("failed to launch update {}", selected.id))?;
        self.inner
            .deps
            .bundle_swapper
            .swap(&content)
            .map_err(|err| UpdatesError::LaunchFailed(format!("{err:#}")))?;
        if let Err(err) = db.mark_update_launched(&selected.id) {
            warn!(update = %selected.id, error = %format!("{err:#}"), "failed to record launch");
        }

        info!(update = %selected.id, "reloaded");
        let content = Arc::new(content);
        self.inner.replace_active(Arc::clone(&content));
        self.inner.signal.notify();
        Inner::schedule_reaper(&self.inner, &content);
        Ok(())
    }

    pub fn set_selection_policy(&self, policy: SelectionPolicy) {
        *self
            .inner
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Reap around the active launch on the calling thread.
    pub fn run_reaper(&self) -> Result<ReapSummary> {
        let db = self.require_database()?;
        let Some(content) = self.inner.active() else {
            return Ok(ReapSummary::default());
        };
        let Some(launched) = content.reapable_update() else {
            return Ok(ReapSummary::default());
        };
        reap_unused_updates(
            db,
            &self.inner.current_policy(),
            launched,
            &self.inner.config.filters(),
        )
    }

    pub fn integrity_scan(&self, orphan_grace: Duration) -> Result<IntegritySummary> {
        self.require_database()?.integrity_scan(orphan_grace)
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.inner.config.enabled() {
            Ok(())
        } else {
            Err(UpdatesError::Disabled.into())
        }
    }

    fn require_database(&self) -> Result<&Database> {
        self.inner.database.as_ref().ok_or_else(|| {
            UpdatesError::Database("update database is unavailable".to_string()).into()
        })
    }

    fn fetch_manifest(&self) -> Result<Option<Manifest>> {
        self.inner
            .deps
            .manifest_source
            .fetch_manifest()
            .inspect_err(|err| {
                self.inner.emit(UpdatesEvent::Error {
                    message: format!("{err:#}"),
                });
            })
    }

    /// Whether `manifest` beats the running update, or failing that, the best
    /// stored one.
    fn is_newer(&self, manifest: &Manifest) -> bool {
        let config = &self.inner.config;
        let filters = config.filters();
        let policy = self.inner.current_policy();
        let candidate = manifest.to_update(config.scope_key(), UpdateStatus::Pending);
        let launched = self
            .inner
            .active()
            .and_then(|content| content.launched_update.clone());
        if let Some(launched) = launched {
            return policy.should_load_new_update(&candidate, Some(&launched), &filters);
        }
        let stored = self
            .inner
            .database
            .as_ref()
            .and_then(|db| db.launchable_updates(config.scope_key()).ok())
            .unwrap_or_default();
        let best = policy.select_update_to_launch(&stored, &filters);
        policy.should_load_new_update(&candidate, best, &filters)
    }
}

struct ReloadGuard<'a>(&'a AtomicBool);

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn current_policy(&self) -> SelectionPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn active(&self) -> Option<Arc<LaunchedContent>> {
        self.launched
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install the startup content unless something is already active.
    fn adopt_initial(&self, content: LaunchedContent) -> Option<Arc<LaunchedContent>> {
        let adopted = {
            let mut slot = self.launched.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                None
            } else {
                let content = Arc::new(content);
                *slot = Some(Arc::clone(&content));
                Some(content)
            }
        };
        self.signal.notify();
        adopted
    }

    fn replace_active(&self, content: Arc<LaunchedContent>) {
        *self.launched.write().unwrap_or_else(PoisonError::into_inner) = Some(content);
    }

    fn emit(&self, event: UpdatesEvent) {
        self.deps.events.emit(event);
    }

    /// Reap in the background once `content` is confirmed running.
    fn schedule_reaper(inner: &Arc<Self>, content: &LaunchedContent) {
        let (Some(db), Some(launched)) = (inner.database.clone(), content.reapable_update().cloned())
        else {
            return;
        };
        let policy = inner.current_policy();
        let filters = inner.config.filters();
        let spawned = thread::Builder::new()
            .name("ota-reaper".into())
            .spawn(move || {
                if let Err(err) = reap_unused_updates(&db, &policy, &launched, &filters) {
                    warn!(error = %format!("{err:#}"), "reaper failed");
                }
            });
        match spawned {
            Ok(handle) => inner.track(handle),
            Err(err) => warn!(%err, "failed to start reaper"),
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

struct ControllerCallback {
    inner: Arc<Inner>,
}

impl LoaderTaskCallback for ControllerCallback {
    fn on_failure(&self, error: &anyhow::Error) {
        warn!(error = %format!("{error:#}"), "loader task failed");
        self.inner.emit(UpdatesEvent::Error {
            message: format!("{error:#}"),
        });
    }

    fn on_remote_manifest_loaded(&self, manifest: &Manifest) {
        debug!(update = %manifest.id, "remote manifest loaded");
    }

    fn on_success(&self, launch: LaunchedContent, is_up_to_date: bool) {
        debug!(is_up_to_date, "loader task finished");
        if let Some(adopted) = self.inner.adopt_initial(launch) {
            Inner::schedule_reaper(&self.inner, &adopted);
        }
    }

    fn on_background_update_finished(
        &self,
        status: BackgroundUpdateStatus,
        update: Option<&Update>,
        error: Option<&anyhow::Error>,
    ) {
        match status {
            BackgroundUpdateStatus::UpdateAvailable => {
                if let Some(update) = update {
                    info!(update = %update.id, "update downloaded in background");
                    self.inner.emit(UpdatesEvent::UpdateAvailable {
                        manifest: update.metadata.clone(),
                    });
                }
            }
            BackgroundUpdateStatus::NoUpdateAvailable => {
                self.inner.emit(UpdatesEvent::NoUpdateAvailable);
            }
            BackgroundUpdateStatus::Error => {
                let message = error.map_or_else(
                    || "background update failed".to_string(),
                    |err| format!("{err:#}"),
                );
                self.inner.emit(UpdatesEvent::Error { message });
            }
        }
    }
}
