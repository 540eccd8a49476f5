//! Launchers resolve one selected update into the files the host runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ota_domain::{Update, UpdateStatus};
use serde::Serialize;
use strum::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::core::errors::UpdatesError;
use crate::core::loader::{EmbeddedBundle, DEFAULT_BUNDLE_NAME};
use crate::core::store::files::verify_file;
use crate::core::store::Database;

/// Why the embedded bundle was used as a last resort.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EmergencyReason {
    DatabaseUnavailable,
    UpdatesDirectoryUnavailable,
    LoaderTaskFailed,
    NoLaunchableUpdate,
}

/// What the host should execute for this run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedContent {
    pub launch_asset_file: Option<PathBuf>,
    /// Set when the host should load the bundle packaged with the install.
    pub bundle_asset_name: Option<String>,
    pub local_assets: BTreeMap<String, PathBuf>,
    pub launched_update: Option<Update>,
    pub emergency: Option<EmergencyReason>,
}

impl LaunchedContent {
    #[must_use]
    pub fn is_emergency_launch(&self) -> bool {
        self.emergency.is_some()
    }

    /// Whether this launch came from a stored update the reaper may reason about.
    #[must_use]
    pub(crate) fn reapable_update(&self) -> Option<&Update> {
        if self.emergency.is_some() {
            return None;
        }
        self.launched_update.as_ref()
    }
}

pub trait Launcher {
    fn launch(&self, database: Option<&Database>) -> Result<LaunchedContent>;
}

/// Launches a stored update after verifying every asset on disk.
#[derive(Clone, Debug)]
pub struct DatabaseLauncher {
    update: Update,
    record_launch: bool,
}

impl DatabaseLauncher {
    #[must_use]
    pub fn new(update: Update) -> Self {
        Self {
            update,
            record_launch: true,
        }
    }

    /// Leave `last_accessed` alone; the caller records the launch once it
    /// commits to this update.
    #[must_use]
    pub fn without_recording_launch(mut self) -> Self {
        self.record_launch = false;
        self
    }
}

impl Launcher for DatabaseLauncher {
    fn launch(&self, database: Option<&Database>) -> Result<LaunchedContent> {
        let db = database.ok_or_else(|| {
            UpdatesError::Database("update database is unavailable".to_string())
        })?;
        let update = &self.update;
        if !update.status.is_launchable() {
            return Err(UpdatesError::LaunchFailed(format!(
                "update {} is {} and cannot be launched",
                update.id, update.status
            ))
            .into());
        }
        if !db.updates_dir().is_dir() {
            return Err(UpdatesError::Database(format!(
                "updates directory {} is missing",
                db.updates_dir().display()
            ))
            .into());
        }

        let assets = db.assets_for_update(&update.id)?;
        let mut launch_asset_file = None;
        let mut local_assets = BTreeMap::new();
        for stored in &assets {
            let path = db.asset_path(&stored.asset);
            if let Err(err) = verify_file(&stored.asset.key, &path, &stored.asset.hash) {
                warn!(update = %update.id, asset = %stored.asset.key, %err, "asset failed verification");
                if let Err(demote) = db.set_update_status(&update.id, UpdateStatus::Pending) {
                    warn!(update = %update.id, error = %demote, "failed to demote update");
                }
                return Err(err.context(format!("update {} cannot be launched", update.id)));
            }
            if stored.is_launch_asset {
                launch_asset_file = Some(path.clone());
            }
            local_assets.insert(stored.asset.key.clone(), path);
        }
        let launch_asset_file = launch_asset_file
            .ok_or_else(|| UpdatesError::MissingLaunchAsset(update.id.to_string()))?;

        if self.record_launch {
            db.mark_update_launched(&update.id)
                .with_context(|| format!("failed to record launch of {}", update.id))?;
        }
        debug!(update = %update.id, assets = local_assets.len(), "launching stored update");
        Ok(LaunchedContent {
            launch_asset_file: Some(launch_asset_file),
            bundle_asset_name: None,
            local_assets,
            launched_update: Some(update.clone()),
            emergency: None,
        })
    }
}

/// Launches the content packaged with the install. Never fails.
#[derive(Clone, Debug)]
pub struct EmbeddedLauncher {
    dir: PathBuf,
    update: Option<Update>,
    emergency: Option<EmergencyReason>,
}

impl EmbeddedLauncher {
    #[must_use]
    pub fn new(embedded_dir: &Path) -> Self {
        Self {
            dir: embedded_dir.to_path_buf(),
            update: None,
            emergency: None,
        }
    }

    /// Fallback used when nothing else can run.
    #[must_use]
    pub fn emergency(embedded_dir: &Path, reason: EmergencyReason) -> Self {
        Self {
            emergency: Some(reason),
            ..Self::new(embedded_dir)
        }
    }

    /// Record the stored row of the embedded update as the launched update.
    #[must_use]
    pub fn for_update(mut self, update: Update) -> Self {
        self.update = Some(update);
        self
    }

    /// Same as [`Launcher::launch`] without the `Result`.
    #[must_use]
    pub fn resolve(&self) -> LaunchedContent {
        let (bundle_name, local_assets) = match EmbeddedBundle::load(&self.dir) {
            Ok(bundle) => {
                let assets = bundle
                    .manifest()
                    .unique_assets()
                    .into_values()
                    .map(|(asset, _)| (asset.key.clone(), bundle.source_path(asset)))
                    .collect();
                (bundle.bundle_name(), assets)
            }
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "embedded manifest unreadable");
                (DEFAULT_BUNDLE_NAME.to_string(), BTreeMap::new())
            }
        };
        if let Some(reason) = self.emergency {
            warn!(%reason, "emergency launch of embedded bundle");
        }
        LaunchedContent {
            launch_asset_file: Some(self.dir.join(&bundle_name)),
            bundle_asset_name: Some(bundle_name),
            local_assets,
            launched_update: self.update.clone(),
            emergency: self.emergency,
        }
    }
}

impl Launcher for EmbeddedLauncher {
    fn launch(&self, _database: Option<&Database>) -> Result<LaunchedContent> {
        Ok(self.resolve())
    }
}

/// The launcher appropriate for a selected candidate.
///
/// The launch is not recorded; call [`Database::mark_update_launched`] once
/// the content is adopted.
#[must_use]
pub fn launcher_for(update: &Update, embedded_dir: &Path) -> Box<dyn Launcher> {
    if update.status == UpdateStatus::Embedded {
        Box::new(EmbeddedLauncher::new(embedded_dir).for_update(update.clone()))
    } else {
        Box::new(DatabaseLauncher::new(update.clone()).without_recording_launch())
    }
}
