//! Update/asset database.
//!
//! A SQLite index (`ota.sqlite`) tracks updates, assets and the join relation
//! between them; asset files live next to it in the updates directory, named by
//! content key. All mutations go through one writer lock plus `IMMEDIATE`
//! transactions; reads open their own connection and may run concurrently.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ota_domain::{Asset, Update, UpdateId, UpdateStatus};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::core::errors::{database_error, UpdatesError};

mod assets;
mod connection;
pub(crate) mod files;
mod gc;
mod integrity;
mod schema;
mod updates;

pub use files::{asset_file_name, compute_sha256};

pub(crate) const INDEX_FILENAME: &str = "ota.sqlite";
pub(crate) const PARTIAL_PREFIX: &str = ".ota-partial-";
const SCHEMA_VERSION: u32 = 1;
const META_KEY_SCHEMA_VERSION: &str = "schema_version";
const OTA_VERSION: &str = env!("CARGO_PKG_VERSION");
const META_KEY_CREATED_BY: &str = "created_by_ota_version";

/// An asset row together with its role in one update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAsset {
    #[serde(flatten)]
    pub asset: Asset,
    pub is_launch_asset: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegritySummary {
    pub assets_checked: usize,
    pub missing_assets: usize,
    pub corrupt_assets: usize,
    pub updates_demoted: usize,
    pub orphans_removed: usize,
    pub partials_removed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapSummary {
    pub updates_removed: Vec<UpdateId>,
    pub assets_removed: usize,
    pub bytes_reclaimed: u64,
}

/// Handle to the update store rooted at one updates directory.
#[derive(Clone)]
pub struct Database {
    root: PathBuf,
    writer: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("root", &self.root).finish()
    }
}

impl Database {
    /// Open (creating if needed) the store under `updates_dir`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the directory cannot be created or the index
    /// schema cannot be initialized.
    pub fn open(updates_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(updates_dir)
            .with_context(|| {
                format!(
                    "failed to create updates directory {}",
                    updates_dir.display()
                )
            })
            .map_err(database_error)?;
        let db = Self {
            root: updates_dir.to_path_buf(),
            writer: Arc::default(),
        };
        db.ensure_schema().map_err(database_error)?;
        debug!(root = %db.root.display(), "update database ready");
        Ok(db)
    }

    #[must_use]
    pub fn updates_dir(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn asset_path(&self, asset: &Asset) -> PathBuf {
        self.root.join(&asset.relative_path)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }

    fn write_lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|_| anyhow!("update database writer lock poisoned"))
    }
}

fn to_millis(time: OffsetDateTime) -> i64 {
    i64::try_from(time.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

fn from_millis(millis: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .with_context(|| format!("invalid timestamp {millis} in update database"))
}

fn now_millis() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

#[cfg(test)]
mod tests;
