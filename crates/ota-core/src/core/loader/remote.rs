use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::{anyhow, Result};
use ota_domain::{Asset, Manifest, ManifestAsset, Update, UpdateStatus};
use tracing::{debug, info, warn};

use super::{AssetFetcher, DOWNLOAD_ATTEMPTS};
use crate::core::errors::{ErrorKind, UpdatesError};
use crate::core::store::files::{verify_file, write_verified};
use crate::core::store::{asset_file_name, Database};

/// Per-asset progress of one remote load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetLoadProgress {
    pub key: String,
    pub succeeded: usize,
    pub total: usize,
}

type ProgressFn<'a> = &'a (dyn Fn(&AssetLoadProgress) + Sync);

/// Downloads the assets of a manifest and records the update as `ready`.
pub struct RemoteLoader<'a> {
    db: &'a Database,
    fetcher: &'a dyn AssetFetcher,
    parallelism: usize,
    progress: Option<ProgressFn<'a>>,
}

struct PendingDownload<'m> {
    asset: &'m ManifestAsset,
    is_launch: bool,
    relative_path: String,
}

impl<'a> RemoteLoader<'a> {
    pub fn new(db: &'a Database, fetcher: &'a dyn AssetFetcher) -> Self {
        Self {
            db,
            fetcher,
            parallelism: 4,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Load every asset of `manifest`, reusing verified ones already stored.
    ///
    /// The update is recorded as `pending` first and each asset is associated
    /// with it as soon as it is on disk, so a failed load keeps its progress.
    /// The first download failure stops new downloads and is returned.
    pub fn load(&self, manifest: &Manifest, scope_key: &str) -> Result<Update> {
        let pending = manifest.to_update(scope_key, UpdateStatus::Pending);
        self.db.insert_pending_update(&pending)?;

        let unique = manifest.unique_assets();
        let total = unique.len();
        let mut resolved = Vec::with_capacity(total);
        let mut downloads = Vec::new();
        for (key, (asset, is_launch)) in unique {
            match self.db.asset_by_key(key)? {
                Some(existing) if existing.hash != asset.hash => {
                    return Err(UpdatesError::DigestMismatch {
                        key: key.to_string(),
                        expected: existing.hash,
                        actual: asset.hash.clone(),
                    }
                    .into());
                }
                Some(existing) => {
                    // Linked before checking so a concurrent reap keeps the file.
                    self.db.attach_asset(&pending.id, &existing, is_launch)?;
                    if verify_file(key, &self.db.asset_path(&existing), &existing.hash).is_ok() {
                        debug!(asset = %key, "reusing stored asset");
                        resolved.push((existing, is_launch));
                        self.report(key, resolved.len(), total);
                    } else {
                        downloads.push(PendingDownload {
                            asset,
                            is_launch,
                            relative_path: existing.relative_path,
                        });
                    }
                }
                None => downloads.push(PendingDownload {
                    asset,
                    is_launch,
                    relative_path: asset_file_name(key),
                }),
            }
        }

        let reused = resolved.len();
        if !downloads.is_empty() {
            let fetched = self.download_all(&pending, &downloads, reused, total)?;
            resolved.extend(fetched);
        }

        let ready = pending.with_status(UpdateStatus::Ready);
        self.db.insert_update(&ready, &resolved)?;
        info!(
            update = %ready.id,
            assets = total,
            reused,
            downloaded = total - reused,
            "update ready"
        );
        Ok(ready)
    }

    fn download_all(
        &self,
        update: &Update,
        downloads: &[PendingDownload<'_>],
        already: usize,
        total: usize,
    ) -> Result<Vec<(Asset, bool)>> {
        let next = AtomicUsize::new(0);
        let succeeded = AtomicUsize::new(already);
        let failed = AtomicBool::new(false);
        let results = Mutex::new(Vec::with_capacity(downloads.len()));
        let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let workers = self.parallelism.min(downloads.len()).max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if failed.load(Ordering::SeqCst) {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(download) = downloads.get(index) else {
                        break;
                    };
                    let outcome = self.download_one(download).and_then(|asset| {
                        self.db
                            .attach_asset(&update.id, &asset, download.is_launch)?;
                        Ok(asset)
                    });
                    match outcome {
                        Ok(asset) => {
                            let done = succeeded.fetch_add(1, Ordering::SeqCst) + 1;
                            debug!(asset = %asset.key, done, total, "asset downloaded");
                            self.report(&asset.key, done, total);
                            if let Ok(mut results) = results.lock() {
                                results.push((asset, download.is_launch));
                            }
                        }
                        Err(err) => {
                            let message = format!("{err:#}");
                            warn!(asset = %download.asset.key, error = %message, "asset download failed");
                            failed.store(true, Ordering::SeqCst);
                            if let Ok(mut slot) = first_error.lock() {
                                slot.get_or_insert(err);
                            }
                            break;
                        }
                    }
                });
            }
        });

        if failed.load(Ordering::SeqCst) {
            let err = first_error
                .into_inner()
                .ok()
                .flatten()
                .unwrap_or_else(|| anyhow!("asset download failed"));
            return Err(err.context(format!("failed to load update {}", update.id)));
        }
        results
            .into_inner()
            .map_err(|_| anyhow!("download results lock poisoned"))
    }

    fn report(&self, key: &str, succeeded: usize, total: usize) {
        if let Some(progress) = self.progress {
            progress(&AssetLoadProgress {
                key: key.to_string(),
                succeeded,
                total,
            });
        }
    }

    fn download_one(&self, download: &PendingDownload<'_>) -> Result<Asset> {
        let asset = download.asset;
        let url = asset
            .url
            .as_ref()
            .ok_or_else(|| UpdatesError::MissingAsset {
                key: asset.key.clone(),
            })?;
        let mut last_err = None;
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let written = write_verified(
                self.db.updates_dir(),
                &download.relative_path,
                &asset.key,
                &asset.hash,
                |dest| {
                    self.fetcher.fetch(url, dest)?;
                    Ok(())
                },
            );
            match written {
                Ok((_, size)) => {
                    let mut stored = asset.to_asset(download.relative_path.clone());
                    stored.size = Some(size);
                    return Ok(stored);
                }
                // A wrong digest will not fix itself.
                Err(err) if UpdatesError::classify(&err) == ErrorKind::Integrity => {
                    return Err(err);
                }
                Err(err) => {
                    debug!(asset = %asset.key, attempt, error = %err, "download attempt failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow!("failed to download {url}"))
            .context(format!("failed to download asset {}", asset.key)))
    }
}
