use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ota_domain::{Asset, Manifest, ManifestAsset, Update, UpdateStatus};
use tracing::{debug, info};

use crate::core::errors::UpdatesError;
use crate::core::store::files::{verify_file, write_verified};
use crate::core::store::{asset_file_name, Database};

/// Manifest file shipped next to the embedded assets.
pub const EMBEDDED_MANIFEST: &str = "app.manifest";
/// Bundle the host falls back to when even the embedded manifest is unreadable.
pub const DEFAULT_BUNDLE_NAME: &str = "app.bundle";

/// Content packaged with the install.
#[derive(Debug, Clone)]
pub struct EmbeddedBundle {
    dir: PathBuf,
    manifest: Manifest,
}

impl EmbeddedBundle {
    /// Read `<dir>/app.manifest`.
    ///
    /// # Errors
    ///
    /// A missing or malformed manifest means the install is broken and is
    /// reported as [`UpdatesError::EmbeddedUnavailable`].
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(EMBEDDED_MANIFEST);
        let bytes = fs::read(&path).map_err(|err| {
            UpdatesError::EmbeddedUnavailable(format!("{}: {err}", path.display()))
        })?;
        let manifest = Manifest::parse(&bytes).map_err(|err| {
            UpdatesError::EmbeddedUnavailable(format!("{}: {err:#}", path.display()))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Location of an asset inside the embedded directory.
    #[must_use]
    pub fn source_path(&self, asset: &ManifestAsset) -> PathBuf {
        self.dir
            .join(asset.embedded_file.as_deref().unwrap_or(&asset.key))
    }

    /// File name of the embedded launch asset.
    #[must_use]
    pub fn bundle_name(&self) -> String {
        let launch = &self.manifest.launch_asset;
        launch
            .embedded_file
            .clone()
            .unwrap_or_else(|| launch.key.clone())
    }

    /// The update row this bundle corresponds to.
    #[must_use]
    pub fn update(&self, scope_key: &str) -> Update {
        self.manifest.to_update(scope_key, UpdateStatus::Embedded)
    }
}

/// Copy the embedded bundle into the store and record it as `embedded`.
///
/// Assets already stored under the same key and passing verification are
/// reused. An update with the same id that was downloaded normally keeps its
/// status. Never touches the network.
pub fn load_embedded_update(
    db: &Database,
    bundle: &EmbeddedBundle,
    scope_key: &str,
) -> Result<Update> {
    let update = bundle.update(scope_key);
    if let Some(existing) = db.update_by_id(&update.id)? {
        if existing.status.is_launchable() && existing.status != UpdateStatus::Embedded {
            debug!(update = %existing.id, status = %existing.status, "embedded update already stored");
            return Ok(existing);
        }
    }

    let mut assets = Vec::new();
    for (key, (manifest_asset, is_launch)) in bundle.manifest().unique_assets() {
        let asset = copy_embedded_asset(db, bundle, manifest_asset)
            .with_context(|| format!("failed to copy embedded asset {key}"))?;
        assets.push((asset, is_launch));
    }
    db.insert_update(&update, &assets)?;
    info!(update = %update.id, assets = assets.len(), "embedded update loaded");
    Ok(update)
}

fn copy_embedded_asset(
    db: &Database,
    bundle: &EmbeddedBundle,
    manifest_asset: &ManifestAsset,
) -> Result<Asset> {
    let key = manifest_asset.key.as_str();
    if let Some(existing) = db.asset_by_key(key)? {
        if existing.hash == manifest_asset.hash
            && verify_file(key, &db.asset_path(&existing), &existing.hash).is_ok()
        {
            return Ok(existing);
        }
    }

    let source = bundle.source_path(manifest_asset);
    let mut file = File::open(&source).map_err(|err| {
        UpdatesError::EmbeddedUnavailable(format!("{}: {err}", source.display()))
    })?;
    let file_name = asset_file_name(key);
    let (_, size) = write_verified(
        db.updates_dir(),
        &file_name,
        key,
        &manifest_asset.hash,
        |dest| {
            io::copy(&mut file, dest)?;
            Ok(())
        },
    )?;
    let mut asset = manifest_asset.to_asset(file_name);
    asset.size = Some(size);
    if asset.embedded_file.is_none() {
        asset.embedded_file = Some(key.to_string());
    }
    Ok(asset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::write_embedded_bundle;
    use tempfile::tempdir;

    #[test]
    fn load_reads_manifest_and_launch_asset_name() -> Result<()> {
        let temp = tempdir()?;
        let embedded = temp.path().join("embedded");
        write_embedded_bundle(&embedded, "embedded-1", &[("bundle", "main()"), ("icon", "png")])?;
        let bundle = EmbeddedBundle::load(&embedded)?;
        assert_eq!(bundle.manifest().id.as_str(), "embedded-1");
        assert_eq!(bundle.bundle_name(), "bundle");
        Ok(())
    }

    #[test]
    fn missing_manifest_is_a_storage_error() -> Result<()> {
        let temp = tempdir()?;
        let err = EmbeddedBundle::load(temp.path()).expect_err("no manifest");
        assert_eq!(
            UpdatesError::classify(&err),
            crate::core::errors::ErrorKind::Storage
        );
        Ok(())
    }

    #[test]
    fn embedded_update_is_copied_and_idempotent() -> Result<()> {
        let temp = tempdir()?;
        let embedded = temp.path().join("embedded");
        write_embedded_bundle(&embedded, "embedded-1", &[("bundle", "main()"), ("icon", "png")])?;
        let db = Database::open(&temp.path().join("updates"))?;
        let bundle = EmbeddedBundle::load(&embedded)?;

        let update = load_embedded_update(&db, &bundle, "scope")?;
        assert_eq!(update.status, UpdateStatus::Embedded);
        let assets = db.assets_for_update(&update.id)?;
        assert_eq!(assets.len(), 2);
        for stored in &assets {
            assert!(db.asset_path(&stored.asset).exists());
        }

        load_embedded_update(&db, &bundle, "scope")?;
        assert_eq!(db.all_assets()?.len(), 2, "second load reuses rows");
        Ok(())
    }

    #[test]
    fn tampered_embedded_file_is_rejected() -> Result<()> {
        let temp = tempdir()?;
        let embedded = temp.path().join("embedded");
        write_embedded_bundle(&embedded, "embedded-1", &[("bundle", "main()")])?;
        fs::write(embedded.join("bundle"), b"evil()")?;
        let db = Database::open(&temp.path().join("updates"))?;
        let bundle = EmbeddedBundle::load(&embedded)?;
        let err = load_embedded_update(&db, &bundle, "scope").expect_err("hash mismatch");
        assert_eq!(
            UpdatesError::classify(&err),
            crate::core::errors::ErrorKind::Integrity
        );
        assert!(db.all_updates()?.is_empty());
        Ok(())
    }
}
