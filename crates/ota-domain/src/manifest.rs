use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use url::Url;

use crate::entities::{Asset, Update, UpdateId, UpdateStatus};

/// Server- or build-provided description of one update, prior to download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: UpdateId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub runtime_version: String,
    pub launch_asset: ManifestAsset,
    #[serde(default)]
    pub assets: Vec<ManifestAsset>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    pub content_type: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_file: Option<String>,
}

impl ManifestAsset {
    #[must_use]
    pub fn to_asset(&self, relative_path: String) -> Asset {
        Asset {
            key: self.key.clone(),
            url: self.url.clone(),
            relative_path,
            content_type: self.content_type.clone(),
            hash: self.hash.clone(),
            size: None,
            embedded_file: self.embedded_file.clone(),
        }
    }
}

impl Manifest {
    /// Parse and validate a manifest document.
    ///
    /// Hashes are normalized to lowercase hex; every asset must carry a
    /// non-empty key and a 64 character SHA-256 digest.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut manifest: Manifest =
            serde_json::from_slice(bytes).context("failed to decode update manifest")?;
        if manifest.id.as_str().trim().is_empty() {
            bail!("manifest is missing an update id");
        }
        if manifest.runtime_version.trim().is_empty() {
            bail!("manifest {} is missing a runtime version", manifest.id);
        }
        normalize_asset(&mut manifest.launch_asset)?;
        for asset in &mut manifest.assets {
            normalize_asset(asset)?;
        }
        Ok(manifest)
    }

    /// Assets keyed by content key in manifest order, launch asset first.
    ///
    /// The flag marks the launch asset. A key listed twice keeps its first entry.
    #[must_use]
    pub fn unique_assets(&self) -> IndexMap<&str, (&ManifestAsset, bool)> {
        let mut assets = IndexMap::with_capacity(self.assets.len() + 1);
        assets.insert(self.launch_asset.key.as_str(), (&self.launch_asset, true));
        for asset in &self.assets {
            assets
                .entry(asset.key.as_str())
                .or_insert((asset, false));
        }
        assets
    }

    /// Build the update row this manifest describes.
    #[must_use]
    pub fn to_update(&self, scope_key: &str, status: UpdateStatus) -> Update {
        Update {
            id: self.id.clone(),
            commit_time: self.created_at,
            scope_key: scope_key.to_string(),
            runtime_version: self.runtime_version.clone(),
            metadata: serde_json::to_value(self).unwrap_or(Value::Null),
            status,
            launch_asset_key: Some(self.launch_asset.key.clone()),
            last_accessed: None,
        }
    }

    /// Recover the manifest an update row was created from.
    pub fn from_update(update: &Update) -> Result<Self> {
        serde_json::from_value(update.metadata.clone())
            .with_context(|| format!("update {} carries no readable manifest", update.id))
    }
}

fn normalize_asset(asset: &mut ManifestAsset) -> Result<()> {
    if asset.key.trim().is_empty() {
        bail!("manifest asset is missing a content key");
    }
    let hash = asset.hash.trim().to_ascii_lowercase();
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!(
            "asset {} has an invalid sha256 hash '{}'",
            asset.key,
            asset.hash
        );
    }
    asset.hash = hash;
    Ok(())
}
