use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use time::OffsetDateTime;
use url::Url;

/// Opaque, server-assigned identity of an update.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateId(String);

impl UpdateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UpdateId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Persisted lifecycle state of an update row.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum UpdateStatus {
    /// Manifest seen, assets incomplete or failed verification.
    Pending,
    /// Every asset downloaded and verified.
    Ready,
    /// Copied from the content packaged with the install.
    Embedded,
    /// Loaded from a development server; never reaped by age.
    Development,
}

impl UpdateStatus {
    #[must_use]
    pub fn is_launchable(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One snapshot of executable content as recorded in the update store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub id: UpdateId,
    #[serde(with = "time::serde::rfc3339")]
    pub commit_time: OffsetDateTime,
    pub scope_key: String,
    pub runtime_version: String,
    /// Raw manifest payload the update was created from.
    pub metadata: Value,
    pub status: UpdateStatus,
    /// Content key of the asset the host executes first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_asset_key: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_accessed: Option<OffsetDateTime>,
}

impl Update {
    #[must_use]
    pub fn with_status(mut self, status: UpdateStatus) -> Self {
        self.status = status;
        self
    }
}

/// A single content-addressed file referenced by one or more updates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    /// Dedup identity; two manifests naming the same key share one file.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// Path of the file relative to the updates directory.
    pub relative_path: String,
    pub content_type: String,
    /// Lowercase hex SHA-256 of the file contents.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// File name inside the embedded directory when the asset shipped with the install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_file: Option<String>,
}
