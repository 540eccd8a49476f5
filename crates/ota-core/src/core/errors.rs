use serde::Serialize;
use strum::{AsRefStr, Display};

/// Broad error categories that decide how the controller recovers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// Fatal; aborts initialization.
    Configuration,
    /// Recoverable; fall back to cached or embedded content.
    Network,
    /// The offending asset or update is demoted or purged.
    Integrity,
    /// Logged; the controller falls back to the emergency launcher.
    Storage,
    /// Reload aborted; the previous launch stays authoritative.
    Launch,
}

/// Errors surfaced by the update subsystem.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UpdatesError {
    #[error("[OTA100] configuration is missing required key '{0}'")]
    MissingConfig(String),
    #[error("[OTA100] unknown configuration key '{0}'")]
    UnknownConfigKey(String),
    #[error("[OTA100] configuration key '{key}' expects {expected}, found {found}")]
    ConfigType {
        key: String,
        expected: &'static str,
        found: String,
    },
    #[error("[OTA100] invalid value for configuration key '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },
    #[error("[OTA101] updates are disabled")]
    Disabled,
    #[error("[OTA200] update source {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("[OTA201] update source returned an invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("[OTA300] asset {key} digest mismatch (expected {expected}, found {actual})")]
    DigestMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("[OTA300] asset {key} is missing from the updates directory")]
    MissingAsset { key: String },
    #[error("[OTA301] update {0} has no launch asset")]
    MissingLaunchAsset(String),
    #[error("[OTA400] update database failure: {0}")]
    Database(String),
    #[error("[OTA401] embedded content is unavailable: {0}")]
    EmbeddedUnavailable(String),
    #[error("[OTA500] launch failed: {0}")]
    LaunchFailed(String),
    #[error("[OTA501] a reload is already in progress")]
    ReloadInProgress,
}

impl UpdatesError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingConfig(_)
            | Self::UnknownConfigKey(_)
            | Self::ConfigType { .. }
            | Self::InvalidConfig { .. }
            | Self::Disabled => ErrorKind::Configuration,
            Self::Unreachable { .. } | Self::InvalidManifest(_) => ErrorKind::Network,
            Self::DigestMismatch { .. } | Self::MissingAsset { .. } | Self::MissingLaunchAsset(_) => {
                ErrorKind::Integrity
            }
            Self::Database(_) | Self::EmbeddedUnavailable(_) => ErrorKind::Storage,
            Self::LaunchFailed(_) | Self::ReloadInProgress => ErrorKind::Launch,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingConfig(_)
            | Self::UnknownConfigKey(_)
            | Self::ConfigType { .. }
            | Self::InvalidConfig { .. } => "OTA100",
            Self::Disabled => "OTA101",
            Self::Unreachable { .. } => "OTA200",
            Self::InvalidManifest(_) => "OTA201",
            Self::DigestMismatch { .. } | Self::MissingAsset { .. } => "OTA300",
            Self::MissingLaunchAsset(_) => "OTA301",
            Self::Database(_) => "OTA400",
            Self::EmbeddedUnavailable(_) => "OTA401",
            Self::LaunchFailed(_) => "OTA500",
            Self::ReloadInProgress => "OTA501",
        }
    }

    /// Classify an arbitrary error chain. Typed errors win, then transport and
    /// storage errors by origin; anything else is treated as storage.
    #[must_use]
    pub fn classify(err: &anyhow::Error) -> ErrorKind {
        if let Some(updates) = err.downcast_ref::<UpdatesError>() {
            return updates.kind();
        }
        for cause in err.chain() {
            if let Some(updates) = cause.downcast_ref::<UpdatesError>() {
                return updates.kind();
            }
            if cause.downcast_ref::<reqwest::Error>().is_some() {
                return ErrorKind::Network;
            }
            if cause.downcast_ref::<rusqlite::Error>().is_some() {
                return ErrorKind::Storage;
            }
        }
        ErrorKind::Storage
    }
}

pub(crate) fn database_error(err: anyhow::Error) -> anyhow::Error {
    if err.is::<UpdatesError>() {
        err
    } else {
        UpdatesError::Database(format!("{err:#}")).into()
    }
}
