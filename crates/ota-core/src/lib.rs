#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

//! Over-the-air update engine: a content-addressed update store, embedded and
//! remote loaders, the startup loader task, launchers and the reaper.

mod core;

pub mod store {
    pub use crate::core::store::*;
}

pub use crate::core::config::{CheckOnLaunch, Config, ConfigSource};
pub use crate::core::controller::{CheckResult, ControllerDeps, FetchResult, UpdatesController};
pub use crate::core::errors::{ErrorKind, UpdatesError};
pub use crate::core::events::{
    BundleSwapper, EventSink, LoggingBundleSwapper, LoggingEventSink, NetworkMonitor,
    UnmeteredNetwork, UpdatesEvent,
};
pub use crate::core::launcher::{
    launcher_for, DatabaseLauncher, EmbeddedLauncher, EmergencyReason, LaunchedContent, Launcher,
};
pub use crate::core::loader::{
    build_http_client, load_embedded_update, AssetFetcher, AssetLoadProgress, EmbeddedBundle,
    HttpAssetFetcher, HttpManifestSource, ManifestSource, RemoteLoader, DEFAULT_BUNDLE_NAME,
    EMBEDDED_MANIFEST,
};
pub use crate::core::loader_task::{
    BackgroundUpdateStatus, LoaderTask, LoaderTaskCallback, LOCAL_LAUNCH_SLACK,
};
pub use crate::core::reaper::reap_unused_updates;
pub use crate::core::store::{Database, IntegritySummary, ReapSummary, UpdateAsset};

pub use ota_domain::{
    Asset, Manifest, ManifestAsset, SelectionFilters, SelectionPolicy, Update, UpdateId,
    UpdateStatus,
};

/// Version string reported in request headers and the CLI.
pub const OTA_VERSION: &str = env!("CARGO_PKG_VERSION");
