#![deny(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Plain data and pure decision logic shared by the update store, loaders and
//! launchers. Nothing in this crate touches the disk or the network.

pub mod entities;
pub mod manifest;
pub mod policy;

pub use entities::{Asset, Update, UpdateId, UpdateStatus};
pub use manifest::{Manifest, ManifestAsset};
pub use policy::{
    LauncherSelectionPolicy, LoaderSelectionPolicy, NewestUpdatePolicy,
    PinnedLauncherSelectionPolicy, ReaperSelectionPolicy, SelectionFilters, SelectionPolicy,
};
