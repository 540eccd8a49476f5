//! Loaders: bring updates into the store from the embedded bundle or a remote
//! update server.

use std::io::Write;

use anyhow::Result;
use ota_domain::Manifest;
use url::Url;

mod embedded;
mod http;
mod remote;

pub use embedded::{load_embedded_update, EmbeddedBundle, DEFAULT_BUNDLE_NAME, EMBEDDED_MANIFEST};
pub use http::{build_http_client, HttpAssetFetcher, HttpManifestSource};
pub use remote::{AssetLoadProgress, RemoteLoader};

pub(crate) const DOWNLOAD_ATTEMPTS: usize = 3;

/// Where manifests come from.
pub trait ManifestSource: Send + Sync {
    /// `Ok(None)` means the server has nothing to offer.
    fn fetch_manifest(&self) -> Result<Option<Manifest>>;
}

/// Byte transport for asset downloads.
pub trait AssetFetcher: Send + Sync {
    /// Stream the body behind `url` into `dest`, returning the byte count.
    fn fetch(&self, url: &Url, dest: &mut dyn Write) -> Result<u64>;
}
