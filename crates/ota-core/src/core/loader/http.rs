use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use ota_domain::Manifest;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use super::{AssetFetcher, ManifestSource};
use crate::core::config::Config;
use crate::core::errors::UpdatesError;

const USER_AGENT: &str = concat!("ota/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const HEADER_RUNTIME_VERSION: &str = "ota-runtime-version";
pub(crate) const HEADER_CHANNEL: &str = "ota-channel-name";
pub(crate) const HEADER_PLATFORM: &str = "ota-platform";

pub fn build_http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build http client")
}

/// Fetches the manifest for this install from the configured update URL.
#[derive(Debug, Clone)]
pub struct HttpManifestSource {
    client: Client,
    url: Url,
    headers: HeaderMap,
}

impl HttpManifestSource {
    pub fn new(client: Client, url: Url, headers: HeaderMap) -> Self {
        Self {
            client,
            url,
            headers,
        }
    }

    /// Build a source from resolved configuration.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error when no update URL is configured or a
    /// request header cannot be encoded.
    pub fn from_config(config: &Config, client: Client) -> Result<Self> {
        let url = config
            .update_url()
            .cloned()
            .ok_or_else(|| UpdatesError::MissingConfig("update_url".to_string()))?;
        let headers = manifest_headers(
            config.runtime_version(),
            config.channel(),
            config.request_headers(),
        )?;
        Ok(Self::new(client, url, headers))
    }
}

pub(crate) fn manifest_headers(
    runtime_version: &str,
    channel: Option<&str>,
    extra: &BTreeMap<String, String>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    insert_header(&mut headers, HEADER_RUNTIME_VERSION, runtime_version)?;
    insert_header(&mut headers, HEADER_PLATFORM, std::env::consts::OS)?;
    if let Some(channel) = channel {
        insert_header(&mut headers, HEADER_CHANNEL, channel)?;
    }
    for (name, value) in extra {
        insert_header(&mut headers, name, value)?;
    }
    Ok(headers)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let invalid = |reason: String| UpdatesError::InvalidConfig {
        key: format!("request_headers.{name}"),
        reason,
    };
    let header = HeaderName::from_bytes(name.as_bytes()).map_err(|err| invalid(err.to_string()))?;
    let value = HeaderValue::from_str(value).map_err(|err| invalid(err.to_string()))?;
    headers.insert(header, value);
    Ok(())
}

impl ManifestSource for HttpManifestSource {
    fn fetch_manifest(&self) -> Result<Option<Manifest>> {
        let unreachable = |reason: String| UpdatesError::Unreachable {
            url: self.url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .send()
            .map_err(|err| unreachable(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            debug!(url = %self.url, "update server has no update");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(unreachable(format!("unexpected status {status}")).into());
        }
        let body = response
            .bytes()
            .map_err(|err| unreachable(err.to_string()))?;
        let manifest = Manifest::parse(&body)
            .map_err(|err| UpdatesError::InvalidManifest(format!("{err:#}")))?;
        debug!(url = %self.url, update = %manifest.id, "fetched manifest");
        Ok(Some(manifest))
    }
}

/// Downloads asset bodies over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    client: Client,
    headers: HeaderMap,
}

impl HttpAssetFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            headers: HeaderMap::new(),
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

impl AssetFetcher for HttpAssetFetcher {
    fn fetch(&self, url: &Url, dest: &mut dyn Write) -> Result<u64> {
        let mut response = self
            .client
            .get(url.clone())
            .headers(self.headers.clone())
            .send()
            .with_context(|| format!("failed to fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("unexpected response for {url}"))?;
        io::copy(&mut response, dest).with_context(|| format!("stream error for {url}"))
    }
}
