//! Fixtures shared by unit tests: an in-memory update server and embedded
//! bundle builders.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use ota_domain::Manifest;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use url::Url;

use crate::core::config::{Config, ConfigSource};
use crate::core::errors::UpdatesError;
use crate::core::loader::{AssetFetcher, ManifestSource, EMBEDDED_MANIFEST};

pub(crate) const EMBEDDED_CREATED_AT: &str = "2024-01-01T00:00:00Z";
pub(crate) const TEST_SCOPE: &str = "scope";

/// Enabled configuration rooted in `root`, with `overrides` applied last.
pub(crate) fn test_config(root: &Path, overrides: &[(&str, Value)]) -> Config {
    let mut values = BTreeMap::from([
        ("runtime_version".to_string(), json!("1.0")),
        (
            "update_url".to_string(),
            json!("https://updates.example.com/manifest"),
        ),
        ("scope_key".to_string(), json!(TEST_SCOPE)),
        (
            "updates_dir".to_string(),
            json!(root.join("updates").to_string_lossy()),
        ),
        (
            "embedded_dir".to_string(),
            json!(root.join("embedded").to_string_lossy()),
        ),
        ("launch_wait_ms".to_string(), json!(2_000)),
    ]);
    for (key, value) in overrides {
        values.insert((*key).to_string(), value.clone());
    }
    Config::resolve(&ConfigSource::builtin(), &values).expect("valid test config")
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn manifest_json(id: &str, created_at: &str, assets: &[Value]) -> Value {
    json!({
        "id": id,
        "createdAt": created_at,
        "runtimeVersion": "1.0",
        "launchAsset": assets[0].clone(),
        "assets": assets[1..].to_vec(),
    })
}

/// Write an embedded directory whose first asset is the launch asset.
pub(crate) fn write_embedded_bundle(
    dir: &Path,
    id: &str,
    files: &[(&str, &str)],
) -> Result<Manifest> {
    fs::create_dir_all(dir)?;
    let mut assets = Vec::new();
    for (key, contents) in files {
        fs::write(dir.join(key), contents)?;
        assets.push(json!({
            "key": key,
            "contentType": "application/octet-stream",
            "hash": sha256_hex(contents.as_bytes()),
        }));
    }
    let manifest = manifest_json(id, EMBEDDED_CREATED_AT, &assets);
    let bytes = serde_json::to_vec_pretty(&manifest)?;
    fs::write(dir.join(EMBEDDED_MANIFEST), &bytes)?;
    Manifest::parse(&bytes)
}

/// In-memory update server implementing both transport traits.
#[derive(Default)]
pub(crate) struct FakeServer {
    manifest: Mutex<Option<Manifest>>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    corrupt: Mutex<HashSet<String>>,
    fetches: Mutex<HashMap<String, usize>>,
    manifest_calls: AtomicUsize,
    unreachable: AtomicBool,
    manifest_delay: Mutex<Duration>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Serve a new manifest created `day` days into 2024.
    pub(crate) fn publish(&self, id: &str, day: u32, files: &[(&str, &str)]) -> Manifest {
        let mut assets = Vec::new();
        let mut bodies = lock(&self.bodies);
        for (key, contents) in files {
            let url = format!("https://cdn.example.com/{id}/{key}");
            bodies.insert(url.clone(), contents.as_bytes().to_vec());
            assets.push(json!({
                "key": key,
                "url": url,
                "contentType": "application/octet-stream",
                "hash": sha256_hex(contents.as_bytes()),
            }));
        }
        let created_at = format!("2024-02-{:02}T00:00:00Z", day.clamp(1, 28));
        let value = manifest_json(id, &created_at, &assets);
        let manifest = Manifest::parse(value.to_string().as_bytes()).expect("valid fake manifest");
        *lock(&self.manifest) = Some(manifest.clone());
        manifest
    }

    pub(crate) fn clear(&self) {
        *lock(&self.manifest) = None;
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub(crate) fn set_manifest_delay(&self, delay: Duration) {
        *lock(&self.manifest_delay) = delay;
    }

    pub(crate) fn fail_asset(&self, key: &str) {
        lock(&self.failing).insert(key.to_string());
    }

    pub(crate) fn heal_asset(&self, key: &str) {
        lock(&self.failing).remove(key);
    }

    pub(crate) fn corrupt_asset(&self, key: &str) {
        lock(&self.corrupt).insert(key.to_string());
    }

    pub(crate) fn manifest_calls(&self) -> usize {
        self.manifest_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fetch_count(&self, key: &str) -> usize {
        lock(&self.fetches).get(key).copied().unwrap_or(0)
    }

    pub(crate) fn total_fetches(&self) -> usize {
        lock(&self.fetches).values().sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn unreachable(url: &str) -> anyhow::Error {
    UpdatesError::Unreachable {
        url: url.to_string(),
        reason: "connection refused".to_string(),
    }
    .into()
}

impl ManifestSource for FakeServer {
    fn fetch_manifest(&self) -> Result<Option<Manifest>> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.manifest_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(unreachable("https://updates.example.com/manifest"));
        }
        Ok(lock(&self.manifest).clone())
    }
}

impl AssetFetcher for FakeServer {
    fn fetch(&self, url: &Url, dest: &mut dyn Write) -> Result<u64> {
        let key = url
            .path_segments()
            .and_then(Iterator::last)
            .unwrap_or_default()
            .to_string();
        *lock(&self.fetches).entry(key.clone()).or_default() += 1;
        if self.unreachable.load(Ordering::SeqCst) || lock(&self.failing).contains(&key) {
            return Err(unreachable(url.as_str()));
        }
        let mut body = lock(&self.bodies)
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| unreachable(url.as_str()))?;
        if lock(&self.corrupt).contains(&key) {
            body.extend_from_slice(b"-tampered");
        }
        dest.write_all(&body)?;
        Ok(body.len() as u64)
    }
}
