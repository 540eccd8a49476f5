use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ota_domain::SelectionFilters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use url::Url;

use super::{ConfigSource, EnvSnapshot};
use crate::core::errors::UpdatesError;

pub(crate) const KEY_ENABLED: &str = "enabled";
pub(crate) const KEY_UPDATE_URL: &str = "update_url";
pub(crate) const KEY_RUNTIME_VERSION: &str = "runtime_version";
pub(crate) const KEY_CHANNEL: &str = "channel";
pub(crate) const KEY_CHECK_ON_LAUNCH: &str = "check_on_launch";
pub(crate) const KEY_LAUNCH_WAIT_MS: &str = "launch_wait_ms";
pub(crate) const KEY_SCOPE_KEY: &str = "scope_key";
pub(crate) const KEY_UPDATES_DIR: &str = "updates_dir";
pub(crate) const KEY_EMBEDDED_DIR: &str = "embedded_dir";
pub(crate) const KEY_MAX_PARALLEL_DOWNLOADS: &str = "max_parallel_downloads";
pub(crate) const KEY_REQUEST_HEADERS: &str = "request_headers";

const KNOWN_KEYS: &[&str] = &[
    KEY_ENABLED,
    KEY_UPDATE_URL,
    KEY_RUNTIME_VERSION,
    KEY_CHANNEL,
    KEY_CHECK_ON_LAUNCH,
    KEY_LAUNCH_WAIT_MS,
    KEY_SCOPE_KEY,
    KEY_UPDATES_DIR,
    KEY_EMBEDDED_DIR,
    KEY_MAX_PARALLEL_DOWNLOADS,
    KEY_REQUEST_HEADERS,
];

/// Environment variables mapped onto configuration keys.
const ENV_KEYS: &[(&str, &str)] = &[
    ("OTA_ENABLED", KEY_ENABLED),
    ("OTA_UPDATE_URL", KEY_UPDATE_URL),
    ("OTA_RUNTIME_VERSION", KEY_RUNTIME_VERSION),
    ("OTA_CHANNEL", KEY_CHANNEL),
    ("OTA_CHECK_ON_LAUNCH", KEY_CHECK_ON_LAUNCH),
    ("OTA_LAUNCH_WAIT_MS", KEY_LAUNCH_WAIT_MS),
    ("OTA_SCOPE_KEY", KEY_SCOPE_KEY),
    ("OTA_UPDATES_DIR", KEY_UPDATES_DIR),
    ("OTA_EMBEDDED_DIR", KEY_EMBEDDED_DIR),
    ("OTA_MAX_PARALLEL_DOWNLOADS", KEY_MAX_PARALLEL_DOWNLOADS),
];

const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 4;
const DEFAULT_EMBEDDED_DIR: &str = "embedded";

/// When to contact the update source during startup.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CheckOnLaunch {
    Never,
    /// Skip the check on metered connections.
    WifiOnly,
    #[default]
    Always,
}

/// Resolved, immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) enabled: bool,
    pub(crate) update_url: Option<Url>,
    pub(crate) runtime_version: String,
    pub(crate) channel: Option<String>,
    pub(crate) check_on_launch: CheckOnLaunch,
    pub(crate) launch_wait: Duration,
    pub(crate) scope_key: String,
    pub(crate) updates_dir: PathBuf,
    pub(crate) embedded_dir: PathBuf,
    pub(crate) max_parallel_downloads: usize,
    pub(crate) request_headers: BTreeMap<String, String>,
}

impl Config {
    /// Merge `overrides` on top of `defaults`.
    ///
    /// # Errors
    ///
    /// Unknown keys, values of the wrong type, and a missing runtime version
    /// are configuration errors. A missing update URL is an error only while
    /// updates are enabled.
    pub fn resolve(defaults: &ConfigSource, overrides: &BTreeMap<String, Value>) -> Result<Self> {
        for key in overrides.keys() {
            ensure_known_key(key)?;
        }
        let mut merged = defaults.values.clone();
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let enabled = read_bool(&merged, KEY_ENABLED)?.unwrap_or(true);
        let runtime_version = read_string(&merged, KEY_RUNTIME_VERSION)?
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| UpdatesError::MissingConfig(KEY_RUNTIME_VERSION.to_string()))?;
        let update_url = read_string(&merged, KEY_UPDATE_URL)?
            .map(|raw| {
                Url::parse(&raw).map_err(|err| UpdatesError::InvalidConfig {
                    key: KEY_UPDATE_URL.to_string(),
                    reason: err.to_string(),
                })
            })
            .transpose()?;
        if enabled && update_url.is_none() {
            return Err(UpdatesError::MissingConfig(KEY_UPDATE_URL.to_string()).into());
        }
        let check_on_launch = match read_string(&merged, KEY_CHECK_ON_LAUNCH)? {
            Some(raw) => raw
                .parse::<CheckOnLaunch>()
                .map_err(|_| UpdatesError::InvalidConfig {
                    key: KEY_CHECK_ON_LAUNCH.to_string(),
                    reason: format!("expected never, wifi-only or always, found '{raw}'"),
                })?,
            None => CheckOnLaunch::default(),
        };
        let launch_wait = Duration::from_millis(read_u64(&merged, KEY_LAUNCH_WAIT_MS)?.unwrap_or(0));
        let scope_key = match read_string(&merged, KEY_SCOPE_KEY)? {
            Some(scope) => scope,
            None => update_url
                .as_ref()
                .map(|url| url.origin().ascii_serialization())
                .unwrap_or_else(|| "default".to_string()),
        };
        let updates_dir = match read_string(&merged, KEY_UPDATES_DIR)? {
            Some(dir) => PathBuf::from(dir),
            None => default_updates_dir()?,
        };
        let embedded_dir = read_string(&merged, KEY_EMBEDDED_DIR)?
            .map_or_else(|| PathBuf::from(DEFAULT_EMBEDDED_DIR), PathBuf::from);
        let max_parallel_downloads = match read_u64(&merged, KEY_MAX_PARALLEL_DOWNLOADS)? {
            Some(0) => {
                return Err(UpdatesError::InvalidConfig {
                    key: KEY_MAX_PARALLEL_DOWNLOADS.to_string(),
                    reason: "must be at least 1".to_string(),
                }
                .into())
            }
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
            None => DEFAULT_MAX_PARALLEL_DOWNLOADS,
        };
        let request_headers = read_headers(&merged)?;

        Ok(Self {
            enabled,
            update_url,
            runtime_version,
            channel: read_string(&merged, KEY_CHANNEL)?.filter(|c| !c.is_empty()),
            check_on_launch,
            launch_wait,
            scope_key,
            updates_dir,
            embedded_dir,
            max_parallel_downloads,
            request_headers,
        })
    }

    /// Resolve `defaults` overlaid with `OTA_*` variables from the process environment.
    pub fn from_env(defaults: &ConfigSource) -> Result<Self> {
        Self::from_snapshot(defaults, &EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(defaults: &ConfigSource, snapshot: &EnvSnapshot) -> Result<Self> {
        let overrides = overrides_from_snapshot(snapshot)?;
        Self::resolve(defaults, &overrides)
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn update_url(&self) -> Option<&Url> {
        self.update_url.as_ref()
    }

    #[must_use]
    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    #[must_use]
    pub fn check_on_launch(&self) -> CheckOnLaunch {
        self.check_on_launch
    }

    #[must_use]
    pub fn launch_wait(&self) -> Duration {
        self.launch_wait
    }

    #[must_use]
    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    #[must_use]
    pub fn updates_dir(&self) -> &Path {
        &self.updates_dir
    }

    #[must_use]
    pub fn embedded_dir(&self) -> &Path {
        &self.embedded_dir
    }

    #[must_use]
    pub fn max_parallel_downloads(&self) -> usize {
        self.max_parallel_downloads
    }

    #[must_use]
    pub fn request_headers(&self) -> &BTreeMap<String, String> {
        &self.request_headers
    }

    #[must_use]
    pub fn filters(&self) -> SelectionFilters {
        SelectionFilters::new(self.scope_key.clone(), self.runtime_version.clone())
    }
}

pub(crate) fn ensure_known_key(key: &str) -> Result<()> {
    if KNOWN_KEYS.contains(&key) {
        Ok(())
    } else {
        Err(UpdatesError::UnknownConfigKey(key.to_string()).into())
    }
}

fn default_updates_dir() -> Result<PathBuf> {
    let base = dirs_next::data_local_dir().context("failed to resolve a data directory for updates")?;
    Ok(base.join("ota").join("updates"))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string '{s}'"),
        Value::Array(_) => "an array".to_string(),
        Value::Object(_) => "a table".to_string(),
    }
}

fn type_error(key: &str, expected: &'static str, value: &Value) -> anyhow::Error {
    UpdatesError::ConfigType {
        key: key.to_string(),
        expected,
        found: describe(value),
    }
    .into()
}

fn read_bool(values: &BTreeMap<String, Value>, key: &str) -> Result<Option<bool>> {
    match values.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(type_error(key, "a boolean", other)),
    }
}

fn read_string(values: &BTreeMap<String, Value>, key: &str) -> Result<Option<String>> {
    match values.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(type_error(key, "a string", other)),
    }
}

fn read_u64(values: &BTreeMap<String, Value>, key: &str) -> Result<Option<u64>> {
    match values.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value @ Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| type_error(key, "a non-negative integer", value)),
        Some(other) => Err(type_error(key, "a non-negative integer", other)),
    }
}

fn read_headers(values: &BTreeMap<String, Value>) -> Result<BTreeMap<String, String>> {
    match values.get(KEY_REQUEST_HEADERS) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, value)| match value {
                Value::String(s) => Ok((name.clone(), s.clone())),
                other => Err(type_error(KEY_REQUEST_HEADERS, "a table of strings", other)),
            })
            .collect(),
        Some(other) => Err(type_error(KEY_REQUEST_HEADERS, "a table of strings", other)),
    }
}

fn parse_env_bool(key: &str, raw: &str) -> Result<Value> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Value::Bool(true)),
        "0" | "false" | "no" | "off" | "" => Ok(Value::Bool(false)),
        _ => Err(type_error(key, "a boolean", &Value::String(raw.to_string()))),
    }
}

fn parse_env_u64(key: &str, raw: &str) -> Result<Value> {
    raw.trim()
        .parse::<u64>()
        .map(Value::from)
        .map_err(|_| type_error(key, "a non-negative integer", &Value::String(raw.to_string())))
}

fn overrides_from_snapshot(snapshot: &EnvSnapshot) -> Result<BTreeMap<String, Value>> {
    let mut overrides = BTreeMap::new();
    for (var, key) in ENV_KEYS {
        let Some(raw) = snapshot.var(var) else {
            continue;
        };
        let value = match *key {
            KEY_ENABLED => parse_env_bool(key, raw)?,
            KEY_LAUNCH_WAIT_MS | KEY_MAX_PARALLEL_DOWNLOADS => parse_env_u64(key, raw)?,
            _ => Value::String(raw.to_string()),
        };
        overrides.insert((*key).to_string(), value);
    }
    Ok(overrides)
}
