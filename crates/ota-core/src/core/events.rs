//! Capabilities the host injects: event delivery, bundle swapping, and network
//! state.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::launcher::LaunchedContent;

/// Notifications about update availability, delivered fire-and-forget.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpdatesEvent {
    UpdateAvailable { manifest: Value },
    NoUpdateAvailable,
    Error { message: String },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: UpdatesEvent);
}

/// Default sink: events become log records.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, event: UpdatesEvent) {
        match event {
            UpdatesEvent::UpdateAvailable { manifest } => {
                let id = manifest.get("id").and_then(Value::as_str).unwrap_or("?");
                info!(update = id, "update available");
            }
            UpdatesEvent::NoUpdateAvailable => info!("no update available"),
            UpdatesEvent::Error { message } => warn!(%message, "update error"),
        }
    }
}

/// Replaces the running content with a newly launched one during reload.
pub trait BundleSwapper: Send + Sync {
    fn swap(&self, content: &LaunchedContent) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingBundleSwapper;

impl BundleSwapper for LoggingBundleSwapper {
    fn swap(&self, content: &LaunchedContent) -> Result<()> {
        info!(
            launch_asset = ?content.launch_asset_file,
            update = ?content.launched_update.as_ref().map(|u| u.id.as_str()),
            "swapping active bundle"
        );
        Ok(())
    }
}

/// Answers whether the current connection is metered.
pub trait NetworkMonitor: Send + Sync {
    fn is_metered(&self) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct UnmeteredNetwork;

impl NetworkMonitor for UnmeteredNetwork {
    fn is_metered(&self) -> bool {
        false
    }
}
