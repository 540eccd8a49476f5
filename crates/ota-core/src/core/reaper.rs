//! Post-launch garbage collection.

use anyhow::Result;
use ota_domain::{SelectionFilters, SelectionPolicy, Update};
use tracing::info;

use crate::core::store::{Database, ReapSummary};

/// Remove every update the policy does not retain around `launched`, along
/// with the assets only they referenced.
///
/// Call only after `launched` has been confirmed running.
pub fn reap_unused_updates(
    db: &Database,
    policy: &SelectionPolicy,
    launched: &Update,
    filters: &SelectionFilters,
) -> Result<ReapSummary> {
    let summary = db.remove_unretained(|all| policy.updates_to_keep(all, launched, filters))?;
    if !summary.updates_removed.is_empty() {
        info!(
            launched = %launched.id,
            updates = summary.updates_removed.len(),
            assets = summary.assets_removed,
            bytes = summary.bytes_reclaimed,
            "reaped unused updates"
        );
    }
    Ok(summary)
}
