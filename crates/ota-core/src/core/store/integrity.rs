//! Verify asset files against the index and sweep stray files.

use std::collections::HashSet;
use std::fs;
use std::time::SystemTime;

use walkdir::WalkDir;

use super::files::{compute_sha256, modified_before};
use super::*;

impl Database {
    /// Re-hash every recorded asset file and drop the ones that fail.
    ///
    /// Updates referencing a missing or corrupt asset fall back to `pending`
    /// so they are re-fetched rather than launched. Files nobody references and
    /// leftover partial downloads older than `orphan_grace` are removed.
    pub fn integrity_scan(&self, orphan_grace: Duration) -> Result<IntegritySummary> {
        let _writer = self.write_lock()?;
        let mut summary = IntegritySummary::default();

        let rows: Vec<(i64, String, String, String)> = {
            let conn = self.connection().map_err(database_error)?;
            let mut stmt = conn
                .prepare("SELECT id, key, relative_path, hash FROM assets")
                .map_err(|err| database_error(err.into()))?;
            let mapped = stmt
                .query_map(params![], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(|err| database_error(err.into()))?;
            mapped
                .collect::<rusqlite::Result<_>>()
                .map_err(|err| database_error(err.into()))?
        };

        let mut broken = Vec::new();
        let mut known = HashSet::new();
        for (id, key, relative_path, hash) in rows {
            summary.assets_checked += 1;
            let path = self.root.join(&relative_path);
            if !path.exists() {
                warn!(asset = %key, path = %path.display(), "asset file missing");
                summary.missing_assets += 1;
                broken.push(id);
                continue;
            }
            match compute_sha256(&path) {
                Ok(actual) if actual == hash => {
                    known.insert(relative_path);
                }
                Ok(actual) => {
                    warn!(asset = %key, expected = %hash, %actual, "asset file corrupt");
                    summary.corrupt_assets += 1;
                    if let Err(err) = fs::remove_file(&path) {
                        warn!(path = %path.display(), %err, "failed to remove corrupt asset");
                    }
                    broken.push(id);
                }
                Err(err) => {
                    warn!(asset = %key, %err, "failed to hash asset file");
                    summary.corrupt_assets += 1;
                    broken.push(id);
                }
            }
        }

        if !broken.is_empty() {
            summary.updates_demoted = self
                .with_write_tx_locked(|tx| {
                    let mut demoted = 0;
                    for id in &broken {
                        demoted += tx.execute(
                            "UPDATE updates SET status = ?2
                             WHERE status != ?2
                               AND id IN (SELECT update_id FROM updates_assets WHERE asset_id = ?1)",
                            params![id, UpdateStatus::Pending.as_ref()],
                        )?;
                        tx.execute("DELETE FROM assets WHERE id = ?1", params![id])?;
                    }
                    Ok(demoted)
                })
                .map_err(database_error)?;
        }

        let cutoff = SystemTime::now()
            .checked_sub(orphan_grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_index_file(&name) || known.contains(&name) {
                continue;
            }
            if !modified_before(entry.path(), cutoff) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) if name.starts_with(PARTIAL_PREFIX) => summary.partials_removed += 1,
                Ok(()) => summary.orphans_removed += 1,
                Err(err) => {
                    warn!(path = %entry.path().display(), %err, "failed to remove stray file");
                }
            }
        }

        debug!(
            checked = summary.assets_checked,
            missing = summary.missing_assets,
            corrupt = summary.corrupt_assets,
            demoted = summary.updates_demoted,
            orphans = summary.orphans_removed,
            partials = summary.partials_removed,
            "integrity scan finished"
        );
        Ok(summary)
    }
}

fn is_index_file(name: &str) -> bool {
    name.strip_prefix(INDEX_FILENAME)
        .is_some_and(|suffix| matches!(suffix, "" | "-wal" | "-shm" | "-journal"))
}
