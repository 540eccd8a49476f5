//! Garbage collection of updates that are no longer retained.

use std::collections::BTreeSet;
use std::fs;

use super::updates::all_updates_in;
use super::*;

impl Database {
    /// Delete every update `retain` does not return, then every asset no
    /// surviving update references, then the files of those assets.
    ///
    /// `retain` sees the update rows as they are inside the deleting
    /// transaction, so an update recorded by a concurrent load is always
    /// visible to it. Row deletion happens in one transaction and file removal
    /// happens while the writer lock is still held, so a concurrent load never
    /// links an asset whose file is about to disappear.
    pub fn remove_unretained<F>(&self, retain: F) -> Result<ReapSummary>
    where
        F: FnOnce(&[Update]) -> BTreeSet<UpdateId>,
    {
        let _writer = self.write_lock()?;
        let (updates_removed, doomed) = self
            .with_write_tx_locked(|tx| {
                let all = all_updates_in(tx)?;
                let keep = retain(&all);
                let mut removed = Vec::new();
                for update in all {
                    if keep.contains(&update.id) {
                        continue;
                    }
                    tx.execute(
                        "DELETE FROM updates WHERE id = ?1",
                        params![update.id.as_str()],
                    )?;
                    removed.push(update.id);
                }

                let doomed: Vec<(i64, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, relative_path FROM assets
                         WHERE id NOT IN (SELECT asset_id FROM updates_assets)",
                    )?;
                    let rows = stmt.query_map(params![], |row| Ok((row.get(0)?, row.get(1)?)))?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                for (id, _) in &doomed {
                    tx.execute("DELETE FROM assets WHERE id = ?1", params![id])?;
                }
                Ok((removed, doomed))
            })
            .map_err(database_error)?;

        let mut summary = ReapSummary {
            updates_removed,
            assets_removed: doomed.len(),
            bytes_reclaimed: 0,
        };
        for (_, relative_path) in doomed {
            let path = self.root.join(&relative_path);
            let size = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => summary.bytes_reclaimed += size,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), %err, "failed to remove asset file"),
            }
        }
        debug!(
            updates = summary.updates_removed.len(),
            assets = summary.assets_removed,
            bytes = summary.bytes_reclaimed,
            "removed unretained updates"
        );
        Ok(summary)
    }
}
