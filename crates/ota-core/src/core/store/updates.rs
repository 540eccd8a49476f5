//! Update rows and their asset associations.

use std::str::FromStr;

use super::*;

const UPDATE_COLUMNS: &str = "u.id, u.commit_time, u.metadata, u.scope_key, u.runtime_version, \
     u.status, u.last_accessed, \
     (SELECT a.key FROM updates_assets ua JOIN assets a ON a.id = ua.asset_id \
      WHERE ua.update_id = u.id AND ua.is_launch_asset = 1 LIMIT 1)";

impl Database {
    /// Record an update whose assets have not been fetched yet.
    ///
    /// An existing row with the same id is left untouched.
    pub fn insert_pending_update(&self, update: &Update) -> Result<()> {
        self.with_write_tx(|tx| {
            tx.execute(
                "INSERT INTO updates(id, commit_time, metadata, scope_key, runtime_version, status, last_accessed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    update.id.as_str(),
                    to_millis(update.commit_time),
                    serde_json::to_string(&update.metadata)?,
                    update.scope_key,
                    update.runtime_version,
                    UpdateStatus::Pending.as_ref(),
                ],
            )?;
            Ok(())
        })
        .map_err(database_error)
    }

    /// Insert or refresh an update together with all of its assets.
    ///
    /// Runs in one transaction: either the update and every association are
    /// stored, or nothing changes. An asset whose key is already stored with a
    /// different hash aborts the insert with a digest mismatch.
    pub fn insert_update(&self, update: &Update, assets: &[(Asset, bool)]) -> Result<()> {
        self.with_write_tx(|tx| {
            upsert_update_tx(tx, update)?;
            for (asset, is_launch) in assets {
                let asset_id = Self::upsert_asset_tx(tx, asset)?;
                link_asset_tx(tx, &update.id, asset_id, *is_launch)?;
            }
            Ok(())
        })
        .map_err(database_error)?;
        debug!(
            update = %update.id,
            status = %update.status,
            assets = assets.len(),
            "stored update"
        );
        Ok(())
    }

    /// Store one asset and associate it with an already recorded update.
    pub fn attach_asset(&self, update_id: &UpdateId, asset: &Asset, is_launch: bool) -> Result<()> {
        self.with_write_tx(|tx| {
            let asset_id = Self::upsert_asset_tx(tx, asset)?;
            link_asset_tx(tx, update_id, asset_id, is_launch)
        })
        .map_err(database_error)
    }

    pub fn update_by_id(&self, id: &UpdateId) -> Result<Option<Update>> {
        let conn = self.connection().map_err(database_error)?;
        let sql = format!("SELECT {UPDATE_COLUMNS} FROM updates u WHERE u.id = ?1");
        let raw = conn
            .query_row(&sql, params![id.as_str()], RawUpdate::from_row)
            .optional()
            .map_err(|err| database_error(err.into()))?;
        raw.map(RawUpdate::into_update).transpose()
    }

    /// Every update in the store, oldest commit first.
    pub fn all_updates(&self) -> Result<Vec<Update>> {
        let conn = self.connection().map_err(database_error)?;
        all_updates_in(&conn)
    }

    /// Updates of `scope_key` that may be handed to a launcher.
    pub fn launchable_updates(&self, scope_key: &str) -> Result<Vec<Update>> {
        let conn = self.connection().map_err(database_error)?;
        let sql = format!(
            "SELECT {UPDATE_COLUMNS} FROM updates u
             WHERE u.scope_key = ?1 AND u.status != ?2
             ORDER BY u.commit_time, u.id"
        );
        query_updates(
            &conn,
            &sql,
            params![scope_key, UpdateStatus::Pending.as_ref()],
        )
    }

    pub fn assets_for_update(&self, id: &UpdateId) -> Result<Vec<UpdateAsset>> {
        let conn = self.connection().map_err(database_error)?;
        let mut stmt = conn
            .prepare(
                "SELECT a.key, a.url, a.relative_path, a.type, a.hash, a.size, a.embedded_file,
                        ua.is_launch_asset
                 FROM updates_assets ua JOIN assets a ON a.id = ua.asset_id
                 WHERE ua.update_id = ?1
                 ORDER BY ua.is_launch_asset DESC, a.key",
            )
            .map_err(|err| database_error(err.into()))?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok((RawAsset::from_row(row)?, row.get::<_, bool>(7)?))
            })
            .map_err(|err| database_error(err.into()))?;
        let mut assets = Vec::new();
        for row in rows {
            let (raw, is_launch_asset) = row.map_err(|err| database_error(err.into()))?;
            assets.push(UpdateAsset {
                asset: raw.into_asset()?,
                is_launch_asset,
            });
        }
        Ok(assets)
    }

    /// Returns `true` when a row changed.
    pub fn set_update_status(&self, id: &UpdateId, status: UpdateStatus) -> Result<bool> {
        let changed = self
            .with_write_tx(|tx| {
                Ok(tx.execute(
                    "UPDATE updates SET status = ?2 WHERE id = ?1 AND status != ?2",
                    params![id.as_str(), status.as_ref()],
                )?)
            })
            .map_err(database_error)?;
        if changed > 0 {
            debug!(update = %id, %status, "update status changed");
        }
        Ok(changed > 0)
    }

    /// Stamp `last_accessed` for the update that is now running.
    pub fn mark_update_launched(&self, id: &UpdateId) -> Result<()> {
        self.with_write_tx(|tx| {
            tx.execute(
                "UPDATE updates SET last_accessed = ?2 WHERE id = ?1",
                params![id.as_str(), now_millis()],
            )?;
            Ok(())
        })
        .map_err(database_error)
    }
}

fn upsert_update_tx(tx: &rusqlite::Transaction<'_>, update: &Update) -> Result<()> {
    tx.execute(
        "INSERT INTO updates(id, commit_time, metadata, scope_key, runtime_version, status, last_accessed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO UPDATE SET
             commit_time = excluded.commit_time,
             metadata = excluded.metadata,
             scope_key = excluded.scope_key,
             runtime_version = excluded.runtime_version,
             status = excluded.status",
        params![
            update.id.as_str(),
            to_millis(update.commit_time),
            serde_json::to_string(&update.metadata)?,
            update.scope_key,
            update.runtime_version,
            update.status.as_ref(),
            update.last_accessed.map(to_millis),
        ],
    )?;
    Ok(())
}

fn link_asset_tx(
    tx: &rusqlite::Transaction<'_>,
    update_id: &UpdateId,
    asset_id: i64,
    is_launch: bool,
) -> Result<()> {
    tx.execute(
        "INSERT INTO updates_assets(update_id, asset_id, is_launch_asset) VALUES (?1, ?2, ?3)
         ON CONFLICT(update_id, asset_id) DO UPDATE SET is_launch_asset = excluded.is_launch_asset",
        params![update_id.as_str(), asset_id, is_launch],
    )
    .with_context(|| format!("failed to associate asset with update {update_id}"))?;
    Ok(())
}

/// Every update visible to `conn`, oldest commit first.
pub(super) fn all_updates_in(conn: &Connection) -> Result<Vec<Update>> {
    let sql = format!("SELECT {UPDATE_COLUMNS} FROM updates u ORDER BY u.commit_time, u.id");
    query_updates(conn, &sql, params![])
}

fn query_updates(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Update>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| database_error(err.into()))?;
    let rows = stmt
        .query_map(params, RawUpdate::from_row)
        .map_err(|err| database_error(err.into()))?;
    let mut updates = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| database_error(err.into()))?;
        updates.push(raw.into_update()?);
    }
    Ok(updates)
}

/// Column values of one `updates` row before domain conversion.
struct RawUpdate {
    id: String,
    commit_time: i64,
    metadata: String,
    scope_key: String,
    runtime_version: String,
    status: String,
    last_accessed: Option<i64>,
    launch_asset_key: Option<String>,
}

impl RawUpdate {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            commit_time: row.get(1)?,
            metadata: row.get(2)?,
            scope_key: row.get(3)?,
            runtime_version: row.get(4)?,
            status: row.get(5)?,
            last_accessed: row.get(6)?,
            launch_asset_key: row.get(7)?,
        })
    }

    fn into_update(self) -> Result<Update> {
        let status = UpdateStatus::from_str(&self.status).map_err(|_| {
            UpdatesError::Database(format!(
                "update {} has unknown status '{}'",
                self.id, self.status
            ))
        })?;
        let metadata: serde_json::Value = serde_json::from_str(&self.metadata)
            .with_context(|| format!("update {} has unreadable metadata", self.id))
            .map_err(database_error)?;
        // Pending rows have no associations yet; fall back to the manifest.
        let launch_asset_key = self.launch_asset_key.or_else(|| {
            metadata
                .pointer("/launchAsset/key")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        });
        Ok(Update {
            id: UpdateId::new(self.id),
            commit_time: from_millis(self.commit_time)?,
            scope_key: self.scope_key,
            runtime_version: self.runtime_version,
            metadata,
            status,
            launch_asset_key,
            last_accessed: self.last_accessed.map(from_millis).transpose()?,
        })
    }
}

/// Column values of one `assets` row before domain conversion.
pub(super) struct RawAsset {
    key: String,
    url: Option<String>,
    relative_path: String,
    content_type: String,
    hash: String,
    size: Option<i64>,
    embedded_file: Option<String>,
}

impl RawAsset {
    /// Reads the first seven columns in `assets` order.
    pub(super) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            url: row.get(1)?,
            relative_path: row.get(2)?,
            content_type: row.get(3)?,
            hash: row.get(4)?,
            size: row.get(5)?,
            embedded_file: row.get(6)?,
        })
    }

    pub(super) fn into_asset(self) -> Result<Asset> {
        let url = match self.url {
            Some(raw) => Some(url::Url::parse(&raw).map_err(|err| {
                UpdatesError::Database(format!("asset {} has invalid url: {err}", self.key))
            })?),
            None => None,
        };
        Ok(Asset {
            key: self.key,
            url,
            relative_path: self.relative_path,
            content_type: self.content_type,
            hash: self.hash,
            size: self.size.and_then(|size| u64::try_from(size).ok()),
            embedded_file: self.embedded_file,
        })
    }
}
