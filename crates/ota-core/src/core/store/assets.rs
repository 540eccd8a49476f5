//! Asset rows, deduplicated by content key.

use super::updates::RawAsset;
use super::*;

const ASSET_COLUMNS: &str = "key, url, relative_path, type, hash, size, embedded_file";

impl Database {
    pub fn asset_by_key(&self, key: &str) -> Result<Option<Asset>> {
        let conn = self.connection().map_err(database_error)?;
        let sql = format!("SELECT {ASSET_COLUMNS} FROM assets WHERE key = ?1");
        let raw = conn
            .query_row(&sql, params![key], RawAsset::from_row)
            .optional()
            .map_err(|err| database_error(err.into()))?;
        raw.map(RawAsset::into_asset).transpose()
    }

    pub fn all_assets(&self) -> Result<Vec<Asset>> {
        let conn = self.connection().map_err(database_error)?;
        let sql = format!("SELECT {ASSET_COLUMNS} FROM assets ORDER BY key");
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|err| database_error(err.into()))?;
        let rows = stmt
            .query_map(params![], RawAsset::from_row)
            .map_err(|err| database_error(err.into()))?;
        let mut assets = Vec::new();
        for row in rows {
            assets.push(row.map_err(|err| database_error(err.into()))?.into_asset()?);
        }
        Ok(assets)
    }

    /// Record one downloaded asset on its own, outside any update.
    pub fn upsert_asset(&self, asset: &Asset) -> Result<()> {
        self.with_write_tx(|tx| Self::upsert_asset_tx(tx, asset).map(|_| ()))
            .map_err(database_error)
    }

    /// Insert the asset row or refresh its optional columns; returns the row id.
    ///
    /// The stored hash of a key never changes: a different hash for a known key
    /// is reported as a digest mismatch.
    pub(super) fn upsert_asset_tx(tx: &rusqlite::Transaction<'_>, asset: &Asset) -> Result<i64> {
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, hash FROM assets WHERE key = ?1",
                params![asset.key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let size = asset.size.and_then(|size| i64::try_from(size).ok());
        let url = asset.url.as_ref().map(url::Url::as_str);
        match existing {
            Some((_, stored)) if stored != asset.hash => Err(UpdatesError::DigestMismatch {
                key: asset.key.clone(),
                expected: stored,
                actual: asset.hash.clone(),
            }
            .into()),
            Some((id, _)) => {
                tx.execute(
                    "UPDATE assets SET
                         url = COALESCE(?2, url),
                         size = COALESCE(?3, size),
                         embedded_file = COALESCE(?4, embedded_file)
                     WHERE id = ?1",
                    params![id, url, size, asset.embedded_file],
                )?;
                Ok(id)
            }
            None => {
                tx.execute(
                    "INSERT INTO assets(key, url, relative_path, type, hash, size, embedded_file)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        asset.key,
                        url,
                        asset.relative_path,
                        asset.content_type,
                        asset.hash,
                        size,
                        asset.embedded_file,
                    ],
                )
                .with_context(|| format!("failed to record asset {}", asset.key))?;
                Ok(tx.last_insert_rowid())
            }
        }
    }
}
