//! Index schema initialization (SQLite DDL).

use super::*;

impl Database {
    pub(super) fn ensure_schema(&self) -> Result<()> {
        self.with_write_tx(|tx| {
            tx.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS updates (
                    id TEXT PRIMARY KEY,
                    commit_time INTEGER NOT NULL,
                    metadata TEXT NOT NULL,
                    scope_key TEXT NOT NULL,
                    runtime_version TEXT NOT NULL,
                    status TEXT NOT NULL,
                    last_accessed INTEGER
                );
                CREATE INDEX IF NOT EXISTS updates_scope ON updates(scope_key, status);
                CREATE TABLE IF NOT EXISTS assets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key TEXT NOT NULL UNIQUE,
                    url TEXT,
                    relative_path TEXT NOT NULL,
                    type TEXT NOT NULL,
                    hash TEXT NOT NULL,
                    size INTEGER,
                    embedded_file TEXT
                );
                CREATE TABLE IF NOT EXISTS updates_assets (
                    update_id TEXT NOT NULL,
                    asset_id INTEGER NOT NULL,
                    is_launch_asset INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY(update_id, asset_id),
                    FOREIGN KEY(update_id) REFERENCES updates(id) ON DELETE CASCADE,
                    FOREIGN KEY(asset_id) REFERENCES assets(id) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS updates_assets_asset ON updates_assets(asset_id);
                "#,
            )
            .context("failed to initialize update database schema")?;

            let stored: Option<String> = tx
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    params![META_KEY_SCHEMA_VERSION],
                    |row| row.get(0),
                )
                .optional()?;
            match stored {
                None => {
                    tx.execute(
                        "INSERT INTO meta(key, value) VALUES (?1, ?2), (?3, ?4)",
                        params![
                            META_KEY_SCHEMA_VERSION,
                            SCHEMA_VERSION.to_string(),
                            META_KEY_CREATED_BY,
                            OTA_VERSION
                        ],
                    )?;
                }
                Some(found) if found == SCHEMA_VERSION.to_string() => {}
                Some(found) => {
                    return Err(UpdatesError::Database(format!(
                        "schema version {found} is not supported (expected {SCHEMA_VERSION})"
                    ))
                    .into());
                }
            }
            Ok(())
        })
    }
}
