//! SQLite connection + transaction helpers.

use super::*;

impl Database {
    pub(super) fn connection(&self) -> Result<Connection> {
        let path = self.index_path();
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open update database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for update database")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign keys for update database")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for update database")?;
        Ok(conn)
    }

    /// Run `f` inside an `IMMEDIATE` transaction while holding the writer lock.
    pub(super) fn with_write_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let _writer = self.write_lock()?;
        self.with_write_tx_locked(f)
    }

    /// Same as [`Database::with_write_tx`] for callers already holding the lock.
    pub(super) fn with_write_tx_locked<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start update database transaction")?;
        let result = f(&tx)?;
        tx.commit()
            .context("failed to commit update database transaction")?;
        Ok(result)
    }
}
