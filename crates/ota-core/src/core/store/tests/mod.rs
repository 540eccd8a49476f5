//! Update store unit tests, split by topic.

use super::*;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use tempfile::tempdir;

const SCOPE: &str = "https://updates.example.com";

fn new_db() -> Result<(tempfile::TempDir, Database)> {
    let temp = tempdir()?;
    let db = Database::open(&temp.path().join("updates"))?;
    Ok((temp, db))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write `content` into the store directory and describe it as an asset.
fn stored_asset(db: &Database, key: &str, content: &[u8]) -> Result<Asset> {
    let hash = sha256_hex(content);
    let file_name = asset_file_name(key);
    let (_, size) = files::write_verified(db.updates_dir(), &file_name, key, &hash, |w| {
        w.write_all(content)?;
        Ok(())
    })?;
    Ok(Asset {
        key: key.to_string(),
        url: None,
        relative_path: file_name,
        content_type: "application/octet-stream".to_string(),
        hash,
        size: Some(size),
        embedded_file: None,
    })
}

fn update(id: &str, day: i64, status: UpdateStatus) -> Update {
    Update {
        id: UpdateId::new(id),
        commit_time: OffsetDateTime::UNIX_EPOCH + time::Duration::days(19_000 + day),
        scope_key: SCOPE.to_string(),
        runtime_version: "1.0".to_string(),
        metadata: json!({ "id": id }),
        status,
        launch_asset_key: None,
        last_accessed: None,
    }
}

mod integrity;
