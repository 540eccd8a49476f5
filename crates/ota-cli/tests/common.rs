#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::assert::Assert;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

pub struct Fixture {
    pub temp: TempDir,
}

impl Fixture {
    pub fn new(prefix: &str) -> Self {
        let temp = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .expect("tempdir");
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn updates_dir(&self) -> PathBuf {
        self.root().join("updates")
    }

    pub fn embedded_dir(&self) -> PathBuf {
        self.root().join("embedded")
    }

    /// Write `ota.toml` with the shared directory keys plus `extra` lines.
    pub fn write_config(&self, extra: &str) -> PathBuf {
        let path = self.root().join("ota.toml");
        let contents = format!(
            "runtime_version = \"1.0\"\nupdates_dir = \"{}\"\nembedded_dir = \"{}\"\n{extra}",
            self.updates_dir().display(),
            self.embedded_dir().display(),
        );
        fs::write(&path, contents).expect("write config");
        path
    }

    /// Package an embedded bundle whose launch asset is `app.bundle`.
    pub fn write_embedded_bundle(&self, id: &str) {
        let dir = self.embedded_dir();
        fs::create_dir_all(&dir).expect("embedded dir");
        let body = b"console.log('embedded')";
        fs::write(dir.join("app.bundle"), body).expect("bundle");
        let manifest = json!({
            "id": id,
            "createdAt": "2024-01-01T00:00:00Z",
            "runtimeVersion": "1.0",
            "launchAsset": {
                "key": "app.bundle",
                "contentType": "application/javascript",
                "hash": hex::encode(Sha256::digest(body)),
            },
            "assets": [],
        });
        fs::write(
            dir.join("app.manifest"),
            serde_json::to_vec_pretty(&manifest).expect("manifest json"),
        )
        .expect("manifest");
    }
}

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}
