use std::panic;
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use httptest::{matchers::*, responders::*, Expectation, Server};
use serde_json::json;
use sha2::{Digest, Sha256};

mod common;

use common::{parse_json, Fixture};

#[test]
fn launch_waits_for_download_that_outlives_the_decision() {
    let Ok(server) = panic::catch_unwind(Server::run) else {
        eprintln!("skipping background launch test: unable to bind local server");
        return;
    };
    let body = "console.log('remote')";
    let manifest = json!({
        "id": "remote-1",
        "createdAt": "2024-05-01T12:00:00Z",
        "runtimeVersion": "1.0",
        "launchAsset": {
            "key": "remote.bundle",
            "url": server.url_str("/remote.bundle"),
            "contentType": "application/javascript",
            "hash": hex::encode(Sha256::digest(body.as_bytes())),
        },
        "assets": [],
    });
    server.expect(
        Expectation::matching(request::method_path("GET", "/manifest")).respond_with(
            delay_and_then(Duration::from_millis(500), json_encoded(manifest)),
        ),
    );
    server.expect(
        Expectation::matching(request::method_path("GET", "/remote.bundle"))
            .respond_with(status_code(200).body(body)),
    );

    let fixture = Fixture::new("ota-background");
    fixture.write_embedded_bundle("embedded-1");
    let config = fixture.write_config(&format!(
        "update_url = \"{}\"\nlaunch_wait_ms = 0\n",
        server.url_str("/manifest")
    ));

    let assert = cargo_bin_cmd!("ota")
        .current_dir(fixture.root())
        .arg("--config")
        .arg(&config)
        .args(["--json", "launch", "--wait-secs", "30"])
        .assert()
        .success();
    let payload = parse_json(&assert);
    assert_eq!(payload["details"]["launchedUpdate"]["id"], "embedded-1");

    let assert = cargo_bin_cmd!("ota")
        .current_dir(fixture.root())
        .arg("--config")
        .arg(&config)
        .args(["--json", "list"])
        .assert()
        .success();
    let payload = parse_json(&assert);
    let updates = payload["details"]["updates"].as_array().expect("updates");
    let remote = updates
        .iter()
        .find(|update| update["id"] == "remote-1")
        .expect("background download stored before exit");
    assert_eq!(remote["status"], "ready");
}
