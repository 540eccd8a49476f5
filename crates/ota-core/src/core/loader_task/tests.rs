use super::*;
use crate::core::events::UnmeteredNetwork;
use crate::core::test_support::{test_config, write_embedded_bundle, FakeServer, TEST_SCOPE};
use serde_json::json;
use std::fs;
use std::sync::Mutex;
use tempfile::tempdir;

#[derive(Default)]
struct Recorder {
    failures: Mutex<Vec<String>>,
    success: Mutex<Option<(LaunchedContent, bool)>>,
    manifests: Mutex<Vec<UpdateId>>,
    background: Mutex<Vec<(BackgroundUpdateStatus, Option<UpdateId>)>>,
    veto: Mutex<Vec<UpdateId>>,
}

impl Recorder {
    fn launched(&self) -> (LaunchedContent, bool) {
        self.success
            .lock()
            .expect("success lock")
            .clone()
            .expect("on_success called")
    }

    fn launched_id(&self) -> Option<String> {
        self.launched()
            .0
            .launched_update
            .map(|update| update.id.to_string())
    }
}

impl LoaderTaskCallback for Recorder {
    fn on_failure(&self, error: &anyhow::Error) {
        self.failures
            .lock()
            .expect("failures lock")
            .push(format!("{error:#}"));
    }

    fn on_cached_update_loaded(&self, update: &Update) -> bool {
        !self.veto.lock().expect("veto lock").contains(&update.id)
    }

    fn on_remote_manifest_loaded(&self, manifest: &Manifest) {
        self.manifests
            .lock()
            .expect("manifests lock")
            .push(manifest.id.clone());
    }

    fn on_success(&self, launch: LaunchedContent, is_up_to_date: bool) {
        *self.success.lock().expect("success lock") = Some((launch, is_up_to_date));
    }

    fn on_background_update_finished(
        &self,
        status: BackgroundUpdateStatus,
        update: Option<&Update>,
        _error: Option<&anyhow::Error>,
    ) {
        self.background
            .lock()
            .expect("background lock")
            .push((status, update.map(|u| u.id.clone())));
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    config: Config,
    db: Database,
    server: Arc<FakeServer>,
}

impl Fixture {
    fn new(overrides: &[(&str, serde_json::Value)]) -> Result<Self> {
        let temp = tempdir()?;
        let config = test_config(temp.path(), overrides);
        write_embedded_bundle(
            config.embedded_dir(),
            "embedded-1",
            &[("embedded.bundle", "embedded()")],
        )?;
        let db = Database::open(config.updates_dir())?;
        Ok(Self {
            _temp: temp,
            config,
            db,
            server: Arc::new(FakeServer::new()),
        })
    }

    fn task(&self) -> LoaderTask {
        self.task_with_policy(SelectionPolicy::newest())
    }

    fn task_with_policy(&self, policy: SelectionPolicy) -> LoaderTask {
        LoaderTask::new(
            self.config.clone(),
            self.db.clone(),
            policy,
            self.server.clone(),
            self.server.clone(),
            Arc::new(UnmeteredNetwork),
        )
    }

    fn run(&self) -> Recorder {
        let recorder = Recorder::default();
        self.task().run(&recorder);
        recorder
    }
}

#[test]
fn embedded_update_launches_when_server_has_nothing() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    let recorder = fixture.run();
    let (content, is_up_to_date) = recorder.launched();
    assert_eq!(recorder.launched_id().as_deref(), Some("embedded-1"));
    assert_eq!(content.bundle_asset_name.as_deref(), Some("embedded.bundle"));
    assert!(!content.is_emergency_launch());
    assert!(is_up_to_date);
    assert_eq!(fixture.server.manifest_calls(), 1);
    Ok(())
}

#[test]
fn unreachable_server_on_fresh_install_is_an_emergency_launch() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    fixture.server.set_unreachable(true);
    let recorder = fixture.run();
    let (content, is_up_to_date) = recorder.launched();
    assert_eq!(content.emergency, Some(EmergencyReason::NoLaunchableUpdate));
    assert_eq!(content.bundle_asset_name.as_deref(), Some("embedded.bundle"));
    assert!(!is_up_to_date);
    Ok(())
}

#[test]
fn remote_update_within_budget_is_launched() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    fixture
        .server
        .publish("remote-b", 5, &[("bundle-b", "b()"), ("asset-b", "b")]);
    let recorder = fixture.run();
    let (content, is_up_to_date) = recorder.launched();
    assert_eq!(recorder.launched_id().as_deref(), Some("remote-b"));
    assert!(is_up_to_date);
    assert_eq!(
        fs::read_to_string(content.launch_asset_file.expect("launch file"))?,
        "b()"
    );
    assert_eq!(
        *recorder.manifests.lock().expect("manifests lock"),
        vec![UpdateId::new("remote-b")]
    );
    assert!(recorder.background.lock().expect("background lock").is_empty());
    Ok(())
}

#[test]
fn slow_remote_check_finishes_in_background() -> Result<()> {
    let fixture = Fixture::new(&[("launch_wait_ms", json!(20))])?;
    fixture.server.publish("remote-b", 5, &[("bundle-b", "b()")]);
    fixture.server.set_manifest_delay(Duration::from_millis(300));

    let recorder = fixture.run();
    assert_eq!(recorder.launched_id().as_deref(), Some("embedded-1"));
    assert_eq!(
        recorder.launched().0.emergency,
        Some(EmergencyReason::NoLaunchableUpdate),
        "embedded only and the server has not answered yet"
    );
    assert_eq!(
        *recorder.background.lock().expect("background lock"),
        vec![(
            BackgroundUpdateStatus::UpdateAvailable,
            Some(UpdateId::new("remote-b"))
        )]
    );
    let stored = fixture.db.update_by_id(&UpdateId::new("remote-b"))?;
    assert_eq!(stored.map(|u| u.status), Some(UpdateStatus::Ready));
    Ok(())
}

#[test]
fn check_on_launch_never_skips_the_server() -> Result<()> {
    let fixture = Fixture::new(&[("check_on_launch", json!("never"))])?;
    fixture.server.publish("remote-b", 5, &[("bundle-b", "b()")]);
    let recorder = fixture.run();
    assert_eq!(fixture.server.manifest_calls(), 0);
    assert_eq!(recorder.launched_id().as_deref(), Some("embedded-1"));
    Ok(())
}

#[test]
fn vetoed_and_corrupt_candidates_are_skipped() -> Result<()> {
    let fixture = Fixture::new(&[("check_on_launch", json!("never"))])?;
    let newest = fixture.server.publish("cached-c", 9, &[("bundle-c", "c()")]);
    RemoteLoader::new(&fixture.db, fixture.server.as_ref()).load(&newest, TEST_SCOPE)?;
    let middle = fixture.server.publish("cached-a", 3, &[("bundle-a", "a()")]);
    RemoteLoader::new(&fixture.db, fixture.server.as_ref()).load(&middle, TEST_SCOPE)?;

    let bundle_a = fixture.db.asset_by_key("bundle-a")?.expect("stored");
    fs::write(fixture.db.asset_path(&bundle_a), "corrupted")?;

    let recorder = fixture.run();
    assert_eq!(recorder.launched_id().as_deref(), Some("cached-c"));

    let recorder = Recorder::default();
    recorder.veto.lock().expect("veto lock").push(UpdateId::new("cached-c"));
    fixture.task().run(&recorder);
    assert_eq!(
        recorder.launched_id().as_deref(),
        Some("embedded-1"),
        "vetoed newest and corrupt middle fall through to embedded"
    );
    assert_eq!(
        fixture
            .db
            .update_by_id(&UpdateId::new("cached-a"))?
            .map(|u| u.status),
        Some(UpdateStatus::Pending)
    );
    Ok(())
}

#[test]
fn missing_embedded_manifest_without_cache_is_an_emergency() -> Result<()> {
    let fixture = Fixture::new(&[("check_on_launch", json!("never"))])?;
    fs::remove_file(fixture.config.embedded_dir().join(crate::core::loader::EMBEDDED_MANIFEST))?;
    let recorder = fixture.run();
    let (content, _) = recorder.launched();
    assert_eq!(content.emergency, Some(EmergencyReason::NoLaunchableUpdate));
    Ok(())
}

#[test]
fn zero_budget_with_unanswered_server_is_an_emergency_launch() -> Result<()> {
    let fixture = Fixture::new(&[("launch_wait_ms", json!(0))])?;
    fixture.server.set_unreachable(true);
    fixture.server.set_manifest_delay(Duration::from_millis(200));

    let recorder = fixture.run();
    let (content, is_up_to_date) = recorder.launched();
    assert_eq!(content.emergency, Some(EmergencyReason::NoLaunchableUpdate));
    assert_eq!(content.bundle_asset_name.as_deref(), Some("embedded.bundle"));
    assert!(!is_up_to_date);
    assert_eq!(
        *recorder.background.lock().expect("background lock"),
        vec![(BackgroundUpdateStatus::Error, None)]
    );
    Ok(())
}

#[test]
fn zero_budget_with_cached_update_is_not_an_emergency() -> Result<()> {
    let fixture = Fixture::new(&[("launch_wait_ms", json!(0))])?;
    let cached = fixture.server.publish("cached-a", 3, &[("bundle-a", "a()")]);
    RemoteLoader::new(&fixture.db, fixture.server.as_ref()).load(&cached, TEST_SCOPE)?;
    fixture.server.set_unreachable(true);
    fixture.server.set_manifest_delay(Duration::from_millis(200));

    let recorder = fixture.run();
    assert_eq!(recorder.launched_id().as_deref(), Some("cached-a"));
    assert!(!recorder.launched().0.is_emergency_launch());
    Ok(())
}

#[test]
fn pinned_launcher_policy_wins_over_fresh_remote_update() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    fixture.server.publish("remote-b", 5, &[("bundle-b", "b()")]);
    let pinned = SelectionPolicy::newest().with_launcher_policy(Arc::new(
        ota_domain::PinnedLauncherSelectionPolicy::new(UpdateId::new("embedded-1")),
    ));

    let recorder = Recorder::default();
    fixture.task_with_policy(pinned).run(&recorder);
    let (content, is_up_to_date) = recorder.launched();
    assert_eq!(recorder.launched_id().as_deref(), Some("embedded-1"));
    assert_eq!(content.bundle_asset_name.as_deref(), Some("embedded.bundle"));
    assert!(!content.is_emergency_launch());
    assert!(!is_up_to_date);
    let stored = fixture.db.update_by_id(&UpdateId::new("remote-b"))?;
    assert_eq!(
        stored.as_ref().map(|u| u.status),
        Some(UpdateStatus::Ready),
        "still downloaded for later"
    );
    assert_eq!(stored.and_then(|u| u.last_accessed), None);
    Ok(())
}

#[test]
fn only_the_adopted_update_is_recorded_as_launched() -> Result<()> {
    let fixture = Fixture::new(&[])?;
    let cached = fixture.server.publish("cached-a", 3, &[("bundle-a", "a()")]);
    RemoteLoader::new(&fixture.db, fixture.server.as_ref()).load(&cached, TEST_SCOPE)?;
    fixture.server.publish("remote-b", 5, &[("bundle-b", "b()")]);

    let recorder = fixture.run();
    assert_eq!(recorder.launched_id().as_deref(), Some("remote-b"));
    let last_accessed = |id: &str| -> Result<_> {
        Ok(fixture
            .db
            .update_by_id(&UpdateId::new(id))?
            .and_then(|u| u.last_accessed))
    };
    assert_eq!(last_accessed("cached-a")?, None, "losing local candidate untouched");
    assert!(last_accessed("remote-b")?.is_some());
    Ok(())
}
