use super::*;

#[test]
fn corrupt_asset_demotes_referencing_updates() -> Result<()> {
    let (_temp, db) = new_db()?;
    let bundle = stored_asset(&db, "bundle", b"good bytes")?;
    let icon = stored_asset(&db, "icon", b"icon")?;
    db.insert_update(
        &update("u1", 1, UpdateStatus::Ready),
        &[(bundle.clone(), true), (icon, false)],
    )?;
    fs::write(db.asset_path(&bundle), b"tampered")?;

    let summary = db.integrity_scan(Duration::from_secs(3600))?;
    assert_eq!(summary.assets_checked, 2);
    assert_eq!(summary.corrupt_assets, 1);
    assert_eq!(summary.updates_demoted, 1);
    assert!(!db.asset_path(&bundle).exists(), "corrupt file removed");
    assert!(db.asset_by_key("bundle")?.is_none(), "corrupt row removed");
    assert_eq!(
        db.update_by_id(&UpdateId::new("u1"))?.map(|u| u.status),
        Some(UpdateStatus::Pending)
    );
    Ok(())
}

#[test]
fn missing_asset_is_reported() -> Result<()> {
    let (_temp, db) = new_db()?;
    let bundle = stored_asset(&db, "bundle", b"bytes")?;
    db.insert_update(&update("u1", 1, UpdateStatus::Embedded), &[(bundle.clone(), true)])?;
    fs::remove_file(db.asset_path(&bundle))?;

    let summary = db.integrity_scan(Duration::from_secs(3600))?;
    assert_eq!(summary.missing_assets, 1);
    assert!(db.launchable_updates(SCOPE)?.is_empty());
    Ok(())
}

#[test]
fn stray_files_respect_grace_period() -> Result<()> {
    let (_temp, db) = new_db()?;
    let kept = stored_asset(&db, "kept", b"kept")?;
    db.insert_update(&update("u1", 1, UpdateStatus::Ready), &[(kept.clone(), true)])?;
    let orphan = db.updates_dir().join("orphan");
    let partial = db.updates_dir().join(format!("{PARTIAL_PREFIX}abc"));
    fs::write(&orphan, b"x")?;
    fs::write(&partial, b"y")?;

    let summary = db.integrity_scan(Duration::from_secs(3600))?;
    assert_eq!(summary.orphans_removed + summary.partials_removed, 0);
    assert!(orphan.exists() && partial.exists(), "fresh files survive");

    let summary = db.integrity_scan(Duration::ZERO)?;
    assert_eq!(summary.orphans_removed, 1);
    assert_eq!(summary.partials_removed, 1);
    assert!(!orphan.exists() && !partial.exists());
    assert!(db.asset_path(&kept).exists(), "referenced asset survives");
    assert!(db.updates_dir().join(INDEX_FILENAME).exists(), "index survives");
    Ok(())
}
