use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use ota_core::{
    reap_unused_updates, Config, ConfigSource, ControllerDeps, Database, SelectionPolicy,
    UpdatesController,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cli::{BackgroundArgs, CommandGroupCli, DoctorArgs, LaunchArgs, ReloadArgs};
use crate::outcome::ExecutionOutcome;

const DEFAULT_CONFIG_FILE: &str = "ota.toml";

pub fn command_name(group: &CommandGroupCli) -> &'static str {
    match group {
        CommandGroupCli::Launch(_) => "launch",
        CommandGroupCli::Check => "check",
        CommandGroupCli::Fetch => "fetch",
        CommandGroupCli::Reload(_) => "reload",
        CommandGroupCli::List => "list",
        CommandGroupCli::Doctor(_) => "doctor",
        CommandGroupCli::Reap => "reap",
    }
}

/// Resolve the config: the explicit file, else `./ota.toml` when present,
/// overlaid with `OTA_*` variables.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let source = match path {
        Some(path) => ConfigSource::load(path)?,
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                ConfigSource::load(default)?
            } else {
                ConfigSource::builtin()
            }
        }
    };
    Config::from_env(&source)
}

pub fn dispatch_command(config: Config, group: &CommandGroupCli) -> Result<ExecutionOutcome> {
    match group {
        CommandGroupCli::Launch(args) => launch(config, args),
        CommandGroupCli::Check => check(config),
        CommandGroupCli::Fetch => fetch(config),
        CommandGroupCli::Reload(args) => reload(config, args),
        CommandGroupCli::List => list(&config),
        CommandGroupCli::Doctor(args) => doctor(&config, args),
        CommandGroupCli::Reap => reap(&config),
    }
}

fn controller(config: Config) -> Result<UpdatesController> {
    let deps = ControllerDeps::http(&config)?;
    Ok(UpdatesController::new(config, deps))
}

/// Let the loader task and reaper finish before the process exits.
fn finish_background(controller: &UpdatesController, args: &BackgroundArgs) {
    if !controller.wait_for_background(Duration::from_secs(args.wait_secs)) {
        warn!(
            wait_secs = args.wait_secs,
            "exiting before background update work finished"
        );
    }
}

fn launch(config: Config, args: &LaunchArgs) -> Result<ExecutionOutcome> {
    let controller = controller(config)?;
    controller.initialize()?;
    let content = controller.launched_content();
    finish_background(&controller, &args.background);
    let file = content
        .launch_asset_file
        .as_deref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let message = match (&content.launched_update, content.emergency) {
        (_, Some(reason)) => format!("emergency launch ({reason}): {file}"),
        (Some(update), None) => format!("launching update {}: {file}", update.id),
        (None, None) => format!("launching embedded bundle: {file}"),
    };
    Ok(ExecutionOutcome::success(
        message,
        serde_json::to_value(&*content)?,
    ))
}

fn check(config: Config) -> Result<ExecutionOutcome> {
    let result = controller(config)?.check_for_update()?;
    let message = match (&result.manifest, result.is_available) {
        (Some(manifest), true) => format!("update {} is available", manifest.id),
        (Some(manifest), false) => format!("up to date (server offers {})", manifest.id),
        (None, _) => "no update available".to_string(),
    };
    Ok(ExecutionOutcome::success(message, serde_json::to_value(&result)?))
}

fn fetch(config: Config) -> Result<ExecutionOutcome> {
    let result = controller(config)?.fetch_update()?;
    let message = match (&result.manifest, result.is_new) {
        (Some(manifest), true) => format!("fetched update {}", manifest.id),
        (Some(manifest), false) => format!("already have {}", manifest.id),
        (None, _) => "no update available".to_string(),
    };
    Ok(ExecutionOutcome::success(message, serde_json::to_value(&result)?))
}

fn reload(config: Config, args: &ReloadArgs) -> Result<ExecutionOutcome> {
    let controller = controller(config)?;
    controller.reload()?;
    finish_background(&controller, &args.background);
    let Some(content) = controller.active_content() else {
        return Ok(ExecutionOutcome::success("reloaded", Value::Null));
    };
    let id = content
        .launched_update
        .as_ref()
        .map_or_else(|| "embedded bundle".to_string(), |u| u.id.to_string());
    Ok(ExecutionOutcome::success(
        format!("reloaded to {id}"),
        serde_json::to_value(&*content)?,
    ))
}

fn open_database(config: &Config) -> Result<Database> {
    Database::open(config.updates_dir())
        .with_context(|| format!("failed to open updates in {}", config.updates_dir().display()))
}

fn list(config: &Config) -> Result<ExecutionOutcome> {
    let db = open_database(config)?;
    let updates = db.all_updates()?;
    let rows: Vec<Value> = updates
        .iter()
        .map(|update| {
            json!({
                "id": update.id,
                "status": update.status,
                "scopeKey": update.scope_key,
                "runtimeVersion": update.runtime_version,
                "commitTime": update.commit_time.to_string(),
                "launched": update.last_accessed.is_some(),
            })
        })
        .collect();
    Ok(ExecutionOutcome::success(
        format!("{} stored update(s)", rows.len()),
        json!({ "updates": rows }),
    ))
}

fn doctor(config: &Config, args: &DoctorArgs) -> Result<ExecutionOutcome> {
    let db = open_database(config)?;
    let summary = db.integrity_scan(Duration::from_secs(args.grace_secs))?;
    let message = if summary.missing_assets + summary.corrupt_assets == 0 {
        format!("{} asset(s) verified", summary.assets_checked)
    } else {
        format!(
            "{} missing and {} corrupt asset(s) purged; {} update(s) demoted",
            summary.missing_assets, summary.corrupt_assets, summary.updates_demoted
        )
    };
    Ok(ExecutionOutcome::success(message, serde_json::to_value(&summary)?))
}

/// Reap around the update the launcher would pick right now.
fn reap(config: &Config) -> Result<ExecutionOutcome> {
    let db = open_database(config)?;
    let policy = SelectionPolicy::default();
    let filters = config.filters();
    let candidates = db.launchable_updates(config.scope_key())?;
    let Some(launched) = policy.select_update_to_launch(&candidates, &filters) else {
        debug!("nothing launchable; skipping reap");
        return Ok(ExecutionOutcome::success(
            "nothing to reap",
            json!({ "updatesRemoved": [], "assetsRemoved": 0, "bytesReclaimed": 0 }),
        ));
    };
    let summary = reap_unused_updates(&db, &policy, launched, &filters)?;
    Ok(ExecutionOutcome::success(
        format!(
            "removed {} update(s) and {} asset(s)",
            summary.updates_removed.len(),
            summary.assets_removed
        ),
        serde_json::to_value(&summary)?,
    ))
}
