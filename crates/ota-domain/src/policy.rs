//! Selection policies.
//!
//! Three independent strategies decide which cached update to launch, whether a
//! newly seen update is worth downloading, and which updates survive a reap.
//! They operate on in-memory [`Update`] records only so each can be tested and
//! swapped without touching the store.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::entities::{Update, UpdateId, UpdateStatus};

/// Identity the running binary can execute: same scope, same runtime version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionFilters {
    pub scope_key: String,
    pub runtime_version: String,
}

impl SelectionFilters {
    pub fn new(scope_key: impl Into<String>, runtime_version: impl Into<String>) -> Self {
        Self {
            scope_key: scope_key.into(),
            runtime_version: runtime_version.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, update: &Update) -> bool {
        update.scope_key == self.scope_key && update.runtime_version == self.runtime_version
    }
}

pub trait LauncherSelectionPolicy: Send + Sync {
    fn select_update_to_launch<'a>(
        &self,
        candidates: &'a [Update],
        filters: &SelectionFilters,
    ) -> Option<&'a Update>;
}

pub trait LoaderSelectionPolicy: Send + Sync {
    fn should_load_new_update(
        &self,
        candidate: &Update,
        launched: Option<&Update>,
        filters: &SelectionFilters,
    ) -> bool;
}

pub trait ReaperSelectionPolicy: Send + Sync {
    /// The returned set always contains `launched`.
    fn updates_to_keep(
        &self,
        all: &[Update],
        launched: &Update,
        filters: &SelectionFilters,
    ) -> BTreeSet<UpdateId>;
}

/// Default policy: newest compatible commit wins, older content is released.
#[derive(Clone, Copy, Debug, Default)]
pub struct NewestUpdatePolicy;

impl LauncherSelectionPolicy for NewestUpdatePolicy {
    fn select_update_to_launch<'a>(
        &self,
        candidates: &'a [Update],
        filters: &SelectionFilters,
    ) -> Option<&'a Update> {
        candidates
            .iter()
            .filter(|update| update.status.is_launchable() && filters.matches(update))
            .max_by(|a, b| {
                a.commit_time
                    .cmp(&b.commit_time)
                    .then_with(|| a.id.cmp(&b.id))
            })
    }
}

impl LoaderSelectionPolicy for NewestUpdatePolicy {
    fn should_load_new_update(
        &self,
        candidate: &Update,
        launched: Option<&Update>,
        filters: &SelectionFilters,
    ) -> bool {
        if !filters.matches(candidate) {
            return false;
        }
        match launched {
            None => true,
            Some(launched) if !filters.matches(launched) => true,
            Some(launched) => candidate.commit_time > launched.commit_time,
        }
    }
}

impl ReaperSelectionPolicy for NewestUpdatePolicy {
    fn updates_to_keep(
        &self,
        all: &[Update],
        launched: &Update,
        filters: &SelectionFilters,
    ) -> BTreeSet<UpdateId> {
        let mut keep = BTreeSet::new();
        keep.insert(launched.id.clone());
        // Only the current embedded bundle is a fallback; superseded ones age out.
        let current_embedded = all
            .iter()
            .filter(|update| update.status == UpdateStatus::Embedded && filters.matches(update))
            .max_by(|a, b| {
                a.commit_time
                    .cmp(&b.commit_time)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|update| &update.id);
        for update in all {
            let retained = if update.scope_key != launched.scope_key {
                // Another app identity owns it.
                true
            } else if update.status == UpdateStatus::Development
                || Some(&update.id) == current_embedded
            {
                true
            } else {
                filters.matches(update) && update.commit_time > launched.commit_time
            };
            if retained {
                keep.insert(update.id.clone());
            }
        }
        keep
    }
}

/// Development variant that always launches one explicit update id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinnedLauncherSelectionPolicy {
    id: UpdateId,
}

impl PinnedLauncherSelectionPolicy {
    #[must_use]
    pub fn new(id: UpdateId) -> Self {
        Self { id }
    }
}

impl LauncherSelectionPolicy for PinnedLauncherSelectionPolicy {
    fn select_update_to_launch<'a>(
        &self,
        candidates: &'a [Update],
        _filters: &SelectionFilters,
    ) -> Option<&'a Update> {
        candidates
            .iter()
            .find(|update| update.id == self.id && update.status.is_launchable())
    }
}

/// The authoritative bundle of the three strategies.
#[derive(Clone)]
pub struct SelectionPolicy {
    launcher: Arc<dyn LauncherSelectionPolicy>,
    loader: Arc<dyn LoaderSelectionPolicy>,
    reaper: Arc<dyn ReaperSelectionPolicy>,
}

impl fmt::Debug for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionPolicy").finish_non_exhaustive()
    }
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::newest()
    }
}

impl SelectionPolicy {
    #[must_use]
    pub fn newest() -> Self {
        let newest = Arc::new(NewestUpdatePolicy);
        Self {
            launcher: newest.clone(),
            loader: newest.clone(),
            reaper: newest,
        }
    }

    #[must_use]
    pub fn with_launcher_policy(mut self, policy: Arc<dyn LauncherSelectionPolicy>) -> Self {
        self.launcher = policy;
        self
    }

    #[must_use]
    pub fn with_loader_policy(mut self, policy: Arc<dyn LoaderSelectionPolicy>) -> Self {
        self.loader = policy;
        self
    }

    #[must_use]
    pub fn with_reaper_policy(mut self, policy: Arc<dyn ReaperSelectionPolicy>) -> Self {
        self.reaper = policy;
        self
    }

    pub fn select_update_to_launch<'a>(
        &self,
        candidates: &'a [Update],
        filters: &SelectionFilters,
    ) -> Option<&'a Update> {
        self.launcher.select_update_to_launch(candidates, filters)
    }

    pub fn should_load_new_update(
        &self,
        candidate: &Update,
        launched: Option<&Update>,
        filters: &SelectionFilters,
    ) -> bool {
        self.loader
            .should_load_new_update(candidate, launched, filters)
    }

    pub fn updates_to_keep(
        &self,
        all: &[Update],
        launched: &Update,
        filters: &SelectionFilters,
    ) -> BTreeSet<UpdateId> {
        let mut keep = self.reaper.updates_to_keep(all, launched, filters);
        keep.insert(launched.id.clone());
        keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use time::{Duration, OffsetDateTime};

    const SCOPE: &str = "https://updates.example.com";

    fn filters() -> SelectionFilters {
        SelectionFilters::new(SCOPE, "1.0")
    }

    fn update(id: &str, age_secs: i64) -> Update {
        Update {
            id: UpdateId::new(id),
            commit_time: OffsetDateTime::UNIX_EPOCH + Duration::days(19_000)
                - Duration::seconds(age_secs),
            scope_key: SCOPE.to_string(),
            runtime_version: "1.0".to_string(),
            metadata: Value::Null,
            status: UpdateStatus::Ready,
            launch_asset_key: None,
            last_accessed: None,
        }
    }

    #[test]
    fn newest_picks_greatest_commit_time() {
        let candidates = vec![update("a", 30), update("b", 10), update("c", 20)];
        let picked = NewestUpdatePolicy.select_update_to_launch(&candidates, &filters());
        assert_eq!(picked.map(|u| u.id.as_str()), Some("b"));
    }

    #[test]
    fn newest_skips_incompatible_and_pending_candidates() {
        let mut wrong_runtime = update("newest-runtime", 0);
        wrong_runtime.runtime_version = "2.0".into();
        let mut other_scope = update("newest-scope", 1);
        other_scope.scope_key = "https://other.example.com".into();
        let pending = update("pending", 2).with_status(UpdateStatus::Pending);
        let candidates = vec![wrong_runtime, other_scope, pending, update("ok", 50)];

        let picked = NewestUpdatePolicy.select_update_to_launch(&candidates, &filters());
        assert_eq!(picked.map(|u| u.id.as_str()), Some("ok"));
    }

    #[test]
    fn equal_commit_times_break_ties_by_id() {
        let forward = vec![update("alpha", 5), update("omega", 5)];
        let backward = vec![update("omega", 5), update("alpha", 5)];
        for candidates in [forward, backward] {
            let picked = NewestUpdatePolicy.select_update_to_launch(&candidates, &filters());
            assert_eq!(picked.map(|u| u.id.as_str()), Some("omega"));
        }
    }

    #[test]
    fn should_load_only_strictly_newer_compatible_updates() {
        let launched = update("launched", 10);
        let policy = NewestUpdatePolicy;
        assert!(policy.should_load_new_update(&update("new", 0), Some(&launched), &filters()));
        assert!(!policy.should_load_new_update(&update("old", 20), Some(&launched), &filters()));
        assert!(!policy.should_load_new_update(&update("same", 10), Some(&launched), &filters()));
        assert!(policy.should_load_new_update(&update("first", 99), None, &filters()));

        let mut incompatible = update("incompatible", 0);
        incompatible.runtime_version = "0.9".into();
        assert!(!policy.should_load_new_update(&incompatible, Some(&launched), &filters()));
    }

    #[test]
    fn reaper_keeps_launched_newer_and_embedded_updates() {
        let launched = update("launched", 10);
        let embedded = update("embedded", 100).with_status(UpdateStatus::Embedded);
        let mut foreign = update("foreign", 200);
        foreign.scope_key = "https://other.example.com".into();
        let all = vec![
            update("older", 20),
            launched.clone(),
            update("newer", 5),
            embedded,
            foreign,
        ];

        let keep = NewestUpdatePolicy.updates_to_keep(&all, &launched, &filters());
        let keep: Vec<_> = keep.iter().map(UpdateId::as_str).collect();
        assert_eq!(keep, vec!["embedded", "foreign", "launched", "newer"]);
    }

    #[test]
    fn reaper_releases_superseded_embedded_updates() {
        let launched = update("launched", 10);
        let oldest = update("embedded-1", 300).with_status(UpdateStatus::Embedded);
        let previous = update("embedded-2", 200).with_status(UpdateStatus::Embedded);
        let current = update("embedded-3", 100).with_status(UpdateStatus::Embedded);
        let mut other_runtime = update("embedded-next", 50).with_status(UpdateStatus::Embedded);
        other_runtime.runtime_version = "2.0".into();
        let dev = update("dev", 400).with_status(UpdateStatus::Development);
        let all = vec![oldest, previous, current, other_runtime, dev, launched.clone()];

        let keep = NewestUpdatePolicy.updates_to_keep(&all, &launched, &filters());
        let keep: Vec<_> = keep.iter().map(UpdateId::as_str).collect();
        assert_eq!(keep, vec!["dev", "embedded-3", "launched"]);
    }

    #[test]
    fn newer_embedded_update_than_launched_is_kept_regardless() {
        let launched = update("launched", 100);
        let all = vec![
            update("embedded-1", 10).with_status(UpdateStatus::Embedded),
            update("embedded-0", 20).with_status(UpdateStatus::Embedded),
            launched.clone(),
        ];
        let keep = NewestUpdatePolicy.updates_to_keep(&all, &launched, &filters());
        assert!(keep.contains(&UpdateId::new("embedded-0")), "newer than launched");
        assert!(keep.contains(&UpdateId::new("embedded-1")), "current embedded");
    }

    #[test]
    fn pinned_policy_overrides_launch_selection_only() {
        let policy = SelectionPolicy::newest().with_launcher_policy(Arc::new(
            PinnedLauncherSelectionPolicy::new(UpdateId::new("a")),
        ));
        let candidates = vec![update("a", 30), update("b", 10)];
        let picked = policy.select_update_to_launch(&candidates, &filters());
        assert_eq!(picked.map(|u| u.id.as_str()), Some("a"));
        assert!(
            policy.should_load_new_update(&candidates[1], Some(&candidates[0]), &filters()),
            "loader policy still compares commit times"
        );
    }

    #[test]
    fn bundle_always_retains_launched_update() {
        struct DropEverything;
        impl ReaperSelectionPolicy for DropEverything {
            fn updates_to_keep(
                &self,
                _all: &[Update],
                _launched: &Update,
                _filters: &SelectionFilters,
            ) -> BTreeSet<UpdateId> {
                BTreeSet::new()
            }
        }
        let policy = SelectionPolicy::newest().with_reaper_policy(Arc::new(DropEverything));
        let launched = update("launched", 0);
        let keep = policy.updates_to_keep(std::slice::from_ref(&launched), &launched, &filters());
        assert!(keep.contains(&launched.id));
    }
}
