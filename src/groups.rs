use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::model::KindGroups;
use crate::persist::{load_json, store_json};

/// User categories of resource kinds, persisted on every mutation.
///
/// The lock is held across the file write, so a catalog resync and a user
/// edit never interleave; whichever finishes last is what lands on disk.
/// Edits are made on a copy that only replaces the live state once it is
/// stored.
#[derive(Debug)]
pub struct GroupStore {
    path: Option<PathBuf>,
    state: Mutex<Ledger>,
}

#[derive(Debug)]
struct Ledger {
    groups: KindGroups,
    /// Last kind set each cluster reported.
    catalogs: BTreeMap<String, BTreeSet<String>>,
}

impl GroupStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let groups = load_json::<KindGroups>(&path);
        Self {
            path: Some(path),
            state: Mutex::new(Ledger {
                groups,
                catalogs: BTreeMap::new(),
            }),
        }
    }

    pub fn in_memory(initial: KindGroups) -> Self {
        Self {
            path: None,
            state: Mutex::new(Ledger {
                groups: initial,
                catalogs: BTreeMap::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> KindGroups {
        self.lock().groups.clone()
    }

    /// Records `catalog` as the kind set of `cluster`, files new kinds as
    /// uncategorized and prunes kinds that no synced cluster reports anymore.
    pub fn reconcile(&self, cluster: &str, catalog: &BTreeSet<String>) -> EngineResult<KindGroups> {
        let mut state = self.lock();
        let mut catalogs = state.catalogs.clone();
        catalogs.insert(cluster.to_string(), catalog.clone());
        let known = catalogs.values().flatten().collect::<BTreeSet<_>>();

        let mut next = state.groups.clone();
        for kinds in next.groups.values_mut() {
            kinds.retain(|kind| known.contains(kind));
        }
        next.uncategorized.retain(|kind| known.contains(kind));

        let placed = next
            .groups
            .values()
            .flatten()
            .chain(next.uncategorized.iter())
            .cloned()
            .collect::<BTreeSet<_>>();
        let fresh = catalog
            .iter()
            .filter(|kind| !placed.contains(*kind))
            .cloned()
            .collect::<Vec<_>>();
        next.uncategorized.extend(fresh);

        if next != state.groups {
            self.persist(&next)?;
            debug!(
                "kind groups reconciled for {cluster}, {} uncategorized",
                next.uncategorized.len()
            );
            state.groups = next;
        }
        state.catalogs = catalogs;

        Ok(state.groups.clone())
    }

    pub fn create_group(&self, name: &str, members: &[String]) -> EngineResult<KindGroups> {
        let name = validate_name(name)?;
        let mut state = self.lock();
        if state.groups.groups.contains_key(&name) {
            return Err(EngineError::InvalidInput(format!(
                "group '{name}' already exists"
            )));
        }

        let mut next = state.groups.clone();
        let members = dedup(members);
        claim_members(&mut next, &members);
        next.groups.insert(name.clone(), members);

        let groups = self.commit(&mut state, next)?;
        info!("kind group {name} created");
        Ok(groups)
    }

    /// Replaces a group's members and optionally renames it.
    pub fn update_group(
        &self,
        name: &str,
        new_name: &str,
        members: &[String],
    ) -> EngineResult<KindGroups> {
        let new_name = validate_name(new_name)?;
        let mut state = self.lock();
        let mut next = state.groups.clone();
        let Some(previous) = next.groups.remove(name) else {
            return Err(EngineError::InvalidInput(format!(
                "group '{name}' does not exist"
            )));
        };

        if new_name != name && next.groups.contains_key(&new_name) {
            return Err(EngineError::InvalidInput(format!(
                "group '{new_name}' already exists"
            )));
        }

        let members = dedup(members);
        for dropped in previous.iter().filter(|kind| !members.contains(kind)) {
            if !next.uncategorized.contains(dropped) {
                next.uncategorized.push(dropped.clone());
            }
        }
        claim_members(&mut next, &members);
        next.groups.insert(new_name.clone(), members);

        let groups = self.commit(&mut state, next)?;
        info!("kind group {name} updated as {new_name}");
        Ok(groups)
    }

    pub fn delete_group(&self, name: &str) -> EngineResult<KindGroups> {
        let mut state = self.lock();
        let mut next = state.groups.clone();
        let Some(members) = next.groups.remove(name) else {
            return Err(EngineError::InvalidInput(format!(
                "group '{name}' does not exist"
            )));
        };

        for kind in members {
            if !next.uncategorized.contains(&kind) {
                next.uncategorized.push(kind);
            }
        }

        let groups = self.commit(&mut state, next)?;
        info!("kind group {name} deleted");
        Ok(groups)
    }

    fn commit(&self, state: &mut Ledger, next: KindGroups) -> EngineResult<KindGroups> {
        self.persist(&next)?;
        state.groups = next;
        Ok(state.groups.clone())
    }

    fn persist(&self, groups: &KindGroups) -> EngineResult<()> {
        match &self.path {
            Some(path) => store_json(path, groups),
            None => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_name(name: &str) -> EngineResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidInput(
            "group name must not be empty".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

fn dedup(members: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    members
        .iter()
        .filter(|kind| seen.insert(kind.as_str()))
        .cloned()
        .collect()
}

/// A kind belongs to exactly one place.
fn claim_members(state: &mut KindGroups, members: &[String]) {
    for kinds in state.groups.values_mut() {
        kinds.retain(|kind| !members.contains(kind));
    }
    state.uncategorized.retain(|kind| !members.contains(kind));
}

#[cfg(test)]
mod tests {
    use super::GroupStore;
    use crate::model::KindGroups;
    use std::collections::{BTreeMap, BTreeSet};

    fn kinds(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn catalog(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn store_with(groups: &[(&str, &[&str])], uncategorized: &[&str]) -> GroupStore {
        GroupStore::in_memory(KindGroups {
            groups: groups
                .iter()
                .map(|(name, members)| (name.to_string(), kinds(members)))
                .collect::<BTreeMap<_, _>>(),
            uncategorized: kinds(uncategorized),
        })
    }

    #[test]
    fn reconcile_keeps_present_kinds_and_prunes_missing_ones() {
        let store = store_with(&[("Workloads", &["pods", "deployments"])], &["leases"]);

        let result = store
            .reconcile("prod", &catalog(&["pods", "services"]))
            .expect("reconcile");

        assert_eq!(result.groups["Workloads"], kinds(&["pods"]));
        assert_eq!(result.uncategorized, kinds(&["services"]));
    }

    #[test]
    fn reconcile_keeps_groups_that_lost_every_member() {
        let store = store_with(&[("Storage", &["storageclasses"])], &[]);

        let result = store.reconcile("prod", &catalog(&["pods"])).expect("reconcile");

        assert_eq!(result.groups.get("Storage"), Some(&Vec::new()));
        assert_eq!(result.uncategorized, kinds(&["pods"]));
    }

    #[test]
    fn create_takes_members_from_uncategorized_and_other_groups() {
        let store = store_with(&[("Workloads", &["pods", "jobs"])], &["leases", "events"]);

        let result = store
            .create_group("Batch", &kinds(&["jobs", "leases"]))
            .expect("create");

        assert_eq!(result.groups["Workloads"], kinds(&["pods"]));
        assert_eq!(result.groups["Batch"], kinds(&["jobs", "leases"]));
        assert_eq!(result.uncategorized, kinds(&["events"]));
    }

    #[test]
    fn create_rejects_duplicate_and_blank_names() {
        let store = store_with(&[("Workloads", &["pods"])], &[]);
        assert!(store.create_group("Workloads", &[]).is_err());
        assert!(store.create_group("  ", &[]).is_err());
    }

    #[test]
    fn update_returns_dropped_members_and_renames() {
        let store = store_with(
            &[("Workloads", &["pods", "jobs"]), ("Net", &["services"])],
            &["leases"],
        );

        let result = store
            .update_group("Workloads", "Apps", &kinds(&["pods", "services", "leases"]))
            .expect("update");

        assert!(!result.groups.contains_key("Workloads"));
        assert_eq!(result.groups["Apps"], kinds(&["pods", "services", "leases"]));
        assert_eq!(result.groups["Net"], Vec::<String>::new());
        assert_eq!(result.uncategorized, kinds(&["jobs"]));
    }

    #[test]
    fn update_into_existing_name_is_rejected_without_losing_the_group() {
        let store = store_with(&[("A", &["pods"]), ("B", &["services"])], &[]);

        assert!(store.update_group("A", "B", &kinds(&["pods"])).is_err());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.groups["A"], kinds(&["pods"]));
        assert_eq!(snapshot.groups["B"], kinds(&["services"]));
    }

    #[test]
    fn delete_moves_members_to_uncategorized() {
        let store = store_with(&[("Config", &["configmaps", "leases"])], &["events"]);

        let result = store.delete_group("Config").expect("delete");

        assert!(result.groups.is_empty());
        assert_eq!(result.uncategorized, kinds(&["events", "configmaps", "leases"]));
        assert!(store.delete_group("Config").is_err());
    }

    #[test]
    fn edits_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("groups.json");

        let store = GroupStore::open(&path);
        assert!(store.snapshot().groups.contains_key("Workloads"));
        store
            .create_group("Mine", &kinds(&["pods"]))
            .expect("create");
        drop(store);

        let reopened = GroupStore::open(&path);
        let snapshot = reopened.snapshot();
        assert_eq!(snapshot.groups["Mine"], kinds(&["pods"]));
        assert!(!snapshot.groups["Workloads"].contains(&"pods".to_string()));
    }

    #[test]
    fn kinds_of_another_synced_cluster_survive_a_resync() {
        let store = store_with(&[("Mine", &["widgets"])], &[]);

        store
            .reconcile("a", &catalog(&["pods", "widgets"]))
            .expect("reconcile a");
        store.reconcile("b", &catalog(&["pods"])).expect("reconcile b");
        let result = store
            .reconcile("a", &catalog(&["pods", "widgets"]))
            .expect("reconcile a again");

        assert_eq!(result.groups["Mine"], kinds(&["widgets"]));
        assert_eq!(result.uncategorized, kinds(&["pods"]));
    }

    #[test]
    fn kind_dropped_by_its_only_cluster_is_pruned() {
        let store = store_with(&[("Mine", &["widgets"])], &[]);

        store
            .reconcile("a", &catalog(&["pods", "widgets"]))
            .expect("reconcile");
        store.reconcile("b", &catalog(&["pods"])).expect("reconcile");
        let result = store.reconcile("a", &catalog(&["pods"])).expect("reconcile");

        assert_eq!(result.groups["Mine"], Vec::<String>::new());
        assert_eq!(result.uncategorized, kinds(&["pods"]));
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").expect("blocker file");
        let store = GroupStore::open(blocker.join("groups.json"));
        let before = store.snapshot();

        assert!(store.create_group("Mine", &kinds(&["pods"])).is_err());
        assert!(store.delete_group("Workloads").is_err());
        assert!(
            store
                .reconcile("prod", &catalog(&["pods", "widgets"]))
                .is_err()
        );

        assert_eq!(store.snapshot(), before);
        assert!(!store.snapshot().groups.contains_key("Mine"));
    }
}
