//! Stable member-group selection for multi-member routing.
//!
//! Members push views of the cluster split into disjoint groups. The client
//! keeps connections to exactly one of them, and when a newer view arrives
//! it moves to the group that overlaps most with the one it already uses,
//! so that existing connections survive view changes.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use datagrid_proto::groups::MemberGroups;

#[derive(Debug, Clone)]
struct SelectedGroup {
    cluster_id: Uuid,
    version: i32,
    members: HashSet<Uuid>,
}

/// The member group the client routes to.
#[derive(Default)]
pub struct MemberPartitionGroup {
    current: Mutex<Option<SelectedGroup>>,
}

impl MemberPartitionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a member-group view. Returns `true` if it was accepted.
    ///
    /// A view from another cluster always replaces the current one; a view
    /// from the same cluster must carry a higher version.
    pub fn set_subset_members(&self, view: &MemberGroups) -> bool {
        let mut current = self.current.lock();

        let members = match current.as_ref() {
            Some(selected) if selected.cluster_id == view.cluster_id => {
                if view.version <= selected.version {
                    debug!(
                        "partition group: ignoring stale view {} (current {})",
                        view.version, selected.version
                    );
                    return false;
                }
                best_overlap(&view.groups, &selected.members)
            }
            _ => initial_group(view),
        };

        info!(
            "partition group: selected {} members at version {} of cluster {}",
            members.len(),
            view.version,
            view.cluster_id
        );
        *current = Some(SelectedGroup {
            cluster_id: view.cluster_id,
            version: view.version,
            members,
        });
        true
    }

    /// Drop a member known to be gone. The version is left unchanged.
    pub fn remove_subset_member(&self, member_id: &Uuid) {
        if let Some(selected) = self.current.lock().as_mut() {
            selected.members.remove(member_id);
        }
    }

    /// Snapshot of the selected group (empty before the first view).
    pub fn selected_group(&self) -> HashSet<Uuid> {
        self.current
            .lock()
            .as_ref()
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, member_id: &Uuid) -> bool {
        self.current
            .lock()
            .as_ref()
            .map_or(false, |s| s.members.contains(member_id))
    }

    pub fn version(&self) -> Option<i32> {
        self.current.lock().as_ref().map(|s| s.version)
    }

    pub fn cluster_id(&self) -> Option<Uuid> {
        self.current.lock().as_ref().map(|s| s.cluster_id)
    }

    pub fn clear(&self) {
        *self.current.lock() = None;
    }
}

/// The group holding the member that sent the view, else the largest one.
fn initial_group(view: &MemberGroups) -> HashSet<Uuid> {
    view.group_of(&view.member_received_from)
        .or_else(|| largest(&view.groups))
        .cloned()
        .unwrap_or_default()
}

fn largest(groups: &[HashSet<Uuid>]) -> Option<&HashSet<Uuid>> {
    // max_by_key keeps the last maximum; prefer the first one.
    groups.iter().rev().max_by_key(|g| g.len())
}

/// Largest intersection with `selected`, ties broken by group size.
fn best_overlap(groups: &[HashSet<Uuid>], selected: &HashSet<Uuid>) -> HashSet<Uuid> {
    groups
        .iter()
        .rev()
        .max_by_key(|g| (g.intersection(selected).count(), g.len()))
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn set(members: &[Uuid]) -> HashSet<Uuid> {
        members.iter().copied().collect()
    }

    #[test]
    fn test_first_view_selects_sender_group() {
        let m = ids(4);
        let cluster = Uuid::new_v4();
        let group = MemberPartitionGroup::new();
        let view = MemberGroups::new(vec![set(&m[0..3]), set(&m[3..4])], 1, cluster, m[3]);
        assert!(group.set_subset_members(&view));
        assert_eq!(group.selected_group(), set(&m[3..4]));
        assert_eq!(group.version(), Some(1));
    }

    #[test]
    fn test_unknown_sender_falls_back_to_largest() {
        let m = ids(4);
        let group = MemberPartitionGroup::new();
        let view = MemberGroups::new(vec![set(&m[0..1]), set(&m[1..4])], 1, Uuid::new_v4(), Uuid::new_v4());
        group.set_subset_members(&view);
        assert_eq!(group.selected_group(), set(&m[1..4]));
    }

    #[test]
    fn test_stale_view_from_same_cluster_is_ignored() {
        let m = ids(4);
        let cluster = Uuid::new_v4();
        let group = MemberPartitionGroup::new();
        group.set_subset_members(&MemberGroups::new(vec![set(&m[0..2])], 5, cluster, m[0]));

        let stale = MemberGroups::new(vec![set(&m[2..4])], 5, cluster, m[2]);
        assert!(!group.set_subset_members(&stale));
        let older = MemberGroups::new(vec![set(&m[2..4])], 4, cluster, m[2]);
        assert!(!group.set_subset_members(&older));
        assert_eq!(group.selected_group(), set(&m[0..2]));
        assert_eq!(group.version(), Some(5));
    }

    #[test]
    fn test_new_cluster_always_wins() {
        let m = ids(4);
        let group = MemberPartitionGroup::new();
        group.set_subset_members(&MemberGroups::new(vec![set(&m[0..2])], 10, Uuid::new_v4(), m[0]));

        let other = Uuid::new_v4();
        assert!(group.set_subset_members(&MemberGroups::new(vec![set(&m[2..4])], 1, other, m[2])));
        assert_eq!(group.cluster_id(), Some(other));
        assert_eq!(group.version(), Some(1));
        assert_eq!(group.selected_group(), set(&m[2..4]));
    }

    #[test]
    fn test_newer_view_maximizes_overlap() {
        let m = ids(6);
        let cluster = Uuid::new_v4();
        let group = MemberPartitionGroup::new();
        group.set_subset_members(&MemberGroups::new(vec![set(&m[0..3])], 1, cluster, m[0]));

        // {m0} overlaps once, {m1, m2, m5} overlaps twice.
        let view = MemberGroups::new(
            vec![set(&[m[0], m[3], m[4]]), set(&[m[1], m[2], m[5]])],
            2,
            cluster,
            m[0],
        );
        assert!(group.set_subset_members(&view));
        assert_eq!(group.selected_group(), set(&[m[1], m[2], m[5]]));
    }

    #[test]
    fn test_overlap_tie_prefers_larger_group() {
        let m = ids(5);
        let cluster = Uuid::new_v4();
        let group = MemberPartitionGroup::new();
        group.set_subset_members(&MemberGroups::new(vec![set(&m[0..2])], 1, cluster, m[0]));

        let view = MemberGroups::new(
            vec![set(&[m[0]]), set(&[m[1], m[2], m[3]])],
            2,
            cluster,
            m[0],
        );
        group.set_subset_members(&view);
        assert_eq!(group.selected_group(), set(&[m[1], m[2], m[3]]));
    }

    #[test]
    fn test_remove_member_keeps_version() {
        let m = ids(3);
        let group = MemberPartitionGroup::new();
        group.set_subset_members(&MemberGroups::new(vec![set(&m)], 3, Uuid::new_v4(), m[0]));
        group.remove_subset_member(&m[1]);
        assert!(!group.contains(&m[1]));
        assert!(group.contains(&m[0]));
        assert_eq!(group.version(), Some(3));
    }
}
