/// Server-pushed member-group views used by multi-member routing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A view of the cluster split into disjoint member groups.
///
/// Members push these views both in the authentication response and later
/// as events. The client keeps exactly one of the groups (see
/// `MemberPartitionGroup` in `datagrid-core`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberGroups {
    /// Disjoint member-id groups, in server order.
    pub groups: Vec<HashSet<Uuid>>,
    /// Version of the view, monotonic within one cluster.
    pub version: i32,
    /// Cluster the view belongs to.
    pub cluster_id: Uuid,
    /// Member that sent the view.
    pub member_received_from: Uuid,
}

impl MemberGroups {
    pub fn new(
        groups: Vec<HashSet<Uuid>>,
        version: i32,
        cluster_id: Uuid,
        member_received_from: Uuid,
    ) -> Self {
        Self {
            groups,
            version,
            cluster_id,
            member_received_from,
        }
    }

    /// The group containing `member`, if any.
    pub fn group_of(&self, member: &Uuid) -> Option<&HashSet<Uuid>> {
        self.groups.iter().find(|g| g.contains(member))
    }
}
