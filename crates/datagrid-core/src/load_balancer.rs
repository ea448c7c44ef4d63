//! Target member selection for invocations that are not bound to a
//! partition or a member.

use parking_lot::Mutex;
use rand::Rng;
use uuid::Uuid;

use datagrid_proto::error::{ClientError, ClientResult};

use crate::options::LoadBalancerKind;

/// Picks a member id among the members the client knows about.
pub trait LoadBalancer: Send + Sync + 'static {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Number of candidate members.
    fn count(&self) -> usize;

    /// Select a member.
    fn get_member(&self) -> ClientResult<Uuid>;

    /// Replace the candidate set with the current member ids, in order.
    fn notify_members(&self, members: &[Uuid]) -> ClientResult<()>;
}

/// Create the balancer selected by the options.
pub fn from_kind(kind: LoadBalancerKind) -> Box<dyn LoadBalancer> {
    match kind {
        LoadBalancerKind::RoundRobin => Box::new(RoundRobinLoadBalancer::new()),
        LoadBalancerKind::Random => Box::new(RandomLoadBalancer::new()),
        LoadBalancerKind::Static(member) => Box::new(StaticLoadBalancer::new(member)),
    }
}

/// Always returns the configured member.
pub struct StaticLoadBalancer {
    member: Uuid,
}

impl StaticLoadBalancer {
    pub fn new(member: Uuid) -> Self {
        Self { member }
    }
}

impl LoadBalancer for StaticLoadBalancer {
    fn name(&self) -> &str {
        "static"
    }

    fn count(&self) -> usize {
        1
    }

    fn get_member(&self) -> ClientResult<Uuid> {
        Ok(self.member)
    }

    fn notify_members(&self, _members: &[Uuid]) -> ClientResult<()> {
        Err(ClientError::Unsupported(
            "static load balancer target is fixed by configuration",
        ))
    }
}

/// Picks a member uniformly at random.
#[derive(Default)]
pub struct RandomLoadBalancer {
    members: Mutex<Vec<Uuid>>,
}

impl RandomLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn name(&self) -> &str {
        "random"
    }

    fn count(&self) -> usize {
        self.members.lock().len()
    }

    fn get_member(&self) -> ClientResult<Uuid> {
        let members = self.members.lock();
        if members.is_empty() {
            return Err(ClientError::NoMembers);
        }
        let idx = rand::thread_rng().gen_range(0..members.len());
        Ok(members[idx])
    }

    fn notify_members(&self, members: &[Uuid]) -> ClientResult<()> {
        *self.members.lock() = members.to_vec();
        Ok(())
    }
}

#[derive(Default)]
struct RoundRobinState {
    members: Vec<Uuid>,
    cursor: usize,
}

/// Cycles through members in order.
///
/// The cursor is positional: replacing the member list keeps the offset,
/// so the next pick is whatever member now sits at that position.
#[derive(Default)]
pub struct RoundRobinLoadBalancer {
    state: Mutex<RoundRobinState>,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn name(&self) -> &str {
        "round-robin"
    }

    fn count(&self) -> usize {
        self.state.lock().members.len()
    }

    fn get_member(&self) -> ClientResult<Uuid> {
        let mut state = self.state.lock();
        let count = state.members.len();
        if count == 0 {
            return Err(ClientError::NoMembers);
        }
        let pos = state.cursor % count;
        state.cursor = (pos + 1) % count;
        Ok(state.members[pos])
    }

    fn notify_members(&self, members: &[Uuid]) -> ClientResult<()> {
        self.state.lock().members = members.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_static_balancer() {
        let id = Uuid::new_v4();
        let lb = StaticLoadBalancer::new(id);
        assert_eq!(lb.get_member().unwrap(), id);
        assert_eq!(lb.get_member().unwrap(), id);
        assert!(matches!(
            lb.notify_members(&ids(2)),
            Err(ClientError::Unsupported(_))
        ));
        assert_eq!(lb.count(), 1);
    }

    #[test]
    fn test_random_balancer() {
        let lb = RandomLoadBalancer::new();
        assert_eq!(lb.get_member(), Err(ClientError::NoMembers));

        let members = ids(3);
        lb.notify_members(&members).unwrap();
        assert_eq!(lb.count(), 3);

        let mut seen = HashSet::new();
        for _ in 0..300 {
            let m = lb.get_member().unwrap();
            assert!(members.contains(&m));
            seen.insert(m);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_round_robin_wraps() {
        let lb = RoundRobinLoadBalancer::new();
        assert_eq!(lb.get_member(), Err(ClientError::NoMembers));

        let members = ids(3);
        lb.notify_members(&members).unwrap();
        let picks: Vec<Uuid> = (0..4).map(|_| lb.get_member().unwrap()).collect();
        assert_eq!(picks, vec![members[0], members[1], members[2], members[0]]);
    }

    #[test]
    fn test_round_robin_cursor_survives_notify() {
        let lb = RoundRobinLoadBalancer::new();
        let members = ids(3);
        lb.notify_members(&members).unwrap();
        assert_eq!(lb.get_member().unwrap(), members[0]);
        assert_eq!(lb.get_member().unwrap(), members[1]);

        // Position 2 now holds a different member: it is the next pick.
        let replaced = vec![members[0], members[1], Uuid::new_v4()];
        lb.notify_members(&replaced).unwrap();
        assert_eq!(lb.get_member().unwrap(), replaced[2]);
        assert_eq!(lb.get_member().unwrap(), replaced[0]);
    }

    #[test]
    fn test_round_robin_shrinking_set() {
        let lb = RoundRobinLoadBalancer::new();
        let members = ids(4);
        lb.notify_members(&members).unwrap();
        for _ in 0..3 {
            lb.get_member().unwrap();
        }
        lb.notify_members(&members[..2]).unwrap();
        // cursor 3 wraps to position 1
        assert_eq!(lb.get_member().unwrap(), members[1]);
    }

    #[test]
    fn test_from_kind() {
        assert_eq!(from_kind(LoadBalancerKind::Random).name(), "random");
        assert_eq!(from_kind(LoadBalancerKind::RoundRobin).name(), "round-robin");
        assert_eq!(
            from_kind(LoadBalancerKind::Static(Uuid::nil())).name(),
            "static"
        );
    }
}
