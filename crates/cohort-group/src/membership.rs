//! Group membership view of one container.

use cohort_core::Id;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use tracing::debug;

/// Membership of the group a container belongs to.
///
/// Once connected, the container's own id is always a member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMembership {
    pub local_id: Id,
    pub group: Option<Id>,
    pub members: BTreeSet<Id>,
}

impl GroupMembership {
    pub fn is_connected(&self) -> bool {
        self.group.is_some()
    }
}

/// Owns a container's membership view. Every read hands out a copy, so
/// callers never observe the set change while iterating.
pub struct MembershipManager {
    view: RwLock<GroupMembership>,
}

impl MembershipManager {
    pub fn new(local_id: Id) -> Self {
        Self {
            view: RwLock::new(GroupMembership {
                local_id,
                group: None,
                members: BTreeSet::new(),
            }),
        }
    }

    pub fn local_id(&self) -> Id {
        self.view.read().local_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.view.read().is_connected()
    }

    pub fn group_id(&self) -> Option<Id> {
        self.view.read().group.clone()
    }

    /// Install the membership learned during a join handshake.
    pub fn join(&self, group: Id, members: impl IntoIterator<Item = Id>) {
        let mut view = self.view.write();
        let local = view.local_id.clone();
        view.members = members.into_iter().collect();
        view.members.insert(local);
        debug!(%group, members = view.members.len(), "membership installed");
        view.group = Some(group);
    }

    /// Start a new group with this container as its only member.
    pub fn found_group(&self) {
        let local = self.local_id();
        self.join(local, std::iter::empty());
    }

    /// Returns `false` if `member` was already present.
    pub fn add_member(&self, member: Id) -> bool {
        self.view.write().members.insert(member)
    }

    pub fn remove_member(&self, member: &Id) -> bool {
        let mut view = self.view.write();
        if &view.local_id == member {
            return false;
        }
        view.members.remove(member)
    }

    pub fn contains(&self, member: &Id) -> bool {
        self.view.read().members.contains(member)
    }

    /// Leave the group. Returns the peers that were members.
    pub fn clear(&self) -> Vec<Id> {
        let mut view = self.view.write();
        view.group = None;
        let local = view.local_id.clone();
        std::mem::take(&mut view.members)
            .into_iter()
            .filter(|m| m != &local)
            .collect()
    }

    /// Snapshot of the full membership, the local id included.
    pub fn members(&self) -> Vec<Id> {
        self.view.read().members.iter().cloned().collect()
    }

    /// Snapshot of every member except the local container.
    pub fn peers(&self) -> Vec<Id> {
        let view = self.view.read();
        view.members
            .iter()
            .filter(|m| *m != &view.local_id)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> GroupMembership {
        self.view.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_includes_local() {
        let manager = MembershipManager::new(Id::from("c"));
        manager.join(Id::from("s"), vec![Id::from("s"), Id::from("a")]);

        assert!(manager.is_connected());
        assert_eq!(manager.group_id(), Some(Id::from("s")));
        assert_eq!(
            manager.members(),
            vec![Id::from("a"), Id::from("c"), Id::from("s")]
        );
        assert_eq!(manager.peers(), vec![Id::from("a"), Id::from("s")]);
    }

    #[test]
    fn test_found_group() {
        let manager = MembershipManager::new(Id::from("s"));
        manager.found_group();

        assert_eq!(manager.group_id(), Some(Id::from("s")));
        assert_eq!(manager.members(), vec![Id::from("s")]);
        assert!(manager.peers().is_empty());
    }

    #[test]
    fn test_local_member_cannot_be_removed() {
        let manager = MembershipManager::new(Id::from("s"));
        manager.found_group();

        assert!(!manager.remove_member(&Id::from("s")));
        assert!(manager.contains(&Id::from("s")));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let manager = MembershipManager::new(Id::from("s"));
        manager.found_group();
        manager.add_member(Id::from("a"));

        let before = manager.members();
        manager.add_member(Id::from("b"));
        assert_eq!(before.len(), 2);
        assert_eq!(manager.members().len(), 3);
    }

    #[test]
    fn test_clear_returns_peers() {
        let manager = MembershipManager::new(Id::from("s"));
        manager.found_group();
        assert!(manager.add_member(Id::from("a")));
        assert!(!manager.add_member(Id::from("a")));

        assert_eq!(manager.clear(), vec![Id::from("a")]);
        assert!(!manager.is_connected());
        assert!(manager.members().is_empty());
    }
}
