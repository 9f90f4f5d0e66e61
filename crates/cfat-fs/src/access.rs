//! Permission evaluation.
//!
//! A user may read (write) an entry if they own it, or if any group holding
//! the read (write) bit on the entry counts them as a member. Superuser
//! status plays no part here; root is special only for account operations.

use std::collections::BTreeMap;

use tracing::warn;

use crate::model::{Access, DirEntry, Group, GroupId, UserId};

pub fn can_read(user: UserId, entry: &DirEntry, groups: &BTreeMap<GroupId, Group>) -> bool {
    granted(user, entry, groups, |a| a.read)
}

pub fn can_write(user: UserId, entry: &DirEntry, groups: &BTreeMap<GroupId, Group>) -> bool {
    granted(user, entry, groups, |a| a.write)
}

fn granted(
    user: UserId,
    entry: &DirEntry,
    groups: &BTreeMap<GroupId, Group>,
    bit: impl Fn(&Access) -> bool,
) -> bool {
    if entry.owner == user {
        return true;
    }
    entry
        .permissions
        .iter()
        .filter(|(_, access)| bit(access))
        .any(|(gid, _)| match groups.get(gid) {
            Some(group) => group.is_member(user),
            None => {
                warn!(entry = %entry.id, group = gid, "permission names a missing group; skipped");
                false
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DirentId, Permission, EVERYBODY_GROUP};
    use proptest::collection::{btree_map, btree_set};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn groups() -> BTreeMap<GroupId, Group> {
        let mut everybody = Group::new(EVERYBODY_GROUP, "everybody", 0);
        everybody.members.extend([1, 2]);
        let staff = Group::new(5, "staff", 1);
        BTreeMap::from([(EVERYBODY_GROUP, everybody), (5, staff)])
    }

    fn entry(owner: UserId) -> DirEntry {
        DirEntry::new_file(DirentId::from("e"), "e", DirentId::root(), owner)
    }

    #[test]
    fn test_owner_always_allowed() {
        let e = entry(2);
        assert!(can_read(2, &e, &groups()));
        assert!(can_write(2, &e, &groups()));
        assert!(!can_read(1, &e, &groups()));
    }

    #[test]
    fn test_group_bits_are_independent() {
        let mut e = entry(0);
        e.grant(Permission::new(EVERYBODY_GROUP, true, false));
        e.grant(Permission::new(5, false, true));

        assert!(can_read(2, &e, &groups()));
        assert!(!can_write(2, &e, &groups()));
        // user 1 is in both groups
        assert!(can_read(1, &e, &groups()));
        assert!(can_write(1, &e, &groups()));
    }

    #[test]
    fn test_root_is_not_special() {
        let mut e = entry(1);
        e.grant(Permission::new(5, true, true));
        assert!(!can_read(0, &e, &groups()));
    }

    #[test]
    fn test_missing_group_is_skipped() {
        let mut e = entry(0);
        e.grant(Permission::new(99, true, true));
        e.grant(Permission::new(5, true, false));
        assert!(can_read(1, &e, &groups()));
        assert!(!can_write(1, &e, &groups()));
    }

    fn group_table(memberships: &BTreeMap<GroupId, BTreeSet<UserId>>) -> BTreeMap<GroupId, Group> {
        memberships
            .iter()
            .map(|(&id, members)| {
                let group = Group {
                    id,
                    name: format!("g{id}"),
                    members: members.clone(),
                    admins: BTreeSet::new(),
                };
                (id, group)
            })
            .collect()
    }

    /// Whether some existing group holding the chosen bit lists `user`.
    fn member_of_granted(
        user: UserId,
        grants: &BTreeMap<GroupId, (bool, bool)>,
        memberships: &BTreeMap<GroupId, BTreeSet<UserId>>,
        bit: impl Fn(&(bool, bool)) -> bool,
    ) -> bool {
        grants
            .iter()
            .filter(|(_, bits)| bit(bits))
            .any(|(gid, _)| memberships.get(gid).is_some_and(|m| m.contains(&user)))
    }

    proptest! {
        // group ids 6 and 7 are never created, so grants to them dangle
        #[test]
        fn write_iff_owner_or_member_of_writer_group(
            memberships in btree_map(0u32..6, btree_set(0u32..6, 0..4), 0..5),
            grants in btree_map(0u32..8, (any::<bool>(), any::<bool>()), 0..6),
            owner in 0u32..6,
            user in 0u32..6,
        ) {
            let mut e = entry(owner);
            for (&gid, &(read, write)) in &grants {
                e.grant(Permission::new(gid, read, write));
            }
            let groups = group_table(&memberships);

            let expected = user == owner || member_of_granted(user, &grants, &memberships, |b| b.1);
            prop_assert_eq!(can_write(user, &e, &groups), expected);
        }

        #[test]
        fn read_iff_owner_or_member_of_reader_group(
            memberships in btree_map(0u32..6, btree_set(0u32..6, 0..4), 0..5),
            grants in btree_map(0u32..8, (any::<bool>(), any::<bool>()), 0..6),
            owner in 0u32..6,
            user in 0u32..6,
        ) {
            let mut e = entry(owner);
            for (&gid, &(read, write)) in &grants {
                e.grant(Permission::new(gid, read, write));
            }
            let groups = group_table(&memberships);

            let expected = user == owner || member_of_granted(user, &grants, &memberships, |b| b.0);
            prop_assert_eq!(can_read(user, &e, &groups), expected);
        }
    }
}
