//! User and group tables with the administrative rules around them.
//!
//! Each mutating method checks its preconditions first and only then
//! changes anything, returning whether state actually changed so the
//! caller knows what to journal. No-op requests (joining a member, demoting
//! a non-admin, ...) succeed without a change.

use std::collections::BTreeMap;

use cfat_core::{CfatError, CfatResult};
use cfat_crypto::verify_password;
use tracing::{debug, info};

use crate::model::{
    Group, GroupId, User, UserId, EVERYBODY_GROUP, EVERYBODY_NAME, ROOT_NAME, ROOT_USER,
};

#[derive(Debug, Clone, Default)]
pub struct Accounts {
    users: BTreeMap<UserId, User>,
    groups: BTreeMap<GroupId, Group>,
    next_user: UserId,
    /// Never handed out twice, since permissions outlive their group
    next_group: GroupId,
}

impl Accounts {
    /// Fresh tables: the root user and the everybody group it administers.
    pub fn bootstrap(root_password_hash: String) -> Self {
        let root = User {
            id: ROOT_USER,
            password_hash: root_password_hash,
            name: ROOT_NAME.to_string(),
        };
        let everybody = Group::new(EVERYBODY_GROUP, EVERYBODY_NAME, ROOT_USER);
        Accounts {
            users: BTreeMap::from([(ROOT_USER, root)]),
            groups: BTreeMap::from([(EVERYBODY_GROUP, everybody)]),
            next_user: ROOT_USER + 1,
            next_group: EVERYBODY_GROUP + 1,
        }
    }

    pub fn from_tables(users: Vec<User>, groups: Vec<Group>) -> CfatResult<Self> {
        let mut accounts = Accounts::default();
        for user in users {
            accounts.insert_user(user);
        }
        for group in groups {
            accounts.insert_group(group);
        }
        accounts.validate()?;
        Ok(accounts)
    }

    pub fn validate(&self) -> CfatResult<()> {
        if !self.users.contains_key(&ROOT_USER) {
            return Err(CfatError::CorruptData("user table has no root".into()));
        }
        if !self.groups.contains_key(&EVERYBODY_GROUP) {
            return Err(CfatError::CorruptData(
                "group table has no everybody group".into(),
            ));
        }
        Ok(())
    }

    pub fn users(&self) -> &BTreeMap<UserId, User> {
        &self.users
    }

    pub fn groups(&self) -> &BTreeMap<GroupId, Group> {
        &self.groups
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&User> {
        self.users.values().find(|u| u.name == name)
    }

    pub fn group_by_name(&self, name: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.name == name)
    }

    /// Unknown acting users are denied everything.
    pub fn require_user(&self, acting: UserId, op: &'static str) -> CfatResult<()> {
        if self.users.contains_key(&acting) {
            Ok(())
        } else {
            Err(CfatError::denied(op, format!("unknown user {acting}")))
        }
    }

    /// An unknown name costs one verification against root's hash, so it
    /// takes as long as a wrong password.
    pub fn authenticate(&self, name: &str, prehash: &str) -> CfatResult<UserId> {
        let Some(user) = self.user_by_name(name) else {
            if let Some(root) = self.users.get(&ROOT_USER) {
                verify_password(prehash, &root.password_hash);
            }
            return Err(CfatError::AuthenticationFailure);
        };
        if !verify_password(prehash, &user.password_hash) {
            return Err(CfatError::AuthenticationFailure);
        }
        debug!(user = user.id, "authenticated");
        Ok(user.id)
    }

    /// Everything [`add_user`](Self::add_user) checks, without mutating.
    /// Lets the caller skip an expensive password hash for a doomed request.
    pub fn check_add_user(&self, acting: UserId, name: &str) -> CfatResult<()> {
        if acting != ROOT_USER {
            return Err(CfatError::denied("add user", name));
        }
        check_name("add user", name)?;
        if self.user_by_name(name).is_some() {
            return Err(CfatError::illegal("add user", name, "name already taken"));
        }
        Ok(())
    }

    /// Root only. The new user joins the everybody group.
    pub fn add_user(
        &mut self,
        acting: UserId,
        name: &str,
        password_hash: String,
    ) -> CfatResult<UserId> {
        self.check_add_user(acting, name)?;
        let id = self.next_user;
        self.next_user += 1;
        self.users.insert(
            id,
            User {
                id,
                password_hash,
                name: name.to_string(),
            },
        );
        if let Some(everybody) = self.groups.get_mut(&EVERYBODY_GROUP) {
            everybody.members.insert(id);
        }
        info!(user = id, name, "user added");
        Ok(id)
    }

    /// Root only; root itself cannot be removed. Returns the groups the user
    /// was purged from. Ownership transfer is the caller's job.
    pub fn remove_user(&mut self, acting: UserId, target: UserId) -> CfatResult<Vec<GroupId>> {
        if acting != ROOT_USER {
            return Err(CfatError::denied("remove user", target));
        }
        if target == ROOT_USER {
            return Err(CfatError::illegal("remove user", ROOT_NAME, "root cannot be removed"));
        }
        if !self.users.contains_key(&target) {
            return Err(CfatError::illegal("remove user", target, "no such user"));
        }

        let mut touched = Vec::new();
        for group in self.groups.values_mut() {
            let was_member = group.members.remove(&target);
            let was_admin = group.admins.remove(&target);
            if was_member || was_admin {
                touched.push(group.id);
            }
        }
        self.users.remove(&target);
        info!(user = target, groups = touched.len(), "user removed");
        Ok(touched)
    }

    /// Users change their own password; root may change anyone's.
    pub fn set_password(
        &mut self,
        acting: UserId,
        target: UserId,
        password_hash: String,
    ) -> CfatResult<()> {
        if acting != target && acting != ROOT_USER {
            return Err(CfatError::denied("set password", target));
        }
        let user = self
            .users
            .get_mut(&target)
            .ok_or_else(|| CfatError::illegal("set password", target, "no such user"))?;
        user.password_hash = password_hash;
        Ok(())
    }

    /// Any user may found a group and becomes its first member and admin.
    pub fn add_group(&mut self, acting: UserId, name: &str) -> CfatResult<GroupId> {
        self.require_user(acting, "add group")?;
        check_name("add group", name)?;
        if self.group_by_name(name).is_some() {
            return Err(CfatError::illegal("add group", name, "name already taken"));
        }
        let id = self.next_group;
        self.next_group += 1;
        self.groups.insert(id, Group::new(id, name, acting));
        info!(group = id, name, founder = acting, "group added");
        Ok(id)
    }

    /// Group admins or root. Permissions naming the group are left in place
    /// and ignored from here on.
    pub fn remove_group(&mut self, acting: UserId, group: GroupId) -> CfatResult<()> {
        if group == EVERYBODY_GROUP {
            return Err(CfatError::illegal(
                "remove group",
                EVERYBODY_NAME,
                "the everybody group cannot be removed",
            ));
        }
        self.admin_of(acting, group, "remove group")?;
        self.groups.remove(&group);
        info!(group, "group removed");
        Ok(())
    }

    pub fn join(&mut self, acting: UserId, user: UserId, group: GroupId) -> CfatResult<bool> {
        self.admin_of(acting, group, "join group")?;
        if !self.users.contains_key(&user) {
            return Err(CfatError::illegal("join group", user, "no such user"));
        }
        Ok(self.group_mut(group, "join group")?.members.insert(user))
    }

    /// Only root may kick a group admin. Nobody leaves everybody.
    pub fn kick(&mut self, acting: UserId, user: UserId, group: GroupId) -> CfatResult<bool> {
        if group == EVERYBODY_GROUP {
            return Err(CfatError::illegal(
                "kick user",
                EVERYBODY_NAME,
                "every user belongs to the everybody group",
            ));
        }
        let g = self.admin_of(acting, group, "kick user")?;
        if !g.is_member(user) && !g.is_admin(user) {
            return Ok(false);
        }
        if g.is_admin(user) && acting != ROOT_USER {
            return Err(CfatError::denied("kick user", format!("admin {user}")));
        }
        let g = self.group_mut(group, "kick user")?;
        g.members.remove(&user);
        g.admins.remove(&user);
        Ok(true)
    }

    /// Admins may promote existing members.
    pub fn promote(&mut self, acting: UserId, user: UserId, group: GroupId) -> CfatResult<bool> {
        let g = self.admin_of(acting, group, "promote user")?;
        if !g.is_member(user) {
            return Err(CfatError::illegal(
                "promote user",
                user,
                "only members can become admins",
            ));
        }
        Ok(self.group_mut(group, "promote user")?.admins.insert(user))
    }

    /// Root only.
    pub fn demote(&mut self, acting: UserId, user: UserId, group: GroupId) -> CfatResult<bool> {
        if acting != ROOT_USER {
            return Err(CfatError::denied("demote user", user));
        }
        Ok(self.group_mut(group, "demote user")?.admins.remove(&user))
    }

    /// Keep group ids still named by some permission out of circulation.
    pub(crate) fn reserve_group_ids(&mut self, referenced: impl IntoIterator<Item = GroupId>) {
        if let Some(max) = referenced.into_iter().max() {
            self.next_group = self.next_group.max(max + 1);
        }
    }

    pub(crate) fn insert_user(&mut self, user: User) {
        self.next_user = self.next_user.max(user.id + 1);
        self.users.insert(user.id, user);
    }

    pub(crate) fn insert_group(&mut self, group: Group) {
        self.next_group = self.next_group.max(group.id + 1);
        self.groups.insert(group.id, group);
    }

    pub(crate) fn drop_user(&mut self, id: UserId) {
        self.users.remove(&id);
    }

    pub(crate) fn drop_group(&mut self, id: GroupId) {
        self.groups.remove(&id);
    }

    fn admin_of(&self, acting: UserId, group: GroupId, op: &'static str) -> CfatResult<&Group> {
        let g = self
            .groups
            .get(&group)
            .ok_or_else(|| CfatError::illegal(op, group, "no such group"))?;
        if acting == ROOT_USER || g.is_admin(acting) {
            Ok(g)
        } else {
            Err(CfatError::denied(op, &g.name))
        }
    }

    fn group_mut(&mut self, group: GroupId, op: &'static str) -> CfatResult<&mut Group> {
        self.groups
            .get_mut(&group)
            .ok_or_else(|| CfatError::illegal(op, group, "no such group"))
    }
}

fn check_name(op: &'static str, name: &str) -> CfatResult<()> {
    if name.is_empty() || name.contains(['\n', '\0']) {
        return Err(CfatError::illegal(op, format!("{name:?}"), "invalid name"));
    }
    Ok(())
}
