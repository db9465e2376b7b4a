//! Collaborator interfaces the engine talks to
//!
//! The engine never touches SQL. It reads parent facts and roles, writes child
//! memberships, attributed grants and group memberships, and groups the writes
//! of one (user, link) unit into a transaction, all through these traits.
//! [`roster::RosterDb`] implements every one of them (see `sqlite.rs`).

mod sqlite;

use crate::model::{
    AttributedRoleGrant, ChildMembership, Course, CourseId, Group, GroupId, GroupMembership, Link,
    LinkId, NewLink, ParentMembershipFact, RoleId, UserId,
};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Parent facts in, child memberships out
pub trait MembershipStore {
    /// Facts of users in the link's parent group, from globally enabled plugins
    /// other than this engine (`user = None` returns every user)
    fn parent_facts(&self, link: &Link, user: Option<UserId>) -> Result<Vec<ParentMembershipFact>>;

    fn child_membership(&self, link: LinkId, user: UserId) -> Result<Option<ChildMembership>>;

    fn child_memberships(&self, link: LinkId) -> Result<Vec<ChildMembership>>;

    fn create_child_membership(&self, membership: &ChildMembership) -> Result<()>;

    /// Overwrite status and validity window
    fn update_child_membership(&self, membership: &ChildMembership) -> Result<()>;

    fn remove_child_membership(&self, link: LinkId, user: UserId) -> Result<()>;
}

/// Role assignments
pub trait RoleStore {
    /// (user, role) pairs held in a course, excluding roles this engine granted
    fn parent_roles(&self, course: CourseId, user: Option<UserId>) -> Result<Vec<(UserId, RoleId)>>;

    fn attributed_roles(&self, link: LinkId, user: Option<UserId>) -> Result<Vec<AttributedRoleGrant>>;

    fn grant_role(&self, grant: &AttributedRoleGrant) -> Result<()>;

    fn revoke_role(&self, grant: &AttributedRoleGrant) -> Result<()>;

    /// Revoke every grant attributed to one link, optionally for one user
    fn revoke_all_for_item(&self, link: LinkId, user: Option<UserId>) -> Result<usize>;

    /// Revoke every grant this engine ever made
    fn revoke_all_attributed(&self) -> Result<usize>;
}

/// A membership added to or removed from a child group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChange {
    pub user: UserId,
    pub course: CourseId,
    pub group: GroupId,
    pub group_name: String,
}

/// Result of one group-sync call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSyncOutcome {
    pub added: Vec<GroupChange>,
    pub removed: Vec<GroupChange>,
}

impl GroupSyncOutcome {
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

/// Child group memberships
pub trait GroupSync {
    fn add_group_member(&self, membership: &GroupMembership) -> Result<()>;

    fn remove_attributed_group_members(&self, link: LinkId, user: Option<UserId>) -> Result<usize>;

    /// Align group memberships written under `component` with child memberships
    fn sync_groups_for_attribution(
        &self,
        component: &str,
        scope: Option<CourseId>,
    ) -> Result<GroupSyncOutcome>;
}

/// Groups the writes of one unit
pub trait UnitOfWork {
    /// Run `work` so that all of its writes land or none do
    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Link persistence
pub trait LinkStore {
    /// Links feeding a child course, or every link, ordered by id
    fn links(&self, child_course: Option<CourseId>) -> Result<Vec<Link>>;

    /// Links reading from a parent course, ordered by id
    fn links_for_parent(&self, parent_course: CourseId) -> Result<Vec<Link>>;

    fn link(&self, id: LinkId) -> Result<Option<Link>>;

    fn insert_link(&self, name: &str, link: &NewLink, child_group: Option<GroupId>) -> Result<Link>;

    fn set_link_enabled(&self, id: LinkId, enabled: bool) -> Result<()>;

    /// Store name, parent group, child group and default role of a link
    fn update_link(&self, link: &Link) -> Result<()>;

    /// Delete the link row and the child memberships it owns
    fn delete_link(&self, id: LinkId) -> Result<bool>;
}

/// Courses and groups
pub trait CourseDirectory {
    fn course(&self, id: CourseId) -> Result<Option<Course>>;

    fn group(&self, id: GroupId) -> Result<Option<Group>>;

    fn groups_in_course(&self, course: CourseId) -> Result<Vec<Group>>;

    fn group_name_exists(&self, course: CourseId, name: &str) -> Result<bool>;

    fn create_group(&self, course: CourseId, name: &str) -> Result<GroupId>;
}

/// Everything the engine needs from its store
pub trait SyncStore:
    MembershipStore + RoleStore + GroupSync + UnitOfWork + LinkStore + CourseDirectory
{
}

impl<T> SyncStore for T where
    T: MembershipStore + RoleStore + GroupSync + UnitOfWork + LinkStore + CourseDirectory
{
}
