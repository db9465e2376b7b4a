//! Store traits over the SQLite roster

use super::{
    CourseDirectory, GroupChange, GroupSync, GroupSyncOutcome, LinkStore, MembershipStore,
    RoleStore, UnitOfWork,
};
use crate::model::{
    AttributedRoleGrant, ChildMembership, Course, CourseId, Group, GroupId, GroupMembership, Link,
    LinkId, MembershipStatus, NewLink, ParentMembershipFact, RoleId, SourceId, SourceStatus,
    UserId, ValidityWindow, COMPONENT,
};
use crate::{Result, SyncError};
use roster::{ChildEnrolment, NewLinkRecord, RosterDb};

fn child_row(membership: &ChildMembership) -> ChildEnrolment {
    ChildEnrolment {
        link_id: membership.link.get(),
        user_id: membership.user.get(),
        status: membership.status.into(),
        time_start: membership.window.start,
        time_end: membership.window.stored_end(),
    }
}

fn child_membership_from_row(row: ChildEnrolment) -> ChildMembership {
    ChildMembership {
        user: UserId::new(row.user_id),
        link: LinkId::new(row.link_id),
        status: MembershipStatus::from(row.status),
        window: ValidityWindow::from_stored(row.time_start, row.time_end),
    }
}

fn grant_from_row(row: roster::RoleAssignment) -> AttributedRoleGrant {
    AttributedRoleGrant::new(
        UserId::new(row.user_id),
        CourseId::new(row.course_id),
        RoleId::new(row.role_id),
        LinkId::new(row.item_id),
    )
}

fn group_change(change: roster::GroupChange) -> GroupChange {
    GroupChange {
        user: UserId::new(change.user_id),
        course: CourseId::new(change.course_id),
        group: GroupId::new(change.group_id),
        group_name: change.group_name,
    }
}

impl MembershipStore for RosterDb {
    fn parent_facts(&self, link: &Link, user: Option<UserId>) -> Result<Vec<ParentMembershipFact>> {
        let rows = self.parent_enrolments(
            link.parent_course.get(),
            link.parent_group.get(),
            user.map(UserId::get),
            COMPONENT,
        )?;
        Ok(rows
            .into_iter()
            .map(|row| ParentMembershipFact {
                user: UserId::new(row.user_id),
                source: SourceId::new(row.source_id),
                status: MembershipStatus::from(row.status),
                window: ValidityWindow::from_stored(row.time_start, row.time_end),
                source_status: SourceStatus::from(row.source_enabled),
            })
            .collect())
    }

    fn child_membership(&self, link: LinkId, user: UserId) -> Result<Option<ChildMembership>> {
        Ok(self
            .child_enrolment(link.get(), user.get())?
            .map(child_membership_from_row))
    }

    fn child_memberships(&self, link: LinkId) -> Result<Vec<ChildMembership>> {
        Ok(self
            .child_enrolments(link.get())?
            .into_iter()
            .map(child_membership_from_row)
            .collect())
    }

    fn create_child_membership(&self, membership: &ChildMembership) -> Result<()> {
        self.insert_child_enrolment(&child_row(membership))?;
        Ok(())
    }

    fn update_child_membership(&self, membership: &ChildMembership) -> Result<()> {
        if !self.update_child_enrolment(&child_row(membership))? {
            return Err(SyncError::NotFound(format!(
                "membership of user {} under link {}",
                membership.user, membership.link
            )));
        }
        Ok(())
    }

    fn remove_child_membership(&self, link: LinkId, user: UserId) -> Result<()> {
        self.delete_child_enrolment(link.get(), user.get())?;
        Ok(())
    }
}

impl RoleStore for RosterDb {
    fn parent_roles(&self, course: CourseId, user: Option<UserId>) -> Result<Vec<(UserId, RoleId)>> {
        Ok(self
            .course_role_assignments(course.get(), user.map(UserId::get), COMPONENT)?
            .into_iter()
            .map(|ra| (UserId::new(ra.user_id), RoleId::new(ra.role_id)))
            .collect())
    }

    fn attributed_roles(&self, link: LinkId, user: Option<UserId>) -> Result<Vec<AttributedRoleGrant>> {
        Ok(self
            .attributed_role_assignments(COMPONENT, Some(link.get()), user.map(UserId::get))?
            .into_iter()
            .map(grant_from_row)
            .collect())
    }

    fn grant_role(&self, grant: &AttributedRoleGrant) -> Result<()> {
        self.assign_role(
            grant.user.get(),
            grant.course.get(),
            grant.role.get(),
            &grant.attribution.component,
            grant.attribution.item.get(),
        )?;
        Ok(())
    }

    fn revoke_role(&self, grant: &AttributedRoleGrant) -> Result<()> {
        self.unassign_role(
            grant.user.get(),
            grant.course.get(),
            grant.role.get(),
            &grant.attribution.component,
            grant.attribution.item.get(),
        )?;
        Ok(())
    }

    fn revoke_all_for_item(&self, link: LinkId, user: Option<UserId>) -> Result<usize> {
        Ok(self.unassign_all(COMPONENT, Some(link.get()), user.map(UserId::get))?)
    }

    fn revoke_all_attributed(&self) -> Result<usize> {
        Ok(self.unassign_all(COMPONENT, None, None)?)
    }
}

impl GroupSync for RosterDb {
    fn add_group_member(&self, membership: &GroupMembership) -> Result<()> {
        RosterDb::add_group_member(
            self,
            membership.group.get(),
            membership.user.get(),
            &membership.attribution.component,
            membership.attribution.item.get(),
        )?;
        Ok(())
    }

    fn remove_attributed_group_members(&self, link: LinkId, user: Option<UserId>) -> Result<usize> {
        Ok(RosterDb::remove_attributed_group_members(
            self,
            COMPONENT,
            link.get(),
            user.map(UserId::get),
        )?)
    }

    fn sync_groups_for_attribution(
        &self,
        component: &str,
        scope: Option<CourseId>,
    ) -> Result<GroupSyncOutcome> {
        let result = self.sync_groups_with_enrolment(component, scope.map(CourseId::get))?;
        Ok(GroupSyncOutcome {
            added: result.added.into_iter().map(group_change).collect(),
            removed: result.removed.into_iter().map(group_change).collect(),
        })
    }
}

impl UnitOfWork for RosterDb {
    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        RosterDb::atomically(self, || work())
    }
}

impl LinkStore for RosterDb {
    fn links(&self, child_course: Option<CourseId>) -> Result<Vec<Link>> {
        Ok(RosterDb::links(self, child_course.map(CourseId::get))?
            .into_iter()
            .map(Link::from)
            .collect())
    }

    fn links_for_parent(&self, parent_course: CourseId) -> Result<Vec<Link>> {
        Ok(RosterDb::links_for_parent(self, parent_course.get())?
            .into_iter()
            .map(Link::from)
            .collect())
    }

    fn link(&self, id: LinkId) -> Result<Option<Link>> {
        Ok(RosterDb::link(self, id.get())?.map(Link::from))
    }

    fn insert_link(&self, name: &str, link: &NewLink, child_group: Option<GroupId>) -> Result<Link> {
        let id = RosterDb::insert_link(
            self,
            &NewLinkRecord {
                name: name.to_string(),
                child_course: link.child_course.get(),
                parent_course: link.parent_course.get(),
                parent_group: link.parent_group.get(),
                child_group: child_group.map(GroupId::get),
                enabled: link.enabled,
                default_role: link.default_role.get(),
            },
        )?;
        Ok(Link {
            id: LinkId::new(id),
            name: name.to_string(),
            child_course: link.child_course,
            parent_course: link.parent_course,
            parent_group: link.parent_group,
            child_group,
            enabled: link.enabled,
            default_role: link.default_role,
        })
    }

    fn set_link_enabled(&self, id: LinkId, enabled: bool) -> Result<()> {
        RosterDb::set_link_enabled(self, id.get(), enabled)?;
        Ok(())
    }

    fn update_link(&self, link: &Link) -> Result<()> {
        RosterDb::update_link(
            self,
            link.id.get(),
            &NewLinkRecord {
                name: link.name.clone(),
                child_course: link.child_course.get(),
                parent_course: link.parent_course.get(),
                parent_group: link.parent_group.get(),
                child_group: link.child_group.map(GroupId::get),
                enabled: link.enabled,
                default_role: link.default_role.get(),
            },
        )?;
        Ok(())
    }

    fn delete_link(&self, id: LinkId) -> Result<bool> {
        Ok(RosterDb::delete_link(self, id.get())?)
    }
}

impl CourseDirectory for RosterDb {
    fn course(&self, id: CourseId) -> Result<Option<Course>> {
        Ok(RosterDb::course(self, id.get())?.map(Course::from))
    }

    fn group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(RosterDb::group(self, id.get())?.map(Group::from))
    }

    fn groups_in_course(&self, course: CourseId) -> Result<Vec<Group>> {
        Ok(RosterDb::groups_in_course(self, course.get())?
            .into_iter()
            .map(Group::from)
            .collect())
    }

    fn group_name_exists(&self, course: CourseId, name: &str) -> Result<bool> {
        Ok(RosterDb::group_name_exists(self, course.get(), name)?)
    }

    fn create_group(&self, course: CourseId, name: &str) -> Result<GroupId> {
        Ok(GroupId::new(self.add_group(course.get(), name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster::EnrolStatus;

    #[test]
    fn test_parent_facts_map_unbounded_end() {
        let db = RosterDb::in_memory().unwrap();
        let parent = db.add_course("P", "Parent").unwrap();
        let child = db.add_course("C", "Child").unwrap();
        let group = db.add_group(parent, "G").unwrap();
        let source = db.add_source(parent, "manual", false).unwrap();
        db.add_group_member(group, 1, "", 0).unwrap();
        db.enrol(source, 1, EnrolStatus::Active, 10, 0).unwrap();

        let link = LinkStore::insert_link(
            &db,
            "P (G)",
            &NewLink::new(
                CourseId::new(child),
                CourseId::new(parent),
                GroupId::new(group),
                RoleId::new(5),
            ),
            None,
        )
        .unwrap();

        let facts = db.parent_facts(&link, None).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].window, ValidityWindow::new(10, None));
        assert_eq!(facts[0].source_status, SourceStatus::Disabled);
        assert!(!facts[0].counts_as_active());
    }

    #[test]
    fn test_parent_roles_exclude_attributed() {
        let db = RosterDb::in_memory().unwrap();
        db.assign_role(1, 10, 5, "", 0).unwrap();
        db.assign_role(1, 10, 6, COMPONENT, 3).unwrap();

        let roles = db.parent_roles(CourseId::new(10), None).unwrap();
        assert_eq!(roles, vec![(UserId::new(1), RoleId::new(5))]);

        let grants = db.attributed_roles(LinkId::new(3), None).unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].link(), LinkId::new(3));
    }

    #[test]
    fn test_update_missing_membership_is_not_found() {
        let db = RosterDb::in_memory().unwrap();
        let membership = ChildMembership {
            user: UserId::new(1),
            link: LinkId::new(1),
            status: MembershipStatus::Active,
            window: ValidityWindow::unbounded(),
        };
        assert!(matches!(
            db.update_child_membership(&membership),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_atomically_rolls_back_unit() {
        let db = RosterDb::in_memory().unwrap();
        let grant = AttributedRoleGrant::new(UserId::new(1), CourseId::new(2), RoleId::new(5), LinkId::new(1));
        let outcome = UnitOfWork::atomically(&db, &mut || {
            db.grant_role(&grant)?;
            Err(SyncError::Other("boom".to_string()))
        });
        assert!(outcome.is_err());
        assert!(db.attributed_roles(LinkId::new(1), None).unwrap().is_empty());
    }
}
