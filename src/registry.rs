//! Link registry
//!
//! Typed access to links for administrative callers. Creating a link or
//! changing its status reconciles it straight away, so it converges without
//! waiting for the next sweep.

use crate::model::{
    ChildGroup, Course, CourseId, Group, GroupId, Link, LinkId, LinkUpdate, NewLink, UserId,
    COMPONENT, DEFAULT_LINK_NAME,
};
use crate::store::SyncStore;
use crate::sync::{apply_unit, Mutation, Reconciler, SyncContext};
use crate::{Result, SyncError};

/// Capability checks consulted before administrative actions
pub trait LinkPermissions {
    /// May the caller add, edit or delete links feeding this course?
    fn can_configure(&self, child_course: CourseId) -> bool;

    /// May the caller unenrol users from this course by hand?
    fn can_unenrol(&self, child_course: CourseId) -> bool;
}

/// Permits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl LinkPermissions for AllowAll {
    fn can_configure(&self, _child_course: CourseId) -> bool {
        true
    }

    fn can_unenrol(&self, _child_course: CourseId) -> bool {
        true
    }
}

static ALLOW_ALL: AllowAll = AllowAll;

/// Name of the `increment`-th candidate for an auto-created group
///
/// The first candidate has no suffix, later ones get `(2)`, `(3)`, ...
pub fn group_name_candidate(parent_name: &str, increment: u32) -> String {
    let suffix = if increment <= 1 {
        String::new()
    } else {
        format!("({})", increment)
    };
    format!("{} course {}", parent_name, suffix).trim().to_string()
}

/// Administrative operations on links
pub struct LinkRegistry<'a, S: ?Sized> {
    ctx: SyncContext<'a, S>,
    permissions: &'a dyn LinkPermissions,
}

impl<'a, S: SyncStore + ?Sized> LinkRegistry<'a, S> {
    pub fn new(ctx: SyncContext<'a, S>) -> Self {
        Self {
            ctx,
            permissions: &ALLOW_ALL,
        }
    }

    pub fn with_permissions(mut self, permissions: &'a dyn LinkPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    fn course(&self, id: CourseId) -> Result<Course> {
        self.ctx
            .store
            .course(id)?
            .ok_or_else(|| SyncError::NotFound(format!("course {}", id)))
    }

    fn require_configure(&self, child_course: CourseId) -> Result<()> {
        if !self.permissions.can_configure(child_course) {
            return Err(SyncError::PermissionDenied(format!(
                "cannot configure links of course {}",
                child_course
            )));
        }
        Ok(())
    }

    fn parent_group(&self, parent_course: CourseId, group: GroupId) -> Result<Group> {
        match self.ctx.store.group(group)? {
            Some(g) if g.course == parent_course => Ok(g),
            Some(_) => Err(SyncError::Config(format!(
                "group {} does not belong to course {}",
                group, parent_course
            ))),
            None => Err(SyncError::NotFound(format!("group {}", group))),
        }
    }

    fn check_child_group(&self, child_course: CourseId, group: GroupId) -> Result<()> {
        match self.ctx.store.group(group)? {
            Some(g) if g.course == child_course => Ok(()),
            _ => Err(SyncError::Config(format!(
                "group {} does not belong to course {}",
                group, child_course
            ))),
        }
    }

    fn enabled_duplicate(&self, request: &NewLink, ignore: Option<LinkId>) -> Result<Option<LinkId>> {
        Ok(self
            .ctx
            .store
            .links(Some(request.child_course))?
            .into_iter()
            .find(|l| {
                l.enabled
                    && Some(l.id) != ignore
                    && l.parent_course == request.parent_course
                    && l.parent_group == request.parent_group
            })
            .map(|l| l.id))
    }

    /// Look up a link
    pub fn link(&self, id: LinkId) -> Result<Link> {
        self.ctx
            .store
            .link(id)?
            .ok_or_else(|| SyncError::NotFound(format!("link {}", id)))
    }

    /// Links feeding a course, or every link
    pub fn links(&self, child_course: Option<CourseId>) -> Result<Vec<Link>> {
        self.ctx.store.links(child_course)
    }

    /// Validate, store and reconcile a new link
    pub fn create_link(&self, request: &NewLink) -> Result<Link> {
        self.require_configure(request.child_course)?;

        if request.parent_course == request.child_course {
            return Err(SyncError::SelfLink(request.child_course));
        }
        self.course(request.child_course)?;
        let parent = self.course(request.parent_course)?;

        let parent_group = self.parent_group(request.parent_course, request.parent_group)?;
        if let ChildGroup::Existing(group) = request.child_group {
            self.check_child_group(request.child_course, group)?;
        }

        if request.enabled {
            if let Some(existing) = self.enabled_duplicate(request, None)? {
                return Err(SyncError::DuplicateLink {
                    existing,
                    child: request.child_course,
                    parent: request.parent_course,
                    group: request.parent_group,
                });
            }
        }

        let name = format!("{} ({})", parent.shortname, parent_group.name);
        let mut created = None;
        self.ctx.store.atomically(&mut || {
            let child_group = match request.child_group {
                ChildGroup::None => None,
                ChildGroup::Existing(group) => Some(group),
                ChildGroup::CreateNew => {
                    Some(self.create_new_group(request.child_course, request.parent_course)?.id)
                }
            };
            created = Some(self.ctx.store.insert_link(&name, request, child_group)?);
            Ok(())
        })?;
        let link = created.ok_or_else(|| SyncError::Other("link was not created".to_string()))?;

        tracing::info!(
            link = %link.id,
            child = %link.child_course,
            parent = %link.parent_course,
            group = %link.parent_group,
            name = %link.name,
            "link created"
        );

        if link.enabled {
            self.reconcile_all_for_link(&link)?;
        }
        Ok(link)
    }

    /// Converge every user of a link, then align its child group
    pub fn reconcile_all_for_link(&self, link: &Link) -> Result<Vec<Mutation>> {
        let applied = Reconciler::new(self.ctx).reconcile_all_for_link(link)?;
        if !self.ctx.policy.enabled {
            return Ok(applied);
        }
        let groups = self
            .ctx
            .store
            .sync_groups_for_attribution(COMPONENT, Some(link.child_course))?;
        if groups.change_count() > 0 {
            tracing::debug!(
                link = %link.id,
                added = groups.added.len(),
                removed = groups.removed.len(),
                "child group aligned"
            );
        }
        Ok(applied)
    }

    /// Enable or disable a link and reconcile it
    pub fn set_link_enabled(&self, id: LinkId, enabled: bool) -> Result<Link> {
        let link = self.link(id)?;
        self.require_configure(link.child_course)?;
        if link.enabled == enabled {
            return Ok(link);
        }

        if enabled {
            let candidate = NewLink::new(
                link.child_course,
                link.parent_course,
                link.parent_group,
                link.default_role,
            );
            if let Some(existing) = self.enabled_duplicate(&candidate, Some(id))? {
                return Err(SyncError::DuplicateLink {
                    existing,
                    child: link.child_course,
                    parent: link.parent_course,
                    group: link.parent_group,
                });
            }
        }

        self.ctx.store.set_link_enabled(id, enabled)?;
        let link = Link { enabled, ..link };
        tracing::info!(link = %id, enabled, "link status changed");

        self.reconcile_all_for_link(&link)?;
        Ok(link)
    }

    /// Edit a link and reconcile it
    ///
    /// A new parent group renames the link. Moving the child group carries
    /// the link's attributed group members along.
    pub fn update_link(&self, id: LinkId, changes: &LinkUpdate) -> Result<Link> {
        let link = self.link(id)?;
        self.require_configure(link.child_course)?;

        let mut updated = link.clone();
        if let Some(group) = changes.parent_group {
            let parent = self.course(link.parent_course)?;
            let parent_group = self.parent_group(link.parent_course, group)?;
            updated.parent_group = group;
            updated.name = format!("{} ({})", parent.shortname, parent_group.name);
        }
        if let Some(role) = changes.default_role {
            updated.default_role = role;
        }
        if let Some(ChildGroup::Existing(group)) = changes.child_group {
            self.check_child_group(link.child_course, group)?;
        }

        if updated.enabled && updated.parent_group != link.parent_group {
            let candidate = NewLink::new(
                updated.child_course,
                updated.parent_course,
                updated.parent_group,
                updated.default_role,
            );
            if let Some(existing) = self.enabled_duplicate(&candidate, Some(id))? {
                return Err(SyncError::DuplicateLink {
                    existing,
                    child: updated.child_course,
                    parent: updated.parent_course,
                    group: updated.parent_group,
                });
            }
        }

        self.ctx.store.atomically(&mut || {
            updated.child_group = match changes.child_group {
                None => link.child_group,
                Some(ChildGroup::None) => None,
                Some(ChildGroup::Existing(group)) => Some(group),
                Some(ChildGroup::CreateNew) => {
                    Some(self.create_new_group(link.child_course, link.parent_course)?.id)
                }
            };
            self.ctx.store.update_link(&updated)
        })?;

        tracing::info!(
            link = %id,
            group = %updated.parent_group,
            child_group = ?updated.child_group.map(GroupId::get),
            name = %updated.name,
            "link updated"
        );

        self.reconcile_all_for_link(&updated)?;
        Ok(updated)
    }

    /// Delete a link with its memberships, attributed roles and group memberships
    pub fn delete_link(&self, id: LinkId) -> Result<()> {
        let link = self.link(id)?;
        self.require_configure(link.child_course)?;

        let store = self.ctx.store;
        store.atomically(&mut || {
            let roles = store.revoke_all_for_item(id, None)?;
            let members = store.remove_attributed_group_members(id, None)?;
            store.delete_link(id)?;
            tracing::info!(link = %id, roles_revoked = roles, group_members_removed = members, "link deleted");
            Ok(())
        })
    }

    /// Display name of a link, falling back to the parent course name
    pub fn instance_name(&self, link: &Link) -> Result<String> {
        if !link.name.trim().is_empty() {
            return Ok(link.name.clone());
        }
        let parent = match self.ctx.store.course(link.parent_course)? {
            Some(course) => course.fullname,
            None => link.parent_course.to_string(),
        };
        Ok(format!("{} ({})", DEFAULT_LINK_NAME, parent))
    }

    /// Groups a link may read from in a parent course
    pub fn group_options(&self, parent_course: CourseId) -> Result<Vec<Group>> {
        self.course(parent_course)?;
        self.ctx.store.groups_in_course(parent_course)
    }

    /// Unenrol a user by hand; only suspended memberships qualify
    pub fn manual_unenrol(&self, id: LinkId, user: UserId) -> Result<()> {
        let link = self.link(id)?;
        if !self.permissions.can_unenrol(link.child_course) {
            return Err(SyncError::PermissionDenied(format!(
                "cannot unenrol users from course {}",
                link.child_course
            )));
        }

        let membership = self
            .ctx
            .store
            .child_membership(id, user)?
            .ok_or_else(|| SyncError::NotFound(format!("user {} under link {}", user, id)))?;
        if membership.status.is_active() {
            return Err(SyncError::PermissionDenied(format!(
                "user {} is active under link {}; only suspended users can be unenrolled",
                user, id
            )));
        }

        let roles = self
            .ctx
            .store
            .attributed_roles(id, Some(user))?
            .into_iter()
            .map(|g| g.role)
            .collect();
        apply_unit(
            self.ctx.store,
            &[Mutation::RemoveMembership {
                user,
                link: id,
                roles,
            }],
        )?;
        tracing::info!(link = %id, user = %user, "manually unenrolled");
        Ok(())
    }

    /// Create a group in the child course named after the parent course
    pub fn create_new_group(&self, child_course: CourseId, parent_course: CourseId) -> Result<Group> {
        let parent = self.course(parent_course)?;

        let mut increment = 1;
        let mut name = group_name_candidate(&parent.fullname, increment);
        while self.ctx.store.group_name_exists(child_course, &name)? {
            increment += 1;
            name = group_name_candidate(&parent.fullname, increment);
        }

        let id: GroupId = self.ctx.store.create_group(child_course, &name)?;
        tracing::info!(course = %child_course, group = %id, name = %name, "created group");
        Ok(Group {
            id,
            course: child_course,
            name,
        })
    }
}
