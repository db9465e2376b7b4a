//! Per-unit reconciliation
//!
//! A unit is one (user, link) pair. [`plan_unit`] turns what the unit should
//! look like and what it looks like now into a list of [`Mutation`]s, and
//! [`apply_unit`] writes them in one transaction. Planning is pure, which
//! makes a second run over converged state plan nothing.

use super::aggregator::{Aggregator, TargetState};
use super::{check_link, SyncContext};
use crate::metrics;
use crate::model::{
    AttributedRoleGrant, Attribution, ChildMembership, GroupMembership, Link, LinkId,
    MembershipStatus, RoleId, UserId,
};
use crate::policy::SyncPolicy;
use crate::store::SyncStore;
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One write against the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    CreateMembership {
        membership: ChildMembership,
    },
    AddGroupMember {
        membership: GroupMembership,
    },
    UpdateMembership {
        from: MembershipStatus,
        membership: ChildMembership,
    },
    /// Also drops the unit's attributed roles and group membership
    RemoveMembership {
        user: UserId,
        link: LinkId,
        roles: Vec<RoleId>,
    },
    GrantRole {
        grant: AttributedRoleGrant,
    },
    RevokeRole {
        grant: AttributedRoleGrant,
    },
    RevokeAllRoles {
        user: UserId,
        link: LinkId,
        roles: Vec<RoleId>,
    },
}

impl Mutation {
    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::CreateMembership { .. } => "create_membership",
            Mutation::AddGroupMember { .. } => "add_group_member",
            Mutation::UpdateMembership { .. } => "update_membership",
            Mutation::RemoveMembership { .. } => "remove_membership",
            Mutation::GrantRole { .. } => "grant_role",
            Mutation::RevokeRole { .. } => "revoke_role",
            Mutation::RevokeAllRoles { .. } => "revoke_all_roles",
        }
    }

    /// Number of role grants this mutation revokes
    pub fn roles_revoked(&self) -> usize {
        match self {
            Mutation::RevokeRole { .. } => 1,
            Mutation::RevokeAllRoles { roles, .. } | Mutation::RemoveMembership { roles, .. } => {
                roles.len()
            }
            _ => 0,
        }
    }
}

/// Everything the planner needs to know about one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitState {
    pub user: UserId,
    pub target: Option<TargetState>,
    pub current: Option<ChildMembership>,
    /// Roles currently granted to the user under this link
    pub granted: BTreeSet<RoleId>,
}

/// Plan the mutations that bring one unit to its target
pub fn plan_unit(unit: &UnitState, link: &Link, policy: &SyncPolicy, now: i64) -> Vec<Mutation> {
    let mut plan = Vec::new();

    let Some(target) = &unit.target else {
        plan_absence(unit, link, policy, &mut plan);
        return plan;
    };

    let status = match &unit.current {
        None if !link.enabled => {
            // A paused link takes no new members
            plan_absence(unit, link, policy, &mut plan);
            return plan;
        }
        None => {
            plan.push(Mutation::CreateMembership {
                membership: ChildMembership {
                    user: unit.user,
                    link: link.id,
                    status: target.status,
                    window: target.window,
                },
            });
            if let Some(group) = link.child_group {
                plan.push(Mutation::AddGroupMember {
                    membership: GroupMembership {
                        group,
                        user: unit.user,
                        attribution: Attribution::for_link(link.id),
                    },
                });
            }
            target.status
        }
        Some(current) => {
            let window_changed = target.status.is_active() && current.window != target.window;
            if current.status != target.status || window_changed {
                let window = if target.status.is_active() {
                    target.window
                } else {
                    current.window
                };
                plan.push(Mutation::UpdateMembership {
                    from: current.status,
                    membership: ChildMembership {
                        status: target.status,
                        window,
                        ..current.clone()
                    },
                });
            }
            target.status
        }
    };

    plan_roles(unit, link, target, status, policy, now, &mut plan);
    plan
}

fn plan_absence(unit: &UnitState, link: &Link, policy: &SyncPolicy, plan: &mut Vec<Mutation>) {
    use crate::policy::UnenrolAction;

    let granted: Vec<RoleId> = unit.granted.iter().copied().collect();
    let Some(current) = &unit.current else {
        // Grants without a membership
        if !granted.is_empty() && !policy.unenrol_action.preserves_roles() {
            plan.push(Mutation::RevokeAllRoles {
                user: unit.user,
                link: link.id,
                roles: granted,
            });
        }
        return;
    };

    match policy.unenrol_action {
        UnenrolAction::Remove => plan.push(Mutation::RemoveMembership {
            user: unit.user,
            link: link.id,
            roles: granted,
        }),
        UnenrolAction::Suspend | UnenrolAction::SuspendNoRoles => {
            if current.status.is_active() {
                plan.push(Mutation::UpdateMembership {
                    from: current.status,
                    membership: ChildMembership {
                        status: MembershipStatus::Suspended,
                        ..current.clone()
                    },
                });
            }
            if policy.unenrol_action == UnenrolAction::SuspendNoRoles && !granted.is_empty() {
                plan.push(Mutation::RevokeAllRoles {
                    user: unit.user,
                    link: link.id,
                    roles: granted,
                });
            }
        }
    }
}

fn plan_roles(
    unit: &UnitState,
    link: &Link,
    target: &TargetState,
    status: MembershipStatus,
    policy: &SyncPolicy,
    now: i64,
    plan: &mut Vec<Mutation>,
) {
    let preserve = policy.unenrol_action.preserves_roles();
    let grant = |role: RoleId| AttributedRoleGrant::new(unit.user, link.child_course, role, link.id);

    if !(status.is_active() && link.enabled && target.window.contains(now)) {
        if !preserve && !unit.granted.is_empty() {
            plan.push(Mutation::RevokeAllRoles {
                user: unit.user,
                link: link.id,
                roles: unit.granted.iter().copied().collect(),
            });
        }
        return;
    }

    for role in target.roles.difference(&unit.granted) {
        plan.push(Mutation::GrantRole { grant: grant(*role) });
    }
    if !preserve {
        for role in unit.granted.difference(&target.roles) {
            plan.push(Mutation::RevokeRole { grant: grant(*role) });
        }
    }
}

fn apply_one<S: SyncStore + ?Sized>(store: &S, mutation: &Mutation) -> Result<()> {
    match mutation {
        Mutation::CreateMembership { membership } => store.create_child_membership(membership),
        Mutation::AddGroupMember { membership } => store.add_group_member(membership),
        Mutation::UpdateMembership { membership, .. } => store.update_child_membership(membership),
        Mutation::RemoveMembership { user, link, .. } => {
            store.revoke_all_for_item(*link, Some(*user))?;
            store.remove_attributed_group_members(*link, Some(*user))?;
            store.remove_child_membership(*link, *user)
        }
        Mutation::GrantRole { grant } => store.grant_role(grant),
        Mutation::RevokeRole { grant } => store.revoke_role(grant),
        Mutation::RevokeAllRoles { user, link, .. } => {
            store.revoke_all_for_item(*link, Some(*user))?;
            Ok(())
        }
    }
}

/// Apply the plan of one unit atomically
pub fn apply_unit<S: SyncStore + ?Sized>(store: &S, plan: &[Mutation]) -> Result<()> {
    if plan.is_empty() {
        return Ok(());
    }
    store.atomically(&mut || {
        for mutation in plan {
            apply_one(store, mutation)?;
        }
        Ok(())
    })?;
    for mutation in plan {
        metrics::record_mutation(mutation.kind());
    }
    Ok(())
}

/// Reconciles single units against the store
pub struct Reconciler<'a, S: ?Sized> {
    ctx: SyncContext<'a, S>,
}

impl<'a, S: SyncStore + ?Sized> Reconciler<'a, S> {
    pub fn new(ctx: SyncContext<'a, S>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> SyncContext<'a, S> {
        self.ctx
    }

    /// Read the target, the current membership and the grants of one unit
    pub fn load_unit(&self, user: UserId, link: &Link) -> Result<UnitState> {
        let target = Aggregator::new(self.ctx).compute_target(user, link)?;
        let current = self.ctx.store.child_membership(link.id, user)?;
        let granted = self
            .ctx
            .store
            .attributed_roles(link.id, Some(user))?
            .into_iter()
            .map(|grant| grant.role)
            .collect();
        Ok(UnitState {
            user,
            target,
            current,
            granted,
        })
    }

    /// Plan without writing
    pub fn plan(&self, user: UserId, link: &Link) -> Result<Vec<Mutation>> {
        check_link(self.ctx.store, link)?;
        let unit = self.load_unit(user, link)?;
        Ok(plan_unit(&unit, link, self.ctx.policy, self.ctx.clock.now()))
    }

    /// Converge one unit and return the mutations that were applied
    ///
    /// Fails with [`SyncError::Disabled`] while the engine is globally off.
    pub fn reconcile(&self, user: UserId, link: &Link) -> Result<Vec<Mutation>> {
        if !self.ctx.policy.enabled {
            return Err(SyncError::Disabled);
        }
        let plan = self.plan(user, link)?;
        if plan.is_empty() {
            tracing::trace!(user = %user, link = %link.id, "unit already converged");
            return Ok(plan);
        }

        if let Err(e) = apply_unit(self.ctx.store, &plan) {
            tracing::warn!(user = %user, link = %link.id, error = %e, "unit failed, rolled back");
            metrics::record_unit_failure(e.kind());
            return Err(e);
        }

        for mutation in &plan {
            tracing::debug!(user = %user, link = %link.id, action = mutation.kind(), "applied");
        }
        Ok(plan)
    }

    /// Converge every user a link knows about
    ///
    /// Covers users with a parent fact, a child membership or an attributed
    /// grant under the link. While the engine is globally off nobody is
    /// enrolled; the link's attributed grants are revoked instead.
    pub fn reconcile_all_for_link(&self, link: &Link) -> Result<Vec<Mutation>> {
        if !self.ctx.policy.enabled {
            return self.revoke_all_for_link(link);
        }
        check_link(self.ctx.store, link)?;

        let mut users: BTreeSet<UserId> = self
            .ctx
            .store
            .parent_facts(link, None)?
            .into_iter()
            .map(|fact| fact.user)
            .collect();
        users.extend(
            self.ctx
                .store
                .child_memberships(link.id)?
                .into_iter()
                .map(|m| m.user),
        );
        users.extend(
            self.ctx
                .store
                .attributed_roles(link.id, None)?
                .into_iter()
                .map(|g| g.user),
        );

        let mut applied = Vec::new();
        for user in users {
            applied.extend(self.reconcile(user, link)?);
        }

        tracing::info!(link = %link.id, mutations = applied.len(), "link reconciled");
        Ok(applied)
    }

    fn revoke_all_for_link(&self, link: &Link) -> Result<Vec<Mutation>> {
        let mut by_user: BTreeMap<UserId, Vec<RoleId>> = BTreeMap::new();
        for grant in self.ctx.store.attributed_roles(link.id, None)? {
            by_user.entry(grant.user).or_default().push(grant.role);
        }

        let mut applied = Vec::new();
        for (user, roles) in by_user {
            let plan = [Mutation::RevokeAllRoles {
                user,
                link: link.id,
                roles,
            }];
            apply_unit(self.ctx.store, &plan)?;
            applied.extend(plan);
        }

        tracing::warn!(link = %link.id, revoked = applied.len(), "sync disabled, link grants revoked");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CourseId, GroupId, ValidityWindow};
    use crate::policy::UnenrolAction;

    fn link(enabled: bool, child_group: Option<GroupId>) -> Link {
        Link {
            id: LinkId::new(1),
            name: "P (G)".to_string(),
            child_course: CourseId::new(20),
            parent_course: CourseId::new(10),
            parent_group: GroupId::new(5),
            child_group,
            enabled,
            default_role: RoleId::new(5),
        }
    }

    fn target(status: MembershipStatus, window: ValidityWindow, roles: &[i64]) -> TargetState {
        TargetState {
            status,
            window,
            roles: roles.iter().map(|r| RoleId::new(*r)).collect(),
        }
    }

    fn membership(status: MembershipStatus, window: ValidityWindow) -> ChildMembership {
        ChildMembership {
            user: UserId::new(7),
            link: LinkId::new(1),
            status,
            window,
        }
    }

    fn unit(
        target: Option<TargetState>,
        current: Option<ChildMembership>,
        granted: &[i64],
    ) -> UnitState {
        UnitState {
            user: UserId::new(7),
            target,
            current,
            granted: granted.iter().map(|r| RoleId::new(*r)).collect(),
        }
    }

    const NOW: i64 = 1_000;

    #[test]
    fn test_create_with_group_and_roles() {
        let state = unit(
            Some(target(MembershipStatus::Active, ValidityWindow::unbounded(), &[5])),
            None,
            &[],
        );
        let plan = plan_unit(&state, &link(true, Some(GroupId::new(9))), &SyncPolicy::default(), NOW);
        let kinds: Vec<_> = plan.iter().map(Mutation::kind).collect();
        assert_eq!(kinds, vec!["create_membership", "add_group_member", "grant_role"]);
    }

    #[test]
    fn test_converged_unit_plans_nothing() {
        let window = ValidityWindow::new(0, None);
        let state = unit(
            Some(target(MembershipStatus::Active, window, &[5])),
            Some(membership(MembershipStatus::Active, window)),
            &[5],
        );
        assert!(plan_unit(&state, &link(true, None), &SyncPolicy::default(), NOW).is_empty());
    }

    #[test]
    fn test_suspended_target_ignores_window_difference() {
        let state = unit(
            Some(target(MembershipStatus::Suspended, ValidityWindow::unbounded(), &[])),
            Some(membership(MembershipStatus::Suspended, ValidityWindow::new(10, Some(20)))),
            &[],
        );
        assert!(plan_unit(&state, &link(true, None), &SyncPolicy::default(), NOW).is_empty());
    }

    #[test]
    fn test_window_change_updates_active_membership() {
        let state = unit(
            Some(target(MembershipStatus::Active, ValidityWindow::new(30, Some(5_000)), &[])),
            Some(membership(MembershipStatus::Active, ValidityWindow::new(50, Some(200)))),
            &[],
        );
        let plan = plan_unit(&state, &link(true, None), &SyncPolicy::default(), NOW);
        assert_eq!(
            plan,
            vec![Mutation::UpdateMembership {
                from: MembershipStatus::Active,
                membership: membership(MembershipStatus::Active, ValidityWindow::new(30, Some(5_000))),
            }]
        );
    }

    #[test]
    fn test_out_of_window_strips_roles() {
        let state = unit(
            Some(target(MembershipStatus::Active, ValidityWindow::new(0, Some(NOW)), &[5])),
            Some(membership(MembershipStatus::Active, ValidityWindow::new(0, Some(NOW)))),
            &[5],
        );
        let plan = plan_unit(&state, &link(true, None), &SyncPolicy::default(), NOW);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].kind(), "revoke_all_roles");
    }

    #[test]
    fn test_disabled_link_strips_roles_but_keeps_membership() {
        let window = ValidityWindow::unbounded();
        let state = unit(
            Some(target(MembershipStatus::Active, window, &[5])),
            Some(membership(MembershipStatus::Active, window)),
            &[5],
        );
        let plan = plan_unit(&state, &link(false, None), &SyncPolicy::default(), NOW);
        assert_eq!(plan.iter().map(Mutation::kind).collect::<Vec<_>>(), vec!["revoke_all_roles"]);
    }

    #[test]
    fn test_disabled_link_takes_no_new_members() {
        let state = unit(
            Some(target(MembershipStatus::Active, ValidityWindow::unbounded(), &[5])),
            None,
            &[],
        );
        assert!(plan_unit(&state, &link(false, None), &SyncPolicy::default(), NOW).is_empty());
    }

    #[test]
    fn test_role_convergence_grants_and_revokes() {
        let window = ValidityWindow::unbounded();
        let state = unit(
            Some(target(MembershipStatus::Active, window, &[5, 6])),
            Some(membership(MembershipStatus::Active, window)),
            &[4, 5],
        );
        let plan = plan_unit(&state, &link(true, None), &SyncPolicy::default(), NOW);
        assert_eq!(plan.iter().map(Mutation::kind).collect::<Vec<_>>(), vec!["grant_role", "revoke_role"]);

        let keep = SyncPolicy::default().with_unenrol_action(UnenrolAction::Suspend);
        let plan = plan_unit(&state, &link(true, None), &keep, NOW);
        assert_eq!(plan.iter().map(Mutation::kind).collect::<Vec<_>>(), vec!["grant_role"]);
    }

    #[test]
    fn test_absence_policies() {
        let window = ValidityWindow::unbounded();
        let state = unit(None, Some(membership(MembershipStatus::Active, window)), &[5]);

        let remove = SyncPolicy::default().with_unenrol_action(UnenrolAction::Remove);
        let plan = plan_unit(&state, &link(true, None), &remove, NOW);
        assert_eq!(plan.iter().map(Mutation::kind).collect::<Vec<_>>(), vec!["remove_membership"]);
        assert_eq!(plan[0].roles_revoked(), 1);

        let suspend = SyncPolicy::default().with_unenrol_action(UnenrolAction::Suspend);
        let plan = plan_unit(&state, &link(true, None), &suspend, NOW);
        assert_eq!(plan.iter().map(Mutation::kind).collect::<Vec<_>>(), vec!["update_membership"]);

        let strip = SyncPolicy::default();
        let plan = plan_unit(&state, &link(true, None), &strip, NOW);
        assert_eq!(
            plan.iter().map(Mutation::kind).collect::<Vec<_>>(),
            vec!["update_membership", "revoke_all_roles"]
        );
    }

    #[test]
    fn test_absent_user_without_membership_plans_nothing() {
        let state = unit(None, None, &[]);
        assert!(plan_unit(&state, &link(true, None), &SyncPolicy::default(), NOW).is_empty());
    }

    #[test]
    fn test_dangling_grants_revoked_unless_preserved() {
        let state = unit(None, None, &[5]);
        let plan = plan_unit(&state, &link(true, None), &SyncPolicy::default(), NOW);
        assert_eq!(plan[0].kind(), "revoke_all_roles");

        let keep = SyncPolicy::default().with_unenrol_action(UnenrolAction::Suspend);
        assert!(plan_unit(&state, &link(true, None), &keep, NOW).is_empty());
    }

    #[test]
    fn test_mutation_serializes_with_action_tag() {
        let mutation = Mutation::RevokeAllRoles {
            user: UserId::new(7),
            link: LinkId::new(1),
            roles: vec![RoleId::new(5)],
        };
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["action"], "revoke_all_roles");
        assert_eq!(json["roles"][0], 5);
    }
}
