//! Bulk sweep over every link in a scope
//!
//! Loads each link's facts, memberships, parent roles and grants with one
//! query apiece, folds them into per-user [`UnitState`]s and runs the same
//! planner the reactor uses. Each unit is applied in its own transaction, so
//! a failing unit is rolled back and reported while the sweep moves on.
//!
//! Phase mapping: enrolling missing users, the absence policy, status and
//! window updates, the grant and revoke phases and the roleless cleanup
//! (`sync_all = false`) all fall out of [`plan_unit`]. The global-disable
//! short-circuit runs first and group sync runs once at the end.

use super::aggregator::compute_target_from;
use super::reconciler::{apply_unit, plan_unit, Mutation, UnitState};
use super::{check_link, SyncContext};
use crate::metrics;
use crate::model::{CourseId, Link, LinkId, MembershipStatus, RoleId, UserId, COMPONENT};
use crate::store::SyncStore;
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Overall outcome of a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    #[default]
    Converged,
    /// At least one unit or the group sync failed
    Failed,
    /// The engine is disabled; only attributed roles were revoked
    Disabled,
}

impl SweepStatus {
    /// Process exit code for schedulers: 0 converged, 1 error, 2 disabled
    pub fn exit_code(self) -> i32 {
        match self {
            SweepStatus::Converged => 0,
            SweepStatus::Failed => 1,
            SweepStatus::Disabled => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SweepStatus::Converged => "converged",
            SweepStatus::Failed => "failed",
            SweepStatus::Disabled => "disabled",
        }
    }
}

/// A link left out of the sweep because of its configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLink {
    pub link: LinkId,
    pub reason: String,
}

/// A unit (or a whole link, when `user` is `None`) that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub link: Option<LinkId>,
    pub user: Option<UserId>,
    pub error: String,
}

/// Counts and problems of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub status: SweepStatus,
    pub scope: Option<CourseId>,
    pub links: usize,
    pub enrolled: usize,
    pub suspended: usize,
    pub unsuspended: usize,
    /// Window-only updates
    pub updated: usize,
    pub unenrolled: usize,
    pub roles_granted: usize,
    pub roles_revoked: usize,
    pub group_changes: usize,
    pub skipped_links: Vec<SkippedLink>,
    pub failures: Vec<UnitFailure>,
}

impl SweepReport {
    fn new(scope: Option<CourseId>) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    fn tally(&mut self, mutation: &Mutation) {
        match mutation {
            Mutation::CreateMembership { .. } => self.enrolled += 1,
            Mutation::UpdateMembership { from, membership } => {
                match (from, membership.status) {
                    (MembershipStatus::Active, MembershipStatus::Suspended) => self.suspended += 1,
                    (MembershipStatus::Suspended, MembershipStatus::Active) => self.unsuspended += 1,
                    _ => self.updated += 1,
                }
            }
            Mutation::RemoveMembership { .. } => self.unenrolled += 1,
            Mutation::GrantRole { .. } => self.roles_granted += 1,
            Mutation::AddGroupMember { .. } => self.group_changes += 1,
            Mutation::RevokeRole { .. } | Mutation::RevokeAllRoles { .. } => {}
        }
        self.roles_revoked += mutation.roles_revoked();
    }

    /// True if the sweep wrote anything
    pub fn has_changes(&self) -> bool {
        self.change_count() > 0
    }

    pub fn change_count(&self) -> usize {
        self.enrolled
            + self.suspended
            + self.unsuspended
            + self.updated
            + self.unenrolled
            + self.roles_granted
            + self.roles_revoked
            + self.group_changes
    }
}

/// Bulk reconciliation pass
pub struct BulkSweep<'a, S: ?Sized> {
    ctx: SyncContext<'a, S>,
}

impl<'a, S: SyncStore + ?Sized> BulkSweep<'a, S> {
    pub fn new(ctx: SyncContext<'a, S>) -> Self {
        Self { ctx }
    }

    /// Sweep every link of `scope` (a child course), or every link
    ///
    /// Only a failure to list the links aborts the sweep. Unit failures and
    /// misconfigured links end up in the report.
    pub fn run(&self, scope: Option<CourseId>) -> Result<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::new(scope);

        if !self.ctx.policy.enabled {
            report.roles_revoked = self.ctx.store.revoke_all_attributed()?;
            report.status = SweepStatus::Disabled;
            tracing::warn!(
                revoked = report.roles_revoked,
                "sync disabled, revoked every attributed role"
            );
            metrics::record_sweep(report.status.as_str(), started.elapsed().as_secs_f64());
            return Ok(report);
        }

        let links = self.ctx.store.links(scope)?;
        report.links = links.len();
        tracing::info!(scope = ?scope.map(CourseId::get), links = links.len(), "starting sweep");

        for link in &links {
            match check_link(self.ctx.store, link) {
                Ok(()) => {}
                Err(SyncError::Configuration { message, .. }) => {
                    tracing::warn!(link = %link.id, reason = %message, "skipping misconfigured link");
                    report.skipped_links.push(SkippedLink {
                        link: link.id,
                        reason: message,
                    });
                    continue;
                }
                Err(e) => {
                    report.failures.push(UnitFailure {
                        link: Some(link.id),
                        user: None,
                        error: e.to_string(),
                    });
                    continue;
                }
            }

            if let Err(e) = self.sweep_link(link, &mut report) {
                tracing::error!(link = %link.id, error = %e, "could not load link state");
                report.failures.push(UnitFailure {
                    link: Some(link.id),
                    user: None,
                    error: e.to_string(),
                });
            }
        }

        match self.ctx.store.sync_groups_for_attribution(COMPONENT, scope) {
            Ok(outcome) => report.group_changes += outcome.change_count(),
            Err(e) => {
                tracing::error!(error = %e, "group sync failed");
                report.failures.push(UnitFailure {
                    link: None,
                    user: None,
                    error: e.to_string(),
                });
            }
        }

        if !report.failures.is_empty() {
            report.status = SweepStatus::Failed;
        }

        tracing::info!(
            status = report.status.as_str(),
            enrolled = report.enrolled,
            suspended = report.suspended,
            unsuspended = report.unsuspended,
            unenrolled = report.unenrolled,
            roles_granted = report.roles_granted,
            roles_revoked = report.roles_revoked,
            group_changes = report.group_changes,
            failures = report.failures.len(),
            "sweep finished"
        );
        metrics::record_sweep(report.status.as_str(), started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Build the state of every unit a link knows about, in user order
    pub fn load_units(&self, link: &Link) -> Result<Vec<UnitState>> {
        let store = self.ctx.store;

        let mut facts: BTreeMap<UserId, Vec<_>> = BTreeMap::new();
        for fact in store.parent_facts(link, None)? {
            facts.entry(fact.user).or_default().push(fact);
        }

        let mut parent_roles: BTreeMap<UserId, Vec<RoleId>> = BTreeMap::new();
        for (user, role) in store.parent_roles(link.parent_course, None)? {
            parent_roles.entry(user).or_default().push(role);
        }

        let mut current: BTreeMap<UserId, _> = store
            .child_memberships(link.id)?
            .into_iter()
            .map(|m| (m.user, m))
            .collect();

        let mut granted: BTreeMap<UserId, BTreeSet<RoleId>> = BTreeMap::new();
        for grant in store.attributed_roles(link.id, None)? {
            granted.entry(grant.user).or_default().insert(grant.role);
        }

        let users: BTreeSet<UserId> = facts
            .keys()
            .chain(current.keys())
            .chain(granted.keys())
            .copied()
            .collect();

        Ok(users
            .into_iter()
            .map(|user| {
                let target = facts.get(&user).and_then(|facts| {
                    let roles = parent_roles.get(&user).into_iter().flatten().copied();
                    compute_target_from(facts, roles, self.ctx.policy)
                });
                UnitState {
                    user,
                    target,
                    current: current.remove(&user),
                    granted: granted.remove(&user).unwrap_or_default(),
                }
            })
            .collect())
    }

    fn sweep_link(&self, link: &Link, report: &mut SweepReport) -> Result<()> {
        let now = self.ctx.clock.now();

        for unit in self.load_units(link)? {
            let plan = plan_unit(&unit, link, self.ctx.policy, now);
            if plan.is_empty() {
                continue;
            }

            match apply_unit(self.ctx.store, &plan) {
                Ok(()) => {
                    for mutation in &plan {
                        match mutation {
                            Mutation::CreateMembership { .. } => tracing::info!(
                                user = %unit.user, course = %link.child_course, link = %link.id, "enrolling"
                            ),
                            Mutation::RemoveMembership { .. } => tracing::info!(
                                user = %unit.user, course = %link.child_course, link = %link.id, "unenrolling"
                            ),
                            other => tracing::debug!(
                                user = %unit.user, link = %link.id, action = other.kind(), "applied"
                            ),
                        }
                        report.tally(mutation);
                    }
                }
                Err(e) => {
                    tracing::warn!(user = %unit.user, link = %link.id, error = %e, "unit failed, rolled back");
                    metrics::record_unit_failure(e.kind());
                    report.failures.push(UnitFailure {
                        link: Some(link.id),
                        user: Some(unit.user),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
