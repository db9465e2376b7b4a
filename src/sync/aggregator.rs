//! Target state of one user under one link
//!
//! The fold is pure so the bulk sweep can feed it facts it loaded in bulk and
//! get exactly what the per-user path computes.

use super::SyncContext;
use crate::model::{Link, MembershipStatus, ParentMembershipFact, RoleId, UserId, ValidityWindow};
use crate::policy::SyncPolicy;
use crate::store::SyncStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a user's child membership should look like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    pub status: MembershipStatus,
    pub window: ValidityWindow,
    pub roles: BTreeSet<RoleId>,
}

/// Fold parent facts into a status and validity window
///
/// Active wins if any fact is active in an enabled source. The window spans
/// the earliest start and the latest end of the active facts, with an
/// unbounded end dominating. With no active fact the result is suspended with
/// an unbounded window. Returns `None` when there are no facts.
pub fn aggregate_facts<'a, I>(facts: I) -> Option<(MembershipStatus, ValidityWindow)>
where
    I: IntoIterator<Item = &'a ParentMembershipFact>,
{
    let mut seen = false;
    let mut start: Option<i64> = None;
    // Outer None: nothing counted yet. Inner None: unbounded.
    let mut end: Option<Option<i64>> = None;

    for fact in facts {
        seen = true;
        if !fact.counts_as_active() {
            continue;
        }
        start = Some(start.map_or(fact.window.start, |s| s.min(fact.window.start)));
        end = Some(match (end, fact.window.end) {
            (None, e) => e,
            (Some(None), _) | (Some(_), None) => None,
            (Some(Some(a)), Some(b)) => Some(a.max(b)),
        });
    }

    if !seen {
        return None;
    }

    match start {
        Some(start) => Some((
            MembershipStatus::Active,
            ValidityWindow::new(start, end.flatten()),
        )),
        None => Some((MembershipStatus::Suspended, ValidityWindow::unbounded())),
    }
}

/// Roles to propagate: parent roles minus the skip list
pub fn propagated_roles<I>(parent_roles: I, policy: &SyncPolicy) -> BTreeSet<RoleId>
where
    I: IntoIterator<Item = RoleId>,
{
    parent_roles
        .into_iter()
        .filter(|role| !policy.is_skipped(*role))
        .collect()
}

/// Combine facts and parent roles into a target
///
/// `parent_roles` must already exclude roles this engine granted.
pub fn compute_target_from<'a, I, R>(facts: I, parent_roles: R, policy: &SyncPolicy) -> Option<TargetState>
where
    I: IntoIterator<Item = &'a ParentMembershipFact>,
    R: IntoIterator<Item = RoleId>,
{
    let (status, window) = aggregate_facts(facts)?;
    let roles = propagated_roles(parent_roles, policy);
    if !policy.sync_all && roles.is_empty() {
        return None;
    }
    Some(TargetState {
        status,
        window,
        roles,
    })
}

/// Reads facts and roles for one user from the store and computes the target
pub struct Aggregator<'a, S: ?Sized> {
    ctx: SyncContext<'a, S>,
}

impl<'a, S: SyncStore + ?Sized> Aggregator<'a, S> {
    pub fn new(ctx: SyncContext<'a, S>) -> Self {
        Self { ctx }
    }

    pub fn compute_target(&self, user: UserId, link: &Link) -> Result<Option<TargetState>> {
        let facts = self.ctx.store.parent_facts(link, Some(user))?;
        if facts.is_empty() {
            return Ok(None);
        }
        let roles = self
            .ctx
            .store
            .parent_roles(link.parent_course, Some(user))?
            .into_iter()
            .map(|(_, role)| role);
        Ok(compute_target_from(&facts, roles, self.ctx.policy))
    }
}
