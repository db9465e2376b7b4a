//! The reconciliation engine
//!
//! - **aggregator**: folds parent facts into a target state
//! - **reconciler**: plans and applies the mutations of one (user, link) unit
//! - **reactor**: single-user reaction to a parent change
//! - **sweep**: set-at-a-time pass over every link in a scope
//!
//! The reactor and the sweep build the same [`UnitState`] and hand it to the
//! same planner, so both paths converge to the same state.

pub mod aggregator;
pub mod reactor;
pub mod reconciler;
pub mod sweep;

pub use aggregator::{aggregate_facts, compute_target_from, Aggregator, TargetState};
pub use reactor::{EventReactor, LinkOutcome, Reaction, ReentrancyGuard};
pub use reconciler::{apply_unit, plan_unit, Mutation, Reconciler, UnitState};
pub use sweep::{BulkSweep, SkippedLink, SweepReport, SweepStatus, UnitFailure};

use crate::clock::Clock;
use crate::model::Link;
use crate::policy::SyncPolicy;
use crate::store::SyncStore;
use crate::{Result, SyncError};

/// Store, policy and clock shared by every engine component
pub struct SyncContext<'a, S: ?Sized> {
    pub store: &'a S,
    pub policy: &'a SyncPolicy,
    pub clock: &'a dyn Clock,
}

impl<'a, S: ?Sized> SyncContext<'a, S> {
    pub fn new(store: &'a S, policy: &'a SyncPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }
}

impl<S: ?Sized> Clone for SyncContext<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: ?Sized> Copy for SyncContext<'_, S> {}

/// Check that everything a link points at still exists
pub fn check_link<S: SyncStore + ?Sized>(store: &S, link: &Link) -> Result<()> {
    let broken = |message: String| SyncError::Configuration {
        link: link.id,
        message,
    };

    if link.parent_course == link.child_course {
        return Err(broken(format!(
            "parent course {} is the child course",
            link.parent_course
        )));
    }
    if store.course(link.parent_course)?.is_none() {
        return Err(broken(format!("parent course {} is gone", link.parent_course)));
    }
    if store.course(link.child_course)?.is_none() {
        return Err(broken(format!("child course {} is gone", link.child_course)));
    }
    match store.group(link.parent_group)? {
        Some(group) if group.course == link.parent_course => {}
        Some(_) => {
            return Err(broken(format!(
                "parent group {} is not in course {}",
                link.parent_group, link.parent_course
            )))
        }
        None => return Err(broken(format!("parent group {} is gone", link.parent_group))),
    }
    if let Some(child_group) = link.child_group {
        match store.group(child_group)? {
            Some(group) if group.course == link.child_course => {}
            _ => {
                return Err(broken(format!(
                    "child group {} is not in course {}",
                    child_group, link.child_course
                )))
            }
        }
    }
    Ok(())
}
