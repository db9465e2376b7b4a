//! Single-user reaction to a parent-side change
//!
//! When a user's enrolment, group membership or roles change in a parent
//! course, every enabled link reading that course is reconciled for the user.
//! A reaction that fires while another one is still running on the same
//! reactor is swallowed.

use super::reconciler::{Mutation, Reconciler};
use crate::metrics;
use crate::model::{CourseId, LinkId, UserId};
use crate::store::SyncStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Non-reentrant execution guard
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    busy: AtomicBool,
}

/// Held while a reaction runs; releases the guard when dropped
#[derive(Debug)]
pub struct GuardToken<'a> {
    busy: &'a AtomicBool,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard, or `None` if it is already held
    pub fn try_enter(&self) -> Option<GuardToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardToken { busy: &self.busy })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// What happened to one link during a reaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LinkOutcome {
    Reconciled { link: LinkId, mutations: Vec<Mutation> },
    Skipped { link: LinkId, reason: String },
}

/// Result of [`EventReactor::on_parent_changed`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reaction", content = "links", rename_all = "snake_case")]
pub enum Reaction {
    /// No link reads from that course
    NoLinks,
    /// A reaction was already running
    Swallowed,
    /// The engine is globally disabled
    Disabled,
    Reconciled(Vec<LinkOutcome>),
}

impl Reaction {
    pub fn mutation_count(&self) -> usize {
        match self {
            Reaction::Reconciled(outcomes) => outcomes
                .iter()
                .map(|o| match o {
                    LinkOutcome::Reconciled { mutations, .. } => mutations.len(),
                    LinkOutcome::Skipped { .. } => 0,
                })
                .sum(),
            _ => 0,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Reaction::NoLinks => "no_links",
            Reaction::Swallowed => "swallowed",
            Reaction::Disabled => "disabled",
            Reaction::Reconciled(_) => "reconciled",
        }
    }
}

/// Reacts to parent-side changes of one user
#[derive(Debug, Default)]
pub struct EventReactor {
    guard: ReentrancyGuard,
}

impl EventReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> &ReentrancyGuard {
        &self.guard
    }

    /// Reconcile `user` under every enabled link reading `parent_course`
    ///
    /// Links are processed in id order. A link with a broken configuration is
    /// skipped and reported. A store failure stops the loop and is returned;
    /// links after the failing one are not processed.
    pub fn on_parent_changed<S: SyncStore + ?Sized>(
        &self,
        reconciler: &Reconciler<'_, S>,
        parent_course: CourseId,
        user: UserId,
    ) -> Result<Reaction> {
        let ctx = reconciler.context();

        let links: Vec<_> = ctx
            .store
            .links_for_parent(parent_course)?
            .into_iter()
            .filter(|link| link.enabled)
            .collect();
        if links.is_empty() {
            return Ok(finish(Reaction::NoLinks));
        }

        if !ctx.policy.enabled {
            tracing::debug!(course = %parent_course, user = %user, "sync disabled, ignoring change");
            return Ok(finish(Reaction::Disabled));
        }

        let Some(_token) = self.guard.try_enter() else {
            tracing::debug!(course = %parent_course, user = %user, "reaction already running, swallowed");
            return Ok(finish(Reaction::Swallowed));
        };

        let mut outcomes = Vec::with_capacity(links.len());
        for link in &links {
            match reconciler.reconcile(user, link) {
                Ok(mutations) => outcomes.push(LinkOutcome::Reconciled {
                    link: link.id,
                    mutations,
                }),
                Err(e) if e.is_configuration() => {
                    tracing::warn!(link = %link.id, error = %e, "skipping misconfigured link");
                    outcomes.push(LinkOutcome::Skipped {
                        link: link.id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(link = %link.id, user = %user, error = %e, "reaction aborted");
                    metrics::record_reaction("failed");
                    return Err(e);
                }
            }
        }

        Ok(finish(Reaction::Reconciled(outcomes)))
    }
}

fn finish(reaction: Reaction) -> Reaction {
    metrics::record_reaction(reaction.label());
    reaction
}
