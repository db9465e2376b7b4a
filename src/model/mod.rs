//! Domain types shared by the registry and the sync engine
//!
//! - **ids**: typed row identifiers
//! - **link**: links, courses and groups
//! - **membership**: parent facts, child memberships, attributed grants

mod ids;
mod link;
mod membership;

pub use ids::{CourseId, GroupId, LinkId, RoleId, SourceId, UserId};
pub use link::{ChildGroup, Course, Group, Link, LinkUpdate, NewLink, DEFAULT_LINK_NAME};
pub use membership::{
    both_active, Attribution, AttributedRoleGrant, ChildMembership, GroupMembership,
    MembershipStatus, ParentMembershipFact, SourceStatus, ValidityWindow, COMPONENT,
};
