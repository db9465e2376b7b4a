//! Membership facts, materialized memberships and attributed records

use super::ids::{CourseId, GroupId, LinkId, RoleId, SourceId, UserId};
use roster::EnrolStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Component name written on every record this engine owns
pub const COMPONENT: &str = "metagroup";

/// Status of a membership (parent fact or child membership)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Suspended,
}

impl MembershipStatus {
    pub fn is_active(self) -> bool {
        self == MembershipStatus::Active
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipStatus::Active => write!(f, "active"),
            MembershipStatus::Suspended => write!(f, "suspended"),
        }
    }
}

impl From<EnrolStatus> for MembershipStatus {
    fn from(status: EnrolStatus) -> Self {
        match status {
            EnrolStatus::Active => MembershipStatus::Active,
            EnrolStatus::Suspended => MembershipStatus::Suspended,
        }
    }
}

impl From<MembershipStatus> for EnrolStatus {
    fn from(status: MembershipStatus) -> Self {
        match status {
            MembershipStatus::Active => EnrolStatus::Active,
            MembershipStatus::Suspended => EnrolStatus::Suspended,
        }
    }
}

/// Enabled flag of the enrolment source a parent fact comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Enabled,
    Disabled,
}

impl From<bool> for SourceStatus {
    fn from(enabled: bool) -> Self {
        if enabled {
            SourceStatus::Enabled
        } else {
            SourceStatus::Disabled
        }
    }
}

/// A fact counts as active only when the enrolment and its source are both active
pub fn both_active(status: MembershipStatus, source: SourceStatus) -> bool {
    status == MembershipStatus::Active && source == SourceStatus::Enabled
}

/// Validity window of a membership, in unix seconds
///
/// `end = None` is unbounded. The roster stores an unbounded end as `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ValidityWindow {
    pub start: i64,
    pub end: Option<i64>,
}

impl ValidityWindow {
    pub fn new(start: i64, end: Option<i64>) -> Self {
        Self { start, end }
    }

    /// Window with no start and no end
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Build from the stored representation (`end == 0` means unbounded)
    pub fn from_stored(start: i64, end: i64) -> Self {
        Self {
            start,
            end: (end != 0).then_some(end),
        }
    }

    /// End as stored in the roster
    pub fn stored_end(&self) -> i64 {
        self.end.unwrap_or(0)
    }

    /// Whether `now` lies inside the window
    pub fn contains(&self, now: i64) -> bool {
        self.start <= now && self.end.map_or(true, |end| end > now)
    }
}

impl fmt::Display for ValidityWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, ∞)", self.start),
        }
    }
}

/// Who wrote a managed record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribution {
    pub component: String,
    pub item: LinkId,
}

impl Attribution {
    /// Attribution for records written on behalf of a link
    pub fn for_link(link: LinkId) -> Self {
        Self {
            component: COMPONENT.to_string(),
            item: link,
        }
    }

    pub fn is_ours(&self) -> bool {
        self.component == COMPONENT
    }
}

/// One user's enrolment in one parent source, read-only input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentMembershipFact {
    pub user: UserId,
    pub source: SourceId,
    pub status: MembershipStatus,
    pub window: ValidityWindow,
    pub source_status: SourceStatus,
}

impl ParentMembershipFact {
    pub fn counts_as_active(&self) -> bool {
        both_active(self.status, self.source_status)
    }
}

/// The materialized membership of a user under a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildMembership {
    pub user: UserId,
    pub link: LinkId,
    pub status: MembershipStatus,
    pub window: ValidityWindow,
}

/// A role in the child course granted on behalf of a link
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributedRoleGrant {
    pub user: UserId,
    pub course: CourseId,
    pub role: RoleId,
    pub attribution: Attribution,
}

impl AttributedRoleGrant {
    pub fn new(user: UserId, course: CourseId, role: RoleId, link: LinkId) -> Self {
        Self {
            user,
            course,
            role,
            attribution: Attribution::for_link(link),
        }
    }

    pub fn link(&self) -> LinkId {
        self.attribution.item
    }
}

/// A child group membership implied by a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group: GroupId,
    pub user: UserId,
    pub attribution: Attribution,
}
