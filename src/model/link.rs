//! Links and the course/group records they point at

use super::ids::{CourseId, GroupId, LinkId, RoleId};
use serde::{Deserialize, Serialize};

/// Prefix of the fallback display name of a link
pub const DEFAULT_LINK_NAME: &str = "Course metagroup link";

/// A configured synchronization from a parent course group into a child course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub name: String,
    pub child_course: CourseId,
    pub parent_course: CourseId,
    pub parent_group: GroupId,
    /// `None` disables group sync in the child course
    pub child_group: Option<GroupId>,
    pub enabled: bool,
    pub default_role: RoleId,
}

impl From<roster::LinkRecord> for Link {
    fn from(record: roster::LinkRecord) -> Self {
        Self {
            id: LinkId::new(record.id),
            name: record.name,
            child_course: CourseId::new(record.child_course),
            parent_course: CourseId::new(record.parent_course),
            parent_group: GroupId::new(record.parent_group),
            child_group: record.child_group.map(GroupId::new),
            enabled: record.enabled,
            default_role: RoleId::new(record.default_role),
        }
    }
}

/// Child group choice when creating a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "group")]
pub enum ChildGroup {
    /// No group sync
    #[default]
    None,
    /// Sync into this existing group of the child course
    Existing(GroupId),
    /// Create a new group named after the parent course
    CreateNew,
}

/// Request to create a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLink {
    pub child_course: CourseId,
    pub parent_course: CourseId,
    pub parent_group: GroupId,
    #[serde(default)]
    pub child_group: ChildGroup,
    pub default_role: RoleId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewLink {
    pub fn new(
        child_course: CourseId,
        parent_course: CourseId,
        parent_group: GroupId,
        default_role: RoleId,
    ) -> Self {
        Self {
            child_course,
            parent_course,
            parent_group,
            child_group: ChildGroup::None,
            default_role,
            enabled: true,
        }
    }

    pub fn with_child_group(mut self, child_group: ChildGroup) -> Self {
        self.child_group = child_group;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Changes to an existing link; `None` leaves a field as it is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkUpdate {
    #[serde(default)]
    pub parent_group: Option<GroupId>,
    #[serde(default)]
    pub child_group: Option<ChildGroup>,
    #[serde(default)]
    pub default_role: Option<RoleId>,
}

impl LinkUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent_group(mut self, group: GroupId) -> Self {
        self.parent_group = Some(group);
        self
    }

    pub fn with_child_group(mut self, child_group: ChildGroup) -> Self {
        self.child_group = Some(child_group);
        self
    }

    pub fn with_default_role(mut self, role: RoleId) -> Self {
        self.default_role = Some(role);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub shortname: String,
    pub fullname: String,
}

impl From<roster::Course> for Course {
    fn from(course: roster::Course) -> Self {
        Self {
            id: CourseId::new(course.id),
            shortname: course.shortname,
            fullname: course.fullname,
        }
    }
}

/// A group inside a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub course: CourseId,
    pub name: String,
}

impl From<roster::Group> for Group {
    fn from(group: roster::Group) -> Self {
        Self {
            id: GroupId::new(group.id),
            course: CourseId::new(group.course_id),
            name: group.name,
        }
    }
}
