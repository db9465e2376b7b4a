//! Type-safe identifier wrappers
//!
//! Every row id in the roster is an `i64`. Wrapping them keeps user ids from
//! being passed where a course id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw row id
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// The raw row id
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self::new(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                id.0
            }
        }
    };
}

row_id!(
    /// A user
    UserId
);
row_id!(
    /// A course (the context roles are assigned in)
    CourseId
);
row_id!(
    /// A group inside a course
    GroupId
);
row_id!(
    /// A configured parent → child link
    LinkId
);
row_id!(
    /// A role definition
    RoleId
);
row_id!(
    /// An enrolment source in a parent course
    SourceId
);
