//! Course roster store for Rust
//!
//! A typed interface to the relational roster that enrolment plugins read and
//! write: courses, groups, group members, enrolment sources, user enrolments,
//! course-level role assignments, course links and the enrolments produced
//! through those links.
//!
//! Every record that a plugin writes on behalf of a link carries an
//! attribution pair (`component`, `item_id`). Manual records use an empty
//! component and item `0`.
//!
//! # Example
//!
//! ```no_run
//! use roster::{EnrolStatus, RosterDb};
//!
//! let db = RosterDb::in_memory()?;
//!
//! let course = db.add_course("BIO101", "Biology 101")?;
//! let group = db.add_group(course, "Lab A")?;
//! let source = db.add_source(course, "manual", true)?;
//!
//! db.enrol(source, 42, EnrolStatus::Active, 0, 0)?;
//! db.add_group_member(group, 42, "", 0)?;
//!
//! let rows = db.parent_enrolments(course, group, Some(42), "metagroup")?;
//! assert_eq!(rows.len(), 1);
//! # Ok::<(), roster::Error>(())
//! ```

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur when talking to the roster database
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Course not found: {0}")]
    CourseNotFound(i64),

    #[error("Group not found: {0}")]
    GroupNotFound(i64),

    #[error("Link not found: {0}")]
    LinkNotFound(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for roster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Status of a user enrolment row (`0` active, `1` suspended)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum EnrolStatus {
    Active = 0,
    Suspended = 1,
}

impl std::fmt::Display for EnrolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrolStatus::Active => write!(f, "active"),
            EnrolStatus::Suspended => write!(f, "suspended"),
        }
    }
}

impl ToSql for EnrolStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as i64))
    }
}

impl FromSql for EnrolStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(EnrolStatus::Active),
            1 => Ok(EnrolStatus::Suspended),
            other => Err(FromSqlError::OutOfRange(other)),
        }
    }
}

/// A course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: i64,
    pub shortname: String,
    pub fullname: String,
}

/// A group inside a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub course_id: i64,
    pub name: String,
}

/// A group membership row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: i64,
    pub user_id: i64,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub item_id: i64,
}

/// An enrolment source (one enrolment method instance in a course)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolSource {
    pub id: i64,
    pub course_id: i64,
    pub plugin: String,
    pub enabled: bool,
}

/// A user enrolment joined with the enabled flag of its source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentEnrolment {
    pub user_id: i64,
    pub source_id: i64,
    pub status: EnrolStatus,
    pub time_start: i64,
    /// `0` means no end date
    pub time_end: i64,
    pub source_enabled: bool,
}

/// A course-level role assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub role_id: i64,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub item_id: i64,
}

/// A stored course link (parent course + group feeding a child course)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub id: i64,
    pub name: String,
    pub child_course: i64,
    pub parent_course: i64,
    pub parent_group: i64,
    #[serde(default)]
    pub child_group: Option<i64>,
    pub enabled: bool,
    pub default_role: i64,
}

/// Fields required to insert a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLinkRecord {
    pub name: String,
    pub child_course: i64,
    pub parent_course: i64,
    pub parent_group: i64,
    pub child_group: Option<i64>,
    pub enabled: bool,
    pub default_role: i64,
}

/// An enrolment produced through a link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEnrolment {
    pub link_id: i64,
    pub user_id: i64,
    pub status: EnrolStatus,
    pub time_start: i64,
    /// `0` means no end date
    pub time_end: i64,
}

/// A single group membership change made by [`RosterDb::sync_groups_with_enrolment`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupChange {
    pub user_id: i64,
    pub course_id: i64,
    pub group_id: i64,
    pub group_name: String,
}

/// Outcome of a group synchronisation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSyncResult {
    pub added: Vec<GroupChange>,
    pub removed: Vec<GroupChange>,
}

impl GroupSyncResult {
    /// Total number of memberships touched
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

/// SQLite-backed roster database
pub struct RosterDb {
    conn: Connection,
}

impl RosterDb {
    /// Open or create a roster database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Create a roster database that lives only in memory
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS courses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                shortname TEXT NOT NULL,
                fullname TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                course_id INTEGER NOT NULL,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                component TEXT NOT NULL DEFAULT '',
                item_id INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS enrol_plugins (
                name TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS enrol_sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                course_id INTEGER NOT NULL,
                plugin TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS user_enrolments (
                source_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                time_start INTEGER NOT NULL DEFAULT 0,
                time_end INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (source_id, user_id),
                FOREIGN KEY (source_id) REFERENCES enrol_sources(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS role_assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                course_id INTEGER NOT NULL,
                role_id INTEGER NOT NULL,
                component TEXT NOT NULL DEFAULT '',
                item_id INTEGER NOT NULL DEFAULT 0,
                UNIQUE (user_id, course_id, role_id, component, item_id)
            );

            CREATE TABLE IF NOT EXISTS links (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                child_course INTEGER NOT NULL,
                parent_course INTEGER NOT NULL,
                parent_group INTEGER NOT NULL,
                child_group INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                default_role INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS child_enrolments (
                link_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                status INTEGER NOT NULL,
                time_start INTEGER NOT NULL DEFAULT 0,
                time_end INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (link_id, user_id),
                FOREIGN KEY (link_id) REFERENCES links(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_groups_course ON groups(course_id);
            CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);
            CREATE INDEX IF NOT EXISTS idx_sources_course ON enrol_sources(course_id);
            CREATE INDEX IF NOT EXISTS idx_user_enrolments_user ON user_enrolments(user_id);
            CREATE INDEX IF NOT EXISTS idx_role_assignments_course ON role_assignments(course_id, user_id);
            CREATE INDEX IF NOT EXISTS idx_role_assignments_item ON role_assignments(component, item_id);
            CREATE INDEX IF NOT EXISTS idx_links_parent ON links(parent_course);
            CREATE INDEX IF NOT EXISTS idx_links_child ON links(child_course);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` inside a single transaction
    ///
    /// Every statement issued through this database while `f` runs belongs to
    /// the transaction. It is committed when `f` returns `Ok` and rolled back
    /// otherwise.
    pub fn atomically<T, E>(&self, f: impl FnOnce() -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| E::from(Error::from(e)))?;
        let value = f()?;
        tx.commit().map_err(|e| E::from(Error::from(e)))?;
        Ok(value)
    }

    /// Execute raw SQL (used by fixtures and maintenance tooling)
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    // --- Courses ---

    /// Insert a course and return its id
    pub fn add_course(&self, shortname: &str, fullname: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO courses (shortname, fullname) VALUES (?1, ?2)",
            params![shortname, fullname],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Look up a course
    pub fn course(&self, id: i64) -> Result<Option<Course>> {
        let course = self
            .conn
            .query_row(
                "SELECT id, shortname, fullname FROM courses WHERE id = ?1",
                [id],
                |row| {
                    Ok(Course {
                        id: row.get(0)?,
                        shortname: row.get(1)?,
                        fullname: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(course)
    }

    /// Delete a course row (its enrolments and groups are left for the caller)
    pub fn delete_course(&self, id: i64) -> Result<bool> {
        let affected = self.conn.execute("DELETE FROM courses WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    // --- Groups ---

    /// Insert a group and return its id
    pub fn add_group(&self, course_id: i64, name: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO groups (course_id, name) VALUES (?1, ?2)",
            params![course_id, name],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Look up a group
    pub fn group(&self, id: i64) -> Result<Option<Group>> {
        let group = self
            .conn
            .query_row(
                "SELECT id, course_id, name FROM groups WHERE id = ?1",
                [id],
                group_from_row,
            )
            .optional()?;
        Ok(group)
    }

    /// All groups of a course, ordered by name
    pub fn groups_in_course(&self, course_id: i64) -> Result<Vec<Group>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, course_id, name FROM groups WHERE course_id = ?1 ORDER BY name, id")?;
        let groups = stmt
            .query_map([course_id], group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(groups)
    }

    /// Check whether a course already has a group with this exact name
    pub fn group_name_exists(&self, course_id: i64, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM groups WHERE course_id = ?1 AND name = ?2",
            params![course_id, name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Delete a group and its memberships
    pub fn delete_group(&self, id: i64) -> Result<bool> {
        self.conn
            .execute("DELETE FROM group_members WHERE group_id = ?1", [id])?;
        let affected = self.conn.execute("DELETE FROM groups WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    /// Add a user to a group; returns false if the user was already a member
    pub fn add_group_member(
        &self,
        group_id: i64,
        user_id: i64,
        component: &str,
        item_id: i64,
    ) -> Result<bool> {
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, component, item_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![group_id, user_id, component, item_id],
        )?;
        Ok(affected > 0)
    }

    /// Remove a user from a group regardless of attribution
    pub fn remove_group_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )?;
        Ok(affected > 0)
    }

    /// Remove group memberships carrying the given attribution
    ///
    /// `user_id = None` removes the memberships of every user.
    pub fn remove_attributed_group_members(
        &self,
        component: &str,
        item_id: i64,
        user_id: Option<i64>,
    ) -> Result<usize> {
        let affected = self.conn.execute(
            "DELETE FROM group_members
             WHERE component = ?1 AND item_id = ?2 AND (?3 IS NULL OR user_id = ?3)",
            params![component, item_id, user_id],
        )?;
        Ok(affected)
    }

    /// Members of a group
    pub fn group_members(&self, group_id: i64) -> Result<Vec<GroupMember>> {
        let mut stmt = self.conn.prepare(
            "SELECT group_id, user_id, component, item_id FROM group_members
             WHERE group_id = ?1 ORDER BY user_id",
        )?;
        let members = stmt
            .query_map([group_id], |row| {
                Ok(GroupMember {
                    group_id: row.get(0)?,
                    user_id: row.get(1)?,
                    component: row.get(2)?,
                    item_id: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    // --- Enrolment plugins and sources ---

    /// Enable or disable an enrolment plugin site-wide
    pub fn set_plugin_enabled(&self, plugin: &str, enabled: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO enrol_plugins (name, enabled) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET enabled = excluded.enabled",
            params![plugin, enabled],
        )?;
        Ok(())
    }

    /// Add an enrolment source to a course; the plugin is registered as enabled if unknown
    pub fn add_source(&self, course_id: i64, plugin: &str, enabled: bool) -> Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO enrol_plugins (name, enabled) VALUES (?1, 1)",
            [plugin],
        )?;
        self.conn.execute(
            "INSERT INTO enrol_sources (course_id, plugin, enabled) VALUES (?1, ?2, ?3)",
            params![course_id, plugin, enabled],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Enable or disable one enrolment source
    pub fn set_source_enabled(&self, source_id: i64, enabled: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE enrol_sources SET enabled = ?2 WHERE id = ?1",
            params![source_id, enabled],
        )?;
        Ok(())
    }

    /// Look up a source
    pub fn source(&self, source_id: i64) -> Result<Option<EnrolSource>> {
        let source = self
            .conn
            .query_row(
                "SELECT id, course_id, plugin, enabled FROM enrol_sources WHERE id = ?1",
                [source_id],
                |row| {
                    Ok(EnrolSource {
                        id: row.get(0)?,
                        course_id: row.get(1)?,
                        plugin: row.get(2)?,
                        enabled: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(source)
    }

    // --- User enrolments ---

    /// Create or replace a user enrolment in a source
    pub fn enrol(
        &self,
        source_id: i64,
        user_id: i64,
        status: EnrolStatus,
        time_start: i64,
        time_end: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO user_enrolments (source_id, user_id, status, time_start, time_end)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_id, user_id) DO UPDATE SET
                status = excluded.status,
                time_start = excluded.time_start,
                time_end = excluded.time_end",
            params![source_id, user_id, status, time_start, time_end],
        )?;
        Ok(())
    }

    /// Remove a user enrolment from a source
    pub fn unenrol(&self, source_id: i64, user_id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM user_enrolments WHERE source_id = ?1 AND user_id = ?2",
            params![source_id, user_id],
        )?;
        Ok(affected > 0)
    }

    /// User enrolments of a course that feed a link
    ///
    /// Only rows from sources whose plugin is enabled site-wide are returned,
    /// `exclude_plugin` is never read, and the user must be a member of
    /// `group_id`, which itself must belong to `course_id`. `user_id = None`
    /// returns the rows of every user.
    pub fn parent_enrolments(
        &self,
        course_id: i64,
        group_id: i64,
        user_id: Option<i64>,
        exclude_plugin: &str,
    ) -> Result<Vec<ParentEnrolment>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ue.user_id, ue.source_id, ue.status, ue.time_start, ue.time_end, s.enabled
              FROM user_enrolments ue
              JOIN enrol_sources s ON (s.id = ue.source_id AND s.course_id = ?1 AND s.plugin <> ?3)
              JOIN enrol_plugins p ON (p.name = s.plugin AND p.enabled = 1)
              JOIN group_members gm ON (gm.user_id = ue.user_id AND gm.group_id = ?2)
              JOIN groups g ON (g.id = gm.group_id AND g.course_id = s.course_id)
             WHERE (?4 IS NULL OR ue.user_id = ?4)
             ORDER BY ue.user_id, ue.source_id
            "#,
        )?;
        let rows = stmt
            .query_map(params![course_id, group_id, exclude_plugin, user_id], |row| {
                Ok(ParentEnrolment {
                    user_id: row.get(0)?,
                    source_id: row.get(1)?,
                    status: row.get(2)?,
                    time_start: row.get(3)?,
                    time_end: row.get(4)?,
                    source_enabled: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // --- Role assignments ---

    /// Assign a course role; returns false if the identical assignment exists
    pub fn assign_role(
        &self,
        user_id: i64,
        course_id: i64,
        role_id: i64,
        component: &str,
        item_id: i64,
    ) -> Result<bool> {
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO role_assignments (user_id, course_id, role_id, component, item_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, course_id, role_id, component, item_id],
        )?;
        Ok(affected > 0)
    }

    /// Remove one role assignment with the given attribution
    pub fn unassign_role(
        &self,
        user_id: i64,
        course_id: i64,
        role_id: i64,
        component: &str,
        item_id: i64,
    ) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM role_assignments
             WHERE user_id = ?1 AND course_id = ?2 AND role_id = ?3 AND component = ?4 AND item_id = ?5",
            params![user_id, course_id, role_id, component, item_id],
        )?;
        Ok(affected > 0)
    }

    /// Remove every role assignment of a component, optionally narrowed to an item and a user
    pub fn unassign_all(
        &self,
        component: &str,
        item_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<usize> {
        let affected = self.conn.execute(
            "DELETE FROM role_assignments
             WHERE component = ?1 AND (?2 IS NULL OR item_id = ?2) AND (?3 IS NULL OR user_id = ?3)",
            params![component, item_id, user_id],
        )?;
        Ok(affected)
    }

    /// Role assignments held in a course, skipping those written by `exclude_component`
    pub fn course_role_assignments(
        &self,
        course_id: i64,
        user_id: Option<i64>,
        exclude_component: &str,
    ) -> Result<Vec<RoleAssignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, course_id, role_id, component, item_id FROM role_assignments
             WHERE course_id = ?1 AND (?2 IS NULL OR user_id = ?2) AND component <> ?3
             ORDER BY user_id, role_id",
        )?;
        let rows = stmt
            .query_map(params![course_id, user_id, exclude_component], role_assignment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Role assignments written by a component, optionally narrowed to an item and a user
    pub fn attributed_role_assignments(
        &self,
        component: &str,
        item_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<Vec<RoleAssignment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, course_id, role_id, component, item_id FROM role_assignments
             WHERE component = ?1 AND (?2 IS NULL OR item_id = ?2) AND (?3 IS NULL OR user_id = ?3)
             ORDER BY item_id, user_id, role_id",
        )?;
        let rows = stmt
            .query_map(params![component, item_id, user_id], role_assignment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // --- Links ---

    /// Insert a link and return its id
    pub fn insert_link(&self, link: &NewLinkRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO links (name, child_course, parent_course, parent_group, child_group, enabled, default_role)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &link.name,
                link.child_course,
                link.parent_course,
                link.parent_group,
                link.child_group,
                link.enabled,
                link.default_role,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Look up a link
    pub fn link(&self, id: i64) -> Result<Option<LinkRecord>> {
        let link = self
            .conn
            .query_row(
                "SELECT id, name, child_course, parent_course, parent_group, child_group, enabled, default_role
                 FROM links WHERE id = ?1",
                [id],
                link_from_row,
            )
            .optional()?;
        Ok(link)
    }

    /// Links feeding a child course (`None` = every link), ordered by id
    pub fn links(&self, child_course: Option<i64>) -> Result<Vec<LinkRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, child_course, parent_course, parent_group, child_group, enabled, default_role
             FROM links WHERE (?1 IS NULL OR child_course = ?1) ORDER BY id",
        )?;
        let links = stmt
            .query_map([child_course], link_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    /// Links reading from a parent course, ordered by id
    pub fn links_for_parent(&self, parent_course: i64) -> Result<Vec<LinkRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, child_course, parent_course, parent_group, child_group, enabled, default_role
             FROM links WHERE parent_course = ?1 ORDER BY id",
        )?;
        let links = stmt
            .query_map([parent_course], link_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    /// Enable or disable a link
    pub fn set_link_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE links SET enabled = ?2 WHERE id = ?1",
            params![id, enabled],
        )?;
        if affected == 0 {
            return Err(Error::LinkNotFound(id));
        }
        Ok(())
    }

    /// Overwrite the editable columns of a link (courses and status stay)
    pub fn update_link(&self, id: i64, link: &NewLinkRecord) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE links SET name = ?2, parent_group = ?3, child_group = ?4, default_role = ?5
             WHERE id = ?1",
            params![id, &link.name, link.parent_group, link.child_group, link.default_role],
        )?;
        if affected == 0 {
            return Err(Error::LinkNotFound(id));
        }
        Ok(())
    }

    /// Delete a link row; child enrolments go with it
    pub fn delete_link(&self, id: i64) -> Result<bool> {
        let affected = self.conn.execute("DELETE FROM links WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    // --- Child enrolments ---

    /// The enrolment a link produced for a user
    pub fn child_enrolment(&self, link_id: i64, user_id: i64) -> Result<Option<ChildEnrolment>> {
        let row = self
            .conn
            .query_row(
                "SELECT link_id, user_id, status, time_start, time_end FROM child_enrolments
                 WHERE link_id = ?1 AND user_id = ?2",
                params![link_id, user_id],
                child_enrolment_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Every enrolment a link produced, ordered by user
    pub fn child_enrolments(&self, link_id: i64) -> Result<Vec<ChildEnrolment>> {
        let mut stmt = self.conn.prepare(
            "SELECT link_id, user_id, status, time_start, time_end FROM child_enrolments
             WHERE link_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt
            .query_map([link_id], child_enrolment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Insert a child enrolment
    pub fn insert_child_enrolment(&self, row: &ChildEnrolment) -> Result<()> {
        self.conn.execute(
            "INSERT INTO child_enrolments (link_id, user_id, status, time_start, time_end)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.link_id, row.user_id, row.status, row.time_start, row.time_end],
        )?;
        Ok(())
    }

    /// Update the status and dates of a child enrolment
    pub fn update_child_enrolment(&self, row: &ChildEnrolment) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE child_enrolments SET status = ?3, time_start = ?4, time_end = ?5
             WHERE link_id = ?1 AND user_id = ?2",
            params![row.link_id, row.user_id, row.status, row.time_start, row.time_end],
        )?;
        Ok(affected > 0)
    }

    /// Delete a child enrolment
    pub fn delete_child_enrolment(&self, link_id: i64, user_id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "DELETE FROM child_enrolments WHERE link_id = ?1 AND user_id = ?2",
            params![link_id, user_id],
        )?;
        Ok(affected > 0)
    }

    // --- Group synchronisation ---

    /// Align group memberships attributed to `component` with child enrolments
    ///
    /// Every user enrolled through a link that names a child group becomes a
    /// member of that group, attributed to (`component`, link id). Attributed
    /// members whose enrolment is gone, or whose link now points at another
    /// group, are removed. `child_course = None` covers every link.
    pub fn sync_groups_with_enrolment(
        &self,
        component: &str,
        child_course: Option<i64>,
    ) -> Result<GroupSyncResult> {
        let mut result = GroupSyncResult::default();

        let mut stale = self.conn.prepare(
            r#"
            SELECT gm.user_id, g.course_id, gm.group_id, g.name
              FROM group_members gm
              JOIN groups g ON g.id = gm.group_id
              LEFT JOIN links l ON l.id = gm.item_id
              LEFT JOIN child_enrolments ce ON (ce.link_id = l.id AND ce.user_id = gm.user_id)
             WHERE gm.component = ?1
               AND (?2 IS NULL OR l.child_course = ?2 OR l.id IS NULL)
               AND (l.id IS NULL OR ce.user_id IS NULL OR l.child_group IS NULL OR l.child_group <> gm.group_id)
             ORDER BY gm.group_id, gm.user_id
            "#,
        )?;
        let removed = stale
            .query_map(params![component, child_course], group_change_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for change in removed {
            self.remove_group_member(change.group_id, change.user_id)?;
            result.removed.push(change);
        }

        let mut missing = self.conn.prepare(
            r#"
            SELECT ce.user_id, g.course_id, g.id, g.name, l.id
              FROM child_enrolments ce
              JOIN links l ON l.id = ce.link_id
              JOIN groups g ON (g.id = l.child_group AND g.course_id = l.child_course)
              LEFT JOIN group_members gm ON (gm.group_id = g.id AND gm.user_id = ce.user_id)
             WHERE gm.user_id IS NULL
               AND (?1 IS NULL OR l.child_course = ?1)
             ORDER BY g.id, ce.user_id
            "#,
        )?;
        let added = missing
            .query_map([child_course], |row| {
                Ok((group_change_from_row(row)?, row.get::<_, i64>(4)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (change, link_id) in added {
            if self.add_group_member(change.group_id, change.user_id, component, link_id)? {
                result.added.push(change);
            }
        }

        Ok(result)
    }
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        course_id: row.get(1)?,
        name: row.get(2)?,
    })
}

fn role_assignment_from_row(row: &Row<'_>) -> rusqlite::Result<RoleAssignment> {
    Ok(RoleAssignment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        course_id: row.get(2)?,
        role_id: row.get(3)?,
        component: row.get(4)?,
        item_id: row.get(5)?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<LinkRecord> {
    Ok(LinkRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        child_course: row.get(2)?,
        parent_course: row.get(3)?,
        parent_group: row.get(4)?,
        child_group: row.get(5)?,
        enabled: row.get(6)?,
        default_role: row.get(7)?,
    })
}

fn child_enrolment_from_row(row: &Row<'_>) -> rusqlite::Result<ChildEnrolment> {
    Ok(ChildEnrolment {
        link_id: row.get(0)?,
        user_id: row.get(1)?,
        status: row.get(2)?,
        time_start: row.get(3)?,
        time_end: row.get(4)?,
    })
}

fn group_change_from_row(row: &Row<'_>) -> rusqlite::Result<GroupChange> {
    Ok(GroupChange {
        user_id: row.get(0)?,
        course_id: row.get(1)?,
        group_id: row.get(2)?,
        group_name: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (RosterDb, i64, i64, i64) {
        let db = RosterDb::in_memory().unwrap();
        let course = db.add_course("BIO101", "Biology 101").unwrap();
        let group = db.add_group(course, "Lab A").unwrap();
        let source = db.add_source(course, "manual", true).unwrap();
        (db, course, group, source)
    }

    #[test]
    fn test_status_display() {
        assert_eq!(EnrolStatus::Active.to_string(), "active");
        assert_eq!(EnrolStatus::Suspended.to_string(), "suspended");
    }

    #[test]
    fn test_status_serializes_as_number() {
        assert_eq!(serde_json::to_string(&EnrolStatus::Suspended).unwrap(), "1");
    }

    #[test]
    fn test_parent_enrolments_require_group_membership() {
        let (db, course, group, source) = seeded();
        db.enrol(source, 1, EnrolStatus::Active, 0, 0).unwrap();
        db.enrol(source, 2, EnrolStatus::Active, 0, 0).unwrap();
        db.add_group_member(group, 1, "", 0).unwrap();

        let rows = db.parent_enrolments(course, group, None, "metagroup").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, 1);
        assert!(rows[0].source_enabled);
    }

    #[test]
    fn test_parent_enrolments_skip_disabled_plugins_and_excluded_plugin() {
        let (db, course, group, source) = seeded();
        let self_source = db.add_source(course, "metagroup", true).unwrap();
        let cohort = db.add_source(course, "cohort", true).unwrap();
        db.add_group_member(group, 1, "", 0).unwrap();
        db.enrol(source, 1, EnrolStatus::Active, 0, 0).unwrap();
        db.enrol(self_source, 1, EnrolStatus::Active, 0, 0).unwrap();
        db.enrol(cohort, 1, EnrolStatus::Active, 0, 0).unwrap();
        db.set_plugin_enabled("cohort", false).unwrap();

        let rows = db.parent_enrolments(course, group, Some(1), "metagroup").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_id, source);
    }

    #[test]
    fn test_group_of_other_course_does_not_qualify() {
        let (db, course, _group, source) = seeded();
        let other = db.add_course("CHEM", "Chemistry").unwrap();
        let foreign_group = db.add_group(other, "Lab B").unwrap();
        db.add_group_member(foreign_group, 1, "", 0).unwrap();
        db.enrol(source, 1, EnrolStatus::Active, 0, 0).unwrap();

        let rows = db.parent_enrolments(course, foreign_group, None, "metagroup").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_enrol_upserts() {
        let (db, course, group, source) = seeded();
        db.add_group_member(group, 1, "", 0).unwrap();
        db.enrol(source, 1, EnrolStatus::Active, 0, 0).unwrap();
        db.enrol(source, 1, EnrolStatus::Suspended, 10, 20).unwrap();

        let rows = db.parent_enrolments(course, group, Some(1), "metagroup").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, EnrolStatus::Suspended);
        assert_eq!((rows[0].time_start, rows[0].time_end), (10, 20));
    }

    #[test]
    fn test_role_assignment_attribution() {
        let (db, course, _, _) = seeded();
        assert!(db.assign_role(1, course, 5, "", 0).unwrap());
        assert!(!db.assign_role(1, course, 5, "", 0).unwrap());
        assert!(db.assign_role(1, course, 5, "metagroup", 7).unwrap());

        let manual = db.course_role_assignments(course, Some(1), "metagroup").unwrap();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].component, "");

        let attributed = db.attributed_role_assignments("metagroup", Some(7), None).unwrap();
        assert_eq!(attributed.len(), 1);

        assert_eq!(db.unassign_all("metagroup", None, None).unwrap(), 1);
        assert_eq!(db.course_role_assignments(course, None, "metagroup").unwrap().len(), 1);
    }

    #[test]
    fn test_atomically_rolls_back_on_error() {
        let (db, course, _, _) = seeded();
        let outcome: Result<()> = db.atomically(|| {
            db.assign_role(1, course, 5, "", 0)?;
            Err(Error::CourseNotFound(99))
        });
        assert!(outcome.is_err());
        assert!(db.course_role_assignments(course, None, "x").unwrap().is_empty());
    }

    #[test]
    fn test_link_round_trip_and_cascade() {
        let (db, course, group, _) = seeded();
        let child = db.add_course("BIO-LAB", "Biology Lab").unwrap();
        let id = db
            .insert_link(&NewLinkRecord {
                name: "BIO101 (Lab A)".to_string(),
                child_course: child,
                parent_course: course,
                parent_group: group,
                child_group: None,
                enabled: true,
                default_role: 5,
            })
            .unwrap();

        let link = db.link(id).unwrap().unwrap();
        assert_eq!(link.parent_group, group);
        assert_eq!(db.links_for_parent(course).unwrap().len(), 1);
        assert_eq!(db.links(Some(child)).unwrap().len(), 1);
        assert!(db.links(Some(course)).unwrap().is_empty());

        db.insert_child_enrolment(&ChildEnrolment {
            link_id: id,
            user_id: 1,
            status: EnrolStatus::Active,
            time_start: 0,
            time_end: 0,
        })
        .unwrap();
        assert!(db.delete_link(id).unwrap());
        assert!(db.child_enrolment(id, 1).unwrap().is_none());
    }

    #[test]
    fn test_update_link_keeps_courses_and_status() {
        let (db, course, group, _) = seeded();
        let child = db.add_course("BIO-LAB", "Biology Lab").unwrap();
        let other = db.add_group(course, "Lab B").unwrap();
        let mut record = NewLinkRecord {
            name: "BIO101 (Lab A)".to_string(),
            child_course: child,
            parent_course: course,
            parent_group: group,
            child_group: None,
            enabled: false,
            default_role: 5,
        };
        let id = db.insert_link(&record).unwrap();

        record.name = "BIO101 (Lab B)".to_string();
        record.parent_group = other;
        record.child_course = 999;
        record.enabled = true;
        db.update_link(id, &record).unwrap();

        let link = db.link(id).unwrap().unwrap();
        assert_eq!(link.name, "BIO101 (Lab B)");
        assert_eq!(link.parent_group, other);
        assert_eq!(link.child_course, child);
        assert!(!link.enabled);

        assert!(matches!(db.update_link(42, &record), Err(Error::LinkNotFound(42))));
    }

    #[test]
    fn test_sync_groups_adds_and_removes() {
        let (db, course, group, _) = seeded();
        let child = db.add_course("BIO-LAB", "Biology Lab").unwrap();
        let child_group = db.add_group(child, "From BIO101").unwrap();
        let id = db
            .insert_link(&NewLinkRecord {
                name: "link".to_string(),
                child_course: child,
                parent_course: course,
                parent_group: group,
                child_group: Some(child_group),
                enabled: true,
                default_role: 5,
            })
            .unwrap();
        for user in [1, 2] {
            db.insert_child_enrolment(&ChildEnrolment {
                link_id: id,
                user_id: user,
                status: EnrolStatus::Active,
                time_start: 0,
                time_end: 0,
            })
            .unwrap();
        }

        let first = db.sync_groups_with_enrolment("metagroup", None).unwrap();
        assert_eq!(first.added.len(), 2);
        assert!(first.removed.is_empty());

        db.delete_child_enrolment(id, 2).unwrap();
        let second = db.sync_groups_with_enrolment("metagroup", Some(child)).unwrap();
        assert!(second.added.is_empty());
        assert_eq!(second.removed.len(), 1);
        assert_eq!(second.removed[0].user_id, 2);

        let third = db.sync_groups_with_enrolment("metagroup", None).unwrap();
        assert_eq!(third.change_count(), 0);
    }

    #[test]
    fn test_file_backed_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("roster.db");
        {
            let db = RosterDb::open(&path).unwrap();
            db.add_course("A", "Course A").unwrap();
        }
        let db = RosterDb::open(&path).unwrap();
        assert!(db.course(1).unwrap().is_some());
    }
}
