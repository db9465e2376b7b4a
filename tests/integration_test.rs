//! Integration tests for metagroup-sync
//!
//! These tests drive the engine through its public API against in-memory and
//! file-backed roster databases.

use metagroup_sync::clock::FixedClock;
use metagroup_sync::config::SyncConfig;
use metagroup_sync::model::{ChildGroup, CourseId, GroupId, Link, NewLink, RoleId, UserId, COMPONENT};
use metagroup_sync::store::LinkStore;
use metagroup_sync::sync::Reaction;
use metagroup_sync::{
    BulkSweep, EventReactor, LinkRegistry, Reconciler, SweepReport, SweepStatus, SyncContext,
    SyncError, SyncPolicy, UnenrolAction,
};
use roster::{ChildEnrolment, EnrolStatus, RosterDb};
use tempfile::TempDir;

const NOW: i64 = 1_000;
const STUDENT: i64 = 5;
const TEACHER: i64 = 3;

/// Courses 10 (parent) and 20 (child), group 5 in course 10, one manual source
struct Site {
    db: RosterDb,
    source: i64,
}

fn site() -> Site {
    let db = RosterDb::in_memory().unwrap();
    db.execute_batch(
        "INSERT INTO courses (id, shortname, fullname) VALUES (10, 'PHY', 'Physics'), (20, 'PHY-LAB', 'Physics lab');
         INSERT INTO groups (id, course_id, name) VALUES (5, 10, 'Lab group');",
    )
    .unwrap();
    let source = db.add_source(10, "manual", true).unwrap();
    Site { db, source }
}

fn link_request() -> NewLink {
    NewLink::new(CourseId::new(20), CourseId::new(10), GroupId::new(5), RoleId::new(STUDENT))
}

/// Store the standard link without reconciling it
fn insert_link(db: &RosterDb) -> Link {
    LinkStore::insert_link(db, "PHY (Lab group)", &link_request(), None).unwrap()
}

fn member(site: &Site, user: i64, status: EnrolStatus, start: i64, end: i64) {
    site.db.add_group_member(5, user, "", 0).unwrap();
    site.db.enrol(site.source, user, status, start, end).unwrap();
}

fn sweep(db: &RosterDb, policy: &SyncPolicy) -> SweepReport {
    let clock = FixedClock::new(NOW);
    BulkSweep::new(SyncContext::new(db, policy, &clock))
        .run(None)
        .unwrap()
}

fn react(db: &RosterDb, policy: &SyncPolicy, user: i64) -> Reaction {
    let clock = FixedClock::new(NOW);
    let reconciler = Reconciler::new(SyncContext::new(db, policy, &clock));
    EventReactor::new()
        .on_parent_changed(&reconciler, CourseId::new(10), UserId::new(user))
        .unwrap()
}

/// (user, role) pairs granted by the engine in course 20
fn granted(db: &RosterDb) -> Vec<(i64, i64)> {
    db.attributed_role_assignments(COMPONENT, None, None)
        .unwrap()
        .into_iter()
        .filter(|r| r.course_id == 20)
        .map(|r| (r.user_id, r.role_id))
        .collect()
}

mod scenario_tests {
    use super::*;

    #[test]
    fn test_documented_scenario() {
        let site = site();
        let link = insert_link(&site.db);
        member(&site, 42, EnrolStatus::Active, 0, 0);
        site.db.assign_role(42, 10, STUDENT, "", 0).unwrap();
        let policy = SyncPolicy::default().with_unenrol_action(UnenrolAction::SuspendNoRoles);

        let first = sweep(&site.db, &policy);
        assert_eq!(first.status, SweepStatus::Converged);
        assert_eq!(first.enrolled, 1);
        assert_eq!(first.roles_granted, 1);
        assert_eq!(
            site.db.child_enrolment(link.id.get(), 42).unwrap(),
            Some(ChildEnrolment {
                link_id: link.id.get(),
                user_id: 42,
                status: EnrolStatus::Active,
                time_start: 0,
                time_end: 0,
            })
        );
        assert_eq!(granted(&site.db), vec![(42, STUDENT)]);

        site.db.enrol(site.source, 42, EnrolStatus::Suspended, 0, 0).unwrap();
        let second = sweep(&site.db, &policy);
        assert_eq!(second.suspended, 1);
        assert_eq!(second.roles_revoked, 1);
        let row = site.db.child_enrolment(link.id.get(), 42).unwrap().unwrap();
        assert_eq!(row.status, EnrolStatus::Suspended);
        assert!(granted(&site.db).is_empty());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let site = site();
        insert_link(&site.db);
        for user in 1..=4 {
            member(&site, user, EnrolStatus::Active, 0, 0);
            site.db.assign_role(user, 10, STUDENT, "", 0).unwrap();
        }
        site.db.enrol(site.source, 3, EnrolStatus::Suspended, 0, 0).unwrap();
        let policy = SyncPolicy::default();

        assert!(sweep(&site.db, &policy).has_changes());
        let again = sweep(&site.db, &policy);
        assert_eq!(again.status, SweepStatus::Converged);
        assert!(!again.has_changes());
        assert_eq!(again.change_count(), 0);
    }

    #[test]
    fn test_registry_created_link_converges_immediately() {
        let site = site();
        member(&site, 42, EnrolStatus::Active, 0, 0);
        site.db.assign_role(42, 10, STUDENT, "", 0).unwrap();

        let policy = SyncPolicy::default();
        let clock = FixedClock::new(NOW);
        let registry = LinkRegistry::new(SyncContext::new(&site.db, &policy, &clock));
        let link = registry
            .create_link(&link_request().with_child_group(ChildGroup::CreateNew))
            .unwrap();

        assert_eq!(link.name, "PHY (Lab group)");
        assert_eq!(site.db.child_enrolments(link.id.get()).unwrap().len(), 1);
        let group = link.child_group.unwrap();
        assert_eq!(site.db.group(group.get()).unwrap().unwrap().name, "Physics course");
        assert_eq!(site.db.group_members(group.get()).unwrap().len(), 1);

        // Nothing left for the sweep to do
        assert!(!sweep(&site.db, &policy).has_changes());
    }
}

mod equivalence_tests {
    use super::*;

    /// A roster with every interesting per-user shape
    fn varied_site() -> (Site, Link) {
        let site = site();
        let link = insert_link(&site.db);
        let other = site.db.add_source(10, "self", true).unwrap();

        // Plain active member with two roles
        member(&site, 1, EnrolStatus::Active, 0, 0);
        site.db.assign_role(1, 10, STUDENT, "", 0).unwrap();
        site.db.assign_role(1, 10, TEACHER, "", 0).unwrap();

        // Suspended in the parent
        member(&site, 2, EnrolStatus::Suspended, 0, 0);
        site.db.assign_role(2, 10, STUDENT, "", 0).unwrap();

        // Two sources, one suspended, bounded windows
        member(&site, 3, EnrolStatus::Suspended, 100, 1_500);
        site.db.enrol(other, 3, EnrolStatus::Active, 500, 2_000).unwrap();
        site.db.assign_role(3, 10, STUDENT, "", 0).unwrap();

        // Enrolled but not in the group
        site.db.enrol(site.source, 4, EnrolStatus::Active, 0, 0).unwrap();

        // Stale child membership and grant with no parent fact left
        site.db
            .insert_child_enrolment(&ChildEnrolment {
                link_id: link.id.get(),
                user_id: 5,
                status: EnrolStatus::Active,
                time_start: 0,
                time_end: 0,
            })
            .unwrap();
        site.db.assign_role(5, 20, STUDENT, COMPONENT, link.id.get()).unwrap();

        // Window that has not started yet
        member(&site, 6, EnrolStatus::Active, 5_000, 0);
        site.db.assign_role(6, 10, STUDENT, "", 0).unwrap();

        (site, link)
    }

    fn snapshot(db: &RosterDb, link: &Link) -> (Vec<ChildEnrolment>, Vec<(i64, i64)>) {
        (db.child_enrolments(link.id.get()).unwrap(), granted(db))
    }

    fn assert_equivalent(policy: SyncPolicy) {
        let (bulk, link) = varied_site();
        sweep(&bulk.db, &policy);

        let (incremental, _) = varied_site();
        for user in 1..=6 {
            react(&incremental.db, &policy, user);
        }

        assert_eq!(snapshot(&bulk.db, &link), snapshot(&incremental.db, &link));
    }

    #[test]
    fn test_bulk_matches_incremental_default_policy() {
        assert_equivalent(SyncPolicy::default());
    }

    #[test]
    fn test_bulk_matches_incremental_remove() {
        assert_equivalent(SyncPolicy::default().with_unenrol_action(UnenrolAction::Remove));
    }

    #[test]
    fn test_bulk_matches_incremental_suspend_and_skip_list() {
        assert_equivalent(
            SyncPolicy::default()
                .with_unenrol_action(UnenrolAction::Suspend)
                .with_skip_roles([RoleId::new(TEACHER)]),
        );
    }

    #[test]
    fn test_bulk_matches_incremental_without_sync_all() {
        assert_equivalent(SyncPolicy::default().with_sync_all(false));
    }
}

mod policy_tests {
    use super::*;

    #[test]
    fn test_window_is_min_start_and_max_end() {
        let site = site();
        let link = insert_link(&site.db);
        let other = site.db.add_source(10, "self", true).unwrap();
        member(&site, 7, EnrolStatus::Active, 300, 900);
        site.db.enrol(other, 7, EnrolStatus::Active, 100, 5_000).unwrap();

        sweep(&site.db, &SyncPolicy::default());
        let row = site.db.child_enrolment(link.id.get(), 7).unwrap().unwrap();
        assert_eq!((row.time_start, row.time_end), (100, 5_000));

        // An unbounded end dominates
        site.db.enrol(site.source, 7, EnrolStatus::Active, 300, 0).unwrap();
        sweep(&site.db, &SyncPolicy::default());
        let row = site.db.child_enrolment(link.id.get(), 7).unwrap().unwrap();
        assert_eq!((row.time_start, row.time_end), (100, 0));
    }

    #[test]
    fn test_any_active_fact_makes_membership_active() {
        let site = site();
        let link = insert_link(&site.db);
        let other = site.db.add_source(10, "self", true).unwrap();
        member(&site, 8, EnrolStatus::Suspended, 0, 0);
        site.db.enrol(other, 8, EnrolStatus::Active, 0, 0).unwrap();

        sweep(&site.db, &SyncPolicy::default());
        let row = site.db.child_enrolment(link.id.get(), 8).unwrap().unwrap();
        assert_eq!(row.status, EnrolStatus::Active);

        // A disabled source no longer counts as active
        site.db.set_source_enabled(other, false).unwrap();
        sweep(&site.db, &SyncPolicy::default());
        let row = site.db.child_enrolment(link.id.get(), 8).unwrap().unwrap();
        assert_eq!(row.status, EnrolStatus::Suspended);
    }

    #[test]
    fn test_skip_listed_role_is_not_propagated() {
        let site = site();
        insert_link(&site.db);
        member(&site, 1, EnrolStatus::Active, 0, 0);
        site.db.assign_role(1, 10, STUDENT, "", 0).unwrap();
        site.db.assign_role(1, 10, TEACHER, "", 0).unwrap();

        let policy = SyncPolicy::default().with_skip_roles([RoleId::new(TEACHER)]);
        sweep(&site.db, &policy);
        assert_eq!(granted(&site.db), vec![(1, STUDENT)]);

        // Skip-listing a role later revokes the grant
        sweep(&site.db, &SyncPolicy::default());
        assert_eq!(granted(&site.db).len(), 2);
        let report = sweep(&site.db, &policy);
        assert_eq!(report.roles_revoked, 1);
        assert_eq!(granted(&site.db), vec![(1, STUDENT)]);
    }

    #[test]
    fn test_suspend_preserves_roles() {
        let site = site();
        let link = insert_link(&site.db);
        member(&site, 1, EnrolStatus::Active, 0, 0);
        site.db.assign_role(1, 10, STUDENT, "", 0).unwrap();
        let policy = SyncPolicy::default().with_unenrol_action(UnenrolAction::Suspend);
        sweep(&site.db, &policy);

        site.db.unenrol(site.source, 1).unwrap();
        let report = sweep(&site.db, &policy);
        assert_eq!(report.suspended, 1);
        assert_eq!(report.roles_revoked, 0);

        let row = site.db.child_enrolment(link.id.get(), 1).unwrap().unwrap();
        assert_eq!(row.status, EnrolStatus::Suspended);
        assert_eq!(granted(&site.db), vec![(1, STUDENT)]);
    }

    #[test]
    fn test_remove_deletes_membership_and_roles() {
        let site = site();
        let link = insert_link(&site.db);
        member(&site, 1, EnrolStatus::Active, 0, 0);
        site.db.assign_role(1, 10, STUDENT, "", 0).unwrap();
        let policy = SyncPolicy::default().with_unenrol_action(UnenrolAction::Remove);
        sweep(&site.db, &policy);

        site.db.remove_group_member(5, 1).unwrap();
        let report = sweep(&site.db, &policy);
        assert_eq!(report.unenrolled, 1);
        assert!(site.db.child_enrolment(link.id.get(), 1).unwrap().is_none());
        assert!(granted(&site.db).is_empty());
    }

    #[test]
    fn test_roleless_user_is_not_kept_without_sync_all() {
        let site = site();
        let link = insert_link(&site.db);
        member(&site, 1, EnrolStatus::Active, 0, 0);
        site.db.assign_role(1, 10, STUDENT, "", 0).unwrap();
        member(&site, 2, EnrolStatus::Active, 0, 0);

        let policy = SyncPolicy::default()
            .with_sync_all(false)
            .with_unenrol_action(UnenrolAction::Remove);
        let report = sweep(&site.db, &policy);
        assert_eq!(report.enrolled, 1);
        assert!(site.db.child_enrolment(link.id.get(), 2).unwrap().is_none());

        // Losing the last role purges the membership
        site.db.unassign_role(1, 10, STUDENT, "", 0).unwrap();
        let report = sweep(&site.db, &policy);
        assert_eq!(report.unenrolled, 1);
        assert!(site.db.child_enrolments(link.id.get()).unwrap().is_empty());
    }

    #[test]
    fn test_global_disable_revokes_roles_only() {
        let site = site();
        let link = insert_link(&site.db);
        member(&site, 1, EnrolStatus::Active, 0, 0);
        site.db.assign_role(1, 10, STUDENT, "", 0).unwrap();
        sweep(&site.db, &SyncPolicy::default());
        assert_eq!(granted(&site.db).len(), 1);

        let disabled = SyncPolicy::default().with_enabled(false);
        let report = sweep(&site.db, &disabled);
        assert_eq!(report.status, SweepStatus::Disabled);
        assert_eq!(report.status.exit_code(), 2);
        assert_eq!(report.roles_revoked, 1);
        assert!(granted(&site.db).is_empty());
        assert_eq!(site.db.child_enrolments(link.id.get()).unwrap().len(), 1);

        // Reactions are ignored while disabled
        assert_eq!(react(&site.db, &disabled, 1), Reaction::Disabled);
    }
}

mod registry_tests {
    use super::*;

    #[test]
    fn test_self_link_is_rejected() {
        let site = site();
        let policy = SyncPolicy::default();
        let clock = FixedClock::new(NOW);
        let registry = LinkRegistry::new(SyncContext::new(&site.db, &policy, &clock));

        let request = NewLink::new(CourseId::new(10), CourseId::new(10), GroupId::new(5), RoleId::new(STUDENT));
        let err = registry.create_link(&request).unwrap_err();
        assert!(matches!(err, SyncError::SelfLink(course) if course == CourseId::new(10)));
        assert!(site.db.links(None).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_enabled_link_is_rejected() {
        let site = site();
        let policy = SyncPolicy::default();
        let clock = FixedClock::new(NOW);
        let registry = LinkRegistry::new(SyncContext::new(&site.db, &policy, &clock));

        let first = registry.create_link(&link_request()).unwrap();
        let err = registry.create_link(&link_request()).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateLink { existing, .. } if existing == first.id));

        // A disabled copy is allowed, but cannot be enabled alongside
        let second = registry.create_link(&link_request().with_enabled(false)).unwrap();
        assert!(registry.set_link_enabled(second.id, true).is_err());
    }

    #[test]
    fn test_delete_link_revokes_everything_it_granted() {
        let site = site();
        member(&site, 1, EnrolStatus::Active, 0, 0);
        site.db.assign_role(1, 10, STUDENT, "", 0).unwrap();
        let policy = SyncPolicy::default();
        let clock = FixedClock::new(NOW);
        let registry = LinkRegistry::new(SyncContext::new(&site.db, &policy, &clock));

        let link = registry.create_link(&link_request()).unwrap();
        assert_eq!(granted(&site.db).len(), 1);

        registry.delete_link(link.id).unwrap();
        assert!(granted(&site.db).is_empty());
        assert!(site.db.child_enrolments(link.id.get()).unwrap().is_empty());
        assert!(site.db.link(link.id.get()).unwrap().is_none());
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_config_file_drives_a_file_backed_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            format!(
                "database: {}\npolicy:\n  sync_all: false\n  unenrol_action: remove\n  skip_roles: [3]\n",
                temp_dir.path().join("roster.db").display()
            ),
        )
        .unwrap();

        let config = SyncConfig::load(&config_path).unwrap();
        assert!(!config.policy.sync_all);
        assert_eq!(config.policy.unenrol_action, UnenrolAction::Remove);
        assert!(config.policy.is_skipped(RoleId::new(TEACHER)));

        let db = RosterDb::open(&config.database).unwrap();
        let parent = db.add_course("P", "Parent").unwrap();
        let child = db.add_course("C", "Child").unwrap();
        let group = db.add_group(parent, "G").unwrap();
        let source = db.add_source(parent, "manual", true).unwrap();
        db.add_group_member(group, 1, "", 0).unwrap();
        db.enrol(source, 1, EnrolStatus::Active, 0, 0).unwrap();
        db.assign_role(1, parent, TEACHER, "", 0).unwrap();
        LinkStore::insert_link(
            &db,
            "P (G)",
            &NewLink::new(CourseId::new(child), CourseId::new(parent), GroupId::new(group), RoleId::new(STUDENT)),
            None,
        )
        .unwrap();

        // The only role is skip-listed, so the user is not synced
        let report = sweep(&db, &config.policy);
        assert_eq!(report.enrolled, 0);
        drop(db);

        let reopened = RosterDb::open(&config.database).unwrap();
        assert_eq!(reopened.links(None).unwrap().len(), 1);
    }
}
