//! Basic usage example for the roster crate
//!
//! Builds a small in-memory roster with a parent course, one group and a few
//! enrolments, then prints what a link reading that group would see.
//!
//! To run this example:
//! ```sh
//! cd crates/roster
//! cargo run --example basic
//! ```

use roster::{EnrolStatus, Result, RosterDb};

fn main() -> Result<()> {
    println!("Roster Example\n");

    let db = RosterDb::in_memory()?;

    let parent = db.add_course("BIO101", "Biology 101")?;
    let lab_a = db.add_group(parent, "Lab A")?;
    let manual = db.add_source(parent, "manual", true)?;
    let self_enrol = db.add_source(parent, "self", true)?;

    db.enrol(manual, 1, EnrolStatus::Active, 0, 0)?;
    db.enrol(self_enrol, 1, EnrolStatus::Suspended, 1_700_000_000, 0)?;
    db.enrol(manual, 2, EnrolStatus::Active, 0, 1_800_000_000)?;
    db.enrol(manual, 3, EnrolStatus::Active, 0, 0)?;

    db.add_group_member(lab_a, 1, "", 0)?;
    db.add_group_member(lab_a, 2, "", 0)?;
    db.assign_role(1, parent, 5, "", 0)?;

    println!("=== Groups in {} ===", parent);
    for group in db.groups_in_course(parent)? {
        println!("  [{}] {}", group.id, group.name);
    }
    println!();

    println!("=== Enrolments visible through Lab A ===");
    for row in db.parent_enrolments(parent, lab_a, None, "metagroup")? {
        let end = if row.time_end == 0 {
            "open".to_string()
        } else {
            row.time_end.to_string()
        };
        println!(
            "  user {:>3}  source {:>2}  {:<9}  start {:>10}  end {}",
            row.user_id, row.source_id, row.status, row.time_start, end
        );
    }
    println!();

    println!("=== Roles in course ===");
    for ra in db.course_role_assignments(parent, None, "metagroup")? {
        println!("  user {} holds role {}", ra.user_id, ra.role_id);
    }

    Ok(())
}
