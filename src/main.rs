//! metagroup-sync - course metagroup enrolment synchronization
//!
//! Main entry point for the metagroup-sync CLI.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use metagroup_sync::clock::SystemClock;
use metagroup_sync::config::{validate_config_result, SyncConfig};
use metagroup_sync::daemon::{DaemonConfig, SyncDaemon};
use metagroup_sync::model::{
    ChildGroup, CourseId, GroupId, Link, LinkId, LinkUpdate, NewLink, RoleId, UserId,
};
use metagroup_sync::sync::{LinkOutcome, Reaction};
use metagroup_sync::{
    BulkSweep, EventReactor, LinkRegistry, Reconciler, SweepReport, SweepStatus, SyncContext,
    SyncError,
};
use roster::RosterDb;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

/// metagroup-sync - keep child courses in step with parent course groups
#[derive(Parser, Debug)]
#[command(name = "metagroup-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/metagroup-sync/config.yaml)
    #[arg(short, long, env = "METAGROUP_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Roster database (overrides the config file)
    #[arg(long, env = "METAGROUP_SYNC_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config file and create the roster schema
    InitDb,

    /// Run a bulk sweep (exit code 0 converged, 1 failed, 2 disabled)
    Sync {
        /// Only sweep links feeding this child course
        #[arg(long)]
        course: Option<i64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the sync daemon
    Daemon {
        /// Seconds between sweeps (overrides the config file)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// React to a change of one user in a parent course
    React {
        /// Parent course id
        #[arg(long)]
        course: i64,

        /// User id
        #[arg(long)]
        user: i64,

        /// Print the reaction as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage links
    #[command(subcommand)]
    Link(LinkCommands),

    /// List the groups a link may read from in a parent course
    Groups {
        /// Parent course id
        course: i64,
    },
}

#[derive(Subcommand, Debug)]
enum LinkCommands {
    /// Create a link and reconcile it
    Add {
        /// Child course id
        #[arg(long)]
        child: i64,

        /// Parent course id
        #[arg(long)]
        parent: i64,

        /// Parent group id
        #[arg(long)]
        group: i64,

        /// Role given to synchronized users
        #[arg(long, default_value = "5")]
        role: i64,

        /// Existing child group to keep in sync
        #[arg(long, conflicts_with = "new_group")]
        child_group: Option<i64>,

        /// Create a child group named after the parent course
        #[arg(long)]
        new_group: bool,

        /// Create the link disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List links
    List {
        /// Only links feeding this child course
        #[arg(long)]
        course: Option<i64>,
    },

    /// Change a link's groups or default role and reconcile it
    Edit {
        id: i64,

        /// New parent group id (renames the link)
        #[arg(long)]
        group: Option<i64>,

        /// New default role
        #[arg(long)]
        role: Option<i64>,

        /// Move synced members into this existing child group
        #[arg(long, conflicts_with_all = ["new_group", "no_child_group"])]
        child_group: Option<i64>,

        /// Move synced members into a new group named after the parent course
        #[arg(long, conflicts_with = "no_child_group")]
        new_group: bool,

        /// Stop syncing a child group
        #[arg(long)]
        no_child_group: bool,
    },

    /// Enable a link and reconcile it
    Enable { id: i64 },

    /// Disable a link and reconcile it
    Disable { id: i64 },

    /// Delete a link with its memberships and roles
    Remove { id: i64 },

    /// Unenrol a suspended user from a link
    Unenrol { id: i64, user: i64 },
}

fn main() {
    // Initialize logging
    if let Err(e) = metagroup_sync::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> metagroup_sync::Result<i32> {
    let mut config = SyncConfig::load_or_default(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database = db;
    }
    validate_config_result(&config)?;

    match cli.command {
        Commands::InitDb => {
            handle_init(&config, cli.config)?;
            Ok(0)
        }

        Commands::Sync { course, json } => {
            let db = open_roster(&config)?;
            let clock = SystemClock;
            let ctx = SyncContext::new(&db, &config.policy, &clock);
            let report = BulkSweep::new(ctx).run(course.map(CourseId::new))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(report.status.exit_code())
        }

        Commands::Daemon { interval } => {
            let db = open_roster(&config)?;
            let mut daemon_config = DaemonConfig::from_sync_config(&config);
            if let Some(secs) = interval {
                daemon_config = daemon_config.with_poll_interval(Duration::from_secs(secs.max(1)));
            }
            let mut daemon = SyncDaemon::new(db, daemon_config);

            let rt = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
            rt.block_on(daemon.run())?;

            let status = daemon
                .stats()
                .last_report
                .as_ref()
                .map(|r| r.status)
                .unwrap_or(SweepStatus::Converged);
            Ok(status.exit_code())
        }

        Commands::React { course, user, json } => {
            let db = open_roster(&config)?;
            let clock = SystemClock;
            let ctx = SyncContext::new(&db, &config.policy, &clock);
            let reaction = EventReactor::new().on_parent_changed(
                &Reconciler::new(ctx),
                CourseId::new(course),
                UserId::new(user),
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reaction)?);
            } else {
                print_reaction(&reaction);
            }
            Ok(0)
        }

        Commands::Link(cmd) => {
            let db = open_roster(&config)?;
            let clock = SystemClock;
            let registry = LinkRegistry::new(SyncContext::new(&db, &config.policy, &clock));
            handle_link_command(&registry, cmd)?;
            Ok(0)
        }

        Commands::Groups { course } => {
            let db = open_roster(&config)?;
            let clock = SystemClock;
            let registry = LinkRegistry::new(SyncContext::new(&db, &config.policy, &clock));
            let groups = registry.group_options(CourseId::new(course))?;
            if groups.is_empty() {
                println!("No groups in course {}", course);
            }
            for group in groups {
                println!("  {:>6}  {}", group.id, group.name);
            }
            Ok(0)
        }
    }
}

fn open_roster(config: &SyncConfig) -> metagroup_sync::Result<RosterDb> {
    let db = RosterDb::open(&config.database)?;
    tracing::info!(database = %config.database.display(), "Roster opened");
    Ok(db)
}

fn handle_init(config: &SyncConfig, config_path: Option<PathBuf>) -> metagroup_sync::Result<()> {
    let config_file = config_path.unwrap_or_else(SyncConfig::default_path);
    if config_file.exists() {
        println!("Config already exists at {}", config_file.display());
    } else {
        config.save(&config_file)?;
        println!("Wrote default config to {}", config_file.display());
    }

    RosterDb::open(&config.database)?;
    println!("Roster schema ready at {}", config.database.display());
    Ok(())
}

fn handle_link_command(
    registry: &LinkRegistry<'_, RosterDb>,
    cmd: LinkCommands,
) -> metagroup_sync::Result<()> {
    match cmd {
        LinkCommands::Add {
            child,
            parent,
            group,
            role,
            child_group,
            new_group,
            disabled,
        } => {
            let child_group = match (child_group, new_group) {
                (Some(id), _) => ChildGroup::Existing(GroupId::new(id)),
                (None, true) => ChildGroup::CreateNew,
                (None, false) => ChildGroup::None,
            };
            let request = NewLink::new(
                CourseId::new(child),
                CourseId::new(parent),
                GroupId::new(group),
                RoleId::new(role),
            )
            .with_child_group(child_group)
            .with_enabled(!disabled);

            let link = registry.create_link(&request)?;
            println!("Created link {} '{}'", link.id, link.name);
        }

        LinkCommands::List { course } => {
            let links = registry.links(course.map(CourseId::new))?;
            if links.is_empty() {
                println!("No links configured");
                return Ok(());
            }
            println!("Links ({}):", links.len());
            println!();
            for link in &links {
                print_link(registry, link)?;
            }
        }

        LinkCommands::Edit {
            id,
            group,
            role,
            child_group,
            new_group,
            no_child_group,
        } => {
            let mut changes = LinkUpdate::new();
            if let Some(group) = group {
                changes = changes.with_parent_group(GroupId::new(group));
            }
            if let Some(role) = role {
                changes = changes.with_default_role(RoleId::new(role));
            }
            match (child_group, new_group, no_child_group) {
                (Some(group_id), _, _) => {
                    changes = changes.with_child_group(ChildGroup::Existing(GroupId::new(group_id)))
                }
                (None, true, _) => changes = changes.with_child_group(ChildGroup::CreateNew),
                (None, false, true) => changes = changes.with_child_group(ChildGroup::None),
                (None, false, false) => {}
            }
            if changes.is_empty() {
                return Err(SyncError::Config("Nothing to change".to_string()));
            }

            let link = registry.update_link(LinkId::new(id), &changes)?;
            println!("Updated link {} '{}'", link.id, link.name);
        }

        LinkCommands::Enable { id } => {
            let link = registry.set_link_enabled(LinkId::new(id), true)?;
            println!("Enabled link {}", link.id);
        }

        LinkCommands::Disable { id } => {
            let link = registry.set_link_enabled(LinkId::new(id), false)?;
            println!("Disabled link {}", link.id);
        }

        LinkCommands::Remove { id } => {
            registry.delete_link(LinkId::new(id))?;
            println!("Removed link {}", id);
        }

        LinkCommands::Unenrol { id, user } => {
            registry.manual_unenrol(LinkId::new(id), UserId::new(user))?;
            println!("Unenrolled user {} from link {}", user, id);
        }
    }

    Ok(())
}

fn print_link(registry: &LinkRegistry<'_, RosterDb>, link: &Link) -> metagroup_sync::Result<()> {
    let state = if link.enabled { "enabled" } else { "disabled" };
    println!("  [{}] {} ({})", link.id, registry.instance_name(link)?, state);
    println!(
        "    course {} group {} -> course {}",
        link.parent_course, link.parent_group, link.child_course
    );
    if let Some(group) = link.child_group {
        println!("    child group: {}", group);
    }
    println!("    default role: {}", link.default_role);
    println!();
    Ok(())
}

fn print_report(report: &SweepReport) {
    println!("Sweep {}", report.status.as_str());
    println!("  Links:        {}", report.links);
    println!("  Enrolled:     {}", report.enrolled);
    println!("  Suspended:    {}", report.suspended);
    println!("  Unsuspended:  {}", report.unsuspended);
    println!("  Updated:      {}", report.updated);
    println!("  Unenrolled:   {}", report.unenrolled);
    println!("  Roles +/-:    {}/{}", report.roles_granted, report.roles_revoked);
    println!("  Group changes: {}", report.group_changes);

    for skipped in &report.skipped_links {
        println!("  Skipped link {}: {}", skipped.link, skipped.reason);
    }
    for failure in &report.failures {
        let link = failure.link.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
        let user = failure.user.map(|u| u.to_string()).unwrap_or_else(|| "-".into());
        println!("  Failed (link {}, user {}): {}", link, user, failure.error);
    }
}

fn print_reaction(reaction: &Reaction) {
    match reaction {
        Reaction::NoLinks => println!("No enabled links read from that course"),
        Reaction::Swallowed => println!("A reaction was already running"),
        Reaction::Disabled => println!("Metagroup sync is disabled"),
        Reaction::Reconciled(outcomes) => {
            for outcome in outcomes {
                match outcome {
                    LinkOutcome::Reconciled { link, mutations } => {
                        println!("Link {}: {} change(s)", link, mutations.len());
                        for mutation in mutations {
                            println!("  {}", mutation.kind());
                        }
                    }
                    LinkOutcome::Skipped { link, reason } => {
                        println!("Link {}: skipped ({})", link, reason);
                    }
                }
            }
        }
    }
}
