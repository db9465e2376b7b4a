//! Sync daemon
//!
//! Runs the bulk sweep on a fixed interval and reacts to parent-side changes
//! sent over its command channel. Sweeps and reactions run on the same task,
//! so they never overlap.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::metrics;
use crate::model::{CourseId, UserId};
use crate::policy::SyncPolicy;
use crate::sync::{BulkSweep, EventReactor, Reaction, Reconciler, SweepReport, SyncContext};
use crate::{Result, SyncError};
use roster::RosterDb;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Default poll interval (5 minutes)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Default event channel capacity (1000 events)
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between scheduled sweeps
    pub poll_interval: Duration,

    pub policy: SyncPolicy,

    /// Event broadcast channel capacity
    pub event_channel_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            policy: SyncPolicy::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl DaemonConfig {
    /// Daemon settings taken from a loaded configuration file
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.daemon.poll_interval(),
            policy: config.policy.clone(),
            event_channel_capacity: config.daemon.event_channel_capacity,
        }
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the sync policy
    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the event channel capacity
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }
}

/// Events emitted by the daemon
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    Started,

    /// A sweep finished (scheduled or requested)
    SweepCompleted { report: SweepReport },

    /// A parent change was handled
    Reacted {
        course: CourseId,
        user: UserId,
        reaction: Reaction,
    },

    Error { message: String },

    Stopped,
}

/// Commands that can be sent to the daemon
#[derive(Debug, Clone)]
pub enum DaemonCommand {
    /// Sweep now, optionally limited to one child course
    SyncNow { scope: Option<CourseId> },

    /// A user's state changed in a parent course
    ParentChanged { course: CourseId, user: UserId },

    /// Set poll interval
    SetPollInterval(Duration),

    /// Stop the daemon
    Shutdown,
}

/// Result of handling a command
enum CommandResult {
    /// Continue running the daemon
    Continue,
    /// Stop the daemon
    Stop,
}

/// Daemon statistics
#[derive(Debug, Clone, Default)]
pub struct DaemonStats {
    pub sweeps: usize,
    pub reactions: usize,
    pub errors: usize,
    pub last_report: Option<SweepReport>,
    pub poll_interval: Duration,
}

/// Sync daemon
pub struct SyncDaemon {
    config: DaemonConfig,
    db: RosterDb,
    clock: Box<dyn Clock + Send + Sync>,
    reactor: EventReactor,
    stats: DaemonStats,

    event_tx: broadcast::Sender<DaemonEvent>,
    command_rx: Option<mpsc::Receiver<DaemonCommand>>,
    command_tx: mpsc::Sender<DaemonCommand>,

    running: bool,
}

impl SyncDaemon {
    /// Create a daemon over an open roster
    pub fn new(db: RosterDb, config: DaemonConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(64);
        let stats = DaemonStats {
            poll_interval: config.poll_interval,
            ..DaemonStats::default()
        };

        Self {
            config,
            db,
            clock: Box::new(SystemClock),
            reactor: EventReactor::new(),
            stats,
            event_tx,
            command_rx: Some(command_rx),
            command_tx,
            running: false,
        }
    }

    /// Replace the clock used for validity-window checks
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Get an event subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    /// Get a command sender
    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    /// The roster the daemon writes to
    pub fn store(&self) -> &RosterDb {
        &self.db
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    /// Send an event, logging if dropped due to no receivers or channel full
    fn send_event(&self, event: DaemonEvent) {
        match self.event_tx.send(event) {
            Ok(receiver_count) => {
                let capacity = self.config.event_channel_capacity;
                let len = self.event_tx.len();
                if len > capacity * 80 / 100 {
                    tracing::warn!(
                        current = len,
                        capacity = capacity,
                        threshold_pct = 80,
                        "Event channel nearing capacity"
                    );
                }
                if receiver_count == 0 {
                    tracing::debug!("Event sent but no receivers subscribed");
                }
            }
            Err(_) => {
                tracing::debug!("Event dropped, no receivers subscribed");
            }
        }
    }

    /// Run the daemon event loop with graceful shutdown on SIGTERM/SIGINT
    pub async fn run(&mut self) -> Result<()> {
        self.running = true;
        metrics::set_health_status(true);
        self.send_event(DaemonEvent::Started);
        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Sync daemon started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);

        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| SyncError::Config("Daemon already running".to_string()))?;

        #[cfg(unix)]
        {
            self.run_with_signals(&mut interval, &mut command_rx).await?;
        }

        #[cfg(not(unix))]
        {
            self.run_without_signals(&mut interval, &mut command_rx)
                .await?;
        }

        tracing::info!(
            sweeps = self.stats.sweeps,
            reactions = self.stats.reactions,
            errors = self.stats.errors,
            "Sync daemon shutdown complete"
        );

        metrics::set_health_status(false);
        self.send_event(DaemonEvent::Stopped);
        Ok(())
    }

    /// Run event loop with Unix signal handling (SIGTERM/SIGINT)
    #[cfg(unix)]
    async fn run_with_signals(
        &mut self,
        interval: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<DaemonCommand>,
    ) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            SyncError::Other(format!("Failed to set up SIGTERM handler: {}", e))
        })?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
            SyncError::Other(format!("Failed to set up SIGINT handler: {}", e))
        })?;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.running {
                        self.sweep(None);
                    }
                }
                Some(cmd) = command_rx.recv() => {
                    match self.handle_command(cmd, interval) {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    self.running = false;
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                    self.running = false;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Run event loop without signal handling (non-Unix platforms)
    #[cfg(not(unix))]
    async fn run_without_signals(
        &mut self,
        interval: &mut tokio::time::Interval,
        command_rx: &mut mpsc::Receiver<DaemonCommand>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.running {
                        self.sweep(None);
                    }
                }
                Some(cmd) = command_rx.recv() => {
                    match self.handle_command(cmd, interval) {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_command(
        &mut self,
        cmd: DaemonCommand,
        interval: &mut tokio::time::Interval,
    ) -> CommandResult {
        match cmd {
            DaemonCommand::SyncNow { scope } => {
                self.sweep(scope);
            }
            DaemonCommand::ParentChanged { course, user } => {
                self.react(course, user);
            }
            DaemonCommand::SetPollInterval(duration) => {
                tracing::info!(secs = duration.as_secs(), "Poll interval changed");
                *interval = tokio::time::interval(duration);
                self.config.poll_interval = duration;
                self.stats.poll_interval = duration;
            }
            DaemonCommand::Shutdown => {
                tracing::info!("Received shutdown command");
                self.running = false;
                return CommandResult::Stop;
            }
        }
        CommandResult::Continue
    }

    /// Run one sweep and publish its report
    pub fn sweep(&mut self, scope: Option<CourseId>) -> Option<SweepReport> {
        let ctx = SyncContext::new(&self.db, &self.config.policy, self.clock.as_ref());
        let outcome = BulkSweep::new(ctx).run(scope);
        self.stats.sweeps += 1;

        match outcome {
            Ok(report) => {
                if !report.failures.is_empty() {
                    self.stats.errors += report.failures.len();
                }
                self.stats.last_report = Some(report.clone());
                self.send_event(DaemonEvent::SweepCompleted {
                    report: report.clone(),
                });
                Some(report)
            }
            Err(e) => {
                self.stats.errors += 1;
                tracing::error!(error = %e, "Sweep failed");
                self.send_event(DaemonEvent::Error {
                    message: format!("Sweep failed: {}", e),
                });
                None
            }
        }
    }

    /// Handle one parent-side change
    pub fn react(&mut self, course: CourseId, user: UserId) -> Option<Reaction> {
        let ctx = SyncContext::new(&self.db, &self.config.policy, self.clock.as_ref());
        let outcome = self
            .reactor
            .on_parent_changed(&Reconciler::new(ctx), course, user);
        self.stats.reactions += 1;

        match outcome {
            Ok(reaction) => {
                self.send_event(DaemonEvent::Reacted {
                    course,
                    user,
                    reaction: reaction.clone(),
                });
                Some(reaction)
            }
            Err(e) => {
                self.stats.errors += 1;
                tracing::error!(course = %course, user = %user, error = %e, "Reaction failed");
                self.send_event(DaemonEvent::Error {
                    message: format!("Reaction for user {} in course {} failed: {}", user, course, e),
                });
                None
            }
        }
    }
}
