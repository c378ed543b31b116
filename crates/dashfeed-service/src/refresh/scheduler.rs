use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, OptionFuture};
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use crate::config::SchedulerConfig;
use crate::fetch::FetchError;

/// Something that can be refreshed periodically by a [`Scheduler`].
pub trait RefreshScope: Send + Sync + 'static {
    /// Refreshes the data of this scope.
    ///
    /// Returning [`FetchError::Cancelled`] does not count as a failure.
    fn refresh(&self) -> BoxFuture<'_, Result<(), FetchError>>;
}

impl<S: RefreshScope + ?Sized> RefreshScope for Arc<S> {
    fn refresh(&self) -> BoxFuture<'_, Result<(), FetchError>> {
        (**self).refresh()
    }
}

/// The state of an auto-refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Refreshing on every tick.
    Running,
    /// Hidden or stopped, ticks are skipped.
    Paused,
    /// Too many consecutive failures, waiting for the cooldown or a retry.
    Tripped,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Tripped => "tripped",
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a [`Scheduler`] publishes about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Number of consecutive failed refreshes.
    pub error_count: u32,
}

/// Why a tick did not start a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The previous refresh is still running.
    InProgress,
    /// Hidden or stopped.
    Paused,
    /// The circuit breaker is open.
    Tripped,
}

/// The outcome of [`AutoRefresh::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Refresh,
    Skip(SkipReason),
}

/// The state machine behind a [`Scheduler`].
///
/// This holds no timers, the current time is passed in by the caller. Every
/// [`Refresh`](TickDecision::Refresh) decision must be followed by a call to
/// [`refresh_finished`](Self::refresh_finished).
#[derive(Debug, Clone)]
pub struct AutoRefresh {
    max_errors: u32,
    cooldown: Duration,
    error_count: u32,
    enabled: bool,
    visible: bool,
    tripped_at: Option<Instant>,
    in_progress: bool,
}

impl AutoRefresh {
    /// Creates a running auto-refresh.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_errors: config.max_errors.max(1),
            cooldown: config.cooldown,
            error_count: 0,
            enabled: true,
            visible: true,
            tripped_at: None,
            in_progress: false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.tripped_at.is_some() {
            SchedulerState::Tripped
        } else if !self.enabled || !self.visible {
            SchedulerState::Paused
        } else {
            SchedulerState::Running
        }
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: self.state(),
            error_count: self.error_count,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// When the circuit breaker closes again on its own, if it is open.
    pub fn cooldown_deadline(&self) -> Option<Instant> {
        self.tripped_at.map(|tripped_at| tripped_at + self.cooldown)
    }

    /// Decides whether a refresh should start now.
    ///
    /// An open circuit breaker whose cooldown has elapsed is closed first.
    pub fn tick(&mut self, now: Instant) -> TickDecision {
        if let Some(deadline) = self.cooldown_deadline() {
            if now < deadline {
                return TickDecision::Skip(SkipReason::Tripped);
            }
            self.reset();
        }

        if self.in_progress {
            return TickDecision::Skip(SkipReason::InProgress);
        }
        if !self.enabled || !self.visible {
            return TickDecision::Skip(SkipReason::Paused);
        }

        self.in_progress = true;
        TickDecision::Refresh
    }

    /// Records the outcome of a refresh. Returns `true` if this opened the circuit breaker.
    pub fn refresh_finished(&mut self, result: &Result<(), FetchError>, now: Instant) -> bool {
        self.in_progress = false;

        match result {
            Ok(()) => {
                self.error_count = 0;
                false
            }
            Err(err) if err.is_cancelled() => false,
            Err(_) => {
                self.error_count += 1;
                if self.error_count >= self.max_errors && self.tripped_at.is_none() {
                    self.tripped_at = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Sets the visibility. Returns `true` if this made the scope visible again.
    pub fn set_visible(&mut self, visible: bool) -> bool {
        let shown = visible && !self.visible;
        self.visible = visible;
        shown
    }

    /// Resumes after [`stop`](Self::stop). Returns `true` if it was stopped.
    pub fn start(&mut self) -> bool {
        let started = !self.enabled;
        self.enabled = true;
        started
    }

    pub fn stop(&mut self) {
        self.enabled = false;
    }

    /// Closes the circuit breaker. Returns `true` if it was open.
    pub fn retry(&mut self) -> bool {
        let tripped = self.tripped_at.is_some();
        self.reset();
        tripped
    }

    fn reset(&mut self) {
        self.tripped_at = None;
        self.error_count = 0;
    }
}

#[derive(Debug)]
enum Command {
    Visibility(bool),
    Start,
    Stop,
    Retry,
    Shutdown,
}

/// Periodically refreshes a [`RefreshScope`] on a background task.
///
/// The first refresh happens right away, then once per interval. Consecutive failures open a
/// circuit breaker which stops the refreshes until the cooldown has elapsed or
/// [`retry`](Self::retry) is called. The current [`SchedulerStatus`] can be observed through
/// [`subscribe`](Self::subscribe).
///
/// The background task stops when the scheduler is dropped or [shut down](Self::shutdown).
pub struct Scheduler {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SchedulerStatus>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// The shortest interval a [`Scheduler`] refreshes at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl Scheduler {
    /// Spawns the refresh loop for `scope`.
    ///
    /// Intervals shorter than [`MIN_INTERVAL`] are raised to it.
    pub fn spawn<S: RefreshScope>(
        name: impl Into<Arc<str>>,
        config: &SchedulerConfig,
        interval: Duration,
        scope: S,
    ) -> Self {
        let name = name.into();
        if interval < MIN_INTERVAL {
            tracing::warn!(scheduler = &*name, ?interval, "Refresh interval too short");
        }
        let interval = interval.max(MIN_INTERVAL);
        let machine = AutoRefresh::new(config);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(machine.status());

        let span = tracing::info_span!("scheduler", name = &*name);
        let driver = run(
            Arc::clone(&name),
            machine,
            interval,
            scope,
            command_rx,
            status_tx,
        );
        let handle = tokio::spawn(
            driver
                .instrument(span)
                .bind_hub(Hub::new_from_top(Hub::current())),
        );

        Self {
            name,
            commands,
            status,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pauses while hidden, and refreshes right away when shown again.
    pub fn set_visible(&self, visible: bool) {
        self.send(Command::Visibility(visible));
    }

    /// Resumes after [`stop`](Self::stop).
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Pauses until [`start`](Self::start) is called.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Closes an open circuit breaker and refreshes right away.
    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.status.borrow()
    }

    /// Returns a receiver that is notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    /// Stops the background task and waits for it to finish.
    ///
    /// A refresh that is still running is dropped. Fetches it started keep running on their own.
    pub async fn shutdown(mut self) {
        self.send(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            handle.await.ok();
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(scheduler = &*self.name, "Scheduler is not running");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run<S: RefreshScope>(
    name: Arc<str>,
    mut machine: AutoRefresh,
    interval: Duration,
    scope: S,
    mut commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<SchedulerStatus>,
) {
    let name = &*name;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut running: Option<BoxFuture<'_, Result<(), FetchError>>> = None;
    let mut state = machine.state();

    tracing::debug!(scheduler = name, ?interval, "Auto-refresh started");

    loop {
        publish(name, &machine, &mut state, &status);
        let cooldown = machine.cooldown_deadline();

        tokio::select! {
            biased;

            command = commands.recv() => {
                let now = Instant::now();
                let refresh_now = match command {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::Visibility(visible)) => machine.set_visible(visible),
                    Some(Command::Start) => {
                        if machine.start() {
                            ticker.reset();
                        }
                        false
                    }
                    Some(Command::Stop) => {
                        machine.stop();
                        false
                    }
                    Some(Command::Retry) => {
                        if machine.retry() {
                            tracing::info!(scheduler = name, "Auto-refresh resumed by retry");
                        }
                        true
                    }
                };

                if refresh_now {
                    ticker.reset();
                    if let Some(refresh) = tick(name, &mut machine, &scope, now) {
                        running = Some(refresh);
                    }
                }
            }

            Some(result) = OptionFuture::from(running.as_mut()), if running.is_some() => {
                running = None;

                match &result {
                    Ok(()) => tracing::trace!(scheduler = name, "Refresh done"),
                    Err(err) if err.is_cancelled() => {
                        tracing::trace!(scheduler = name, "Refresh cancelled")
                    }
                    Err(err) => tracing::warn!(
                        error = err as &dyn std::error::Error,
                        scheduler = name,
                        "Refresh failed",
                    ),
                }

                if machine.refresh_finished(&result, Instant::now()) {
                    metric!(counter("scheduler.tripped") += 1, "scheduler" => name);
                    tracing::warn!(
                        scheduler = name,
                        errors = machine.error_count(),
                        "Auto-refresh stopped after repeated failures",
                    );
                }
            }

            _ = tokio::time::sleep_until(cooldown.unwrap_or_else(Instant::now)), if cooldown.is_some() => {
                ticker.reset();
                if let Some(refresh) = tick(name, &mut machine, &scope, Instant::now()) {
                    running = Some(refresh);
                }
            }

            _ = ticker.tick(), if machine.state() == SchedulerState::Running => {
                if let Some(refresh) = tick(name, &mut machine, &scope, Instant::now()) {
                    running = Some(refresh);
                }
            }
        }
    }

    tracing::debug!(scheduler = name, "Auto-refresh shut down");
}

fn tick<'a, S: RefreshScope>(
    name: &str,
    machine: &mut AutoRefresh,
    scope: &'a S,
    now: Instant,
) -> Option<BoxFuture<'a, Result<(), FetchError>>> {
    metric!(counter("scheduler.tick") += 1, "scheduler" => name);
    match machine.tick(now) {
        TickDecision::Refresh => {
            tracing::trace!(scheduler = name, "Refreshing");
            Some(scope.refresh())
        }
        TickDecision::Skip(reason) => {
            tracing::trace!(scheduler = name, ?reason, "Skipping refresh");
            None
        }
    }
}

fn publish(
    name: &str,
    machine: &AutoRefresh,
    state: &mut SchedulerState,
    status: &watch::Sender<SchedulerStatus>,
) {
    let current = machine.status();
    if current.state != *state {
        tracing::info!(
            scheduler = name,
            from = %state,
            to = %current.state,
            "Auto-refresh state changed",
        );
        *state = current.state;
    }

    status.send_if_modified(|published| {
        let modified = *published != current;
        *published = current;
        modified
    });
}
