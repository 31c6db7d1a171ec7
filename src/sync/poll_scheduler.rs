//! A background thread that periodically runs a [`SyncTask`].
use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

use super::{SyncOutcome, SyncTask};

/// How often a [`PollScheduler`] runs its task.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Nominal pause between two cycles. The actual pause is shortened by up to
    /// [`SchedulerConfig::jitter`].
    pub interval: Duration,
    /// Upper bound of the random amount taken off each pause. Zero makes cycles strictly
    /// periodic.
    pub jitter: Duration,
}

impl SchedulerConfig {
    /// An hour between cycles.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3600);
    /// Up to three seconds taken off each pause.
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    /// Same as [`SchedulerConfig::default`].
    pub fn new() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    /// Pause nominally `interval` between cycles.
    pub fn with_interval(mut self, interval: Duration) -> SchedulerConfig {
        self.interval = interval;
        self
    }

    /// Take a random amount of at most `jitter` off each pause.
    pub fn with_jitter(mut self, jitter: Duration) -> SchedulerConfig {
        self.jitter = jitter;
        self
    }

    /// Pause before the next cycle. Never longer than the interval, never negative.
    fn next_pause(&self) -> Duration {
        let cut = thread_rng().gen_range(Duration::ZERO..=self.jitter);
        self.interval.saturating_sub(cut)
    }
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            interval: SchedulerConfig::DEFAULT_POLL_INTERVAL,
            jitter: SchedulerConfig::DEFAULT_POLL_JITTER,
        }
    }
}

enum Command {
    /// Run a cycle now.
    Refresh,
    Stop,
}

type FirstSync = Arc<(Mutex<Option<Result<()>>>, Condvar)>;

/// Runs a [`SyncTask`] on a named background thread: once at start, then every
/// [`SchedulerConfig::interval`] minus jitter, and early whenever [`PollScheduler::force_refresh`]
/// is called.
///
/// The scheduler stops by itself on errors that retrying cannot fix, such as
/// [`Error::Unauthorized`].
pub struct PollScheduler {
    join_handle: std::thread::JoinHandle<()>,

    task: Arc<dyn SyncTask>,

    commands: Sender<Command>,

    /// Holds `None` until the first successful cycle. Holds `Some(Ok(()))` once the task has
    /// synced. Holds `Some(Err(...))` if the scheduler stopped on an unrecoverable error first.
    first_sync: FirstSync,
}

impl PollScheduler {
    /// Start the scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(task: Arc<dyn SyncTask>, config: SchedulerConfig) -> std::io::Result<PollScheduler> {
        let (commands, receiver) = std::sync::mpsc::channel::<Command>();
        let first_sync: FirstSync = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let task = Arc::clone(&task);
            let first_sync = Arc::clone(&first_sync);

            std::thread::Builder::new()
                .name(format!("split-{}-sync", task.resource()))
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        run(&*task, &config, &receiver, &first_sync)
                    }));

                    // If catch_unwind returns Err, it means a panic occurred.
                    if result.is_err() {
                        set_first_sync(&first_sync, Err(Error::SchedulerThreadPanicked));
                    }
                })?
        };

        Ok(PollScheduler {
            join_handle,
            task,
            commands,
            first_sync,
        })
    }

    /// Request a full resync and wake the thread to run it now.
    ///
    /// If a cycle is already running, the request is folded into the next one.
    pub fn force_refresh(&self) {
        self.task.force_refresh();
        // Error means the thread already exited. Nothing to wake.
        let _ = self.commands.send(Command::Refresh);
    }

    /// Block until the first successful cycle.
    ///
    /// # Errors
    ///
    /// - [`Error::SchedulerThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidBaseUrl`]
    pub fn wait_for_first_sync(&self) -> Result<()> {
        let mut lock = self
            .first_sync
            .0
            .lock()
            .map_err(|_| Error::SchedulerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .first_sync
                        .1
                        .wait(lock)
                        .map_err(|_| Error::SchedulerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the scheduler thread.
    ///
    /// Does not wait for the thread to exit. A cycle in progress still completes and applies.
    pub fn stop(&self) {
        // Error means the thread already exited.
        let _ = self.commands.send(Command::Stop);
    }

    /// Stop the scheduler thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchedulerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::SchedulerThreadPanicked)?;
        Ok(())
    }
}

fn run(
    task: &dyn SyncTask,
    config: &SchedulerConfig,
    commands: &Receiver<Command>,
    first_sync: &FirstSync,
) {
    let resource = task.resource();
    loop {
        log::debug!(target: "split", resource; "running sync cycle");
        let outcome = task.sync();
        match &outcome {
            SyncOutcome::Failed(err) if outcome.is_unrecoverable() => {
                log::warn!(target: "split", resource; "stopping scheduler: {err}");
                set_first_sync(first_sync, Err(err.clone()));
                return;
            }
            outcome if outcome.is_synced() => set_first_sync(first_sync, Ok(())),
            _ => {
                // Retried on the next tick.
            }
        }

        let command = match commands.recv_timeout(config.next_pause()) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => Command::Refresh,
            Err(RecvTimeoutError::Disconnected) => Command::Stop,
        };
        if let Command::Stop = coalesce(command, commands) {
            log::debug!(target: "split", resource; "scheduler stopped");
            return;
        }
    }
}

/// Fold commands already queued behind `command` into it: the next cycle serves every pending
/// refresh, and a pending stop wins.
fn coalesce(command: Command, commands: &Receiver<Command>) -> Command {
    if let Command::Stop = command {
        return command;
    }
    loop {
        match commands.try_recv() {
            Ok(Command::Refresh) => {}
            Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return Command::Stop,
            Err(TryRecvError::Empty) => return command,
        }
    }
}

/// The first recorded result wins.
fn set_first_sync(first_sync: &FirstSync, value: Result<()>) {
    let mut lock = first_sync.0.lock().expect("thread holding first sync lock should not panic");
    if lock.is_none() {
        *lock = Some(value);
        first_sync.1.notify_all();
    }
}
