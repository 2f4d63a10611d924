//! Fixed-delay periodic task runner.
//!
//! A [`RecurringTask`] runs one [`Task`] cycle at a time. The next cycle is
//! scheduled `delay` after the previous one finished, so cycles never overlap
//! and slow cycles push the schedule back instead of piling up.
//!
//! An error escaping [`Task::run`] is fatal: the runner moves to
//! [`TaskState::Aborted`], calls [`Task::on_abort`] and does not retry until
//! [`RecurringTask::start`] is called again. Expected transient failures must
//! be handled inside `run`.
//!
//! Each cycle receives the run's stop token. A cycle that can block for long
//! (waiting on a fence, for instance) should watch it and return early, since
//! [`RecurringTask::stop`] waits for the in-flight cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{Error, Result};

/// A unit of periodic work.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Run a single cycle. `stop` is cancelled when the runner is stopped.
    async fn run(&self, stop: &CancellationToken) -> Result<()>;

    /// Called once when a cycle fails and the runner gives up.
    fn on_abort(&self, error: &Error);
}

/// Lifecycle state of a [`RecurringTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Running,
    /// A cycle failed. Terminal until `start()` is called again.
    Aborted,
}

#[derive(Debug, Clone, Copy, Default)]
struct Activity {
    busy: bool,
    finished_cycles: u64,
}

#[derive(Debug)]
struct Control {
    state: TaskState,
    generation: u64,
    cancel: Option<CancellationToken>,
}

/// Non-overlapping, fixed-delay runner for a [`Task`].
pub struct RecurringTask<T: Task> {
    task: Arc<T>,
    delay: Duration,
    control: Arc<Mutex<Control>>,
    activity: Arc<watch::Sender<Activity>>,
}

impl<T: Task> RecurringTask<T> {
    pub fn new(task: Arc<T>, delay: Duration) -> Self {
        let (activity, _) = watch::channel(Activity::default());
        Self {
            task,
            delay,
            control: Arc::new(Mutex::new(Control {
                state: TaskState::Stopped,
                generation: 0,
                cancel: None,
            })),
            activity: Arc::new(activity),
        }
    }

    pub fn task(&self) -> &Arc<T> {
        &self.task
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn state(&self) -> TaskState {
        self.control.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Whether a cycle is executing right now.
    pub fn is_busy(&self) -> bool {
        self.activity.borrow().busy
    }

    /// Start the runner and execute the first cycle immediately.
    ///
    /// No-op if already running. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let (token, generation) = {
            let mut control = self.control.lock();
            if control.state == TaskState::Running {
                return;
            }
            control.state = TaskState::Running;
            control.generation += 1;
            let token = CancellationToken::new();
            control.cancel = Some(token.clone());
            (token, control.generation)
        };

        tokio::spawn(run_cycles(
            self.task.clone(),
            self.delay,
            self.control.clone(),
            self.activity.clone(),
            token,
            generation,
        ));
    }

    /// Stop the runner.
    ///
    /// Cancels the pending delay and resolves once any in-flight cycle has
    /// finished; resolves immediately when idle. Calling it twice is harmless.
    /// Must not be awaited from inside [`Task::run`] of the same task.
    pub async fn stop(&self) {
        {
            let mut control = self.control.lock();
            if control.state == TaskState::Running {
                control.state = TaskState::Stopped;
            }
            if let Some(token) = control.cancel.take() {
                token.cancel();
            }
        }

        let mut activity = self.activity.subscribe();
        let current = *activity.borrow_and_update();
        if !current.busy {
            return;
        }
        let target = current.finished_cycles + 1;
        let _ = activity
            .wait_for(|a| !a.busy || a.finished_cycles >= target)
            .await;
    }
}

impl<T: Task> Drop for RecurringTask<T> {
    fn drop(&mut self) {
        if let Some(token) = self.control.lock().cancel.take() {
            token.cancel();
        }
    }
}

async fn run_cycles<T: Task>(
    task: Arc<T>,
    delay: Duration,
    control: Arc<Mutex<Control>>,
    activity: Arc<watch::Sender<Activity>>,
    token: CancellationToken,
    generation: u64,
) {
    let mut activity_rx = activity.subscribe();

    loop {
        // A previous run may still be finishing its last cycle after a quick
        // stop/start; never overlap with it.
        if activity_rx.wait_for(|a| !a.busy).await.is_err() || token.is_cancelled() {
            return;
        }

        activity.send_modify(|a| a.busy = true);
        let result = task.run(&token).await;
        activity.send_modify(|a| {
            a.busy = false;
            a.finished_cycles += 1;
        });

        if let Err(error) = result {
            {
                let mut control = control.lock();
                if control.generation == generation && control.state == TaskState::Running {
                    control.state = TaskState::Aborted;
                    control.cancel = None;
                }
            }
            task.on_abort(&error);
            return;
        }

        trace!(delay_ms = delay.as_millis() as u64, "Cycle finished, scheduling next");

        tokio::select! {
            _ = token.cancelled() => {
                debug!("Recurring task stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
