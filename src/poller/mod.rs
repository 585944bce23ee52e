//! Background polling loops.
//!
//! A poller walks every VM in the environment, then waits for its delay or
//! a stop request, whichever comes first. Stopping is cooperative: a poller
//! only looks at its [`StopSignal`] between passes.
//!
//! - [`screendump`]: periodic screen captures with duplicate detection
//! - [`register`]: periodic CPU register dumps

pub mod register;
pub mod screendump;

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Time allowed for a poller to exit once stopped.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopState {
    /// The poller runs.
    Armed,
    /// Stop requested, not yet observed.
    Set,
    /// The poller has exited.
    Released,
}

/// Stop request shared between a poller and its owner.
#[derive(Debug)]
pub struct StopSignal {
    state: Mutex<StopState>,
    cond: Condvar,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self {
            state: Mutex::new(StopState::Armed),
            cond: Condvar::new(),
        }
    }
}

impl StopSignal {
    /// Create an armed signal.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request the poller to stop.
    pub fn set(&self) {
        let mut state = self.state.lock();
        if *state == StopState::Armed {
            *state = StopState::Set;
        }
        self.cond.notify_all();
    }

    /// Whether a stop was requested and not yet released.
    pub fn is_set(&self) -> bool {
        *self.state.lock() == StopState::Set
    }

    /// Whether the poller has exited.
    pub fn is_released(&self) -> bool {
        *self.state.lock() == StopState::Released
    }

    /// Mark the poller as exited.
    pub fn release(&self) {
        *self.state.lock() = StopState::Released;
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for a stop request.
    ///
    /// Returns true when stopping was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while *state == StopState::Armed {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        *state != StopState::Armed
    }

    /// End-of-pass check: if stopping was requested, release and return true;
    /// otherwise wait up to `delay` and report whether to keep going.
    pub fn should_exit(&self, delay: Duration) -> bool {
        if self.is_set() || self.wait(delay) && self.is_set() {
            self.release();
            return true;
        }
        self.is_released()
    }
}

/// A poller running on its own named thread.
#[derive(Debug)]
pub struct BackgroundTask {
    name: String,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `body` on a thread named `name`.
    ///
    /// The body owns a clone of the stop signal and must release it on exit;
    /// [`StopSignal::should_exit`] does so.
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Arc<StopSignal>) + Send + 'static,
    {
        let signal = StopSignal::new();
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body(Arc::clone(&thread_signal));
                thread_signal.release();
            })?;

        tracing::debug!(task = %name, "started background task");
        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the task and wait up to `timeout` for it to exit.
    ///
    /// A task still running after `timeout` is detached with a warning.
    /// Returns true when the task exited in time.
    pub fn stop(mut self, timeout: Duration) -> bool {
        self.signal.set();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now().checked_add(timeout);
        while !handle.is_finished() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                tracing::warn!(
                    task = %self.name,
                    ?timeout,
                    "background task did not stop in time, detaching it"
                );
                return false;
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }

        if handle.join().is_err() {
            tracing::error!(task = %self.name, "background task panicked");
        }
        tracing::debug!(task = %self.name, "background task stopped");
        true
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.signal.set();
        }
    }
}
