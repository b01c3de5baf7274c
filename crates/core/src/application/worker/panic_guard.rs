// Panic isolation for every unit of background work
use futures::FutureExt;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

thread_local! {
    /// >0 while a guarded future is being polled on this thread
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    /// Backtrace captured by the hook for the panic currently unwinding
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install the process-wide panic hook (idempotent).
///
/// Inside guarded code the hook only records a backtrace for the runner to
/// log; everywhere else the previous hook runs unchanged.
fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let guarded = GUARD_DEPTH.try_with(|d| d.get() > 0).unwrap_or(false);
            if guarded {
                let backtrace = Backtrace::force_capture().to_string();
                let _ = LAST_BACKTRACE.try_with(|slot| *slot.borrow_mut() = Some(backtrace));
            } else {
                previous(info);
            }
        }));
    });
}

fn take_backtrace() -> String {
    LAST_BACKTRACE
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten()
        .unwrap_or_else(|| "<no backtrace captured>".to_string())
}

/// Extract a readable message from a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        GUARD_DEPTH.with(|d| d.set(d.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        let _ = GUARD_DEPTH.try_with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Marks the thread as guarded for the duration of each poll
struct Marked<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Marked<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _depth = DepthGuard::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// Execution ran to completion
    Finished(T),
    /// Execution panicked; the panic was logged with its backtrace
    Panicked(String),
    /// The task was aborted before finishing (runtime shutting down)
    Aborted,
}

impl<T> TaskOutcome<T> {
    pub fn is_panicked(&self) -> bool {
        matches!(self, TaskOutcome::Panicked(_))
    }

    /// Collapse into the finished value or a failure message
    pub fn into_result(self) -> std::result::Result<T, String> {
        match self {
            TaskOutcome::Finished(value) => Ok(value),
            TaskOutcome::Panicked(msg) => Err(format!("panicked: {}", msg)),
            TaskOutcome::Aborted => Err("aborted".to_string()),
        }
    }
}

/// Runs futures as isolated tokio tasks and converts panics into outcomes.
///
/// Every task spawned through a runner (and its clones) is tracked, so
/// `drain` can wait for in-flight work at shutdown.
#[derive(Clone)]
pub struct TaskRunner {
    tracker: TaskTracker,
    panics: Arc<AtomicU64>,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner {
    pub fn new() -> Self {
        install_panic_hook();
        Self {
            tracker: TaskTracker::new(),
            panics: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn `future` and wait for its outcome
    pub async fn run<F, T>(&self, name: &str, future: F) -> TaskOutcome<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        match self.spawn(name, future).await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                warn!(task = name, error = %join_err, "Task did not finish");
                TaskOutcome::Aborted
            }
        }
    }

    /// Spawn `future` without waiting; the handle resolves to its outcome
    pub fn spawn<F, T>(&self, name: &str, future: F) -> JoinHandle<TaskOutcome<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.to_string();
        let panics = Arc::clone(&self.panics);
        let guarded = AssertUnwindSafe(Marked {
            inner: Box::pin(future),
        })
        .catch_unwind();

        self.tracker.spawn(async move {
            match guarded.await {
                Ok(value) => TaskOutcome::Finished(value),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    let backtrace = take_backtrace();
                    panics.fetch_add(1, Ordering::Relaxed);
                    error!(
                        task = %name,
                        panic_msg = %message,
                        backtrace = %backtrace,
                        "Task panicked"
                    );
                    TaskOutcome::Panicked(message)
                }
            }
        })
    }

    /// Panics caught since the runner was created
    pub fn panics_caught(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Tasks spawned and not yet finished
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `timeout` for every tracked task to finish.
    ///
    /// Returns false if tasks were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending == 0 {
            return true;
        }
        info!(pending = pending, timeout_ms = timeout.as_millis() as u64, "Draining tasks");
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(still_running = self.tracker.len(), "Drain timeout elapsed");
                false
            }
        }
    }
}
