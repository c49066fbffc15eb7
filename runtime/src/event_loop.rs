//! The dispatch event loop.
//!
//! One dedicated thread drives a single-threaded tokio runtime. Every
//! mutation of session manager state happens in a task running on that
//! thread, so managers never need to coordinate with each other or with
//! submitting threads beyond a channel send.
//!
//! The thread is started lazily, on the first call that hands the loop work.
//! Submission goes through an unbounded channel: it never blocks on work
//! already running on the loop, and tasks submitted from one thread run in
//! the order they were submitted.
//!
//! # Example
//!
//! ```
//! use courier_runtime::EventLoop;
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! let event_loop = EventLoop::new("docs-loop");
//! let (tx, rx) = mpsc::channel();
//!
//! let first = tx.clone();
//! event_loop.execute(move || first.send("task").unwrap()).unwrap();
//! event_loop
//!     .schedule(move || tx.send("timer").unwrap(), Duration::from_millis(5))
//!     .unwrap();
//!
//! assert_eq!(rx.recv().unwrap(), "task");
//! assert_eq!(rx.recv().unwrap(), "timer");
//! event_loop.shutdown().unwrap();
//! ```

use crate::error::EventLoopError;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Hooks run once the loop stops; `None` after they ran.
type StopHooks = Arc<Mutex<Option<Vec<Task>>>>;

enum Command {
    Run(Task),
    Spawn(BoxFuture<'static, ()>),
    Timer {
        task: Task,
        delay: Duration,
        timer: Arc<TimerState>,
    },
    Stop,
}

/// Handle to the dispatch event loop.
///
/// Cheap to clone; every clone drives the same thread. The thread stops when
/// [`EventLoop::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    sender: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    started: OnceLock<Result<ThreadId, EventLoopError>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    stop_hooks: StopHooks,
}

impl EventLoop {
    /// Create a loop whose thread will carry `name`. Nothing is started yet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                sender,
                receiver: Mutex::new(Some(receiver)),
                started: OnceLock::new(),
                thread: Mutex::new(None),
                stopping: AtomicBool::new(false),
                stop_hooks: Arc::new(Mutex::new(Some(Vec::new()))),
            }),
        }
    }

    /// Name of the loop thread.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run `task` on the loop thread, after every task previously submitted
    /// from the calling thread.
    ///
    /// A panicking task is logged and does not take the loop down.
    ///
    /// # Errors
    ///
    /// - [`EventLoopError::Start`] if the loop thread could not be started
    /// - [`EventLoopError::Stopped`] if the loop has been shut down
    pub fn execute<F>(&self, task: F) -> Result<(), EventLoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Command::Run(Box::new(task)))
    }

    /// Run `task` on the loop thread once `delay` has elapsed, unless the
    /// returned handle is cancelled first.
    ///
    /// # Errors
    ///
    /// Same as [`EventLoop::execute`].
    pub fn schedule<F>(&self, task: F, delay: Duration) -> Result<TimerHandle, EventLoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        let timer = Arc::new(TimerState::default());
        self.send(Command::Timer {
            task: Box::new(task),
            delay,
            timer: Arc::clone(&timer),
        })?;
        metrics::counter!("courier.event_loop.timers").increment(1);
        Ok(TimerHandle { state: timer })
    }

    /// Drive `future` to completion on the loop thread.
    ///
    /// Transports and connection attempts run this way, so their completions
    /// are observed on the loop without another hop.
    ///
    /// # Errors
    ///
    /// Same as [`EventLoop::execute`].
    pub fn spawn<F>(&self, future: F) -> Result<(), EventLoopError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.send(Command::Spawn(Box::pin(future)))
    }

    /// Whether the caller is running on the loop thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        matches!(self.inner.started.get(), Some(Ok(id)) if *id == thread::current().id())
    }

    /// Whether the loop thread has been started and not yet told to stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.inner.started.get(), Some(Ok(_)))
            && !self.inner.stopping.load(Ordering::Acquire)
    }

    /// Run `hook` on the loop thread after the loop stops, before its
    /// pending timers and spawned futures are dropped.
    ///
    /// Owners of work carried by those futures register a hook so the work
    /// still gets an outcome. A hook registered after the hooks already ran
    /// runs immediately on the calling thread.
    pub fn on_stop<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self
            .inner
            .stop_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match hooks.as_mut() {
            Some(hooks) => hooks.push(Box::new(hook)),
            None => {
                drop(hooks);
                run_task(Box::new(hook));
            }
        }
    }

    /// Stop the loop and wait for its thread to exit.
    ///
    /// Tasks already queued ahead of the stop request still run. Then the
    /// [`EventLoop::on_stop`] hooks run, and pending timers and spawned
    /// futures are dropped. Called from the loop thread itself this only
    /// requests the stop.
    ///
    /// # Errors
    ///
    /// Returns [`EventLoopError::Panicked`] if the loop thread panicked.
    pub fn shutdown(&self) -> Result<(), EventLoopError> {
        if !self.inner.stopping.swap(true, Ordering::AcqRel) {
            let _ = self.inner.sender.send(Command::Stop);
            tracing::info!(name = %self.inner.name, "Event loop stopping");
        }

        if self.is_current() {
            return Ok(());
        }

        let handle = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| EventLoopError::Panicked)?;
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), EventLoopError> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(EventLoopError::Stopped);
        }
        self.ensure_started()?;
        self.inner
            .sender
            .send(command)
            .map_err(|_| EventLoopError::Stopped)
    }

    fn ensure_started(&self) -> Result<(), EventLoopError> {
        match self.inner.started.get_or_init(|| self.inner.start()) {
            Ok(_) => Ok(()),
            Err(error) => Err(error.clone()),
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Inner {
    fn start(&self) -> Result<ThreadId, EventLoopError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EventLoopError::Stopped)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| {
                tracing::error!(
                    name = %self.name,
                    error = %e,
                    "Failed to build event loop runtime"
                );
                EventLoopError::Start(e.to_string())
            })?;

        let hooks = Arc::clone(&self.stop_hooks);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || drive(runtime, receiver, &hooks))
            .map_err(|e| {
                tracing::error!(name = %self.name, error = %e, "Failed to spawn event loop thread");
                EventLoopError::Start(e.to_string())
            })?;

        let id = handle.thread().id();
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tracing::info!(name = %self.name, "Event loop started");
        Ok(id)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(Command::Stop);
        }
    }
}

fn drive(
    runtime: tokio::runtime::Runtime,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    hooks: &StopHooks,
) {
    runtime.block_on(async move {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Run(task) => run_task(task),
                Command::Spawn(future) => {
                    tokio::spawn(future);
                }
                Command::Timer { task, delay, timer } => {
                    tokio::spawn(fire_after(task, delay, timer));
                }
                Command::Stop => break,
            }
        }
    });

    let hooks = hooks
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or_default();
    tracing::debug!(hooks = hooks.len(), "Event loop thread exiting");
    {
        let _context = runtime.enter();
        for hook in hooks {
            run_task(hook);
        }
    }
    drop(runtime);
}

fn run_task(task: Task) {
    metrics::counter!("courier.event_loop.tasks").increment(1);
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!("Event loop task panicked, continuing");
    }
}

async fn fire_after(task: Task, delay: Duration, timer: Arc<TimerState>) {
    tokio::select! {
        () = tokio::time::sleep(delay) => {
            if timer.try_transition(TimerState::FIRED) {
                run_task(task);
            }
        }
        () = timer.notify.notified() => {}
    }
}

#[derive(Debug, Default)]
struct TimerState {
    status: AtomicU8,
    notify: Notify,
}

impl TimerState {
    const PENDING: u8 = 0;
    const CANCELLED: u8 = 1;
    const FIRED: u8 = 2;

    fn try_transition(&self, to: u8) -> bool {
        self.status
            .compare_exchange(Self::PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Handle to a task scheduled with [`EventLoop::schedule`].
///
/// Firing and cancellation race through a single compare-and-set, so exactly
/// one of them wins.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    /// Cancel the timer. Returns `false` if it already fired or was
    /// already cancelled.
    pub fn cancel(&self) -> bool {
        let won = self.state.try_transition(TimerState::CANCELLED);
        if won {
            self.state.notify.notify_one();
        }
        won
    }

    /// Whether [`TimerHandle::cancel`] won.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == TimerState::CANCELLED
    }

    /// Whether the scheduled task ran (or is running).
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state.status.load(Ordering::Acquire) == TimerState::FIRED
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::mpsc as std_mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn tasks_run_in_submission_order() {
        let event_loop = EventLoop::new("order-test");
        let (tx, rx) = std_mpsc::channel();

        for i in 0..100 {
            let tx = tx.clone();
            event_loop.execute(move || tx.send(i).unwrap()).unwrap();
        }

        let seen: Vec<i32> = (0..100).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        event_loop.shutdown().unwrap();
    }

    #[test]
    fn loop_starts_lazily() {
        let event_loop = EventLoop::new("lazy-test");
        assert!(!event_loop.is_running());

        event_loop.execute(|| {}).unwrap();
        assert!(event_loop.is_running());
        event_loop.shutdown().unwrap();
        assert!(!event_loop.is_running());
    }

    #[test]
    fn tasks_run_on_loop_thread() {
        let event_loop = EventLoop::new("thread-test");
        let (tx, rx) = std_mpsc::channel();

        let observer = event_loop.clone();
        event_loop
            .execute(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((observer.is_current(), name)).unwrap();
            })
            .unwrap();

        let (on_loop, name) = rx.recv_timeout(WAIT).unwrap();
        assert!(on_loop);
        assert_eq!(name.as_deref(), Some("thread-test"));
        assert!(!event_loop.is_current());
        event_loop.shutdown().unwrap();
    }

    #[test]
    fn scheduled_task_fires_after_delay() {
        let event_loop = EventLoop::new("timer-test");
        let (tx, rx) = std_mpsc::channel();
        let started = std::time::Instant::now();

        let handle = event_loop
            .schedule(move || tx.send(()).unwrap(), Duration::from_millis(20))
            .unwrap();

        rx.recv_timeout(WAIT).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(handle.has_fired());
        assert!(!handle.cancel(), "cancelling after firing is a no-op");
        event_loop.shutdown().unwrap();
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let event_loop = EventLoop::new("cancel-test");
        let (tx, rx) = std_mpsc::channel::<()>();

        let handle = event_loop
            .schedule(move || tx.send(()).unwrap(), Duration::from_millis(20))
            .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel(), "second cancel reports no change");
        assert!(handle.is_cancelled());

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        event_loop.shutdown().unwrap();
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_task_does_not_stop_loop() {
        let event_loop = EventLoop::new("panic-test");
        let (tx, rx) = std_mpsc::channel();

        event_loop.execute(|| panic!("boom")).unwrap();
        event_loop.execute(move || tx.send(42).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 42);
        event_loop.shutdown().unwrap();
    }

    #[test]
    fn spawned_futures_run_on_loop() {
        let event_loop = EventLoop::new("spawn-test");
        let (tx, rx) = std_mpsc::channel();

        event_loop
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                tx.send("done").unwrap();
            })
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "done");
        event_loop.shutdown().unwrap();
    }

    #[test]
    fn stop_hooks_run_on_loop_before_pending_futures_drop() {
        struct Dropped(std_mpsc::Sender<&'static str>);
        impl Drop for Dropped {
            fn drop(&mut self) {
                let _ = self.0.send("future dropped");
            }
        }

        let event_loop = EventLoop::new("hook-test");
        let (tx, rx) = std_mpsc::channel();

        let guard = Dropped(tx.clone());
        event_loop
            .spawn(async move {
                let _guard = guard;
                futures::future::pending::<()>().await;
            })
            .unwrap();
        let observer = event_loop.clone();
        event_loop.on_stop(move || {
            let label = if observer.is_current() {
                "hook on loop"
            } else {
                "hook elsewhere"
            };
            tx.send(label).unwrap();
        });

        event_loop.shutdown().unwrap();
        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(seen, vec!["hook on loop", "future dropped"]);
    }

    #[test]
    fn hook_registered_after_stop_runs_immediately() {
        let event_loop = EventLoop::new("late-hook-test");
        event_loop.execute(|| {}).unwrap();
        event_loop.shutdown().unwrap();

        let (tx, rx) = std_mpsc::channel();
        event_loop.on_stop(move || tx.send(()).unwrap());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn stopped_loop_rejects_work() {
        let event_loop = EventLoop::new("stop-test");
        event_loop.execute(|| {}).unwrap();
        event_loop.shutdown().unwrap();

        assert_eq!(event_loop.execute(|| {}), Err(EventLoopError::Stopped));
        assert!(event_loop.schedule(|| {}, Duration::ZERO).is_err());
        assert!(event_loop.shutdown().is_ok(), "shutdown is idempotent");
    }
}
