//! Confinement Dispatcher - One Owning Thread for All Engine Work
//!
//! Rendering engines may only be created, mutated and destroyed on a single
//! thread. The [`Dispatcher`] owns that thread and runs every pool mutation
//! on it, in submission order, while callers on any other thread get:
//! - [`run_confined`](Dispatcher::run_confined): blocking call with a bounded wait
//! - [`run_confined_async`](Dispatcher::run_confined_async): the same as an await point
//! - [`post_confined`](Dispatcher::post_confined): fire-and-forget
//!
//! # Design:
//! - The owning thread runs a tokio current-thread runtime inside a
//!   `LocalSet` and drains an unbounded job queue one job at a time
//! - Calls made on the owning thread itself run inline, so a confined task
//!   may call back into the dispatcher without deadlocking
//! - Results the caller stopped waiting for are handed to an "undelivered"
//!   hook instead of being silently dropped. A timed-out caller closes its
//!   reply channel before draining it, so every result lands on exactly one
//!   side
//! - Shutdown waits for the owning thread at most one handshake timeout,
//!   then detaches it

pub mod cell;

pub use cell::Confined;

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    After(Duration, Job),
}

type Reply<T> = Result<T, String>;

/// The owning thread plus a channel that disconnects when it exits.
struct Worker {
    thread: JoinHandle<()>,
    exited: std_mpsc::Receiver<()>,
}

/// Handle to the owning thread and its job queue.
pub struct Dispatcher {
    name: String,
    owner: ThreadId,
    sender: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    handshake_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl Dispatcher {
    /// Spawn the owning thread.
    ///
    /// `handshake_timeout` bounds how long a blocking or awaiting caller
    /// waits for a confined task to finish.
    pub fn spawn(name: impl Into<String>, handshake_timeout: Duration) -> io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let (exit_tx, exited) = std_mpsc::sync_channel::<()>(1);

        let thread = thread::Builder::new().name(name.clone()).spawn({
            let shutdown = shutdown.clone();
            move || {
                let _exit = exit_tx;
                Self::run_loop(receiver, shutdown)
            }
        })?;
        let owner = thread.thread().id();
        info!(thread = %name, "Confinement thread started");

        Ok(Self {
            name,
            owner,
            sender,
            shutdown,
            handshake_timeout,
            worker: Mutex::new(Some(Worker { thread, exited })),
        })
    }

    fn run_loop(mut receiver: mpsc::UnboundedReceiver<Message>, shutdown: CancellationToken) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(error = %err, "Failed to build confinement runtime");
                return;
            }
        };

        let local = LocalSet::new();
        local.block_on(&runtime, async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(Message::Run(job)) => run_job(job),
                        Some(Message::After(delay, job)) => {
                            let shutdown = shutdown.clone();
                            tokio::task::spawn_local(async move {
                                tokio::select! {
                                    _ = shutdown.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => run_job(job),
                                }
                            });
                        }
                        None => break,
                    },
                }
            }
        });
        debug!("Confinement loop exited");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the owning thread.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Whether the queue still accepts work.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.sender.is_closed()
    }

    fn submit(&self, message: Message) -> Result<(), DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Unavailable);
        }
        self.sender
            .send(message)
            .map_err(|_| DispatchError::Unavailable)
    }

    /// Run `task` on the owning thread and block until it finishes.
    pub fn run_confined<T, F>(&self, task: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.run_confined_or_else(task, drop)
    }

    /// Like [`run_confined`](Self::run_confined), but a result produced after
    /// the caller gave up is passed to `undelivered` on the owning thread.
    pub fn run_confined_or_else<T, F, U>(&self, task: F, undelivered: U) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        U: FnOnce(T) + Send + 'static,
    {
        if self.is_owner_thread() {
            return run_inline(task);
        }

        let (reply_tx, reply_rx) = oneshot::channel::<Reply<T>>();
        let (done_tx, done_rx) = std_mpsc::sync_channel::<()>(1);
        self.submit(Message::Run(Box::new(move || {
            deliver(reply_tx, run_captured(task), undelivered);
            let _ = done_tx.send(());
        })))?;

        let deadline_passed = matches!(
            done_rx.recv_timeout(self.handshake_timeout),
            Err(RecvTimeoutError::Timeout)
        );
        self.settle(reply_rx, deadline_passed)
    }

    /// Await `task` on the owning thread.
    pub async fn run_confined_async<T, F>(&self, task: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.run_confined_async_or_else(task, drop).await
    }

    /// Async counterpart of [`run_confined_or_else`](Self::run_confined_or_else).
    pub async fn run_confined_async_or_else<T, F, U>(
        &self,
        task: F,
        undelivered: U,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        U: FnOnce(T) + Send + 'static,
    {
        if self.is_owner_thread() {
            return run_inline(task);
        }

        let (reply_tx, mut reply_rx) = oneshot::channel::<Reply<T>>();
        self.submit(Message::Run(Box::new(move || {
            deliver(reply_tx, run_captured(task), undelivered);
        })))?;

        match tokio::time::timeout(self.handshake_timeout, &mut reply_rx).await {
            Ok(Ok(reply)) => reply.map_err(DispatchError::TaskPanicked),
            Ok(Err(_)) => Err(DispatchError::Unavailable),
            Err(_) => self.settle(reply_rx, true),
        }
    }

    /// Close the reply channel, then take whatever already arrived.
    ///
    /// After `close` the task can no longer deliver, so a result is either
    /// returned here or handed to its undelivered hook, never both or neither.
    fn settle<T>(
        &self,
        mut reply_rx: oneshot::Receiver<Reply<T>>,
        deadline_passed: bool,
    ) -> Result<T, DispatchError> {
        reply_rx.close();
        match reply_rx.try_recv() {
            Ok(reply) => {
                if deadline_passed {
                    debug!(thread = %self.name, "Confined result arrived at the deadline, keeping it");
                }
                reply.map_err(DispatchError::TaskPanicked)
            }
            Err(_) if deadline_passed => {
                warn!(thread = %self.name, timeout = ?self.handshake_timeout, "Confined call timed out");
                Err(DispatchError::Timeout(self.handshake_timeout))
            }
            Err(_) => Err(DispatchError::Unavailable),
        }
    }

    /// Queue `task` on the owning thread without waiting for it.
    pub fn post_confined<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Message::Run(Box::new(task)))
    }

    /// Queue `task` to run on the owning thread once `delay` has elapsed.
    ///
    /// Delayed tasks still pending at shutdown never run.
    pub fn post_delayed<F>(&self, delay: Duration, task: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Message::After(delay, Box::new(task)))
    }

    /// Stop the owning thread. Queued work that has not started is dropped.
    ///
    /// Waits up to the handshake timeout for the thread to finish its
    /// current task and joins it; a thread still busy after that is
    /// detached. Never waits when called from the owning thread itself.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        if self.is_owner_thread() {
            return;
        }
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            let waited = worker.exited.recv_timeout(self.handshake_timeout);
            if let Err(RecvTimeoutError::Timeout) = waited {
                warn!(
                    thread = %self.name,
                    timeout = ?self.handshake_timeout,
                    "Confinement thread still busy, detaching"
                );
                return;
            }
            if worker.thread.join().is_err() {
                error!(thread = %self.name, "Confinement thread panicked");
            }
        }
        info!(thread = %self.name, "Confinement thread stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run_inline<T>(task: impl FnOnce() -> T) -> Result<T, DispatchError> {
    run_captured(task).map_err(DispatchError::TaskPanicked)
}

fn run_captured<T>(task: impl FnOnce() -> T) -> Reply<T> {
    panic::catch_unwind(AssertUnwindSafe(task)).map_err(|payload| panic_message(payload.as_ref()))
}

/// Send `reply` to the waiting caller; a value the caller no longer accepts
/// goes to `undelivered`.
fn deliver<T>(reply_tx: oneshot::Sender<Reply<T>>, reply: Reply<T>, undelivered: impl FnOnce(T)) {
    if let Err(Ok(value)) = reply_tx.send(reply) {
        undelivered(value);
    }
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        error!(panic = %panic_message(payload.as_ref()), "Posted task panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::spawn("test-confinement", Duration::from_secs(2)).unwrap())
    }

    #[test]
    fn test_run_confined_executes_on_owner() {
        let d = dispatcher();
        let owner = d.owner();
        let ran_on = d.run_confined(|| thread::current().id()).unwrap();
        assert_eq!(ran_on, owner);
        assert_ne!(ran_on, thread::current().id());
        let name = d
            .run_confined(|| thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-confinement"));
    }

    #[test]
    fn test_posted_and_run_tasks_keep_submission_order() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let log = Arc::clone(&log);
            d.post_confined(move || log.lock().unwrap().push(i)).unwrap();
        }
        let snapshot = {
            let log = Arc::clone(&log);
            d.run_confined(move || log.lock().unwrap().clone()).unwrap()
        };
        assert_eq!(snapshot, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_reentrant_call_runs_inline() {
        let d = dispatcher();
        let inner = Arc::clone(&d);
        let value = d
            .run_confined(move || inner.run_confined(|| 7).unwrap() * 6)
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_panic_is_returned_to_caller() {
        let d = dispatcher();
        let err = d.run_confined(|| -> u32 { panic!("boom") }).unwrap_err();
        assert_eq!(err, DispatchError::TaskPanicked("boom".into()));
        // The owning thread survives.
        assert_eq!(d.run_confined(|| 1).unwrap(), 1);
    }

    #[test]
    fn test_posted_panic_does_not_kill_thread() {
        let d = dispatcher();
        d.post_confined(|| panic!("posted boom")).unwrap();
        assert!(d.run_confined(|| true).unwrap());
    }

    #[test]
    fn test_timeout_hands_result_to_undelivered_hook() {
        let d = Arc::new(Dispatcher::spawn("slow", Duration::from_millis(50)).unwrap());
        let recovered = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&recovered);
        let err = d
            .run_confined_or_else(
                || {
                    thread::sleep(Duration::from_millis(200));
                    5usize
                },
                move |value| {
                    hook.fetch_add(value, Ordering::SeqCst);
                },
            )
            .unwrap_err();
        assert_eq!(err, DispatchError::Timeout(Duration::from_millis(50)));

        // Later work queues behind the slow task, so once it runs the hook has fired.
        let d2 = Arc::clone(&d);
        let _ = thread::spawn(move || {
            let start = Instant::now();
            while start.elapsed() < Duration::from_secs(2) {
                if d2.run_confined(|| ()).is_ok() {
                    break;
                }
            }
        })
        .join();
        assert_eq!(recovered.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_result_landing_at_deadline_is_kept() {
        let d = dispatcher();
        let (reply_tx, reply_rx) = oneshot::channel::<Reply<usize>>();
        let hooked = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&hooked);
        // Delivered after the caller's wait expired but before it closed.
        deliver(reply_tx, Ok(9), move |v| {
            hook.fetch_add(v, Ordering::SeqCst);
        });
        assert_eq!(d.settle(reply_rx, true), Ok(9));
        assert_eq!(hooked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_result_after_close_goes_to_undelivered_hook() {
        let d = dispatcher();
        let (reply_tx, reply_rx) = oneshot::channel::<Reply<usize>>();
        assert_eq!(
            d.settle(reply_rx, true),
            Err(DispatchError::Timeout(Duration::from_secs(2)))
        );
        let hooked = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&hooked);
        deliver(reply_tx, Ok(9), move |v| {
            hook.fetch_add(v, Ordering::SeqCst);
        });
        assert_eq!(hooked.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn test_dropped_task_reports_unavailable() {
        let d = dispatcher();
        let (reply_tx, reply_rx) = oneshot::channel::<Reply<usize>>();
        drop(reply_tx);
        assert_eq!(d.settle(reply_rx, false), Err(DispatchError::Unavailable));
    }

    #[test]
    fn test_shutdown_detaches_busy_thread() {
        let d = Dispatcher::spawn("busy", Duration::from_millis(50)).unwrap();
        let (started_tx, started_rx) = std_mpsc::channel();
        d.post_confined(move || {
            let _ = started_tx.send(());
            thread::sleep(Duration::from_secs(2));
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let start = Instant::now();
        d.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!d.is_running());

        let start = Instant::now();
        drop(d);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_shutdown_makes_dispatch_unavailable() {
        let d = dispatcher();
        d.shutdown();
        assert!(!d.is_running());
        assert_eq!(d.run_confined(|| 1), Err(DispatchError::Unavailable));
        assert_eq!(d.post_confined(|| ()), Err(DispatchError::Unavailable));
        // Second shutdown is a no-op.
        d.shutdown();
    }

    #[test]
    fn test_post_delayed_runs_later_on_owner() {
        let d = dispatcher();
        let (tx, rx) = std_mpsc::channel();
        let posted_at = Instant::now();
        d.post_delayed(Duration::from_millis(30), move || {
            let _ = tx.send((thread::current().name().map(str::to_owned), Instant::now()));
        })
        .unwrap();
        let (name, ran_at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("test-confinement"));
        assert!(ran_at.duration_since(posted_at) >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_run_confined_async() {
        let d = dispatcher();
        let owner = d.owner();
        let ran_on = d.run_confined_async(|| thread::current().id()).await.unwrap();
        assert_eq!(ran_on, owner);
    }

    #[tokio::test]
    async fn test_run_confined_async_after_shutdown() {
        let d = dispatcher();
        d.shutdown();
        assert_eq!(
            d.run_confined_async(|| 1).await,
            Err(DispatchError::Unavailable)
        );
    }
}
