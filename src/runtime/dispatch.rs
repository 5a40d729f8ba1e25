//! Running closures on the privileged thread.
//!
//! Closures are appended to the bridge's [`ClosureQueue`] and the monitor
//! thread is woken. The monitor drains the queue in FIFO order in the same
//! wake cycle as deferred releases, so no two closures ever run concurrently.

use super::error::{panic_message, BridgeError, Result};
use super::vm::Handle;
use super::{Bridge, Shared};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

type Closure = Box<dyn FnOnce() + Send + 'static>;

/// How [`Bridge::run_in_main_thread`] waits for its closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Block until the closure has run and return its result
    Sync,
    /// Return as soon as the closure is queued
    Async,
}

/// Auto-reset event used to wake the monitor thread.
pub(crate) struct WakeSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub(crate) fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        *self.flag.lock() = true;
        self.cond.notify_one();
    }

    /// Block until set, then clear.
    pub(crate) fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cond.wait(&mut flag);
        }
        *flag = false;
    }
}

#[derive(Default)]
struct ClosureInner {
    pending: VecDeque<Closure>,
    closed: bool,
}

/// Closures waiting for the privileged thread.
pub(crate) struct ClosureQueue {
    inner: Mutex<ClosureInner>,
}

impl ClosureQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ClosureInner::default()),
        }
    }

    fn push(&self, closure: Closure) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(BridgeError::VmNotRunning);
        }
        inner.pending.push_back(closure);
        Ok(())
    }

    fn pop(&self) -> Option<Closure> {
        self.inner.lock().pending.pop_front()
    }

    /// Refuse further closures and drop the ones that never ran. Synchronous
    /// callers waiting on a dropped closure see `VmNotRunning`.
    pub(crate) fn close(&self) -> usize {
        let leftovers = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.pending)
        };
        leftovers.len()
    }
}

/// Run every queued closure, oldest first. Runs on the monitor thread.
pub(crate) fn run_pending(shared: &Shared) -> usize {
    let mut ran = 0;
    // Pop one at a time so closures may enqueue more without deadlocking.
    while let Some(closure) = shared.closures.pop() {
        closure();
        ran += 1;
    }
    ran
}

impl Bridge {
    fn enqueue(&self, closure: Closure) -> Result<()> {
        if !self.shared.is_running() {
            return Err(BridgeError::VmNotRunning);
        }
        self.shared.closures.push(closure)?;
        self.shared.wake.set();
        Ok(())
    }

    /// Run `f` on the privileged thread and wait for its result.
    ///
    /// On the privileged thread itself `f` runs inline. A panic inside `f`
    /// resumes in the caller with the original payload.
    pub fn run_on_main<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.is_main_thread() {
            return Ok(f());
        }
        let (tx, rx) = mpsc::channel();
        self.enqueue(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            let _ = tx.send(outcome);
        }))?;
        match rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(BridgeError::VmNotRunning),
        }
    }

    /// Queue `f` for the privileged thread without waiting.
    pub fn post_to_main<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.is_main_thread() {
            f();
            return Ok(());
        }
        self.enqueue(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    "closure posted to the main thread panicked"
                );
            }
        }))
    }

    /// Run `f` on the privileged thread. With [`Dispatch::Sync`] the result
    /// is returned; with [`Dispatch::Async`] this returns `None` once queued.
    pub fn run_in_main_thread<F, T>(&self, f: F, dispatch: Dispatch) -> Result<Option<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match dispatch {
            Dispatch::Sync => self.run_on_main(f).map(Some),
            Dispatch::Async => self
                .post_to_main(move || {
                    f();
                })
                .map(|()| None),
        }
    }

    /// Call `run()` on a runtime `java/lang/Runnable` from the privileged
    /// thread.
    ///
    /// With [`Dispatch::Async`] the caller must keep `runnable` referenced
    /// until it has run; failures are then only logged.
    pub fn execute_runnable_in_main_thread(&self, runnable: Handle, dispatch: Dispatch) -> Result<()> {
        let bridge = self.clone();
        let run = move || -> Result<()> {
            bridge.env()?.call_method(runnable, "run", "()V", Vec::new())?;
            Ok(())
        };
        match dispatch {
            Dispatch::Sync => self.run_on_main(run)?,
            Dispatch::Async => self.post_to_main(move || {
                if let Err(err) = run() {
                    warn!(%runnable, error = %err, "runnable posted to the main thread failed");
                }
            }),
        }
    }

    /// Run `f` on the privileged thread, resolving the returned future with
    /// its result.
    pub fn run_on_main_async<F, T>(&self, f: F) -> BoxFuture<'static, Result<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let submitted = if self.shared.is_main_thread() {
            let _ = tx.send(panic::catch_unwind(AssertUnwindSafe(f)));
            Ok(())
        } else {
            self.enqueue(Box::new(move || {
                let _ = tx.send(panic::catch_unwind(AssertUnwindSafe(f)));
            }))
        };
        async move {
            submitted?;
            match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(payload)) => panic::resume_unwind(payload),
                Err(_) => {
                    debug!("main-thread closure dropped before running");
                    Err(BridgeError::VmNotRunning)
                }
            }
        }
        .boxed()
    }

    /// Force the windowing subsystem to initialize on the privileged thread.
    pub fn activate_ui(&self) -> Result<()> {
        if self.shared.is_headless() {
            return Err(BridgeError::Misuse(
                "the windowing subsystem is unavailable in headless mode".to_string(),
            ));
        }
        let shared = self.shared.clone();
        self.run_on_main(move || -> Result<()> {
            let env = super::attach::current_env(&shared)?;
            shared.backend.activate_ui(env)?;
            shared.ui_active.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })?
    }

    /// Close every window the windowing subsystem has open. A no-op unless
    /// [`Bridge::activate_ui`] succeeded earlier.
    pub fn deactivate_ui(&self) -> Result<()> {
        if !self.shared.ui_active.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        let shared = self.shared.clone();
        self.run_on_main(move || -> Result<()> {
            let env = super::attach::current_env(&shared)?;
            shared.backend.close_ui_windows(env)?;
            shared.ui_active.store(false, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })?
    }
}
