//! Waiting for privileged-thread work without starving a UI event loop.
//!
//! A caller that owns a foreign UI loop cannot simply block on a result
//! produced by the privileged thread: the privileged thread may itself be
//! waiting for that loop to deliver an event. [`Bridge::await_future`] picks a
//! waiting strategy from the caller's loop state and always finishes with a
//! bounded poll-sleep.

use super::error::{BridgeError, Result};
use super::Bridge;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Sleep between completion checks when no UI loop needs servicing.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Timer period of the nested loop run for an idle UI loop.
pub const NESTED_LOOP_INTERVAL: Duration = Duration::from_millis(10);

type Body<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

enum Slot<T> {
    Pending,
    Ready(thread::Result<Result<T>>),
    Taken,
}

/// A unit of work with a completion flag and a single-fetch result.
pub struct FutureTask<T> {
    body: Mutex<Option<Body<T>>>,
    slot: Mutex<Slot<T>>,
    done: Condvar,
}

impl<T: Send + 'static> FutureTask<T> {
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        Arc::new(Self {
            body: Mutex::new(Some(Box::new(f))),
            slot: Mutex::new(Slot::Pending),
            done: Condvar::new(),
        })
    }

    /// Run the body on the calling thread. Later calls do nothing.
    pub fn run(&self) {
        let body = self.body.lock().take();
        if let Some(body) = body {
            let outcome = panic::catch_unwind(AssertUnwindSafe(body));
            self.complete(outcome);
        }
    }

    fn complete(&self, outcome: thread::Result<Result<T>>) {
        *self.slot.lock() = Slot::Ready(outcome);
        self.done.notify_all();
    }

    /// Resolve a task whose body will never run.
    fn abandon(&self) {
        if self.body.lock().take().is_some() {
            self.complete(Ok(Err(BridgeError::VmNotRunning)));
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    /// Wait for the result and take it. A panic in the body resumes here; a
    /// second fetch fails with `Misuse`.
    pub fn get(&self) -> Result<T> {
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Pending) {
            self.done.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(Ok(result)) => result,
            Slot::Ready(Err(payload)) => {
                drop(slot);
                panic::resume_unwind(payload)
            }
            Slot::Taken | Slot::Pending => Err(BridgeError::Misuse(
                "future result already fetched".to_string(),
            )),
        }
    }
}

/// Resolves its task as abandoned if dropped before the task ran.
struct Submission<T: Send + 'static>(Arc<FutureTask<T>>);

impl<T: Send + 'static> Drop for Submission<T> {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

/// State of the calling thread's foreign UI loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No loop on this thread
    Absent,
    /// A loop exists but has not been entered
    Idle,
    /// The loop is being run by this thread
    Running,
}

/// A host-supplied foreign UI event loop.
pub trait UiEventLoop {
    fn state(&self) -> LoopState;

    /// Whether events are waiting to be processed.
    fn has_pending(&self) -> bool;

    /// Process one dispatch cycle.
    fn dispatch(&self);

    /// Run a nested instance of the loop. `tick` is called every `interval`
    /// and the nested loop exits once it returns `false`.
    fn run_nested(&self, interval: Duration, tick: &mut dyn FnMut() -> bool);
}

fn poll_until_done<T: Send + 'static>(task: &FutureTask<T>) {
    while !task.is_done() {
        thread::sleep(POLL_INTERVAL);
    }
}

impl Bridge {
    /// Run `task` on the privileged thread and return its result, keeping
    /// `ui` responsive while waiting.
    pub fn await_future<T: Send + 'static>(
        &self,
        task: &Arc<FutureTask<T>>,
        ui: Option<&dyn UiEventLoop>,
    ) -> Result<T> {
        if self.is_main_thread() {
            task.run();
            while !task.is_done() {
                std::hint::spin_loop();
            }
            return task.get();
        }

        let submission = Submission(Arc::clone(task));
        self.post_to_main(move || {
            let submission = submission;
            submission.0.run();
        })?;

        let ui = if self.is_headless() { None } else { ui };
        match ui.map(|ui| (ui.state(), ui)) {
            None | Some((LoopState::Absent, _)) => poll_until_done(task),
            Some((LoopState::Running, ui)) => {
                while !task.is_done() {
                    if ui.has_pending() {
                        ui.dispatch();
                    } else {
                        thread::sleep(POLL_INTERVAL);
                    }
                }
            }
            Some((LoopState::Idle, ui)) => {
                ui.run_nested(NESTED_LOOP_INTERVAL, &mut || !task.is_done());
            }
        }
        // A nested loop may exit early; never return before completion.
        poll_until_done(task);
        task.get()
    }

    /// Run `f` on the privileged thread through [`Bridge::await_future`].
    pub fn execute_callable_in_main_thread<F, T>(
        &self,
        f: F,
        ui: Option<&dyn UiEventLoop>,
    ) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.await_future(&FutureTask::new(f), ui)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::panic_message;
    use crate::runtime::test_support::running_bridge;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Loop double that records how it was driven.
    struct FakeLoop {
        state: LoopState,
        pending: Cell<usize>,
        dispatched: Cell<usize>,
        nested_ticks: Cell<usize>,
    }

    impl FakeLoop {
        fn new(state: LoopState, pending: usize) -> Self {
            Self {
                state,
                pending: Cell::new(pending),
                dispatched: Cell::new(0),
                nested_ticks: Cell::new(0),
            }
        }
    }

    impl UiEventLoop for FakeLoop {
        fn state(&self) -> LoopState {
            self.state
        }

        fn has_pending(&self) -> bool {
            self.pending.get() > 0
        }

        fn dispatch(&self) {
            self.pending.set(self.pending.get().saturating_sub(1));
            self.dispatched.set(self.dispatched.get() + 1);
        }

        fn run_nested(&self, interval: Duration, tick: &mut dyn FnMut() -> bool) {
            loop {
                self.nested_ticks.set(self.nested_ticks.get() + 1);
                if !tick() {
                    break;
                }
                thread::sleep(interval);
            }
        }
    }

    fn slow_task() -> Arc<FutureTask<String>> {
        FutureTask::new(|| {
            thread::sleep(Duration::from_millis(20));
            Ok(format!("computed on {:?}", thread::current().name()))
        })
    }

    #[test]
    fn test_result_independent_of_branch() {
        let (_vm, bridge) = running_bridge(false);
        let absent = bridge.await_future(&slow_task(), None).unwrap();

        let idle = FakeLoop::new(LoopState::Idle, 0);
        let nested = bridge.await_future(&slow_task(), Some(&idle)).unwrap();
        assert!(idle.nested_ticks.get() >= 1);

        let running = FakeLoop::new(LoopState::Running, 3);
        let pumped = bridge.await_future(&slow_task(), Some(&running)).unwrap();

        assert_eq!(absent, "computed on Some(\"vmbridge-monitor\")");
        assert_eq!(nested, absent);
        assert_eq!(pumped, absent);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_running_loop_is_pumped() {
        let (_vm, bridge) = running_bridge(false);
        let running = FakeLoop::new(LoopState::Running, 2);
        bridge.await_future(&slow_task(), Some(&running)).unwrap();
        assert_eq!(running.dispatched.get(), 2);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_headless_ignores_ui_loop() {
        let (_vm, bridge) = running_bridge(true);
        let idle = FakeLoop::new(LoopState::Idle, 0);
        bridge.await_future(&slow_task(), Some(&idle)).unwrap();
        assert_eq!(idle.nested_ticks.get(), 0);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_error_and_panic_propagate() {
        let (_vm, bridge) = running_bridge(true);
        let failing = FutureTask::new(|| -> Result<()> {
            Err(BridgeError::Internal("body failed".to_string()))
        });
        let err = bridge.await_future(&failing, None).unwrap_err();
        assert!(matches!(err, BridgeError::Internal(ref msg) if msg == "body failed"));

        let panicking = FutureTask::new(|| -> Result<()> { panic!("body panicked") });
        let caller = bridge.clone();
        let payload = panic::catch_unwind(AssertUnwindSafe(move || {
            caller.await_future(&panicking, None)
        }))
        .unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "body panicked");
        bridge.kill().unwrap();
    }

    #[test]
    fn test_single_fetch() {
        let task = FutureTask::new(|| Ok(1));
        assert!(!task.is_done());
        task.run();
        task.run();
        assert!(task.is_done());
        assert_eq!(task.get().unwrap(), 1);
        assert!(matches!(task.get(), Err(BridgeError::Misuse(_))));
    }

    #[test]
    fn test_body_runs_once_on_main_thread() {
        let (_vm, bridge) = running_bridge(true);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let inner = bridge.clone();
        let value = bridge
            .run_on_main(move || {
                let task = FutureTask::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(9)
                });
                inner.await_future(&task, None)
            })
            .unwrap()
            .unwrap();
        assert_eq!(value, 9);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_dropped_submission_resolves_task() {
        let task = FutureTask::new(|| Ok(()));
        drop(Submission(task.clone()));
        assert!(task.is_done());
        assert!(matches!(task.get(), Err(BridgeError::VmNotRunning)));
    }

    #[test]
    fn test_execute_callable_in_main_thread() {
        let (vm, bridge) = running_bridge(true);
        let ran_on = bridge
            .execute_callable_in_main_thread(|| Ok(thread::current().id()), None)
            .unwrap();
        assert_eq!(Some(ran_on), vm.creator_thread());
        bridge.kill().unwrap();
        assert!(matches!(
            bridge.execute_callable_in_main_thread(|| Ok(()), None),
            Err(BridgeError::VmNotRunning)
        ));
    }
}
