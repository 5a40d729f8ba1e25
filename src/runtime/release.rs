//! Ownership of runtime objects held by host code.
//!
//! A [`GlobalRef`] owns one global reference. Dropping it on an attached
//! thread releases the reference immediately; anywhere else the handle is
//! queued on the bridge's deferred-release set and the monitor thread
//! releases it on its next wake.

use super::vm::Handle;
use super::{attach, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct ReleaseInner {
    handles: Vec<Handle>,
    closed: bool,
}

/// Handles waiting to be released on the monitor thread.
pub(crate) struct ReleaseQueue {
    inner: Mutex<ReleaseInner>,
}

impl ReleaseQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ReleaseInner::default()),
        }
    }

    /// Queue a handle. Returns false once the queue is closed.
    pub(crate) fn push(&self, handle: Handle) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.handles.push(handle);
        true
    }

    pub(crate) fn drain(&self) -> Vec<Handle> {
        std::mem::take(&mut self.inner.lock().handles)
    }

    /// Drain and refuse further handles.
    pub(crate) fn close(&self) -> Vec<Handle> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        std::mem::take(&mut inner.handles)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().handles.len()
    }
}

/// Release every queued handle. Runs on the monitor thread.
pub(crate) fn reap(shared: &Shared) -> usize {
    let handles = shared.releases.drain();
    let count = handles.len();
    for handle in handles {
        if let Err(err) = shared.backend.release(handle) {
            warn!(%handle, error = %err, "failed to release deferred reference");
        }
    }
    count
}

fn release_handle(shared: &Arc<Shared>, handle: Handle) {
    if attach::is_attached(shared) {
        match shared.with_live_vm(|backend| backend.release(handle)) {
            Some(Ok(())) => {}
            Some(Err(err)) => warn!(%handle, error = %err, "failed to release reference"),
            None => debug!(%handle, "VM is gone, abandoning reference"),
        }
        return;
    }
    if shared.releases.push(handle) {
        shared.wake.set();
    } else {
        debug!(%handle, "VM is gone, abandoning reference");
    }
}

/// An owned global reference to a runtime object.
pub struct GlobalRef {
    handle: Handle,
    shared: Arc<Shared>,
    owned: bool,
}

impl GlobalRef {
    pub(crate) fn new(shared: &Arc<Shared>, handle: Handle) -> Self {
        Self {
            handle,
            shared: Arc::clone(shared),
            owned: true,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Give up ownership without releasing the reference.
    pub fn into_raw(mut self) -> Handle {
        self.owned = false;
        self.handle
    }
}

impl fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalRef")
            .field("handle", &self.handle)
            .field("bridge", &self.shared.id)
            .finish()
    }
}

impl Drop for GlobalRef {
    fn drop(&mut self) {
        if self.owned {
            self.owned = false;
            release_handle(&self.shared, self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::BridgeError;
    use crate::runtime::test_support::running_bridge;
    use crate::runtime::vm::VmBackend;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_release_queue_closes() {
        let queue = ReleaseQueue::new();
        assert!(queue.push(Handle::from_raw(1)));
        assert!(queue.push(Handle::from_raw(2)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.close(), vec![Handle::from_raw(1), Handle::from_raw(2)]);
        assert!(!queue.push(Handle::from_raw(3)));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_attached_drop_releases_inline() {
        let (vm, bridge) = running_bridge(true);
        let env = bridge.env().unwrap();
        let loader = env.system_class_loader().unwrap();
        let handle = loader.handle();
        drop(loader);
        assert_eq!(
            vm.release_log().last(),
            Some(&(handle, thread::current().id()))
        );
        drop(env);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_unattached_drop_defers_to_monitor() {
        let (vm, bridge) = running_bridge(true);
        let queue = {
            let env = bridge.env().unwrap();
            vm.new_invocation_queue(env.id()).unwrap()
        };
        let before = vm.live_objects();
        let reference = bridge.global_ref(queue);

        let remote = thread::spawn(move || drop(reference));
        remote.join().unwrap();

        wait_until(|| vm.live_objects() == before - 1);
        let (released, by) = vm.release_log().last().copied().unwrap();
        assert_eq!(released, queue);
        assert_eq!(Some(by), vm.creator_thread());
        assert_eq!(vm.misplaced_releases(), 0);
        assert_eq!(bridge.pending_releases(), 0);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_drop_after_detach_defers_to_monitor() {
        let (vm, bridge) = running_bridge(true);
        let remote = bridge.clone();
        let (handle, dropped_on) = thread::spawn(move || {
            let loader = remote.attach().unwrap().system_class_loader().unwrap();
            remote.detach().unwrap();
            assert_eq!(remote.attach_count(), 0);
            let handle = loader.handle();
            drop(loader);
            (handle, thread::current().id())
        })
        .join()
        .unwrap();

        wait_until(|| vm.release_log().iter().any(|(released, _)| *released == handle));
        let (_, by) = vm
            .release_log()
            .into_iter()
            .find(|(released, _)| *released == handle)
            .unwrap();
        assert_ne!(by, dropped_on);
        assert_eq!(Some(by), vm.creator_thread());
        assert_eq!(vm.misplaced_releases(), 0);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_attached_thread_outliving_kill_leaves_vm_alone() {
        let (vm, bridge) = running_bridge(true);
        let (held_tx, held_rx) = mpsc::channel();
        let (killed_tx, killed_rx) = mpsc::channel::<()>();
        let remote = bridge.clone();
        let holder = thread::spawn(move || {
            let env = remote.attach().unwrap();
            let loader = env.system_class_loader().unwrap();
            held_tx.send(()).unwrap();
            killed_rx.recv().unwrap();

            assert_eq!(remote.attach_count(), 1);
            drop(loader);
            assert!(matches!(
                env.system_class_loader(),
                Err(BridgeError::VmNotRunning)
            ));
            // Exits still attached.
        });

        held_rx.recv().unwrap();
        bridge.kill().unwrap();
        killed_tx.send(()).unwrap();
        holder.join().unwrap();

        assert!(vm.is_destroyed());
        assert_eq!(vm.calls_after_destroy(), 0);
        assert_eq!(vm.misplaced_releases(), 0);
    }

    #[test]
    fn test_into_raw_keeps_reference() {
        let (vm, bridge) = running_bridge(true);
        let env = bridge.env().unwrap();
        let queue = vm.new_invocation_queue(env.id()).unwrap();
        let before = vm.live_objects();
        let raw = bridge.global_ref(queue).into_raw();
        assert_eq!(raw, queue);
        assert_eq!(vm.live_objects(), before);
        drop(env);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_drop_after_kill_is_abandoned() {
        let (vm, bridge) = running_bridge(true);
        let env = bridge.env().unwrap();
        let queue = vm.new_invocation_queue(env.id()).unwrap();
        drop(env);
        let reference = bridge.global_ref(queue);
        bridge.kill().unwrap();
        drop(reference);
        assert_eq!(bridge.pending_releases(), 0);
        assert_eq!(vm.misplaced_releases(), 0);
    }
}
