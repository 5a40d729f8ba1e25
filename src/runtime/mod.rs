//! Bridge between host threads and an embedded managed VM.
//!
//! A [`Bridge`] owns the single VM a process may create. A dedicated monitor
//! thread creates the VM, services deferred reference releases and closures
//! submitted for the privileged thread, and tears the VM down on
//! [`Bridge::kill`]. Host threads attach before touching the VM and detach
//! when done.

pub mod attach;
pub mod config;
pub mod conversion;
pub mod dispatch;
pub mod error;
pub mod future_bridge;
pub mod lifecycle;
pub mod proxy;
pub mod release;
pub mod value;
pub mod vm;

use attach::{AttachGuard, Env};
use dispatch::{ClosureQueue, WakeSignal};
use error::Result;
use lifecycle::MonitorThread;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use release::ReleaseQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;
use vm::VmBackend;

pub use config::VmOptions;
pub use dispatch::Dispatch;
pub use future_bridge::{FutureTask, LoopState, UiEventLoop};
pub use lifecycle::VmGuard;
pub use proxy::{Invoker, ProxyHandle, ProxyServer};
pub use release::GlobalRef;

/// Process-wide bridge returned by [`Bridge::install`].
static PROCESS_BRIDGE: OnceCell<Bridge> = OnceCell::new();

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of the VM owned by a bridge. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmState {
    Unstarted,
    Starting,
    Running,
    Stopping,
    /// Terminal: the runtime cannot create a second VM in one process.
    Stopped,
}

/// State shared by the bridge handle, the monitor thread and every attached
/// thread.
pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) backend: Arc<dyn VmBackend>,
    pub(crate) state: Mutex<VmState>,
    /// Serializes `start` and `kill`
    pub(crate) lifecycle: Mutex<()>,
    pub(crate) releases: ReleaseQueue,
    pub(crate) closures: ClosureQueue,
    pub(crate) wake: WakeSignal,
    pub(crate) kill: AtomicBool,
    pub(crate) monitor: Mutex<Option<MonitorThread>>,
    pub(crate) main_thread: OnceCell<ThreadId>,
    pub(crate) headless: AtomicBool,
    pub(crate) ui_active: AtomicBool,
    /// True between VM creation and destruction. The monitor holds the write
    /// lock while destroying the VM.
    pub(crate) vm_live: RwLock<bool>,
}

impl Shared {
    pub(crate) fn state(&self) -> VmState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, next: VmState) {
        let mut state = self.state.lock();
        debug!(bridge = self.id, from = ?*state, to = ?next, "VM state change");
        *state = next;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == VmState::Running
    }

    pub(crate) fn is_main_thread(&self) -> bool {
        self.main_thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn is_headless(&self) -> bool {
        self.headless.load(Ordering::SeqCst)
    }

    pub(crate) fn vm_live(&self) -> bool {
        *self.vm_live.read()
    }

    /// Run `f` against the backend unless the VM is gone. Destruction waits
    /// for `f` to return.
    pub(crate) fn with_live_vm<R>(&self, f: impl FnOnce(&dyn VmBackend) -> R) -> Option<R> {
        let live = self.vm_live.read();
        if *live {
            Some(f(self.backend.as_ref()))
        } else {
            None
        }
    }
}

/// Handle to the bridge. Cheap to clone; every clone refers to the same VM.
#[derive(Clone)]
pub struct Bridge {
    pub(crate) shared: Arc<Shared>,
}

impl Bridge {
    /// Create an unstarted bridge over `backend`.
    ///
    /// The underlying runtime allows one VM per process; use
    /// [`Bridge::install`] for the process-wide instance.
    pub fn new(backend: Arc<dyn VmBackend>) -> Self {
        let shared = Shared {
            id: NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            state: Mutex::new(VmState::Unstarted),
            lifecycle: Mutex::new(()),
            releases: ReleaseQueue::new(),
            closures: ClosureQueue::new(),
            wake: WakeSignal::new(),
            kill: AtomicBool::new(false),
            monitor: Mutex::new(None),
            main_thread: OnceCell::new(),
            headless: AtomicBool::new(false),
            ui_active: AtomicBool::new(false),
            vm_live: RwLock::new(false),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Install the process-wide bridge. Later calls return the first
    /// instance and ignore their argument.
    pub fn install(backend: Arc<dyn VmBackend>) -> &'static Bridge {
        PROCESS_BRIDGE.get_or_init(|| Bridge::new(backend))
    }

    /// The process-wide bridge, if one was installed.
    pub fn installed() -> Option<&'static Bridge> {
        PROCESS_BRIDGE.get()
    }

    pub fn backend(&self) -> &Arc<dyn VmBackend> {
        &self.shared.backend
    }

    pub fn state(&self) -> VmState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_headless(&self) -> bool {
        self.shared.is_headless()
    }

    /// Whether the calling thread is the privileged (monitor) thread.
    pub fn is_main_thread(&self) -> bool {
        self.shared.is_main_thread()
    }

    /// Attach the calling thread, returning its environment.
    pub fn attach(&self) -> Result<Env> {
        attach::attach(&self.shared)
    }

    /// Attach the calling thread until the returned guard drops.
    pub fn attach_guard(&self) -> Result<AttachGuard> {
        AttachGuard::new(&self.shared)
    }

    pub fn detach(&self) -> Result<()> {
        attach::detach(&self.shared)
    }

    /// The calling thread's environment. Fails unless the thread is attached.
    pub fn env(&self) -> Result<Env> {
        attach::env(&self.shared)
    }

    /// How many unmatched `attach` calls the calling thread has made.
    pub fn attach_count(&self) -> usize {
        attach::attach_count(&self.shared)
    }

    /// Take ownership of a global reference returned by the runtime.
    pub fn global_ref(&self, handle: vm::Handle) -> GlobalRef {
        GlobalRef::new(&self.shared, handle)
    }

    /// Handles waiting for the monitor thread to release them.
    pub fn pending_releases(&self) -> usize {
        self.shared.releases.len()
    }

    /// Open a proxy invocation server. The calling thread must be attached.
    pub fn open_proxy_server(&self) -> Result<ProxyServer> {
        ProxyServer::open(self)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::runtime::vm::LocalVm;

    /// A running bridge over a fresh in-process VM. The calling thread is
    /// attached once.
    pub(crate) fn running_bridge(headless: bool) -> (Arc<LocalVm>, Bridge) {
        let vm = Arc::new(LocalVm::new());
        let bridge = Bridge::new(vm.clone());
        bridge
            .start(VmOptions::new().headless(headless))
            .expect("start bridge");
        (vm, bridge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::vm::LocalVm;

    #[test]
    fn test_install_returns_single_instance() {
        let first = Bridge::install(Arc::new(LocalVm::new()));
        let second = Bridge::install(Arc::new(LocalVm::missing_installation()));
        assert!(Arc::ptr_eq(&first.shared, &second.shared));
        assert!(Bridge::installed().is_some());
        // The first backend wins.
        assert!(first.backend().locate().is_ok());
    }

    #[test]
    fn test_new_bridge_is_unstarted() {
        let bridge = Bridge::new(Arc::new(LocalVm::new()));
        assert_eq!(bridge.state(), VmState::Unstarted);
        assert!(!bridge.is_running());
        assert!(!bridge.is_main_thread());
        assert_eq!(bridge.attach_count(), 0);
        assert_eq!(bridge.pending_releases(), 0);
    }

    #[test]
    fn test_bridges_have_distinct_ids() {
        let a = Bridge::new(Arc::new(LocalVm::new()));
        let b = Bridge::new(Arc::new(LocalVm::new()));
        assert_ne!(a.shared.id, b.shared.id);
        let clone = a.clone();
        assert_eq!(a.shared.id, clone.shared.id);
    }
}
