//! Per-thread attachment to the VM.
//!
//! Each host thread keeps a thread-local [`ThreadEnvironment`] per bridge with
//! the runtime's call handle and an attach count. The first `attach`
//! registers the thread with the runtime; the `detach` that brings the count
//! back to zero unregisters it, after which references dropped on the thread
//! go through the deferred-release set.

use super::conversion::{args_to_foreign, from_foreign, parse_method};
use super::error::{BridgeError, Result};
use super::release::GlobalRef;
use super::value::Value;
use super::vm::{EnvId, Handle, VmBackend};
use super::Shared;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

struct ThreadEnvironment {
    env: EnvId,
    attach_count: usize,
    shared: Arc<Shared>,
}

impl Drop for ThreadEnvironment {
    fn drop(&mut self) {
        if self.attach_count > 0 {
            warn!(
                attach_count = self.attach_count,
                "thread exited while attached to the VM, detaching"
            );
            self.attach_count = 0;
            unregister(&self.shared);
        }
    }
}

thread_local! {
    /// Keyed by bridge id.
    static ENVIRONMENTS: RefCell<HashMap<u64, ThreadEnvironment>> = RefCell::new(HashMap::new());
}

/// Attach the calling thread without checking the VM state. The monitor
/// thread uses this while the VM is still starting.
pub(crate) fn attach_thread(shared: &Arc<Shared>, daemon: bool) -> Result<EnvId> {
    let existing = ENVIRONMENTS.with(|envs| {
        envs.borrow_mut().get_mut(&shared.id).map(|entry| {
            entry.attach_count += 1;
            entry.env
        })
    });
    if let Some(env) = existing {
        return Ok(env);
    }

    let env = shared.backend.attach_current_thread(daemon)?;
    if let Err(exception) = shared.backend.init_context_class_loader(env) {
        let _ = shared.backend.detach_current_thread();
        return Err(exception.into());
    }
    debug!(bridge = shared.id, daemon, "thread attached");
    ENVIRONMENTS.with(|envs| {
        envs.borrow_mut().insert(
            shared.id,
            ThreadEnvironment {
                env,
                attach_count: 1,
                shared: Arc::clone(shared),
            },
        )
    });
    Ok(env)
}

pub(crate) fn attach(shared: &Arc<Shared>) -> Result<Env> {
    if !shared.is_running() {
        return Err(BridgeError::VmNotRunning);
    }
    let env = attach_thread(shared, true)?;
    Ok(Env::new(shared, env))
}

pub(crate) fn detach(shared: &Shared) -> Result<()> {
    let emptied = ENVIRONMENTS.with(|envs| -> Result<Option<ThreadEnvironment>> {
        let mut envs = envs.borrow_mut();
        let entry = envs.get_mut(&shared.id).ok_or(BridgeError::NotAttached)?;
        entry.attach_count -= 1;
        if entry.attach_count == 0 {
            Ok(envs.remove(&shared.id))
        } else {
            Ok(None)
        }
    })?;
    if let Some(entry) = emptied {
        unregister(&entry.shared);
    }
    Ok(())
}

/// Drop the calling thread's attachment regardless of its count.
pub(crate) fn force_detach(shared: &Shared) {
    let removed = ENVIRONMENTS.with(|envs| envs.borrow_mut().remove(&shared.id));
    if let Some(mut entry) = removed {
        debug!(
            bridge = shared.id,
            attach_count = entry.attach_count,
            "forcing thread detach"
        );
        entry.attach_count = 0;
        unregister(&entry.shared);
    }
}

fn unregister(shared: &Shared) {
    match shared.with_live_vm(|backend| backend.detach_current_thread()) {
        Some(Ok(())) => {}
        Some(Err(err)) => warn!(error = %err, "failed to detach thread from the VM"),
        None => debug!(bridge = shared.id, "VM is gone, nothing to detach"),
    }
}

pub(crate) fn attach_count(shared: &Shared) -> usize {
    ENVIRONMENTS.with(|envs| {
        envs.borrow()
            .get(&shared.id)
            .map_or(0, |entry| entry.attach_count)
    })
}

pub(crate) fn is_attached(shared: &Shared) -> bool {
    attach_count(shared) > 0
}

pub(crate) fn current_env(shared: &Shared) -> Result<EnvId> {
    ENVIRONMENTS.with(|envs| {
        envs.borrow()
            .get(&shared.id)
            .map(|entry| entry.env)
            .ok_or(BridgeError::NotAttached)
    })
}

pub(crate) fn env(shared: &Arc<Shared>) -> Result<Env> {
    current_env(shared).map(|env| Env::new(shared, env))
}

/// The calling thread's view of the VM.
///
/// An `Env` is only valid on the thread that obtained it and is therefore
/// neither `Send` nor `Sync`.
pub struct Env {
    id: EnvId,
    shared: Arc<Shared>,
    _thread_bound: PhantomData<*const ()>,
}

impl Env {
    fn new(shared: &Arc<Shared>, id: EnvId) -> Self {
        Self {
            id,
            shared: Arc::clone(shared),
            _thread_bound: PhantomData,
        }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    fn backend(&self) -> Result<&dyn VmBackend> {
        if self.shared.vm_live() {
            Ok(self.shared.backend.as_ref())
        } else {
            Err(BridgeError::VmNotRunning)
        }
    }

    /// Call an instance method, coercing `args` and the result through
    /// `signature` (e.g. `(I)Ljava/lang/String;`).
    pub fn call_method(
        &self,
        target: Handle,
        name: &str,
        signature: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let method = parse_method(signature)?;
        let args = args_to_foreign(args, &method)?;
        let result = self
            .backend()?
            .call_method(self.id, target, name, signature, &args)?;
        from_foreign(result, &method.ret)
    }

    pub fn to_string(&self, target: Handle) -> Result<String> {
        Ok(self.backend()?.to_string(self.id, target)?)
    }

    pub fn is_instance_of(&self, target: Handle, class_name: &str) -> Result<bool> {
        Ok(self.backend()?.is_instance_of(self.id, target, class_name)?)
    }

    pub fn system_class_loader(&self) -> Result<GlobalRef> {
        let loader = self.backend()?.system_class_loader(self.id)?;
        Ok(GlobalRef::new(&self.shared, loader))
    }

    /// Evaluate a snippet with the runtime's scripting engine.
    ///
    /// Every key already present in `bindings_out` receives the value of the
    /// matching variable afterwards. An exception thrown by the script body
    /// is returned as itself rather than wrapped by the engine.
    pub fn run_script(
        &self,
        source: &str,
        bindings_in: &IndexMap<String, Value>,
        bindings_out: &mut IndexMap<String, Value>,
    ) -> Result<Value> {
        let engine = self.backend()?.script_engine().ok_or_else(|| {
            BridgeError::Misuse("the runtime has no scripting engine".to_string())
        })?;
        engine
            .eval(self.id, source, bindings_in, bindings_out)
            .map_err(|exception| BridgeError::Foreign(exception.unwrap_script()))
    }
}

/// Keeps the calling thread attached until dropped.
pub struct AttachGuard {
    env: Env,
}

impl AttachGuard {
    pub(crate) fn new(shared: &Arc<Shared>) -> Result<Self> {
        Ok(Self {
            env: attach(shared)?,
        })
    }
}

impl Deref for AttachGuard {
    type Target = Env;

    fn deref(&self) -> &Env {
        &self.env
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        // A kill in between may already have detached this thread.
        if is_attached(&self.env.shared) {
            if let Err(err) = detach(&self.env.shared) {
                warn!(error = %err, "failed to detach attach guard");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::classes;
    use crate::runtime::test_support::running_bridge;
    use std::thread;

    #[test]
    fn test_attach_count_never_negative() {
        let (vm, bridge) = running_bridge(true);
        let remote = bridge.clone();
        let vm_remote = vm.clone();
        thread::spawn(move || {
            assert!(matches!(remote.env(), Err(BridgeError::NotAttached)));
            for _ in 0..3 {
                remote.attach().unwrap();
            }
            assert_eq!(remote.attach_count(), 3);
            assert_eq!(vm_remote.is_daemon(thread::current().id()), Some(true));
            assert!(vm_remote.has_context_class_loader(thread::current().id()));
            for _ in 0..3 {
                remote.detach().unwrap();
            }
            assert_eq!(remote.attach_count(), 0);
            assert_eq!(vm_remote.is_daemon(thread::current().id()), None);
            // The first unmatched detach fails, and so does every later one.
            for _ in 0..2 {
                assert!(matches!(remote.detach(), Err(BridgeError::NotAttached)));
                assert_eq!(remote.attach_count(), 0);
            }
            assert!(matches!(remote.env(), Err(BridgeError::NotAttached)));
        })
        .join()
        .unwrap();
        bridge.kill().unwrap();
    }

    #[test]
    fn test_attach_requires_running_vm() {
        let (_vm, bridge) = running_bridge(true);
        bridge.kill().unwrap();
        assert!(matches!(bridge.attach(), Err(BridgeError::VmNotRunning)));
    }

    #[test]
    fn test_attach_guard_detaches_on_drop() {
        let (vm, bridge) = running_bridge(true);
        let remote = bridge.clone();
        let attached = thread::spawn(move || {
            {
                let guard = remote.attach_guard().unwrap();
                assert_eq!(remote.attach_count(), 1);
                assert!(guard.system_class_loader().is_ok());
            }
            remote.attach_count()
        })
        .join()
        .unwrap();
        assert_eq!(attached, 0);
        // Only the calling thread and the monitor remain attached.
        assert_eq!(vm.attached_threads(), 2);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_exited_thread_is_detached() {
        let (vm, bridge) = running_bridge(true);
        let remote = bridge.clone();
        thread::spawn(move || {
            remote.attach().unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(vm.attached_threads(), 2);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_env_calls_through_signature() {
        let (_vm, bridge) = running_bridge(true);
        let env = bridge.env().unwrap();
        let loader = env.system_class_loader().unwrap();
        let text = env
            .call_method(loader.handle(), "toString", "()Ljava/lang/String;", vec![])
            .unwrap();
        assert_eq!(text.as_str(), Some(env.to_string(loader.handle()).unwrap().as_str()));
        assert!(env
            .is_instance_of(loader.handle(), "java/lang/ClassLoader")
            .unwrap());
        let err = env
            .call_method(loader.handle(), "toString", "(I)Ljava/lang/String;", vec![])
            .unwrap_err();
        assert!(matches!(err, BridgeError::Misuse(_)));
        drop(loader);
        drop(env);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_run_script_unwraps_thrown_exception() {
        let (_vm, bridge) = running_bridge(true);
        let env = bridge.env().unwrap();
        let err = env
            .run_script("throw 'bad input'", &IndexMap::new(), &mut IndexMap::new())
            .unwrap_err();
        let exception = err.foreign().unwrap();
        assert_eq!(exception.class_name, classes::RUNTIME_EXCEPTION);
        assert_eq!(exception.message(), "bad input");
        drop(env);
        bridge.kill().unwrap();
    }
}
