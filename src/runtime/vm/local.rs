//! An in-process [`VmBackend`] that models the embedded runtime's contracts:
//! one creation per process, per-thread attachment, reference-counted global
//! references, thread-affine windowing, blocking invocation queues, and
//! dynamic proxies.

use super::{
    script, EnvId, Handle, InvocationRequest, MethodDescriptor, RequestId, ScriptEngine,
    VmBackend,
};
use crate::runtime::error::{classes, BridgeError, ForeignException, Result};
use crate::runtime::value::Value;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;

const ILLEGAL_ARGUMENT_EXCEPTION: &str = "java/lang/IllegalArgumentException";
const NO_SUCH_METHOD_ERROR: &str = "java/lang/NoSuchMethodError";
const OBJECT_CLASS: &str = "java/lang/Object";
const QUEUE_CLASS: &str = "org/vmbridge/InvocationQueue";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Fresh,
    Created,
    Destroyed,
}

struct AttachedThread {
    env: EnvId,
    daemon: bool,
}

enum ObjectKind {
    ClassLoader,
    Queue(Arc<LocalQueue>),
    Proxy {
        queue: Arc<LocalQueue>,
        interfaces: Vec<String>,
        key: String,
    },
}

struct HeapObject {
    kind: ObjectKind,
    refs: usize,
}

struct LocalState {
    phase: Phase,
    creator: Option<ThreadId>,
    vm_args: Vec<String>,
    threads: HashMap<ThreadId, AttachedThread>,
    heap: HashMap<Handle, HeapObject>,
    interfaces: HashMap<String, Vec<(String, String)>>,
    system_loader: Option<Handle>,
    context_loaders: HashSet<ThreadId>,
    ui_active: bool,
    open_windows: usize,
    misplaced_releases: usize,
    calls_after_destroy: usize,
    release_log: Vec<(Handle, ThreadId)>,
}

/// Blocking rendezvous between callers of a proxy and the host worker that
/// serves them.
struct LocalQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

#[derive(Default)]
struct QueueInner {
    requests: VecDeque<InvocationRequest>,
    pending: HashSet<RequestId>,
    responses: HashMap<RequestId, std::result::Result<Value, ForeignException>>,
    closed: bool,
    next_request: u64,
}

impl LocalQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            cond: Condvar::new(),
        }
    }

    fn invoke(
        &self,
        proxy: Handle,
        method: MethodDescriptor,
        args: Vec<Value>,
    ) -> std::result::Result<Value, ForeignException> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ForeignException::queue_closed("invocation queue is closed"));
        }
        inner.next_request += 1;
        let id = RequestId::from_raw(inner.next_request);
        inner.requests.push_back(InvocationRequest {
            id,
            proxy,
            method,
            args,
        });
        inner.pending.insert(id);
        self.cond.notify_all();
        loop {
            if let Some(response) = inner.responses.remove(&id) {
                return response;
            }
            if inner.closed {
                inner.pending.remove(&id);
                return Err(ForeignException::queue_closed(
                    "invocation queue closed while waiting for a response",
                ));
            }
            self.cond.wait(&mut inner);
        }
    }

    fn take(&self) -> std::result::Result<InvocationRequest, ForeignException> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(ForeignException::queue_closed("invocation queue is closed"));
            }
            if let Some(request) = inner.requests.pop_front() {
                return Ok(request);
            }
            self.cond.wait(&mut inner);
        }
    }

    fn respond(
        &self,
        id: RequestId,
        response: std::result::Result<Value, ForeignException>,
    ) -> std::result::Result<(), ForeignException> {
        let mut inner = self.inner.lock();
        if !inner.pending.remove(&id) {
            return Err(ForeignException::new(
                classes::ILLEGAL_STATE_EXCEPTION,
                format!("request {} has no waiting caller", id.as_raw()),
            ));
        }
        inner.responses.insert(id, response);
        self.cond.notify_all();
        Ok(())
    }

    fn close(&self) -> std::result::Result<(), ForeignException> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ForeignException::new(
                classes::ILLEGAL_STATE_EXCEPTION,
                "invocation queue is already closed",
            ));
        }
        inner.closed = true;
        inner.requests.clear();
        self.cond.notify_all();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// In-process runtime implementing [`VmBackend`] and [`ScriptEngine`].
///
/// Each instance stands for one process: it can create its VM once, and
/// after destruction every further creation fails.
pub struct LocalVm {
    installation: Option<PathBuf>,
    creation_failure: Option<String>,
    next_id: AtomicU64,
    state: Mutex<LocalState>,
}

impl Default for LocalVm {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalVm {
    pub fn new() -> Self {
        Self::build(Some(PathBuf::from("<in-process>")), None)
    }

    /// A runtime whose installation cannot be located.
    pub fn missing_installation() -> Self {
        Self::build(None, None)
    }

    /// A runtime that is found but refuses to create its VM.
    pub fn failing_creation(reason: impl Into<String>) -> Self {
        Self::build(Some(PathBuf::from("<in-process>")), Some(reason.into()))
    }

    fn build(installation: Option<PathBuf>, creation_failure: Option<String>) -> Self {
        let mut interfaces = HashMap::new();
        interfaces.insert(
            "java/lang/Runnable".to_string(),
            vec![("run".to_string(), "()V".to_string())],
        );
        interfaces.insert(
            "java/util/concurrent/Callable".to_string(),
            vec![("call".to_string(), "()Ljava/lang/Object;".to_string())],
        );
        interfaces.insert(
            "java/beans/ExceptionListener".to_string(),
            vec![(
                "exceptionThrown".to_string(),
                "(Ljava/lang/Exception;)V".to_string(),
            )],
        );
        Self {
            installation,
            creation_failure,
            next_id: AtomicU64::new(1),
            state: Mutex::new(LocalState {
                phase: Phase::Fresh,
                creator: None,
                vm_args: Vec::new(),
                threads: HashMap::new(),
                heap: HashMap::new(),
                interfaces,
                system_loader: None,
                context_loaders: HashSet::new(),
                ui_active: false,
                open_windows: 0,
                misplaced_releases: 0,
                calls_after_destroy: 0,
                release_log: Vec::new(),
            }),
        }
    }

    /// Register an interface that proxies may implement.
    pub fn define_interface(&self, name: &str, methods: &[(&str, &str)]) {
        let methods = methods
            .iter()
            .map(|(name, sig)| (name.to_string(), sig.to_string()))
            .collect();
        self.state.lock().interfaces.insert(name.to_string(), methods);
    }

    /// Number of objects still referenced by at least one global reference.
    /// The system class loader is included.
    pub fn live_objects(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Releases attempted from threads that were not attached.
    pub fn misplaced_releases(&self) -> usize {
        self.state.lock().misplaced_releases
    }

    /// Releases and detaches issued after the VM was destroyed.
    pub fn calls_after_destroy(&self) -> usize {
        self.state.lock().calls_after_destroy
    }

    /// Every successful release with the thread that performed it.
    pub fn release_log(&self) -> Vec<(Handle, ThreadId)> {
        self.state.lock().release_log.clone()
    }

    /// Options the VM was created with.
    pub fn vm_args(&self) -> Vec<String> {
        self.state.lock().vm_args.clone()
    }

    pub fn creator_thread(&self) -> Option<ThreadId> {
        self.state.lock().creator
    }

    pub fn is_created(&self) -> bool {
        self.state.lock().phase == Phase::Created
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().phase == Phase::Destroyed
    }

    pub fn attached_threads(&self) -> usize {
        self.state.lock().threads.len()
    }

    /// Whether `thread` is attached as a daemon, or `None` if not attached.
    pub fn is_daemon(&self, thread: ThreadId) -> Option<bool> {
        self.state.lock().threads.get(&thread).map(|t| t.daemon)
    }

    pub fn has_context_class_loader(&self, thread: ThreadId) -> bool {
        self.state.lock().context_loaders.contains(&thread)
    }

    pub fn ui_active(&self) -> bool {
        self.state.lock().ui_active
    }

    /// Open a window. Requires an initialized windowing subsystem.
    pub fn open_window(&self) -> bool {
        let mut state = self.state.lock();
        if state.ui_active {
            state.open_windows += 1;
            true
        } else {
            false
        }
    }

    pub fn open_windows(&self) -> usize {
        self.state.lock().open_windows
    }

    fn allocate(&self, state: &mut LocalState, kind: ObjectKind) -> Handle {
        let handle = Handle::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.heap.insert(handle, HeapObject { kind, refs: 1 });
        handle
    }

    fn check_env(state: &LocalState, env: EnvId) -> std::result::Result<(), ForeignException> {
        if state.phase != Phase::Created {
            return Err(ForeignException::new(
                classes::ILLEGAL_STATE_EXCEPTION,
                "the VM is not running",
            ));
        }
        match state.threads.get(&thread::current().id()) {
            Some(attached) if attached.env == env => Ok(()),
            _ => Err(ForeignException::new(
                classes::ILLEGAL_STATE_EXCEPTION,
                "environment used on a thread it does not belong to",
            )),
        }
    }

    fn object<'a>(
        state: &'a LocalState,
        handle: Handle,
    ) -> std::result::Result<&'a HeapObject, ForeignException> {
        state.heap.get(&handle).ok_or_else(|| {
            ForeignException::new(
                ILLEGAL_ARGUMENT_EXCEPTION,
                format!("{} is not a live reference", handle),
            )
        })
    }

    fn queue(
        &self,
        env: EnvId,
        handle: Handle,
    ) -> std::result::Result<Arc<LocalQueue>, ForeignException> {
        let state = self.state.lock();
        Self::check_env(&state, env)?;
        match &Self::object(&state, handle)?.kind {
            ObjectKind::Queue(queue) => Ok(Arc::clone(queue)),
            _ => Err(ForeignException::new(
                ILLEGAL_ARGUMENT_EXCEPTION,
                format!("{} is not an invocation queue", handle),
            )),
        }
    }

    fn describe(state: &LocalState, handle: Handle) -> String {
        match state.heap.get(&handle).map(|object| &object.kind) {
            Some(ObjectKind::ClassLoader) => format!("SystemClassLoader@{}", handle.as_raw()),
            Some(ObjectKind::Queue(_)) => format!("InvocationQueue@{}", handle.as_raw()),
            Some(ObjectKind::Proxy { interfaces, key, .. }) => {
                format!("Proxy[{}]@{}", interfaces.join(","), key)
            }
            None => handle.to_string(),
        }
    }

    fn require_creator(
        state: &LocalState,
        what: &str,
    ) -> std::result::Result<(), ForeignException> {
        if state.creator == Some(thread::current().id()) {
            Ok(())
        } else {
            Err(ForeignException::new(
                classes::ILLEGAL_STATE_EXCEPTION,
                format!("{} must run on the VM's main thread", what),
            ))
        }
    }
}

impl VmBackend for LocalVm {
    fn locate(&self) -> Result<PathBuf> {
        self.installation.clone().ok_or_else(|| {
            BridgeError::RuntimeNotFound("no runtime installation is available".to_string())
        })
    }

    fn create_vm(&self, args: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Created => {
                return Err(BridgeError::StartFailed(
                    "a VM already exists in this process".to_string(),
                ))
            }
            Phase::Destroyed => return Err(BridgeError::AlreadyStopped),
            Phase::Fresh => {}
        }
        if let Some(reason) = &self.creation_failure {
            return Err(BridgeError::StartFailed(reason.clone()));
        }
        if let Some(bad) = args.iter().find(|arg| !arg.starts_with('-')) {
            return Err(BridgeError::StartFailed(format!(
                "unrecognized option: {}",
                bad
            )));
        }
        state.phase = Phase::Created;
        state.creator = Some(thread::current().id());
        state.vm_args = args.to_vec();
        let loader = self.allocate(&mut state, ObjectKind::ClassLoader);
        state.system_loader = Some(loader);
        debug!(options = args.len(), "local VM created");
        Ok(())
    }

    fn destroy_vm(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != Phase::Created {
            return Err(BridgeError::VmNotRunning);
        }
        if state.creator != Some(thread::current().id()) {
            return Err(BridgeError::Misuse(
                "the VM must be destroyed on the thread that created it".to_string(),
            ));
        }
        for object in state.heap.values() {
            let queue = match &object.kind {
                ObjectKind::Queue(queue) => queue,
                _ => continue,
            };
            if !queue.is_closed() {
                let _ = queue.close();
            }
        }
        state.phase = Phase::Destroyed;
        state.threads.clear();
        state.context_loaders.clear();
        state.ui_active = false;
        debug!(live_objects = state.heap.len(), "local VM destroyed");
        Ok(())
    }

    fn attach_current_thread(&self, daemon: bool) -> Result<EnvId> {
        let mut state = self.state.lock();
        if state.phase != Phase::Created {
            return Err(BridgeError::VmNotRunning);
        }
        let current = thread::current().id();
        if let Some(attached) = state.threads.get(&current) {
            return Ok(attached.env);
        }
        let env = EnvId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.threads.insert(current, AttachedThread { env, daemon });
        Ok(env)
    }

    fn detach_current_thread(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase == Phase::Destroyed {
            state.calls_after_destroy += 1;
            return Err(BridgeError::VmNotRunning);
        }
        let current = thread::current().id();
        state.threads.remove(&current);
        state.context_loaders.remove(&current);
        Ok(())
    }

    fn release(&self, handle: Handle) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase == Phase::Destroyed {
            state.calls_after_destroy += 1;
            return Err(BridgeError::VmNotRunning);
        }
        let current = thread::current().id();
        if !state.threads.contains_key(&current) {
            state.misplaced_releases += 1;
            return Err(BridgeError::NotAttached);
        }
        let object = state.heap.get_mut(&handle).ok_or_else(|| {
            BridgeError::Misuse(format!("{} released more than once", handle))
        })?;
        object.refs -= 1;
        if object.refs == 0 {
            state.heap.remove(&handle);
        }
        state.release_log.push((handle, current));
        Ok(())
    }

    fn init_context_class_loader(&self, env: EnvId) -> std::result::Result<(), ForeignException> {
        let mut state = self.state.lock();
        Self::check_env(&state, env)?;
        state.context_loaders.insert(thread::current().id());
        Ok(())
    }

    fn system_class_loader(&self, env: EnvId) -> std::result::Result<Handle, ForeignException> {
        let mut state = self.state.lock();
        Self::check_env(&state, env)?;
        let loader = state.system_loader.ok_or_else(|| {
            ForeignException::new(classes::ILLEGAL_STATE_EXCEPTION, "no system class loader")
        })?;
        if let Some(object) = state.heap.get_mut(&loader) {
            object.refs += 1;
        }
        Ok(loader)
    }

    fn call_method(
        &self,
        env: EnvId,
        target: Handle,
        name: &str,
        signature: &str,
        args: &[Value],
    ) -> std::result::Result<Value, ForeignException> {
        let state = self.state.lock();
        Self::check_env(&state, env)?;
        let object = Self::object(&state, target)?;
        let is_proxy = matches!(object.kind, ObjectKind::Proxy { .. });
        if !is_proxy && name == "toString" && signature == "()Ljava/lang/String;" {
            return Ok(Value::String(Self::describe(&state, target)));
        }
        let (queue, interfaces) = match &object.kind {
            ObjectKind::Proxy {
                queue, interfaces, ..
            } => (Arc::clone(queue), interfaces.clone()),
            _ => {
                return Err(ForeignException::new(
                    NO_SUCH_METHOD_ERROR,
                    format!("{}{}", name, signature),
                ))
            }
        };
        let declaring = interfaces.iter().find(|interface| {
            state.interfaces.get(*interface).map_or(false, |methods| {
                methods.iter().any(|(m, s)| m == name && s == signature)
            })
        });
        let method = match declaring {
            Some(interface) => MethodDescriptor::new(interface.as_str(), name, signature),
            None if name == "toString" => {
                MethodDescriptor::new(OBJECT_CLASS, name, signature)
            }
            None => {
                return Err(ForeignException::new(
                    NO_SUCH_METHOD_ERROR,
                    format!("{}{}", name, signature),
                ))
            }
        };
        // The caller blocks until a host worker answers; never hold the state
        // lock across that wait.
        drop(state);
        queue.invoke(target, method, args.to_vec())
    }

    fn to_string(&self, env: EnvId, target: Handle) -> std::result::Result<String, ForeignException> {
        let state = self.state.lock();
        Self::check_env(&state, env)?;
        Self::object(&state, target)?;
        Ok(Self::describe(&state, target))
    }

    fn is_instance_of(
        &self,
        env: EnvId,
        target: Handle,
        class_name: &str,
    ) -> std::result::Result<bool, ForeignException> {
        let state = self.state.lock();
        Self::check_env(&state, env)?;
        if class_name == OBJECT_CLASS {
            return Self::object(&state, target).map(|_| true);
        }
        Ok(match &Self::object(&state, target)?.kind {
            ObjectKind::ClassLoader => class_name == "java/lang/ClassLoader",
            ObjectKind::Queue(_) => class_name == QUEUE_CLASS,
            ObjectKind::Proxy { interfaces, .. } => {
                class_name == "java/lang/reflect/Proxy"
                    || interfaces.iter().any(|interface| interface == class_name)
            }
        })
    }

    fn activate_ui(&self, env: EnvId) -> std::result::Result<(), ForeignException> {
        let mut state = self.state.lock();
        Self::check_env(&state, env)?;
        Self::require_creator(&state, "windowing initialization")?;
        state.ui_active = true;
        Ok(())
    }

    fn close_ui_windows(&self, env: EnvId) -> std::result::Result<(), ForeignException> {
        let mut state = self.state.lock();
        Self::check_env(&state, env)?;
        Self::require_creator(&state, "closing windows")?;
        state.open_windows = 0;
        Ok(())
    }

    fn script_engine(&self) -> Option<&dyn ScriptEngine> {
        Some(self)
    }

    fn new_invocation_queue(&self, env: EnvId) -> std::result::Result<Handle, ForeignException> {
        let mut state = self.state.lock();
        Self::check_env(&state, env)?;
        Ok(self.allocate(&mut state, ObjectKind::Queue(Arc::new(LocalQueue::new()))))
    }

    fn take_request(
        &self,
        env: EnvId,
        queue: Handle,
    ) -> std::result::Result<InvocationRequest, ForeignException> {
        self.queue(env, queue)?.take()
    }

    fn respond(
        &self,
        env: EnvId,
        queue: Handle,
        request: RequestId,
        response: std::result::Result<Value, ForeignException>,
    ) -> std::result::Result<(), ForeignException> {
        self.queue(env, queue)?.respond(request, response)
    }

    fn close_queue(&self, env: EnvId, queue: Handle) -> std::result::Result<(), ForeignException> {
        self.queue(env, queue)?.close()
    }

    fn new_proxy(
        &self,
        env: EnvId,
        queue: Handle,
        interfaces: &[&str],
        class_loader: Option<Handle>,
        key: &str,
    ) -> std::result::Result<Handle, ForeignException> {
        let mut state = self.state.lock();
        Self::check_env(&state, env)?;
        let queue = match &Self::object(&state, queue)?.kind {
            ObjectKind::Queue(queue) => Arc::clone(queue),
            _ => {
                return Err(ForeignException::new(
                    ILLEGAL_ARGUMENT_EXCEPTION,
                    format!("{} is not an invocation queue", queue),
                ))
            }
        };
        if let Some(loader) = class_loader {
            if !matches!(Self::object(&state, loader)?.kind, ObjectKind::ClassLoader) {
                return Err(ForeignException::new(
                    ILLEGAL_ARGUMENT_EXCEPTION,
                    format!("{} is not a class loader", loader),
                ));
            }
        }
        if interfaces.is_empty() {
            return Err(ForeignException::new(
                ILLEGAL_ARGUMENT_EXCEPTION,
                "a proxy must implement at least one interface",
            ));
        }
        if let Some(unknown) = interfaces
            .iter()
            .find(|interface| !state.interfaces.contains_key(**interface))
        {
            return Err(ForeignException::new(
                "java/lang/ClassNotFoundException",
                unknown.replace('/', "."),
            ));
        }
        let kind = ObjectKind::Proxy {
            queue,
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            key: key.to_string(),
        };
        Ok(self.allocate(&mut state, kind))
    }

    fn proxy_key(&self, env: EnvId, proxy: Handle) -> std::result::Result<String, ForeignException> {
        let state = self.state.lock();
        Self::check_env(&state, env)?;
        match &Self::object(&state, proxy)?.kind {
            ObjectKind::Proxy { key, .. } => Ok(key.clone()),
            _ => Err(ForeignException::new(
                ILLEGAL_ARGUMENT_EXCEPTION,
                format!("{} is not a proxy", proxy),
            )),
        }
    }
}

impl ScriptEngine for LocalVm {
    fn eval(
        &self,
        env: EnvId,
        source: &str,
        bindings_in: &IndexMap<String, Value>,
        bindings_out: &mut IndexMap<String, Value>,
    ) -> std::result::Result<Value, ForeignException> {
        Self::check_env(&self.state.lock(), env)?;
        let mut scope = bindings_in.clone();
        let display = |value: &Value| match value {
            Value::Object(handle) => Self::describe(&self.state.lock(), *handle),
            other => other.to_string(),
        };
        let result = script::evaluate(source, &mut scope, &display)?;
        for (name, slot) in bindings_out.iter_mut() {
            *slot = scope.get(name).cloned().unwrap_or(Value::Null);
        }
        Ok(result)
    }
}
