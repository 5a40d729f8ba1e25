//! The embedded runtime as seen by the bridge.
//!
//! [`VmBackend`] is the native invocation interface: VM creation and
//! destruction, per-thread attachment, global-reference release, method
//! calls, the UI subsystem hooks, and the runtime-side half of the proxy
//! machinery (a blocking invocation queue and proxy synthesis). The bridge
//! only ever talks to the runtime through this trait.
//!
//! [`LocalVm`] is an in-process implementation used by the test suite and by
//! hosts that want the bridge's threading model without a native runtime.
//! With the `jni` feature, `JniVm` drives a real Java VM.

#[cfg(feature = "jni")]
mod java;
mod local;
mod script;

#[cfg(feature = "jni")]
pub use java::JniVm;
pub use local::LocalVm;
pub use script::evaluate;

use super::error::{ForeignException, Result};
use super::value::Value;
use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;

/// Opaque, non-owning reference to an object inside the embedded runtime.
///
/// A `Handle` does not keep its object alive; ownership is expressed by
/// wrapping it in a [`GlobalRef`](crate::runtime::release::GlobalRef).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// A thread's foreign-call handle, valid only on the thread that obtained it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnvId(u64);

impl EnvId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Identifies one pending call waiting in an invocation queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// The interface method a proxy call targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Declaring interface, slash-separated
    pub interface: String,
    pub name: String,
    /// JNI-style method signature, e.g. `()Ljava/lang/Object;`
    pub signature: String,
}

impl MethodDescriptor {
    pub fn new(
        interface: impl Into<String>,
        name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            name: name.into(),
            signature: signature.into(),
        }
    }
}

/// A call made by runtime code on a proxy, as taken from an invocation queue.
#[derive(Clone, Debug)]
pub struct InvocationRequest {
    pub id: RequestId,
    /// The proxy object the call was made on
    pub proxy: Handle,
    pub method: MethodDescriptor,
    pub args: Vec<Value>,
}

/// The native invocation interface of the embedded runtime.
///
/// Methods taking an [`EnvId`] must be called on the thread that owns it.
/// Lifecycle methods report configuration failures as
/// [`BridgeError`](super::error::BridgeError); calls into the runtime report
/// [`ForeignException`]s.
pub trait VmBackend: Send + Sync + 'static {
    /// Locate a usable runtime installation.
    fn locate(&self) -> Result<PathBuf>;

    /// Create the VM on the calling thread with the rendered option list.
    /// A runtime supports exactly one creation per process.
    fn create_vm(&self, args: &[String]) -> Result<()>;

    /// Destroy the VM. Must run on the thread that created it.
    fn destroy_vm(&self) -> Result<()>;

    /// Attach the calling thread. Daemon threads do not block VM shutdown.
    fn attach_current_thread(&self, daemon: bool) -> Result<EnvId>;

    fn detach_current_thread(&self) -> Result<()>;

    /// Delete a global reference. The calling thread must be attached.
    fn release(&self, handle: Handle) -> Result<()>;

    /// Give the calling thread the system class loader as its context class
    /// loader when it has none.
    fn init_context_class_loader(&self, env: EnvId) -> Result<(), ForeignException>;

    fn system_class_loader(&self, env: EnvId) -> Result<Handle, ForeignException>;

    /// Invoke an instance method. Arguments are already coerced to `signature`.
    fn call_method(
        &self,
        env: EnvId,
        target: Handle,
        name: &str,
        signature: &str,
        args: &[Value],
    ) -> Result<Value, ForeignException>;

    fn to_string(&self, env: EnvId, target: Handle) -> Result<String, ForeignException>;

    fn is_instance_of(
        &self,
        env: EnvId,
        target: Handle,
        class_name: &str,
    ) -> Result<bool, ForeignException>;

    /// Force the windowing subsystem to initialize on the calling thread.
    fn activate_ui(&self, env: EnvId) -> Result<(), ForeignException>;

    /// Dispose every window the windowing subsystem has open.
    fn close_ui_windows(&self, env: EnvId) -> Result<(), ForeignException>;

    /// The scripting engine bundled with the runtime, if any.
    fn script_engine(&self) -> Option<&dyn ScriptEngine>;

    /// Create a blocking invocation queue. The returned handle is a global
    /// reference owned by the caller.
    fn new_invocation_queue(&self, env: EnvId) -> Result<Handle, ForeignException>;

    /// Block until a call arrives. Fails with a queue-closed exception once
    /// the queue is closed.
    fn take_request(&self, env: EnvId, queue: Handle)
        -> Result<InvocationRequest, ForeignException>;

    /// Resolve a pending call. Each request accepts exactly one response.
    fn respond(
        &self,
        env: EnvId,
        queue: Handle,
        request: RequestId,
        response: Result<Value, ForeignException>,
    ) -> Result<(), ForeignException>;

    /// Close the queue, failing every waiting and future caller.
    fn close_queue(&self, env: EnvId, queue: Handle) -> Result<(), ForeignException>;

    /// Synthesize an object implementing `interfaces` whose calls are routed
    /// into `queue`. `key` is stored in the proxy's invocation handler.
    fn new_proxy(
        &self,
        env: EnvId,
        queue: Handle,
        interfaces: &[&str],
        class_loader: Option<Handle>,
        key: &str,
    ) -> Result<Handle, ForeignException>;

    /// Read the key stored in a proxy's invocation handler.
    fn proxy_key(&self, env: EnvId, proxy: Handle) -> Result<String, ForeignException>;
}

/// Opaque evaluator for snippets of runtime-side script code.
pub trait ScriptEngine: Send + Sync {
    /// Evaluate `source` with `bindings_in` as global variables. Every key of
    /// `bindings_out` is filled with the matching global after evaluation.
    fn eval(
        &self,
        env: EnvId,
        source: &str,
        bindings_in: &IndexMap<String, Value>,
        bindings_out: &mut IndexMap<String, Value>,
    ) -> Result<Value, ForeignException>;
}
