//! Embed a managed VM in a host process and call across the boundary safely.
//!
//! Start the VM through a [`Bridge`], attach every thread that touches it,
//! run privileged-thread work through the dispatcher, and let runtime code call
//! host objects through a [`ProxyServer`].

pub mod runtime;

pub use runtime::attach::{AttachGuard, Env};
pub use runtime::error::{BridgeError, ForeignException, Result};
pub use runtime::proxy::{InvokeError, Invoker, ProxyHandle, ProxyServer};
pub use runtime::value::Value;
pub use runtime::vm::{Handle, LocalVm, ScriptEngine, VmBackend};
#[cfg(feature = "jni")]
pub use runtime::vm::JniVm;
pub use runtime::{
    Bridge, Dispatch, FutureTask, GlobalRef, LoopState, UiEventLoop, VmGuard, VmOptions, VmState,
};
