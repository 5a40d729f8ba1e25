//! Error types shared by every bridge component.
//!
//! [`BridgeError`] is what host code sees. [`ForeignException`] describes an
//! exception living inside the embedded runtime; it travels in both
//! directions: out of the runtime when a foreign call fails, and back into the
//! runtime when a proxied host method fails.

use super::vm::Handle;
use std::fmt;
use thiserror::Error;

/// Class names for the exceptions the bridge raises inside the embedded runtime.
pub mod classes {
    /// Generic failure; host-side errors and panics are reported with this class.
    pub const RUNTIME_EXCEPTION: &str = "java/lang/RuntimeException";
    /// A proxy whose host invoker has been dropped.
    pub const ILLEGAL_STATE_EXCEPTION: &str = "java/lang/IllegalStateException";
    /// A proxy whose host invoker does not implement the called method.
    pub const NO_SUCH_METHOD_EXCEPTION: &str = "java/lang/NoSuchMethodException";
    /// Raised to callers of a proxy whose invocation queue has been closed.
    pub const QUEUE_CLOSED_EXCEPTION: &str =
        "org/vmbridge/InvocationQueue$InvocationQueueClosedException";
    /// Script errors that wrap an exception thrown by the script body.
    pub const WRAPPED_EXCEPTION: &str = "org/vmbridge/script/WrappedException";
    /// Script syntax or evaluation errors.
    pub const SCRIPT_EXCEPTION: &str = "javax/script/ScriptException";
}

/// An exception raised inside the embedded runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignException {
    /// Slash-separated class name, e.g. `java/lang/RuntimeException`.
    pub class_name: String,
    pub message: Option<String>,
    /// The throwable object, when the runtime materialized one.
    pub throwable: Option<Handle>,
    pub cause: Option<Box<ForeignException>>,
}

impl ForeignException {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: Some(message.into()),
            throwable: None,
            cause: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(classes::RUNTIME_EXCEPTION, message)
    }

    pub fn queue_closed(message: impl Into<String>) -> Self {
        Self::new(classes::QUEUE_CLOSED_EXCEPTION, message)
    }

    pub fn with_throwable(mut self, throwable: Handle) -> Self {
        self.throwable = Some(throwable);
        self
    }

    pub fn with_cause(mut self, cause: ForeignException) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_instance_of(&self, class_name: &str) -> bool {
        self.class_name == class_name
    }

    pub fn is_queue_closed(&self) -> bool {
        self.is_instance_of(classes::QUEUE_CLOSED_EXCEPTION)
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Strip script wrappers and return the exception the script body threw.
    pub fn unwrap_script(self) -> ForeignException {
        match self.cause {
            Some(cause) if self.class_name == classes::WRAPPED_EXCEPTION => cause.unwrap_script(),
            _ => self,
        }
    }
}

impl fmt::Display for ForeignException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.class_name, message),
            None => f.write_str(&self.class_name),
        }
    }
}

impl std::error::Error for ForeignException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Errors returned by the bridge to host code.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("can't find the managed runtime: {0}")]
    RuntimeNotFound(String),

    /// The VM was stopped earlier in this process. The runtime's invocation
    /// interface cannot create a second VM in the same process.
    #[error("the VM has been stopped and cannot be restarted in this process")]
    AlreadyStopped,

    #[error("failed to start the VM: {0}")]
    StartFailed(String),

    #[error("invalid VM option: {0}")]
    InvalidOption(String),

    #[error("the VM is not running")]
    VmNotRunning,

    #[error("the current thread is not attached to the VM")]
    NotAttached,

    #[error("bridge misuse: {0}")]
    Misuse(String),

    /// The embedded runtime rejected a call.
    #[error("foreign exception: {0}")]
    Foreign(#[from] ForeignException),

    #[error("cannot convert {value} to signature `{signature}`")]
    Conversion { value: String, signature: String },

    #[error("internal bridge error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn foreign(&self) -> Option<&ForeignException> {
        match self {
            BridgeError::Foreign(exception) => Some(exception),
            _ => None,
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Render a panic payload for logs and exception messages.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
