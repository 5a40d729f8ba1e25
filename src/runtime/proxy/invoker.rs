//! Host-side method tables for proxies.

use crate::runtime::error::ForeignException;
use crate::runtime::value::Value;
use indexmap::IndexMap;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a host method invoked through a proxy.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// Rethrown into the runtime unchanged
    #[error("{0}")]
    Foreign(#[from] ForeignException),
    /// Reported to the runtime as a generic runtime exception
    #[error("{0}")]
    Host(String),
}

impl From<String> for InvokeError {
    fn from(message: String) -> Self {
        InvokeError::Host(message)
    }
}

impl From<&str> for InvokeError {
    fn from(message: &str) -> Self {
        InvokeError::Host(message.to_string())
    }
}

/// Type alias for proxy method handlers.
///
/// Handlers receive the call's arguments already converted to host values.
pub type MethodHandler = Arc<dyn Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync>;

#[derive(Clone)]
struct MethodEntry {
    /// `None` accepts any number of arguments
    arity: Option<usize>,
    handler: MethodHandler,
}

/// The methods a host object exposes to proxies, by name.
///
/// Several handlers may share a name. A call resolves to the first one
/// registered whose arity accepts the argument count.
#[derive(Clone, Default)]
pub struct Invoker {
    methods: IndexMap<String, Vec<MethodEntry>>,
}

impl Invoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler taking exactly `arity` arguments.
    pub fn method<F>(self, name: impl Into<String>, arity: usize, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        self.register(name.into(), Some(arity), Arc::new(handler))
    }

    /// Register a handler accepting any number of arguments.
    pub fn variadic<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        self.register(name.into(), None, Arc::new(handler))
    }

    fn register(mut self, name: String, arity: Option<usize>, handler: MethodHandler) -> Self {
        self.methods
            .entry(name)
            .or_default()
            .push(MethodEntry { arity, handler });
        self
    }

    pub fn resolve(&self, name: &str, argc: usize) -> Option<MethodHandler> {
        self.methods.get(name)?.iter().find_map(|entry| {
            match entry.arity {
                Some(arity) if arity != argc => None,
                _ => Some(Arc::clone(&entry.handler)),
            }
        })
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Number of distinct method names.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_name_and_arity() {
        let invoker = Invoker::new()
            .method("greet", 0, |_| Ok(Value::from("hi")))
            .method("greet", 1, |args| Ok(Value::from(format!("hi {}", args[0]))));

        let zero = invoker.resolve("greet", 0).unwrap();
        assert_eq!(zero(&[]).unwrap(), Value::from("hi"));
        let one = invoker.resolve("greet", 1).unwrap();
        assert_eq!(one(&[Value::from("bob")]).unwrap(), Value::from("hi bob"));
        assert!(invoker.resolve("greet", 2).is_none());
        assert!(invoker.resolve("missing", 0).is_none());
        assert_eq!(invoker.len(), 1);
    }

    #[test]
    fn test_first_compatible_registration_wins() {
        let invoker = Invoker::new()
            .variadic("run", |_| Ok(Value::from("first")))
            .method("run", 0, |_| Ok(Value::from("second")));
        let handler = invoker.resolve("run", 0).unwrap();
        assert_eq!(handler(&[]).unwrap(), Value::from("first"));
    }

    #[test]
    fn test_method_names_keep_registration_order() {
        let invoker = Invoker::new()
            .method("b", 0, |_| Ok(Value::Null))
            .method("a", 0, |_| Ok(Value::Null))
            .method("b", 1, |_| Ok(Value::Null));
        assert_eq!(invoker.method_names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert!(invoker.has_method("a"));
        assert!(!Invoker::new().has_method("a"));
        assert!(Invoker::new().is_empty());
    }

    #[test]
    fn test_invoke_error_conversions() {
        let host: InvokeError = "bad argument".into();
        assert_eq!(host.to_string(), "bad argument");
        let foreign: InvokeError = ForeignException::runtime("boom").into();
        assert!(matches!(foreign, InvokeError::Foreign(_)));
    }
}
