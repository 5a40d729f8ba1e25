//! [`VmBackend`] over a real Java VM, driven through the `jni` crate's
//! invocation API.
//!
//! Proxies and invocation queues are implemented by the
//! `org.vmbridge.InvocationQueue` helper (`java/org/vmbridge/` in this
//! repository), which must be on the VM's class path. Scripts run on the
//! `javascript` engine registered with `javax.script`, when the VM ships one.
//!
//! Objects returned by [`VmBackend::call_method`] and by scripts are new
//! global references owned by the caller; adopt them with
//! [`Bridge::global_ref`](crate::runtime::Bridge::global_ref). Object
//! arguments of a proxy call stay valid until the call is answered.

use super::{
    EnvId, Handle, InvocationRequest, MethodDescriptor, RequestId, ScriptEngine, VmBackend,
};
use crate::runtime::conversion::{parse_method, Signature};
use crate::runtime::error::{classes, BridgeError, ForeignException, Result};
use crate::runtime::value::Value;
use ::jni::errors::Error as JniError;
use ::jni::objects::{GlobalRef, JObject, JString, JValue, JValueOwned};
use ::jni::{sys, InitArgsBuilder, JNIEnv, JNIVersion, JavaVM};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

const QUEUE_CLASS: &str = "org/vmbridge/InvocationQueue";
const ARRAY_CLASS: &str = "java/lang/reflect/Array";
const ILLEGAL_ARGUMENT_EXCEPTION: &str = "java/lang/IllegalArgumentException";
const LOCAL_FRAME_CAPACITY: i32 = 32;
/// Cause chains are cut at this depth when a throwable is described.
const MAX_CAUSE_DEPTH: usize = 8;

#[cfg(windows)]
const JAVA_EXECUTABLE: &str = "java.exe";
#[cfg(not(windows))]
const JAVA_EXECUTABLE: &str = "java";

/// Failure inside a block of JNI calls. Pending Java exceptions are turned
/// into [`ForeignException`]s once the block's local frame is popped.
enum CallError {
    Jni(JniError),
    Foreign(ForeignException),
}

impl From<JniError> for CallError {
    fn from(err: JniError) -> Self {
        CallError::Jni(err)
    }
}

impl From<ForeignException> for CallError {
    fn from(err: ForeignException) -> Self {
        CallError::Foreign(err)
    }
}

type Call<T> = std::result::Result<T, CallError>;

struct PendingRequest {
    request: GlobalRef,
    ret: Signature,
    /// References made for the call's proxy and object arguments
    scoped: Vec<Handle>,
}

pub struct JniVm {
    java_home: Option<PathBuf>,
    jvm: OnceCell<JavaVM>,
    destroyed: AtomicBool,
    next_handle: AtomicU64,
    refs: Mutex<HashMap<Handle, GlobalRef>>,
    next_request: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl Default for JniVm {
    fn default() -> Self {
        Self::new()
    }
}

impl JniVm {
    /// A backend that finds the runtime through `JAVA_HOME` or `PATH`.
    pub fn new() -> Self {
        Self {
            java_home: None,
            jvm: OnceCell::new(),
            destroyed: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            refs: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// A backend bound to the installation at `home`.
    pub fn with_java_home(home: impl Into<PathBuf>) -> Self {
        Self {
            java_home: Some(home.into()),
            ..Self::new()
        }
    }

    fn jvm(&self) -> Result<&JavaVM> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::VmNotRunning);
        }
        self.jvm.get().ok_or(BridgeError::VmNotRunning)
    }

    fn register(&self, global: GlobalRef) -> Handle {
        let handle = Handle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.refs.lock().insert(handle, global);
        handle
    }

    fn global(&self, handle: Handle) -> std::result::Result<GlobalRef, ForeignException> {
        self.refs.lock().get(&handle).cloned().ok_or_else(|| {
            ForeignException::new(
                ILLEGAL_ARGUMENT_EXCEPTION,
                format!("{} is not a live reference", handle),
            )
        })
    }

    fn release_all(&self, handles: &[Handle]) {
        let released: Vec<GlobalRef> = {
            let mut refs = self.refs.lock();
            handles.iter().filter_map(|handle| refs.remove(handle)).collect()
        };
        drop(released);
    }

    /// Run `f` in a fresh local frame on the thread owning `env`.
    fn with_env<T>(
        &self,
        env: EnvId,
        f: impl FnOnce(&mut JNIEnv<'_>) -> Call<T>,
    ) -> std::result::Result<T, ForeignException> {
        let jvm = self
            .jvm()
            .map_err(|err| ForeignException::new(classes::ILLEGAL_STATE_EXCEPTION, err.to_string()))?;
        let mut current = jvm.get_env().map_err(|_| {
            ForeignException::new(
                classes::ILLEGAL_STATE_EXCEPTION,
                "the calling thread is not attached to the VM",
            )
        })?;
        if current.get_raw() as u64 != env.as_raw() {
            return Err(ForeignException::new(
                classes::ILLEGAL_STATE_EXCEPTION,
                "environment used on a thread that does not own it",
            ));
        }
        let outcome = current.with_local_frame(LOCAL_FRAME_CAPACITY, f);
        outcome.map_err(|err| match err {
            CallError::Foreign(exception) => exception,
            CallError::Jni(JniError::JavaException) => take_exception(&mut current),
            CallError::Jni(other) => ForeignException::runtime(format!("JNI failure: {}", other)),
        })
    }

    /// Convert a Java object into a host value. Objects that have no host
    /// counterpart become new global references recorded in `scope`.
    fn to_value<'local>(
        &self,
        env: &mut JNIEnv<'local>,
        obj: JObject<'local>,
        scope: &mut Vec<Handle>,
    ) -> Call<Value> {
        if obj.is_null() {
            return Ok(Value::Null);
        }
        if env.is_instance_of(&obj, "java/lang/String")? {
            return Ok(Value::String(read_string(env, obj)?.unwrap_or_default()));
        }
        if env.is_instance_of(&obj, "java/lang/Boolean")? {
            return Ok(Value::Bool(env.call_method(&obj, "booleanValue", "()Z", &[])?.z()?));
        }
        if env.is_instance_of(&obj, "java/lang/Character")? {
            let unit = env.call_method(&obj, "charValue", "()C", &[])?.c()?;
            return Ok(char_value(unit));
        }
        for class in ["java/lang/Integer", "java/lang/Long", "java/lang/Short", "java/lang/Byte"] {
            if env.is_instance_of(&obj, class)? {
                return Ok(Value::Int(env.call_method(&obj, "longValue", "()J", &[])?.j()?));
            }
        }
        for class in ["java/lang/Double", "java/lang/Float"] {
            if env.is_instance_of(&obj, class)? {
                return Ok(Value::Float(env.call_method(&obj, "doubleValue", "()D", &[])?.d()?));
            }
        }
        if is_array(env, &obj)? {
            let length = array_length(env, &obj)?;
            let mut items = Vec::with_capacity(usize::try_from(length).unwrap_or(0));
            for index in 0..length {
                let item = array_get(env, &obj, index)?;
                items.push(self.to_value(env, item, scope)?);
            }
            return Ok(Value::Array(items));
        }
        let handle = self.register(env.new_global_ref(&obj)?);
        scope.push(handle);
        Ok(Value::Object(handle))
    }

    fn from_jvalue<'local>(
        &self,
        env: &mut JNIEnv<'local>,
        value: JValueOwned<'local>,
        sig: &Signature,
    ) -> Call<Value> {
        Ok(match sig {
            Signature::Void => Value::Null,
            Signature::Boolean => Value::Bool(value.z()?),
            Signature::Byte => Value::Int(i64::from(value.b()?)),
            Signature::Char => char_value(value.c()?),
            Signature::Short => Value::Int(i64::from(value.s()?)),
            Signature::Int => Value::Int(i64::from(value.i()?)),
            Signature::Long => Value::Int(value.j()?),
            Signature::Float => Value::Float(f64::from(value.f()?)),
            Signature::Double => Value::Float(value.d()?),
            Signature::Object(_) | Signature::Array(_) => {
                let obj = value.l()?;
                self.to_value(env, obj, &mut Vec::new())?
            }
        })
    }

    /// Convert a host value into a Java object, picking wrapper and array
    /// component types from `sig` when it is known.
    fn to_object<'local>(
        &self,
        env: &mut JNIEnv<'local>,
        value: &Value,
        sig: Option<&Signature>,
    ) -> Call<JObject<'local>> {
        Ok(match value {
            Value::Null => JObject::null(),
            Value::Object(handle) => {
                let global = self.global(*handle)?;
                env.new_local_ref(global.as_obj())?
            }
            Value::String(text) => env.new_string(text)?.into(),
            Value::Array(items) => self.new_array(env, items, sig)?,
            Value::Bool(_) | Value::Char(_) | Value::Int(_) | Value::Float(_) => {
                let code = sig
                    .and_then(|sig| match sig {
                        Signature::Object(class) => wrapper_code(class),
                        other => primitive_code(other),
                    })
                    .unwrap_or_else(|| natural_code(value));
                let class = wrapper_class(code);
                let argument = primitive(code, value)?;
                let factory = format!("({})L{};", code, class);
                env.call_static_method(class, "valueOf", factory.as_str(), &[argument])?
                    .l()?
            }
        })
    }

    fn new_array<'local>(
        &self,
        env: &mut JNIEnv<'local>,
        items: &[Value],
        sig: Option<&Signature>,
    ) -> Call<JObject<'local>> {
        let element = match sig {
            Some(Signature::Array(inner)) => Some(inner.as_ref()),
            _ => None,
        };
        let component = component_class(env, element)?;
        let length = i32::try_from(items.len()).map_err(|_| {
            ForeignException::new(ILLEGAL_ARGUMENT_EXCEPTION, "array too long for the VM")
        })?;
        let array = env
            .call_static_method(
                ARRAY_CLASS,
                "newInstance",
                "(Ljava/lang/Class;I)Ljava/lang/Object;",
                &[JValue::Object(&component), JValue::Int(length)],
            )?
            .l()?;
        for (index, item) in (0..length).zip(items) {
            let boxed = self.to_object(env, item, element)?;
            array_set(env, &array, index, &boxed)?;
        }
        Ok(array)
    }

    fn new_throwable<'local>(
        &self,
        env: &mut JNIEnv<'local>,
        exception: &ForeignException,
    ) -> Call<JObject<'local>> {
        if let Some(handle) = exception.throwable {
            let global = self.global(handle)?;
            return Ok(env.new_local_ref(global.as_obj())?);
        }
        let message = env.new_string(exception.message())?;
        let created = env.new_object(
            exception.class_name.as_str(),
            "(Ljava/lang/String;)V",
            &[JValue::Object(&message)],
        );
        let throwable = match created {
            Ok(throwable) => throwable,
            Err(_) => {
                // Unknown class or no message constructor.
                env.exception_clear()?;
                let text = env.new_string(exception.to_string())?;
                env.new_object(
                    classes::RUNTIME_EXCEPTION,
                    "(Ljava/lang/String;)V",
                    &[JValue::Object(&text)],
                )?
            }
        };
        if let Some(cause) = &exception.cause {
            let cause = self.new_throwable(env, cause)?;
            env.call_method(
                &throwable,
                "initCause",
                "(Ljava/lang/Throwable;)Ljava/lang/Throwable;",
                &[JValue::Object(&cause)],
            )?;
        }
        Ok(throwable)
    }

    fn read_request<'local>(
        &self,
        env: &mut JNIEnv<'local>,
        request: &JObject<'local>,
        scope: &mut Vec<Handle>,
    ) -> Call<(Handle, MethodDescriptor, Vec<Value>)> {
        let interface = string_method(env, request, "getInterfaceName")?.unwrap_or_default();
        let name = string_method(env, request, "getMethodName")?.unwrap_or_default();
        let signature = string_method(env, request, "getSignature")?.unwrap_or_default();
        let proxy = env
            .call_method(request, "getProxy", "()Ljava/lang/Object;", &[])?
            .l()?;
        let proxy = self.register(env.new_global_ref(&proxy)?);
        scope.push(proxy);
        let args = env
            .call_method(request, "getArgs", "()[Ljava/lang/Object;", &[])?
            .l()?;
        let count = array_length(env, &args)?;
        let mut values = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for index in 0..count {
            let arg = array_get(env, &args, index)?;
            values.push(self.to_value(env, arg, scope)?);
        }
        Ok((proxy, MethodDescriptor::new(interface, name, signature), values))
    }
}

impl VmBackend for JniVm {
    fn locate(&self) -> Result<PathBuf> {
        match &self.java_home {
            Some(home) if home.is_dir() => Ok(home.clone()),
            Some(home) => Err(BridgeError::RuntimeNotFound(format!(
                "{} is not a directory",
                home.display()
            ))),
            None => find_java_home().ok_or_else(|| {
                BridgeError::RuntimeNotFound("set JAVA_HOME or put java on the PATH".to_string())
            }),
        }
    }

    fn create_vm(&self, args: &[String]) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStopped);
        }
        if self.jvm.get().is_some() {
            return Err(BridgeError::StartFailed(
                "a Java VM already exists in this process".to_string(),
            ));
        }
        let mut builder = InitArgsBuilder::new()
            .version(JNIVersion::V8)
            .ignore_unrecognized(false);
        for arg in args {
            builder = builder.option(arg.as_str());
        }
        let init = builder
            .build()
            .map_err(|err| BridgeError::StartFailed(err.to_string()))?;
        let jvm = JavaVM::new(init).map_err(|err| BridgeError::StartFailed(err.to_string()))?;
        info!(options = args.len(), "Java VM created");
        self.jvm.set(jvm).map_err(|_| {
            BridgeError::StartFailed("a Java VM already exists in this process".to_string())
        })
    }

    fn destroy_vm(&self) -> Result<()> {
        let jvm = self.jvm()?;
        self.destroyed.store(true, Ordering::SeqCst);
        // Global references must go while the VM can still delete them.
        let pending: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        drop(pending);
        let refs: Vec<GlobalRef> = self.refs.lock().drain().map(|(_, r)| r).collect();
        if !refs.is_empty() {
            debug!(count = refs.len(), "deleting references still held at shutdown");
        }
        drop(refs);
        let raw = jvm.get_java_vm_pointer();
        // SAFETY: `raw` points at the VM this backend created; the bridge
        // stops every other caller before asking for destruction.
        let status = unsafe {
            match (**raw).DestroyJavaVM {
                Some(destroy) => destroy(raw),
                None => sys::JNI_ERR,
            }
        };
        if status != sys::JNI_OK {
            return Err(BridgeError::Internal(format!(
                "DestroyJavaVM failed with status {}",
                status
            )));
        }
        Ok(())
    }

    fn attach_current_thread(&self, daemon: bool) -> Result<EnvId> {
        let jvm = self.jvm()?;
        let attached = if daemon {
            jvm.attach_current_thread_as_daemon()
        } else {
            jvm.attach_current_thread_permanently()
        };
        let env = attached.map_err(|err| BridgeError::Internal(format!("attach failed: {}", err)))?;
        Ok(EnvId::from_raw(env.get_raw() as u64))
    }

    fn detach_current_thread(&self) -> Result<()> {
        let jvm = self.jvm()?;
        // SAFETY: the bridge detaches only after the thread's environment and
        // local references are out of use.
        unsafe { jvm.detach_current_thread() };
        Ok(())
    }

    fn release(&self, handle: Handle) -> Result<()> {
        let removed = self.refs.lock().remove(&handle);
        match removed {
            Some(global) => {
                drop(global);
                Ok(())
            }
            None => {
                warn!(%handle, "release of an unknown reference");
                Err(BridgeError::Misuse(format!("{} is not a live reference", handle)))
            }
        }
    }

    fn init_context_class_loader(&self, env: EnvId) -> std::result::Result<(), ForeignException> {
        self.with_env(env, |env| {
            let thread = env
                .call_static_method("java/lang/Thread", "currentThread", "()Ljava/lang/Thread;", &[])?
                .l()?;
            let current = env
                .call_method(&thread, "getContextClassLoader", "()Ljava/lang/ClassLoader;", &[])?
                .l()?;
            if current.is_null() {
                let loader = system_loader(env)?;
                env.call_method(
                    &thread,
                    "setContextClassLoader",
                    "(Ljava/lang/ClassLoader;)V",
                    &[JValue::Object(&loader)],
                )?;
            }
            Ok(())
        })
    }

    fn system_class_loader(&self, env: EnvId) -> std::result::Result<Handle, ForeignException> {
        self.with_env(env, |env| {
            let loader = system_loader(env)?;
            Ok(self.register(env.new_global_ref(&loader)?))
        })
    }

    fn call_method(
        &self,
        env: EnvId,
        target: Handle,
        name: &str,
        signature: &str,
        args: &[Value],
    ) -> std::result::Result<Value, ForeignException> {
        let method = parse_method(signature)
            .map_err(|err| ForeignException::new(ILLEGAL_ARGUMENT_EXCEPTION, err.to_string()))?;
        if method.params.len() != args.len() {
            return Err(ForeignException::new(
                ILLEGAL_ARGUMENT_EXCEPTION,
                format!("{} takes {} arguments, got {}", name, method.params.len(), args.len()),
            ));
        }
        self.with_env(env, |env| {
            let target = self.global(target)?;
            enum Slot {
                Primitive(JValue<'static, 'static>),
                Object(usize),
            }
            let mut objects = Vec::new();
            let mut slots = Vec::with_capacity(args.len());
            for (arg, param) in args.iter().zip(&method.params) {
                match primitive_code(param) {
                    Some(code) => slots.push(Slot::Primitive(primitive(code, arg)?)),
                    None => {
                        objects.push(self.to_object(env, arg, Some(param))?);
                        slots.push(Slot::Object(objects.len() - 1));
                    }
                }
            }
            let jargs: Vec<JValue> = slots
                .into_iter()
                .map(|slot| match slot {
                    Slot::Primitive(value) => value,
                    Slot::Object(index) => JValue::Object(&objects[index]),
                })
                .collect();
            let result = env.call_method(target.as_obj(), name, signature, &jargs)?;
            self.from_jvalue(env, result, &method.ret)
        })
    }

    fn to_string(&self, env: EnvId, target: Handle) -> std::result::Result<String, ForeignException> {
        self.with_env(env, |env| {
            let target = self.global(target)?;
            Ok(string_method(env, target.as_obj(), "toString")?.unwrap_or_else(|| "null".into()))
        })
    }

    fn is_instance_of(
        &self,
        env: EnvId,
        target: Handle,
        class_name: &str,
    ) -> std::result::Result<bool, ForeignException> {
        self.with_env(env, |env| {
            let target = self.global(target)?;
            Ok(env.is_instance_of(target.as_obj(), class_name)?)
        })
    }

    fn activate_ui(&self, env: EnvId) -> std::result::Result<(), ForeignException> {
        self.with_env(env, |env| {
            env.call_static_method(
                "java/awt/Toolkit",
                "getDefaultToolkit",
                "()Ljava/awt/Toolkit;",
                &[],
            )?;
            Ok(())
        })
    }

    fn close_ui_windows(&self, env: EnvId) -> std::result::Result<(), ForeignException> {
        self.with_env(env, |env| {
            let windows = env
                .call_static_method("java/awt/Window", "getWindows", "()[Ljava/awt/Window;", &[])?
                .l()?;
            let count = array_length(env, &windows)?;
            for index in 0..count {
                let window = array_get(env, &windows, index)?;
                env.call_method(&window, "dispose", "()V", &[])?;
            }
            debug!(count, "disposed windows");
            Ok(())
        })
    }

    fn script_engine(&self) -> Option<&dyn ScriptEngine> {
        Some(self)
    }

    fn new_invocation_queue(&self, env: EnvId) -> std::result::Result<Handle, ForeignException> {
        self.with_env(env, |env| {
            let queue = env.new_object(QUEUE_CLASS, "()V", &[])?;
            Ok(self.register(env.new_global_ref(&queue)?))
        })
    }

    fn take_request(
        &self,
        env: EnvId,
        queue: Handle,
    ) -> std::result::Result<InvocationRequest, ForeignException> {
        self.with_env(env, |env| {
            let queue = self.global(queue)?;
            let request = env
                .call_method(
                    queue.as_obj(),
                    "takeRequest",
                    "()Lorg/vmbridge/InvocationQueue$Request;",
                    &[],
                )?
                .l()?;
            let mut scoped = Vec::new();
            let (proxy, method, args) = match self.read_request(env, &request, &mut scoped) {
                Ok(read) => read,
                Err(err) => {
                    self.release_all(&scoped);
                    return Err(err);
                }
            };
            let ret = parse_method(&method.signature)
                .map(|sig| sig.ret)
                .unwrap_or_else(|_| Signature::Object("java/lang/Object".to_string()));
            let id = RequestId::from_raw(self.next_request.fetch_add(1, Ordering::Relaxed));
            let pending = PendingRequest {
                request: env.new_global_ref(&request)?,
                ret,
                scoped,
            };
            self.pending.lock().insert(id, pending);
            Ok(InvocationRequest {
                id,
                proxy,
                method,
                args,
            })
        })
    }

    fn respond(
        &self,
        env: EnvId,
        _queue: Handle,
        request: RequestId,
        response: std::result::Result<Value, ForeignException>,
    ) -> std::result::Result<(), ForeignException> {
        let pending = self.pending.lock().remove(&request).ok_or_else(|| {
            ForeignException::new(
                classes::ILLEGAL_STATE_EXCEPTION,
                format!("request {} is not waiting for a response", request.as_raw()),
            )
        })?;
        let answered = self.with_env(env, |env| {
            match &response {
                Ok(value) => {
                    let result = self.to_object(env, value, Some(&pending.ret))?;
                    env.call_method(
                        pending.request.as_obj(),
                        "respond",
                        "(Ljava/lang/Object;)V",
                        &[JValue::Object(&result)],
                    )?;
                }
                Err(exception) => {
                    let throwable = self.new_throwable(env, exception)?;
                    env.call_method(
                        pending.request.as_obj(),
                        "respondWithException",
                        "(Ljava/lang/Throwable;)V",
                        &[JValue::Object(&throwable)],
                    )?;
                }
            }
            Ok(())
        });
        self.release_all(&pending.scoped);
        answered
    }

    fn close_queue(&self, env: EnvId, queue: Handle) -> std::result::Result<(), ForeignException> {
        self.with_env(env, |env| {
            let queue = self.global(queue)?;
            env.call_method(queue.as_obj(), "close", "()V", &[])?;
            Ok(())
        })
    }

    fn new_proxy(
        &self,
        env: EnvId,
        queue: Handle,
        interfaces: &[&str],
        class_loader: Option<Handle>,
        key: &str,
    ) -> std::result::Result<Handle, ForeignException> {
        if interfaces.is_empty() {
            return Err(ForeignException::new(
                ILLEGAL_ARGUMENT_EXCEPTION,
                "a proxy needs at least one interface",
            ));
        }
        self.with_env(env, |env| {
            let queue = self.global(queue)?;
            let loader = match class_loader {
                Some(handle) => {
                    let global = self.global(handle)?;
                    env.new_local_ref(global.as_obj())?
                }
                None => system_loader(env)?,
            };
            let class_class: JObject = env.find_class("java/lang/Class")?.into();
            let length = i32::try_from(interfaces.len()).map_err(|_| {
                ForeignException::new(ILLEGAL_ARGUMENT_EXCEPTION, "too many interfaces")
            })?;
            let classes = env
                .call_static_method(
                    ARRAY_CLASS,
                    "newInstance",
                    "(Ljava/lang/Class;I)Ljava/lang/Object;",
                    &[JValue::Object(&class_class), JValue::Int(length)],
                )?
                .l()?;
            for (index, interface) in (0..length).zip(interfaces) {
                let dotted = env.new_string(interface.replace('/', "."))?;
                let class = env
                    .call_static_method(
                        "java/lang/Class",
                        "forName",
                        "(Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;",
                        &[
                            JValue::Object(&dotted),
                            JValue::Bool(sys::JNI_FALSE),
                            JValue::Object(&loader),
                        ],
                    )?
                    .l()?;
                array_set(env, &classes, index, &class)?;
            }
            let key = env.new_string(key)?;
            let proxy = env
                .call_method(
                    queue.as_obj(),
                    "newProxy",
                    "(Ljava/lang/ClassLoader;[Ljava/lang/Class;Ljava/lang/String;)Ljava/lang/Object;",
                    &[
                        JValue::Object(&loader),
                        JValue::Object(&classes),
                        JValue::Object(&key),
                    ],
                )?
                .l()?;
            Ok(self.register(env.new_global_ref(&proxy)?))
        })
    }

    fn proxy_key(&self, env: EnvId, proxy: Handle) -> std::result::Result<String, ForeignException> {
        self.with_env(env, |env| {
            let proxy = self.global(proxy)?;
            let key = env
                .call_static_method(
                    QUEUE_CLASS,
                    "keyOf",
                    "(Ljava/lang/Object;)Ljava/lang/String;",
                    &[JValue::Object(proxy.as_obj())],
                )?
                .l()?;
            Ok(read_string(env, key)?.unwrap_or_default())
        })
    }
}

impl ScriptEngine for JniVm {
    fn eval(
        &self,
        env: EnvId,
        source: &str,
        bindings_in: &IndexMap<String, Value>,
        bindings_out: &mut IndexMap<String, Value>,
    ) -> std::result::Result<Value, ForeignException> {
        self.with_env(env, |env| {
            let manager = env.new_object("javax/script/ScriptEngineManager", "()V", &[])?;
            let language = env.new_string("javascript")?;
            let engine = env
                .call_method(
                    &manager,
                    "getEngineByName",
                    "(Ljava/lang/String;)Ljavax/script/ScriptEngine;",
                    &[JValue::Object(&language)],
                )?
                .l()?;
            if engine.is_null() {
                return Err(ForeignException::new(
                    classes::SCRIPT_EXCEPTION,
                    "no JavaScript engine is available in this VM",
                )
                .into());
            }
            for (name, value) in bindings_in {
                let name = env.new_string(name)?;
                let value = self.to_object(env, value, None)?;
                env.call_method(
                    &engine,
                    "put",
                    "(Ljava/lang/String;Ljava/lang/Object;)V",
                    &[JValue::Object(&name), JValue::Object(&value)],
                )?;
            }
            let code = env.new_string(source)?;
            let result = env
                .call_method(
                    &engine,
                    "eval",
                    "(Ljava/lang/String;)Ljava/lang/Object;",
                    &[JValue::Object(&code)],
                )?
                .l()?;
            let mut owned = Vec::new();
            let value = self.to_value(env, result, &mut owned)?;
            for (name, slot) in bindings_out.iter_mut() {
                let name = env.new_string(name)?;
                let out = env
                    .call_method(
                        &engine,
                        "get",
                        "(Ljava/lang/String;)Ljava/lang/Object;",
                        &[JValue::Object(&name)],
                    )?
                    .l()?;
                *slot = self.to_value(env, out, &mut owned)?;
            }
            Ok(value)
        })
    }
}

/// Clear the pending Java exception and describe it.
fn take_exception(env: &mut JNIEnv<'_>) -> ForeignException {
    let throwable = match env.exception_occurred() {
        Ok(throwable) if !throwable.is_null() => throwable,
        _ => return ForeignException::runtime("a Java exception was reported but none is pending"),
    };
    let _ = env.exception_clear();
    describe_throwable(env, &throwable, 0)
}

fn describe_throwable(env: &mut JNIEnv<'_>, throwable: &JObject<'_>, depth: usize) -> ForeignException {
    let class_name = match class_name_of(env, throwable) {
        Ok(name) => name,
        Err(_) => {
            let _ = env.exception_clear();
            classes::RUNTIME_EXCEPTION.to_string()
        }
    };
    let message = match string_method(env, throwable, "getMessage") {
        Ok(message) => message,
        Err(_) => {
            let _ = env.exception_clear();
            None
        }
    };
    let mut exception = ForeignException {
        class_name,
        message,
        throwable: None,
        cause: None,
    };
    if depth < MAX_CAUSE_DEPTH {
        let cause = env
            .call_method(throwable, "getCause", "()Ljava/lang/Throwable;", &[])
            .and_then(|value| value.l());
        match cause {
            Ok(cause) if !cause.is_null() => {
                if !env.is_same_object(&cause, throwable).unwrap_or(true) {
                    exception.cause = Some(Box::new(describe_throwable(env, &cause, depth + 1)));
                }
            }
            Ok(_) => {}
            Err(_) => {
                let _ = env.exception_clear();
            }
        }
    }
    exception
}

fn class_name_of(env: &mut JNIEnv<'_>, obj: &JObject<'_>) -> ::jni::errors::Result<String> {
    let class = env.get_object_class(obj)?;
    let name = env
        .call_method(&class, "getName", "()Ljava/lang/String;", &[])?
        .l()?;
    Ok(read_string(env, name)?.unwrap_or_default().replace('.', "/"))
}

fn string_method(
    env: &mut JNIEnv<'_>,
    obj: &JObject<'_>,
    name: &str,
) -> ::jni::errors::Result<Option<String>> {
    let value = env.call_method(obj, name, "()Ljava/lang/String;", &[])?.l()?;
    read_string(env, value)
}

fn read_string(env: &mut JNIEnv<'_>, obj: JObject<'_>) -> ::jni::errors::Result<Option<String>> {
    if obj.is_null() {
        return Ok(None);
    }
    let text = JString::from(obj);
    let text: String = env.get_string(&text)?.into();
    Ok(Some(text))
}

fn system_loader<'local>(env: &mut JNIEnv<'local>) -> ::jni::errors::Result<JObject<'local>> {
    env.call_static_method(
        "java/lang/ClassLoader",
        "getSystemClassLoader",
        "()Ljava/lang/ClassLoader;",
        &[],
    )?
    .l()
}

fn is_array(env: &mut JNIEnv<'_>, obj: &JObject<'_>) -> ::jni::errors::Result<bool> {
    let class = env.get_object_class(obj)?;
    env.call_method(&class, "isArray", "()Z", &[])?.z()
}

fn array_length(env: &mut JNIEnv<'_>, array: &JObject<'_>) -> ::jni::errors::Result<i32> {
    env.call_static_method(
        ARRAY_CLASS,
        "getLength",
        "(Ljava/lang/Object;)I",
        &[JValue::Object(array)],
    )?
    .i()
}

fn array_get<'local>(
    env: &mut JNIEnv<'local>,
    array: &JObject<'_>,
    index: i32,
) -> ::jni::errors::Result<JObject<'local>> {
    env.call_static_method(
        ARRAY_CLASS,
        "get",
        "(Ljava/lang/Object;I)Ljava/lang/Object;",
        &[JValue::Object(array), JValue::Int(index)],
    )?
    .l()
}

fn array_set(
    env: &mut JNIEnv<'_>,
    array: &JObject<'_>,
    index: i32,
    value: &JObject<'_>,
) -> ::jni::errors::Result<()> {
    env.call_static_method(
        ARRAY_CLASS,
        "set",
        "(Ljava/lang/Object;ILjava/lang/Object;)V",
        &[JValue::Object(array), JValue::Int(index), JValue::Object(value)],
    )?
    .v()
}

/// The `Class` object for array components of type `element`.
fn component_class<'local>(
    env: &mut JNIEnv<'local>,
    element: Option<&Signature>,
) -> ::jni::errors::Result<JObject<'local>> {
    match element {
        None | Some(Signature::Void) => Ok(env.find_class("java/lang/Object")?.into()),
        Some(Signature::Object(class)) => Ok(env.find_class(class.as_str())?.into()),
        Some(array @ Signature::Array(_)) => Ok(env.find_class(array.to_string())?.into()),
        Some(primitive) => {
            let code = primitive_code(primitive).unwrap_or('I');
            env.get_static_field(wrapper_class(code), "TYPE", "Ljava/lang/Class;")?
                .l()
        }
    }
}

fn primitive_code(sig: &Signature) -> Option<char> {
    match sig {
        Signature::Boolean => Some('Z'),
        Signature::Byte => Some('B'),
        Signature::Char => Some('C'),
        Signature::Short => Some('S'),
        Signature::Int => Some('I'),
        Signature::Long => Some('J'),
        Signature::Float => Some('F'),
        Signature::Double => Some('D'),
        _ => None,
    }
}

fn wrapper_code(class: &str) -> Option<char> {
    match class {
        "java/lang/Boolean" => Some('Z'),
        "java/lang/Byte" => Some('B'),
        "java/lang/Character" => Some('C'),
        "java/lang/Short" => Some('S'),
        "java/lang/Integer" => Some('I'),
        "java/lang/Long" => Some('J'),
        "java/lang/Float" => Some('F'),
        "java/lang/Double" => Some('D'),
        _ => None,
    }
}

fn wrapper_class(code: char) -> &'static str {
    match code {
        'Z' => "java/lang/Boolean",
        'B' => "java/lang/Byte",
        'C' => "java/lang/Character",
        'S' => "java/lang/Short",
        'I' => "java/lang/Integer",
        'J' => "java/lang/Long",
        'F' => "java/lang/Float",
        _ => "java/lang/Double",
    }
}

/// The primitive a scalar boxes to when nothing declares its type.
fn natural_code(value: &Value) -> char {
    match value {
        Value::Bool(_) => 'Z',
        Value::Char(_) => 'C',
        Value::Int(i) if i32::try_from(*i).is_ok() => 'I',
        Value::Int(_) => 'J',
        _ => 'D',
    }
}

fn primitive(code: char, value: &Value) -> Call<JValue<'static, 'static>> {
    let int = || -> Call<i64> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Char(c) => Ok(i64::from(u32::from(*c))),
            Value::Bool(b) => Ok(i64::from(*b)),
            other => Err(mismatch(code, other)),
        }
    };
    let float = || -> Call<f64> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(mismatch(code, other)),
        }
    };
    Ok(match code {
        'Z' => JValue::Bool(match value {
            Value::Bool(b) => u8::from(*b),
            _ => u8::from(int()? != 0),
        }),
        'B' => JValue::Byte(int()? as i8),
        'C' => JValue::Char(match value {
            Value::Char(c) => {
                let mut units = [0u16; 2];
                match c.encode_utf16(&mut units) {
                    [unit] => *unit,
                    _ => return Err(mismatch(code, value)),
                }
            }
            _ => int()? as u16,
        }),
        'S' => JValue::Short(int()? as i16),
        'I' => JValue::Int(int()? as i32),
        'J' => JValue::Long(int()?),
        'F' => JValue::Float(float()? as f32),
        _ => JValue::Double(float()?),
    })
}

fn mismatch(code: char, value: &Value) -> CallError {
    CallError::Foreign(ForeignException::new(
        ILLEGAL_ARGUMENT_EXCEPTION,
        format!("cannot pass {:?} as {}", value, code),
    ))
}

fn char_value(unit: u16) -> Value {
    Value::Char(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER))
}

fn find_java_home() -> Option<PathBuf> {
    if let Some(home) = env::var_os("JAVA_HOME").map(PathBuf::from) {
        if home.is_dir() {
            return Some(home);
        }
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(JAVA_EXECUTABLE))
        .find(|candidate| candidate.is_file())
        .and_then(|java| home_of_executable(&java))
}

/// `<home>/bin/java` to `<home>`, following links such as `/usr/bin/java`.
fn home_of_executable(java: &Path) -> Option<PathBuf> {
    let resolved = std::fs::canonicalize(java).ok()?;
    resolved.parent()?.parent().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_home_of_executable() {
        let root = env::temp_dir().join(format!("vmbridge-jdk-{}", uuid::Uuid::new_v4()));
        let bin = root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let java = bin.join(JAVA_EXECUTABLE);
        fs::write(&java, b"").unwrap();

        let home = home_of_executable(&java).unwrap();
        assert_eq!(home, fs::canonicalize(&root).unwrap());
        assert!(home_of_executable(&root.join("missing")).is_none());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_explicit_home_must_exist() {
        let vm = JniVm::with_java_home("/nonexistent/vmbridge-jdk");
        assert!(matches!(vm.locate(), Err(BridgeError::RuntimeNotFound(_))));
    }

    #[test]
    fn test_calls_before_creation_fail() {
        let vm = JniVm::new();
        assert!(matches!(
            vm.attach_current_thread(true),
            Err(BridgeError::VmNotRunning)
        ));
        assert!(matches!(vm.destroy_vm(), Err(BridgeError::VmNotRunning)));
        let err = vm.system_class_loader(EnvId::from_raw(1)).unwrap_err();
        assert!(err.is_instance_of(classes::ILLEGAL_STATE_EXCEPTION));
        assert!(vm.release(Handle::from_raw(7)).is_err());
    }

    #[test]
    fn test_boxing_codes() {
        assert_eq!(natural_code(&Value::Int(5)), 'I');
        assert_eq!(natural_code(&Value::Int(i64::MAX)), 'J');
        assert_eq!(natural_code(&Value::Float(0.5)), 'D');
        assert_eq!(wrapper_code("java/lang/Long"), Some('J'));
        assert_eq!(wrapper_code("java/lang/Object"), None);
        assert_eq!(primitive_code(&Signature::Short), Some('S'));
        assert_eq!(primitive_code(&Signature::Object("java/lang/Short".into())), None);
        assert_eq!(wrapper_class('C'), "java/lang/Character");
    }

    #[test]
    fn test_primitive_rejects_mismatched_values() {
        assert!(matches!(primitive('I', &Value::Int(3)), Ok(JValue::Int(3))));
        assert!(matches!(primitive('Z', &Value::Bool(true)), Ok(JValue::Bool(1))));
        assert!(matches!(primitive('D', &Value::Int(2)), Ok(JValue::Double(d)) if d == 2.0));
        assert!(primitive('I', &Value::from("text")).is_err());
        assert!(primitive('C', &Value::Char('😀')).is_err());
    }
}
