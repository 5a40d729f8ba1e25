//! Letting runtime code call host objects through synthesized interfaces.
//!
//! A [`ProxyServer`] owns a runtime-side invocation queue and a worker thread.
//! [`ProxyServer::make_proxy`] asks the runtime for an object implementing a
//! set of interfaces whose calls land in that queue; the worker takes each
//! call, finds the host [`Invoker`] registered under the proxy's key, runs the
//! matching handler, and answers the caller. Every call is answered exactly
//! once, with a value or with a typed exception.

mod invoker;
mod table;

pub use invoker::{InvokeError, Invoker, MethodHandler};

use super::attach::{self, AttachGuard};
use super::conversion::{from_foreign, parse_method, to_foreign};
use super::error::{classes, panic_message, BridgeError, ForeignException, Result};
use super::release::GlobalRef;
use super::value::Value;
use super::vm::{EnvId, Handle, InvocationRequest};
use super::{Bridge, Shared};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use table::ManagedObjectTable;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// First delay after a failed take; doubles up to [`MAX_TAKE_BACKOFF`].
const TAKE_BACKOFF: Duration = Duration::from_millis(1);
const MAX_TAKE_BACKOFF: Duration = Duration::from_millis(100);
/// Consecutive failed takes after which the worker gives up.
const MAX_TAKE_FAILURES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Open,
    Closing,
    Closed,
}

/// A proxy object and the key its calls are routed by.
#[derive(Debug)]
pub struct ProxyHandle {
    proxy: GlobalRef,
    key: String,
}

impl ProxyHandle {
    pub fn handle(&self) -> Handle {
        self.proxy.handle()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Give up the reference without releasing it.
    pub fn into_global_ref(self) -> GlobalRef {
        self.proxy
    }
}

struct Worker {
    join: JoinHandle<()>,
    thread: ThreadId,
}

/// Serves calls made on proxies by runtime code.
pub struct ProxyServer {
    shared: Arc<Shared>,
    queue: GlobalRef,
    table: Arc<ManagedObjectTable>,
    state: Mutex<ServerState>,
    worker: Mutex<Option<Worker>>,
}

impl ProxyServer {
    /// Create the invocation queue and start the worker. Returns once the
    /// worker is attached and serving.
    pub fn open(bridge: &Bridge) -> Result<Self> {
        let shared = Arc::clone(&bridge.shared);
        let env = attach::current_env(&shared)?;
        let queue = GlobalRef::new(&shared, shared.backend.new_invocation_queue(env)?);
        let table = Arc::new(ManagedObjectTable::new());

        let (ready_tx, ready_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker_table = Arc::clone(&table);
        let queue_handle = queue.handle();
        let join = thread::Builder::new()
            .name("vmbridge-proxy-worker".to_string())
            .spawn(move || serve(worker_shared, queue_handle, worker_table, ready_tx))
            .map_err(|err| BridgeError::Internal(format!("failed to spawn proxy worker: {}", err)))?;
        let thread = join.thread().id();

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = join.join();
                return Err(err);
            }
            Err(_) => {
                let _ = join.join();
                return Err(BridgeError::Internal(
                    "proxy worker exited during startup".to_string(),
                ));
            }
        }
        debug!(queue = %queue_handle, "proxy server open");

        Ok(Self {
            shared,
            queue,
            table,
            state: Mutex::new(ServerState::Open),
            worker: Mutex::new(Some(Worker { join, thread })),
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Number of registered invokers still held by the host.
    pub fn live_invokers(&self) -> usize {
        self.table.len()
    }

    /// Synthesize a proxy implementing `interfaces` backed by `invoker`.
    ///
    /// The server only keeps a weak reference to `invoker`; once the caller
    /// drops it, calls through the proxy fail with `IllegalStateException`.
    /// The calling thread must be attached.
    pub fn make_proxy(
        &self,
        invoker: &Arc<Invoker>,
        interfaces: &[&str],
        class_loader: Option<&GlobalRef>,
    ) -> Result<ProxyHandle> {
        if self.state() != ServerState::Open {
            return Err(BridgeError::Misuse("the proxy server is closed".to_string()));
        }
        let env = attach::current_env(&self.shared)?;
        let key = Uuid::new_v4().to_string();
        let proxy = self.shared.backend.new_proxy(
            env,
            self.queue.handle(),
            interfaces,
            class_loader.map(GlobalRef::handle),
            &key,
        )?;
        self.table.register(key.clone(), invoker);
        Ok(ProxyHandle {
            proxy: GlobalRef::new(&self.shared, proxy),
            key,
        })
    }

    /// Close the queue and wait for the worker to exit. Later calls through
    /// any proxy of this server fail with the queue-closed exception.
    pub fn close(&self) -> Result<()> {
        let on_worker = self
            .worker
            .lock()
            .as_ref()
            .map_or(false, |worker| worker.thread == thread::current().id());
        if on_worker {
            return Err(BridgeError::Misuse(
                "a proxy server cannot be closed from its own worker".to_string(),
            ));
        }
        {
            let mut state = self.state.lock();
            if *state != ServerState::Open {
                return Ok(());
            }
            *state = ServerState::Closing;
        }

        // A stopped VM has already closed every queue.
        if self.shared.is_running() {
            match AttachGuard::new(&self.shared) {
                Ok(guard) => {
                    if let Err(exception) =
                        self.shared.backend.close_queue(guard.id(), self.queue.handle())
                    {
                        debug!(error = %exception, "invocation queue already closed");
                    }
                }
                Err(err) => debug!(error = %err, "VM stopped before the queue was closed"),
            }
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join.join().is_err() {
                error!("proxy worker panicked");
            }
        }
        *self.state.lock() = ServerState::Closed;
        debug!("proxy server closed");
        Ok(())
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close proxy server");
        }
    }
}

fn serve(
    shared: Arc<Shared>,
    queue: Handle,
    table: Arc<ManagedObjectTable>,
    ready: mpsc::Sender<Result<()>>,
) {
    let env = match attach::attach_thread(&shared, true) {
        Ok(env) => env,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut failures = 0;
    let mut backoff = TAKE_BACKOFF;
    while shared.vm_live() {
        let request = match shared.backend.take_request(env, queue) {
            Ok(request) => request,
            Err(exception) if exception.is_queue_closed() => break,
            Err(exception) => {
                if !shared.is_running() {
                    break;
                }
                failures += 1;
                if failures >= MAX_TAKE_FAILURES {
                    error!(error = %exception, failures, "proxy worker giving up on its queue");
                    break;
                }
                warn!(error = %exception, "failed to take proxy request");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_TAKE_BACKOFF);
                continue;
            }
        };
        failures = 0;
        backoff = TAKE_BACKOFF;

        let id = request.id;
        let response = dispatch(&shared, env, &table, request);
        if let Err(exception) = &response {
            debug!(request = id.as_raw(), error = %exception, "proxy call failed");
        }
        match shared.with_live_vm(|backend| backend.respond(env, queue, id, response)) {
            Some(Ok(())) => {}
            Some(Err(exception)) => {
                warn!(request = id.as_raw(), error = %exception, "failed to answer proxy call")
            }
            None => debug!(request = id.as_raw(), "VM is gone, dropping proxy answer"),
        }
    }

    if attach::is_attached(&shared) {
        let _ = attach::detach(&shared);
    }
    debug!("proxy worker exiting");
}

fn internal(err: BridgeError) -> ForeignException {
    ForeignException::runtime(err.to_string())
}

fn dispatch(
    shared: &Shared,
    env: EnvId,
    table: &ManagedObjectTable,
    request: InvocationRequest,
) -> std::result::Result<Value, ForeignException> {
    let InvocationRequest {
        proxy,
        method,
        args,
        ..
    } = request;
    let key = shared.backend.proxy_key(env, proxy).map_err(|cause| {
        ForeignException::runtime(format!("could not identify proxy {}", proxy)).with_cause(cause)
    })?;
    let invoker = table.lookup(&key).ok_or_else(|| {
        ForeignException::new(
            classes::ILLEGAL_STATE_EXCEPTION,
            "Could not find host handler for proxy",
        )
    })?;
    let handler = invoker.resolve(&method.name, args.len()).ok_or_else(|| {
        ForeignException::new(
            classes::NO_SUCH_METHOD_EXCEPTION,
            format!("{}.{}{}", method.interface, method.name, method.signature),
        )
    })?;

    let signature = parse_method(&method.signature).map_err(internal)?;
    if signature.params.len() != args.len() {
        return Err(ForeignException::runtime(format!(
            "{} expects {} argument(s), got {}",
            method.name,
            signature.params.len(),
            args.len()
        )));
    }
    let args = args
        .into_iter()
        .zip(&signature.params)
        .map(|(arg, param)| from_foreign(arg, param))
        .collect::<Result<Vec<_>>>()
        .map_err(internal)?;

    let value = match panic::catch_unwind(AssertUnwindSafe(|| handler(&args))) {
        Ok(Ok(value)) => value,
        Ok(Err(InvokeError::Foreign(exception))) => return Err(exception),
        Ok(Err(InvokeError::Host(message))) => return Err(ForeignException::runtime(message)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(method = %method.name, panic = %message, "proxy handler panicked");
            return Err(ForeignException::runtime(message));
        }
    };
    to_foreign(value, &signature.ret).map_err(internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::running_bridge;
    use crate::runtime::vm::{LocalVm, MethodDescriptor, RequestId, VmBackend};
    use std::time::Instant;

    const CALLABLE: &str = "java/util/concurrent/Callable";
    const CALL_SIG: &str = "()Ljava/lang/Object;";

    fn callable(reply: &'static str) -> Arc<Invoker> {
        Arc::new(Invoker::new().method("call", 0, move |_| Ok(Value::from(reply))))
    }

    fn call(bridge: &Bridge, proxy: &ProxyHandle) -> Result<Value> {
        bridge
            .env()?
            .call_method(proxy.handle(), "call", CALL_SIG, vec![])
    }

    fn class_of(err: &BridgeError) -> &str {
        err.foreign().map(|e| e.class_name.as_str()).unwrap_or("")
    }

    #[test]
    fn test_callable_proxy_returns_invoker_value() {
        let (vm, bridge) = running_bridge(true);
        let server = bridge.open_proxy_server().unwrap();
        let invoker = callable("Hello");
        let proxy = server.make_proxy(&invoker, &[CALLABLE], None).unwrap();
        let env = bridge.env().unwrap();
        assert!(env.is_instance_of(proxy.handle(), CALLABLE).unwrap());
        assert_eq!(vm.proxy_key(env.id(), proxy.handle()).unwrap(), proxy.key());
        drop(env);

        assert_eq!(call(&bridge, &proxy).unwrap(), Value::from("Hello"));
        assert_eq!(call(&bridge, &proxy).unwrap(), Value::from("Hello"));

        drop(invoker);
        let err = call(&bridge, &proxy).unwrap_err();
        assert_eq!(class_of(&err), classes::ILLEGAL_STATE_EXCEPTION);
        assert!(err.to_string().contains("Could not find host handler"));

        drop(proxy);
        server.close().unwrap();
        bridge.kill().unwrap();
    }

    #[test]
    fn test_call_after_close_fails_without_hanging() {
        let (_vm, bridge) = running_bridge(true);
        let server = bridge.open_proxy_server().unwrap();
        let invoker = callable("Hello");
        let proxy = server.make_proxy(&invoker, &[CALLABLE], None).unwrap();
        server.close().unwrap();
        assert_eq!(server.state(), ServerState::Closed);
        // Closing again is a no-op.
        server.close().unwrap();

        let err = call(&bridge, &proxy).unwrap_err();
        assert!(err.foreign().unwrap().is_queue_closed());
        assert!(matches!(
            server.make_proxy(&invoker, &[CALLABLE], None),
            Err(BridgeError::Misuse(_))
        ));
        drop(proxy);
        drop(server);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_missing_method_is_reported() {
        let (_vm, bridge) = running_bridge(true);
        let server = bridge.open_proxy_server().unwrap();
        let invoker = callable("unused");
        let proxy = server
            .make_proxy(&invoker, &["java/lang/Runnable"], None)
            .unwrap();
        let err = bridge
            .env()
            .unwrap()
            .call_method(proxy.handle(), "run", "()V", vec![])
            .unwrap_err();
        assert_eq!(class_of(&err), classes::NO_SUCH_METHOD_EXCEPTION);
        assert!(err.to_string().contains("java/lang/Runnable.run()V"));
        drop(proxy);
        drop(server);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_arguments_and_return_are_converted() {
        let (vm, bridge) = running_bridge(true);
        vm.define_interface("org/example/Adder", &[("add", "(II)I")]);
        let server = bridge.open_proxy_server().unwrap();
        let invoker = Arc::new(Invoker::new().method("add", 2, |args| {
            let a = args[0].as_i64().ok_or("first argument must be an int")?;
            let b = args[1].as_i64().ok_or("second argument must be an int")?;
            Ok(Value::from(a + b))
        }));
        let proxy = server
            .make_proxy(&invoker, &["org/example/Adder"], None)
            .unwrap();
        let env = bridge.env().unwrap();
        let sum = env
            .call_method(proxy.handle(), "add", "(II)I", vec![2.into(), 3.into()])
            .unwrap();
        assert_eq!(sum, Value::Int(5));

        // A result outside the declared return type is a runtime exception.
        let overflow = env
            .call_method(proxy.handle(), "add", "(II)I", vec![i32::MAX.into(), 1.into()])
            .unwrap_err();
        assert_eq!(class_of(&overflow), classes::RUNTIME_EXCEPTION);
        drop(env);
        drop(proxy);
        drop(server);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_host_and_foreign_failures_are_distinguished() {
        let (_vm, bridge) = running_bridge(true);
        let server = bridge.open_proxy_server().unwrap();
        let host = Arc::new(Invoker::new().method("call", 0, |_| Err("host failure".into())));
        let foreign = Arc::new(Invoker::new().method("call", 0, |_| {
            Err(ForeignException::new("java/io/IOException", "disk full").into())
        }));
        let panicking = Arc::new(Invoker::new().method("call", 0, |_| panic!("handler exploded")));

        let host_proxy = server.make_proxy(&host, &[CALLABLE], None).unwrap();
        let err = call(&bridge, &host_proxy).unwrap_err();
        assert_eq!(class_of(&err), classes::RUNTIME_EXCEPTION);
        assert_eq!(err.foreign().unwrap().message(), "host failure");

        let foreign_proxy = server.make_proxy(&foreign, &[CALLABLE], None).unwrap();
        let err = call(&bridge, &foreign_proxy).unwrap_err();
        assert_eq!(class_of(&err), "java/io/IOException");
        assert_eq!(err.foreign().unwrap().message(), "disk full");

        let panic_proxy = server.make_proxy(&panicking, &[CALLABLE], None).unwrap();
        let err = call(&bridge, &panic_proxy).unwrap_err();
        assert_eq!(class_of(&err), classes::RUNTIME_EXCEPTION);
        assert_eq!(err.foreign().unwrap().message(), "handler exploded");

        // The worker keeps serving after every failure.
        let healthy = callable("still here");
        let ok_proxy = server.make_proxy(&healthy, &[CALLABLE], None).unwrap();
        assert_eq!(call(&bridge, &ok_proxy).unwrap(), Value::from("still here"));
        drop((host_proxy, foreign_proxy, panic_proxy, ok_proxy));
        drop(server);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_concurrent_callers() {
        let (_vm, bridge) = running_bridge(true);
        let server = bridge.open_proxy_server().unwrap();
        let invoker = Arc::new(Invoker::new().variadic("call", |_| {
            Ok(Value::from(format!("{:?}", thread::current().name())))
        }));
        let proxy = server.make_proxy(&invoker, &[CALLABLE], None).unwrap();
        let target = proxy.handle();

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let bridge = bridge.clone();
                thread::spawn(move || {
                    let guard = bridge.attach_guard().unwrap();
                    guard
                        .call_method(target, "call", CALL_SIG, vec![])
                        .unwrap()
                })
            })
            .collect();
        for caller in callers {
            assert_eq!(
                caller.join().unwrap(),
                Value::from("Some(\"vmbridge-proxy-worker\")")
            );
        }
        drop(proxy);
        drop(server);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_kill_with_open_server() {
        let (vm, bridge) = running_bridge(true);
        let server = bridge.open_proxy_server().unwrap();
        let invoker = callable("Hello");
        let proxy = server
            .make_proxy(&invoker, &[CALLABLE], Some(&bridge.env().unwrap().system_class_loader().unwrap()))
            .unwrap();
        bridge.kill().unwrap();
        assert!(vm.is_destroyed());
        drop(proxy);
        drop(server);
    }

    #[test]
    fn test_unidentified_proxy_is_a_runtime_exception() {
        let (_vm, bridge) = running_bridge(true);
        let env = bridge.env().unwrap();
        let loader = env.system_class_loader().unwrap();
        let request = InvocationRequest {
            id: RequestId::from_raw(1),
            proxy: loader.handle(),
            method: MethodDescriptor::new(CALLABLE, "call", CALL_SIG),
            args: vec![],
        };
        let err = dispatch(&bridge.shared, env.id(), &ManagedObjectTable::new(), request)
            .unwrap_err();
        assert_eq!(err.class_name, classes::RUNTIME_EXCEPTION);
        let cause = err.cause.as_deref().unwrap();
        assert_eq!(cause.class_name, "java/lang/IllegalArgumentException");
        drop(loader);
        drop(env);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_worker_backs_off_then_gives_up_on_broken_queue() {
        let (vm, bridge) = running_bridge(true);
        let loader = bridge.env().unwrap().system_class_loader().unwrap();
        let (ready_tx, ready_rx) = mpsc::channel();
        let shared = Arc::clone(&bridge.shared);
        let not_a_queue = loader.handle();
        let started = Instant::now();
        let worker = thread::spawn(move || {
            serve(shared, not_a_queue, Arc::new(ManagedObjectTable::new()), ready_tx)
        });
        ready_rx.recv().unwrap().unwrap();
        worker.join().unwrap();

        // 1 + 2 + 4 + ... + 64 ms of sleeps before the last failure.
        assert!(started.elapsed() >= Duration::from_millis(127));
        assert_eq!(vm.attached_threads(), 2);
        drop(loader);
        bridge.kill().unwrap();
    }

    #[test]
    fn test_open_requires_attached_thread() {
        let vm = Arc::new(LocalVm::new());
        let bridge = Bridge::new(vm);
        assert!(matches!(
            bridge.open_proxy_server(),
            Err(BridgeError::NotAttached)
        ));
    }
}
