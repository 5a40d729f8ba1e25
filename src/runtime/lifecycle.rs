//! Starting and stopping the VM.
//!
//! The VM is created, serviced and destroyed by a dedicated monitor thread,
//! which also serves as the privileged thread for the windowing subsystem.
//! The runtime's invocation interface supports a single VM creation per
//! process: once killed, a bridge can never start again.

use super::config::VmOptions;
use super::dispatch::run_pending;
use super::error::{BridgeError, Result};
use super::release::reap;
use super::{attach, Bridge, Shared, VmState};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

type InitSignalChannel = (mpsc::Sender<Result<()>>, mpsc::Receiver<Result<()>>);

pub(crate) struct MonitorThread {
    join: JoinHandle<()>,
    dead: mpsc::Receiver<()>,
}

impl Bridge {
    /// Start the VM and attach the calling thread.
    ///
    /// A no-op while the VM is running. Fails with `RuntimeNotFound` before
    /// any thread is spawned when no runtime installation is available, and
    /// with `AlreadyStopped` once the VM has been killed.
    pub fn start(&self, options: VmOptions) -> Result<()> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock();
        match shared.state() {
            VmState::Running => return Ok(()),
            VmState::Stopping | VmState::Stopped => return Err(BridgeError::AlreadyStopped),
            VmState::Unstarted | VmState::Starting => {}
        }

        let args = options.to_vm_args()?;
        let home = shared.backend.locate()?;
        info!(home = %home.display(), options = ?args, "starting VM");

        shared.headless.store(options.headless, Ordering::SeqCst);
        shared.set_state(VmState::Starting);

        let (init_tx, init_rx): InitSignalChannel = mpsc::channel();
        let (dead_tx, dead_rx) = mpsc::channel();
        let monitor_shared = Arc::clone(shared);
        let join = thread::Builder::new()
            .name("vmbridge-monitor".to_string())
            .spawn(move || monitor_main(monitor_shared, args, init_tx, dead_tx))
            .map_err(|err| {
                shared.set_state(VmState::Stopped);
                BridgeError::StartFailed(format!("failed to spawn monitor thread: {}", err))
            })?;

        let started = match init_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(BridgeError::StartFailed(
                "monitor thread exited during startup".to_string(),
            )),
        };
        if let Err(err) = started {
            if join.join().is_err() {
                error!("monitor thread panicked during startup");
            }
            shared.set_state(VmState::Stopped);
            return Err(match err {
                BridgeError::AlreadyStopped | BridgeError::StartFailed(_) => err,
                other => BridgeError::StartFailed(other.to_string()),
            });
        }

        *shared.monitor.lock() = Some(MonitorThread {
            join,
            dead: dead_rx,
        });
        shared.set_state(VmState::Running);
        attach::attach_thread(shared, true)?;
        info!(bridge = shared.id, "VM running");
        Ok(())
    }

    /// Start the VM for the lifetime of the returned guard.
    pub fn scoped(&self, options: VmOptions) -> Result<VmGuard> {
        self.start(options)?;
        Ok(VmGuard {
            bridge: self.clone(),
        })
    }

    /// Stop the VM and wait for the monitor thread to exit.
    ///
    /// Idempotent once stopped. Closes any open windows, detaches the calling
    /// thread completely, and fails with `Misuse` on the monitor thread.
    pub fn kill(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.is_main_thread() {
            return Err(BridgeError::Misuse(
                "kill() cannot run on the VM's main thread".to_string(),
            ));
        }
        let _lifecycle = shared.lifecycle.lock();
        match shared.state() {
            VmState::Stopped => return Ok(()),
            VmState::Unstarted => {
                shared.set_state(VmState::Stopped);
                return Ok(());
            }
            _ => {}
        }

        if let Err(err) = self.deactivate_ui() {
            warn!(error = %err, "failed to close windows before shutdown");
        }
        attach::force_detach(shared);

        shared.set_state(VmState::Stopping);
        shared.kill.store(true, Ordering::SeqCst);
        shared.wake.set();

        let monitor = shared.monitor.lock().take();
        if let Some(monitor) = monitor {
            if monitor.dead.recv().is_err() {
                warn!("monitor thread exited without signalling shutdown");
            }
            if monitor.join.join().is_err() {
                error!("monitor thread panicked during shutdown");
            }
        }
        shared.set_state(VmState::Stopped);
        info!(bridge = shared.id, "VM stopped");
        Ok(())
    }
}

fn monitor_main(
    shared: Arc<Shared>,
    args: Vec<String>,
    init_tx: mpsc::Sender<Result<()>>,
    dead_tx: mpsc::Sender<()>,
) {
    let _ = shared.main_thread.set(thread::current().id());

    if let Err(err) = shared.backend.create_vm(&args) {
        error!(error = %err, "VM creation failed");
        let _ = init_tx.send(Err(err));
        return;
    }
    *shared.vm_live.write() = true;
    if let Err(err) = attach::attach_thread(&shared, false) {
        error!(error = %err, "monitor thread failed to attach");
        destroy(&shared);
        let _ = init_tx.send(Err(err));
        return;
    }
    let _ = init_tx.send(Ok(()));

    loop {
        shared.wake.wait();
        let released = reap(&shared);
        let ran = run_pending(&shared);
        if released + ran > 0 {
            debug!(released, ran, "monitor wake cycle");
        }
        if shared.kill.load(Ordering::SeqCst) {
            break;
        }
    }

    let dropped = shared.closures.close();
    if dropped > 0 {
        warn!(dropped, "closures discarded at VM shutdown");
    }
    let leaked = shared.releases.close();
    for handle in &leaked {
        if let Err(err) = shared.backend.release(*handle) {
            debug!(%handle, error = %err, "release during shutdown failed");
        }
    }
    if !leaked.is_empty() {
        warn!(count = leaked.len(), "references still pending release at VM shutdown");
    }

    attach::force_detach(&shared);
    destroy(&shared);
    let _ = dead_tx.send(());
}

/// Close the liveness gate and destroy the VM. Releases and detaches issued
/// by other threads from now on are abandoned.
fn destroy(shared: &Shared) {
    let mut live = shared.vm_live.write();
    *live = false;
    if let Err(err) = shared.backend.destroy_vm() {
        error!(error = %err, "failed to destroy VM");
    }
}

/// Keeps the VM running until dropped, then kills it.
pub struct VmGuard {
    bridge: Bridge,
}

impl VmGuard {
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }
}

impl Drop for VmGuard {
    fn drop(&mut self) {
        if let Err(err) = self.bridge.kill() {
            error!(error = %err, "failed to stop VM");
        }
    }
}
