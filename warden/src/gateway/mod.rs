//! C5 — the per-VM SOCKS5 gateway.
//!
//! One [`Gateway`] per running VM: an accept loop that never blocks on
//! per-connection work (handshake, dial, relay, and the firewall decision
//! are all off in their own tasks), wrapped by [`supervisor`] for
//! crash-restart-with-backoff.

pub mod socks5;
pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};

use crate::decision::Decider;
use crate::{WardenError, WardenResult};

/// Mirrors the reference implementation's dedicated thread pool for
/// firewall checks: enough concurrency to keep several prompts in flight
/// without unbounded fan-out.
const DECISION_POOL_SIZE: usize = 4;

pub struct Gateway {
    vm_name: String,
    listener: TcpListener,
    port: u16,
    engine: Arc<Decider>,
    decision_pool: Arc<Semaphore>,
    stopping: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
}

impl Gateway {
    /// Bind to `port` on all interfaces (`port == 0` lets the OS assign
    /// one, used only on a VM's very first start — subsequent restarts
    /// must pass back the port chosen that time).
    pub async fn bind(vm_name: &str, port: u16, engine: Arc<Decider>) -> WardenResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| WardenError::Internal(format!("failed to bind SOCKS5 gateway: {e}")))?;
        let actual_port = listener.local_addr()?.port();

        tracing::info!(target: "warden::proxy", vm = vm_name, port = actual_port, "firewall proxy listening");

        Ok(Self {
            vm_name: vm_name.to_string(),
            listener,
            port: actual_port,
            engine,
            decision_pool: Arc::new(Semaphore::new(DECISION_POOL_SIZE)),
            stopping: Arc::new(AtomicBool::new(false)),
            stop_notify: Arc::new(Notify::new()),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the accept loop until [`Self::request_stop`] is called (or,
    /// outside of an intentional stop, until the listener itself errors —
    /// which the caller's supervisor treats as a crash worth restarting).
    pub async fn serve(&self) -> WardenResult<()> {
        loop {
            let accepted = tokio::select! {
                res = self.listener.accept() => res,
                _ = self.stop_notify.notified() => return Ok(()),
            };

            let (socket, _peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    if self.stopping.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    return Err(WardenError::Internal(format!("accept failed: {e}")));
                }
            };

            let vm_name = self.vm_name.clone();
            let engine = Arc::clone(&self.engine);
            let pool = Arc::clone(&self.decision_pool);

            tokio::spawn(async move {
                let outcome = socks5::handle_client(socket, &vm_name, engine, pool).await;
                if !outcome.dest.is_empty() {
                    tracing::debug!(
                        target: "warden::proxy",
                        vm = %vm_name,
                        dest = %outcome.dest,
                        port = outcome.port,
                        decision = ?outcome.decision,
                        "session closed"
                    );
                }
            });
        }
    }

    /// Signal the accept loop to stop. Setting the flag before waking the
    /// waiter means `serve()` always sees `stopping == true` if it happens
    /// to race the notification against a fresh `accept()`.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}
