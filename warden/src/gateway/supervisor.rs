//! Crash-restart-with-backoff wrapper around [`super::Gateway`].
//!
//! Delays follow `1, 2, 4, 8, 10, 10, ...` seconds, capped at 10s, with a
//! hard ceiling of 5 restarts. An intentional stop (the supervisor asked
//! the gateway to shut down) never counts as a crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::decision::Decider;
use crate::gateway::Gateway;
use crate::WardenResult;

const MAX_RESTARTS: u32 = 5;

fn backoff_delay(attempt: u32) -> Duration {
    let secs = match attempt {
        0 => 1,
        1 => 2,
        2 => 4,
        3 => 8,
        _ => 10,
    };
    Duration::from_secs(secs)
}

pub struct GatewaySupervisor {
    vm_name: String,
    port: u16,
    engine: Arc<Decider>,
    current: tokio::sync::Mutex<Option<Arc<Gateway>>>,
    intentional_stop: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl GatewaySupervisor {
    pub async fn start(vm_name: &str, port: u16, engine: Arc<Decider>) -> WardenResult<Arc<Self>> {
        let gateway = Gateway::bind(vm_name, port, Arc::clone(&engine)).await?;
        let actual_port = gateway.port();

        let supervisor = Arc::new(Self {
            vm_name: vm_name.to_string(),
            port: actual_port,
            engine,
            current: tokio::sync::Mutex::new(Some(Arc::new(gateway))),
            intentional_stop: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
        });

        let task_supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            task_supervisor.run_loop().await;
        });

        Ok(supervisor)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `false` once `run_loop` has given up (exhausted its restart budget
    /// or failed to rebind) or after a graceful [`Self::stop`].
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn run_loop(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        loop {
            let gateway = {
                let guard = self.current.lock().await;
                match guard.as_ref() {
                    Some(g) => Arc::clone(g),
                    None => return,
                }
            };

            let result = gateway.serve().await;

            if self.intentional_stop.load(Ordering::SeqCst) {
                tracing::info!(target: "warden::proxy", vm = %self.vm_name, "gateway stopped intentionally");
                self.alive.store(false, Ordering::SeqCst);
                return;
            }

            if let Err(e) = result {
                attempt += 1;
                if attempt > MAX_RESTARTS {
                    tracing::error!(
                        target: "warden::proxy",
                        vm = %self.vm_name,
                        error = %e,
                        "gateway crashed too many times, giving up"
                    );
                    self.alive.store(false, Ordering::SeqCst);
                    return;
                }

                let delay = backoff_delay(attempt - 1);
                tracing::warn!(
                    target: "warden::proxy",
                    vm = %self.vm_name,
                    error = %e,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "gateway crashed, restarting"
                );
                tokio::time::sleep(delay).await;

                match Gateway::bind(&self.vm_name, self.port, Arc::clone(&self.engine)).await {
                    Ok(new_gateway) => {
                        let mut guard = self.current.lock().await;
                        *guard = Some(Arc::new(new_gateway));
                    }
                    Err(e) => {
                        tracing::error!(target: "warden::proxy", vm = %self.vm_name, error = %e, "failed to rebind after crash");
                        self.alive.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
        }
    }

    /// Graceful stop: mark this as intentional so `run_loop` doesn't treat
    /// the resulting accept error as a crash, then ask the live gateway to
    /// close its listener.
    pub async fn stop(&self) {
        self.intentional_stop.store(true, Ordering::SeqCst);
        let mut guard = self.current.lock().await;
        if let Some(gateway) = guard.take() {
            gateway.request_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_spec() {
        let delays: Vec<u64> = (0..7).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10, 10]);
    }

    #[tokio::test]
    async fn start_and_stop_round_trips() {
        let engine = Arc::new(Decider::Engine(crate::decision::DecisionEngine::new(Arc::new(crate::notifier::DenyAllNotifier))));
        let supervisor = GatewaySupervisor::start("v1", 0, engine).await.unwrap();
        assert!(supervisor.port() > 0);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn is_alive_flips_false_once_run_loop_observes_the_stop() {
        let engine = Arc::new(Decider::Engine(crate::decision::DecisionEngine::new(Arc::new(crate::notifier::DenyAllNotifier))));
        let supervisor = GatewaySupervisor::start("v2", 0, engine).await.unwrap();
        assert!(supervisor.is_alive());

        supervisor.stop().await;

        for _ in 0..50 {
            if !supervisor.is_alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("gateway supervisor did not report itself as stopped within 1s");
    }
}
