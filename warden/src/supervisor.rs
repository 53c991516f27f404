//! C6 — the VM lifecycle supervisor.
//!
//! Owns the full create -> start -> stop -> remove lifecycle, wiring the
//! SOCKS5 gateway into the hypervisor's guest networking and blocking on
//! the hypervisor's exit while it runs.

use std::sync::Arc;
use std::time::Duration;

use warden_shared::{PortForward, VmDescriptor};

use crate::gateway::supervisor::GatewaySupervisor;
use crate::hypervisor::DisplayMode;
use crate::notifier::FirewallNotifier;
use crate::{decision, descriptor_store, disk, enrich, hooks, hypervisor, paths, qmp};
use crate::{WardenError, WardenResult};

pub struct StartOptions {
    pub display: DisplayMode,
    pub run_hooks: bool,
    /// Bypass the firewall entirely: every connection is allowed and
    /// nothing is persisted or prompted.
    pub allow_all: bool,
    pub notifier: Arc<dyn FirewallNotifier>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            display: DisplayMode::Native,
            run_hooks: true,
            allow_all: false,
            notifier: Arc::new(crate::notifier::DenyAllNotifier),
        }
    }
}

#[derive(Debug)]
pub struct VmInfo {
    pub name: String,
    pub running: bool,
    pub descriptor: VmDescriptor,
}

pub struct VmSupervisor;

impl VmSupervisor {
    /// Create a new VM: overlay disk, efivars, descriptor, scripts dirs.
    /// Returns the assigned SSH port.
    pub async fn create(
        name: &str,
        base_name: &str,
        memory: u32,
        cpus: u8,
        ports: Vec<PortForward>,
        ssh_user: &str,
    ) -> WardenResult<u16> {
        if descriptor_store::exists(name)? {
            return Err(WardenError::AlreadyExists(format!("VM '{name}' already exists")));
        }

        let base_path = paths::base_path(base_name)?;
        if !base_path.exists() {
            return Err(WardenError::NotFound(format!("base image '{base_name}' not found")));
        }

        let ssh_port = descriptor_store::next_available_ssh_port()?;

        let mut descriptor = VmDescriptor::new(base_name, ssh_port);
        descriptor.memory = memory;
        descriptor.cpus = cpus;
        descriptor.ports = ports;
        descriptor.ssh_user = ssh_user.to_string();

        let vm_dir = paths::vm_dir(name)?;
        std::fs::create_dir_all(&vm_dir)?;
        descriptor_store::save(name, &descriptor)?;

        let disk_path = paths::vm_disk_path(name)?;
        let rel_base = paths::relative_backing_path(&base_path, &vm_dir)?;
        disk::create_overlay(&rel_base, &disk_path).await?;

        let efivars_path = paths::vm_efivars_path(name)?;
        disk::ensure_efivars(&efivars_path).await?;

        hooks::ensure_scripts_dirs(Some(name))?;

        Ok(ssh_port)
    }

    /// Delete a VM entirely. Refuses while it's running.
    pub fn remove(name: &str) -> WardenResult<()> {
        if !descriptor_store::exists(name)? {
            return Err(WardenError::NotFound(format!("VM '{name}' not found")));
        }
        if Self::is_running(name)? {
            return Err(WardenError::InvalidState(format!(
                "VM '{name}' is running, stop it first"
            )));
        }
        descriptor_store::remove_dir(name)
    }

    /// PID-file based liveness check. A PID file referring to a dead
    /// process is stale and is cleaned up here rather than left for the
    /// next caller to trip over.
    pub fn is_running(name: &str) -> WardenResult<bool> {
        let pid_path = paths::vm_pid_path(name)?;
        let Some(pid) = hypervisor::read_pid_file(&pid_path) else {
            return Ok(false);
        };

        if hypervisor::process_alive(pid) {
            return Ok(true);
        }

        let _ = std::fs::remove_file(&pid_path);
        let _ = std::fs::remove_file(paths::vm_qmp_path(name)?);
        Ok(false)
    }

    /// Start a VM in the foreground: blocks until the hypervisor exits.
    pub async fn start(name: &str, options: StartOptions) -> WardenResult<()> {
        if !descriptor_store::exists(name)? {
            return Err(WardenError::NotFound(format!("VM '{name}' not found")));
        }
        if Self::is_running(name)? {
            return Err(WardenError::InvalidState(format!("VM '{name}' is already running")));
        }

        let descriptor = descriptor_store::load(name)?;

        let proxy_port_path = paths::vm_proxy_port_path(name)?;
        let _ = std::fs::remove_file(&proxy_port_path);

        let decider = Arc::new(if options.allow_all {
            decision::Decider::AllowAll
        } else {
            decision::Decider::Engine(decision::DecisionEngine::new(options.notifier))
        });

        let gateway_supervisor = GatewaySupervisor::start(name, 0, decider).await?;
        let proxy_port = gateway_supervisor.port();
        std::fs::write(&proxy_port_path, proxy_port.to_string())?;

        // Proxy readiness: 5s budget, 100ms granularity, verified with a
        // real TCP probe (not just trusting the bind succeeded above).
        if !wait_for_proxy_ready(proxy_port, Duration::from_secs(5)).await {
            gateway_supervisor.stop().await;
            let _ = std::fs::remove_file(&proxy_port_path);
            return Err(WardenError::Internal("proxy failed to become ready".into()));
        }

        let qmp_path = paths::vm_qmp_path(name)?;
        let _ = std::fs::remove_file(&qmp_path);
        let efivars_path = paths::vm_efivars_path(name)?;
        disk::ensure_efivars(&efivars_path).await?;

        let disk_path = paths::vm_disk_path(name)?;
        let pid_path = paths::vm_pid_path(name)?;

        let spec = hypervisor::StartSpec {
            disk_path: &disk_path,
            efivars_path: &efivars_path,
            qmp_sock_path: &qmp_path,
            memory_mb: descriptor.memory,
            cpus: descriptor.cpus,
            ssh_port: descriptor.ssh_port,
            ports: &descriptor.ports,
            proxy_port,
            display: options.display,
        };

        let mut child = hypervisor::spawn(&spec).await?;
        if let Some(pid) = hypervisor::pid_of(&child) {
            std::fs::write(&pid_path, pid.to_string())?;
        }

        if options.run_hooks {
            if let Err(e) = hooks::run_boot_hooks(name, &descriptor.ssh_user).await {
                tracing::warn!(target: "warden::hooks", vm = name, error = %e, "error running boot hooks");
            }
        }

        // Block on hypervisor exit, with a 5s heartbeat checking gateway
        // health so a crashed gateway (after exhausting its own restarts)
        // is surfaced instead of silently leaving the VM with no network.
        loop {
            tokio::select! {
                status = child.wait() => {
                    tracing::info!(target: "warden::proxy", vm = name, ?status, "hypervisor exited");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    if !gateway_supervisor.is_alive() {
                        tracing::warn!(target: "warden::proxy", vm = name, "proxy appears down, VM has no internet");
                    }
                }
            }
        }

        gateway_supervisor.stop().await;
        enrich::clear_vm_state(name);
        let _ = std::fs::remove_file(&pid_path);
        let _ = std::fs::remove_file(&qmp_path);
        let _ = std::fs::remove_file(&proxy_port_path);

        Ok(())
    }

    /// Stop a running VM: graceful ACPI shutdown via QMP, escalating to
    /// `SIGKILL` after a 30s grace period (or immediately with `force`).
    pub async fn stop(name: &str, force: bool) -> WardenResult<()> {
        if !Self::is_running(name)? {
            return Err(WardenError::InvalidState(format!("VM '{name}' is not running")));
        }

        let pid_path = paths::vm_pid_path(name)?;
        let pid = hypervisor::read_pid_file(&pid_path)
            .ok_or_else(|| WardenError::Internal("PID file vanished mid-stop".into()))?;

        let mut force = force;

        if !force {
            let qmp_path = paths::vm_qmp_path(name)?;
            match qmp::QmpClient::connect(&qmp_path).await {
                Ok(mut client) => {
                    if client.system_powerdown().await.is_err() {
                        force = true;
                    } else {
                        let mut exited = false;
                        for _ in 0..30 {
                            if !hypervisor::process_alive(pid) {
                                exited = true;
                                break;
                            }
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        if !exited {
                            force = true;
                        }
                    }
                }
                Err(_) => force = true,
            }
        }

        if force && hypervisor::process_alive(pid) {
            // SAFETY: SIGKILL on a PID we just confirmed is alive and that
            // we own (it's our own hypervisor child).
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }

        let _ = std::fs::remove_file(paths::vm_proxy_port_path(name)?);
        let _ = std::fs::remove_file(&pid_path);
        let _ = std::fs::remove_file(paths::vm_qmp_path(name)?);

        Ok(())
    }

    pub fn add_port(name: &str, mapping: PortForward) -> WardenResult<()> {
        let mut descriptor = descriptor_store::load(name)?;
        if descriptor.ports.contains(&mapping) {
            return Err(WardenError::AlreadyExists(format!("port mapping '{mapping}' already exists")));
        }
        descriptor.ports.push(mapping);
        descriptor_store::save(name, &descriptor)
    }

    pub fn remove_port(name: &str, mapping: PortForward) -> WardenResult<()> {
        let mut descriptor = descriptor_store::load(name)?;
        let before = descriptor.ports.len();
        descriptor.ports.retain(|p| *p != mapping);
        if descriptor.ports.len() == before {
            return Err(WardenError::NotFound(format!("port mapping '{mapping}' not found")));
        }
        descriptor_store::save(name, &descriptor)
    }

    pub fn info(name: &str) -> WardenResult<VmInfo> {
        let descriptor = descriptor_store::load(name)?;
        let running = Self::is_running(name)?;
        Ok(VmInfo {
            name: name.to_string(),
            running,
            descriptor,
        })
    }
}

async fn wait_for_proxy_ready(port: u16, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    static ENV_LOCK: StdMutex<()> = StdMutex::new(());

    struct HomeGuard {
        _tmp: tempfile::TempDir,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    fn isolated_home() -> HomeGuard {
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var(paths::ENV_HOME, tmp.path());
        }
        HomeGuard {
            _tmp: tmp,
            _lock: lock,
        }
    }

    #[test]
    fn create_rejects_missing_base_image() {
        let _home = isolated_home();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(VmSupervisor::create(
            "v1",
            "nonexistent-base",
            2048,
            2,
            Vec::new(),
            "ubuntu",
        ));
        assert!(matches!(result, Err(WardenError::NotFound(_))));
    }

    #[test]
    fn is_running_false_when_no_pid_file() {
        let _home = isolated_home();
        descriptor_store::save("v1", &VmDescriptor::new("jammy", 2222)).unwrap();
        assert!(!VmSupervisor::is_running("v1").unwrap());
    }

    #[test]
    fn is_running_cleans_up_stale_pid_file() {
        let _home = isolated_home();
        descriptor_store::save("v1", &VmDescriptor::new("jammy", 2222)).unwrap();
        let pid_path = paths::vm_pid_path("v1").unwrap();
        // A PID essentially guaranteed not to be alive in the test sandbox.
        std::fs::write(&pid_path, "999999").unwrap();
        assert!(!VmSupervisor::is_running("v1").unwrap());
        assert!(!pid_path.exists());
    }

    #[test]
    fn add_port_then_remove_port_round_trips() {
        let _home = isolated_home();
        descriptor_store::save("v1", &VmDescriptor::new("jammy", 2222)).unwrap();
        let mapping = PortForward::new(8080, 80);
        VmSupervisor::add_port("v1", mapping).unwrap();
        assert_eq!(descriptor_store::load("v1").unwrap().ports, vec![mapping]);

        VmSupervisor::remove_port("v1", mapping).unwrap();
        assert!(descriptor_store::load("v1").unwrap().ports.is_empty());
    }

    #[test]
    fn add_duplicate_port_is_rejected() {
        let _home = isolated_home();
        descriptor_store::save("v1", &VmDescriptor::new("jammy", 2222)).unwrap();
        let mapping = PortForward::new(8080, 80);
        VmSupervisor::add_port("v1", mapping).unwrap();
        assert!(matches!(
            VmSupervisor::add_port("v1", mapping),
            Err(WardenError::AlreadyExists(_))
        ));
    }

    #[test]
    fn remove_refuses_while_running() {
        let _home = isolated_home();
        descriptor_store::save("v1", &VmDescriptor::new("jammy", 2222)).unwrap();
        std::fs::write(paths::vm_pid_path("v1").unwrap(), std::process::id().to_string()).unwrap();
        assert!(matches!(VmSupervisor::remove("v1"), Err(WardenError::InvalidState(_))));
    }
}
