//! §4.10 — the hook runner.
//!
//! Hook scripts live in three merged sources — built into warden, the
//! user's global scripts directory, and the VM's own — and run on the host
//! (not inside the guest); scripts reach the guest themselves over SSH
//! using the environment variables this module injects.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use warden_shared::VmDescriptor;

use crate::paths::scripts::HOOK_TYPES;
use crate::{descriptor_store, paths, ssh};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSource {
    Builtin,
    User,
    Vm,
}

impl HookSource {
    fn label(self) -> &'static str {
        match self {
            HookSource::Builtin => "warden",
            HookSource::User => "user",
            HookSource::Vm => "vm",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HookResult {
    pub source: HookSource,
    pub script_name: String,
    pub success: bool,
    pub message: String,
}

fn builtin_scripts_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scripts")
}

fn scripts_in_dir(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut scripts: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sh"))
        .collect();
    scripts.sort();
    scripts
}

/// Merge the three hook sources in fixed order: builtin, then user-global,
/// then per-vm, alphabetical within each.
pub fn hook_scripts(vm_name: &str, hook_type: &str) -> crate::WardenResult<Vec<(HookSource, PathBuf)>> {
    if !HOOK_TYPES.contains(&hook_type) {
        return Err(crate::WardenError::Config(format!(
            "invalid hook type '{hook_type}', must be one of {HOOK_TYPES:?}"
        )));
    }

    let mut scripts = Vec::new();
    for (source, dir) in [
        (HookSource::Builtin, builtin_scripts_dir().join(hook_type)),
        (HookSource::User, paths::scripts::user_scripts_dir()?.join(hook_type)),
        (HookSource::Vm, paths::scripts::vm_scripts_dir(vm_name)?.join(hook_type)),
    ] {
        for script in scripts_in_dir(&dir) {
            scripts.push((source, script));
        }
    }
    Ok(scripts)
}

/// Run every script for one hook type, in order, tolerating individual
/// failures (a failed script does not stop the rest from running).
pub async fn run_hook_scripts(
    vm_name: &str,
    hook_type: &str,
    ssh_user: &str,
    timeout_per_script: Duration,
) -> crate::WardenResult<Vec<HookResult>> {
    let scripts = hook_scripts(vm_name, hook_type)?;
    if scripts.is_empty() {
        return Ok(Vec::new());
    }

    let descriptor = descriptor_store::load(vm_name)?;
    let ssh_port = descriptor.ssh_port;

    if hook_type == "initial-boot" || hook_type == "boot" {
        tracing::info!(target: "warden::hooks", vm = vm_name, port = ssh_port, "waiting for SSH");
        if !ssh::wait_for_ssh("127.0.0.1", ssh_port, ssh_user, Duration::from_secs(120)).await {
            return Ok(vec![HookResult {
                source: HookSource::Builtin,
                script_name: String::new(),
                success: false,
                message: "SSH not available after 120 seconds".to_string(),
            }]);
        }
    }

    let mut results = Vec::new();
    for (source, script_path) in scripts {
        let script_name = script_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::info!(
            target: "warden::hooks",
            vm = vm_name, hook_type, script = %script_name, source = source.label(),
            "running hook"
        );

        let result = run_one_script(&script_path, vm_name, ssh_port, ssh_user, timeout_per_script).await;

        match &result {
            Ok(()) => {
                tracing::info!(target: "warden::hooks", vm = vm_name, script = %script_name, "hook completed");
                results.push(HookResult {
                    source,
                    script_name,
                    success: true,
                    message: String::new(),
                });
            }
            Err(message) => {
                tracing::warn!(target: "warden::hooks", vm = vm_name, script = %script_name, error = %message, "hook failed");
                results.push(HookResult {
                    source,
                    script_name,
                    success: false,
                    message: message.clone(),
                });
            }
        }
    }

    Ok(results)
}

async fn run_one_script(
    script_path: &Path,
    vm_name: &str,
    ssh_port: u16,
    ssh_user: &str,
    timeout: Duration,
) -> Result<(), String> {
    let parent = script_path.parent().unwrap_or(Path::new("."));

    let mut cmd = Command::new(script_path);
    cmd.current_dir(parent)
        .env("WARDEN_VM_NAME", vm_name)
        .env("WARDEN_SSH_PORT", ssh_port.to_string())
        .env("WARDEN_SSH_USER", ssh_user)
        .env("WARDEN_SSH_HOST", "127.0.0.1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| format!("failed to start script: {e}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err(format!("script timed out after {}s", timeout.as_secs())),
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        tracing::info!(target: "warden::hooks", "  {line}");
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        tracing::info!(target: "warden::hooks", "  {line}");
    }

    if !output.status.success() {
        return Err(format!("exit code {}", output.status.code().unwrap_or(-1)));
    }
    Ok(())
}

/// Run `initial-boot` (once) then `boot` for a VM that just started.
/// `initial-boot` is marked completed only when every script in it
/// succeeds; a partial failure leaves the flag unset so it retries on the
/// next boot.
pub async fn run_boot_hooks(vm_name: &str, ssh_user: &str) -> crate::WardenResult<()> {
    let descriptor = descriptor_store::load(vm_name)?;

    if !descriptor.first_boot_completed {
        let scripts = hook_scripts(vm_name, "initial-boot")?;
        if scripts.is_empty() {
            mark_first_boot_completed(vm_name, descriptor)?;
        } else {
            tracing::info!(target: "warden::hooks", vm = vm_name, "running initial-boot hooks");
            let results = run_hook_scripts(vm_name, "initial-boot", ssh_user, Duration::from_secs(300)).await?;
            if results.iter().all(|r| r.success) {
                let descriptor = descriptor_store::load(vm_name)?;
                mark_first_boot_completed(vm_name, descriptor)?;
                tracing::info!(target: "warden::hooks", vm = vm_name, "initial-boot completed");
            } else {
                let failed: Vec<_> = results.iter().filter(|r| !r.success).map(|r| r.script_name.clone()).collect();
                tracing::warn!(target: "warden::hooks", vm = vm_name, ?failed, "initial-boot had failures");
            }
        }
    }

    let scripts = hook_scripts(vm_name, "boot")?;
    if !scripts.is_empty() {
        tracing::info!(target: "warden::hooks", vm = vm_name, "running boot hooks");
        let results = run_hook_scripts(vm_name, "boot", ssh_user, Duration::from_secs(300)).await?;
        let failed: Vec<_> = results.iter().filter(|r| !r.success).map(|r| r.script_name.clone()).collect();
        if failed.is_empty() {
            tracing::info!(target: "warden::hooks", vm = vm_name, "boot hooks completed");
        } else {
            tracing::warn!(target: "warden::hooks", vm = vm_name, ?failed, "boot hooks had failures");
        }
    }

    Ok(())
}

fn mark_first_boot_completed(vm_name: &str, mut descriptor: VmDescriptor) -> crate::WardenResult<()> {
    descriptor.first_boot_completed = true;
    descriptor_store::save(vm_name, &descriptor)
}

/// Make sure the scripts directories for a VM (and the user-global ones)
/// exist, so an operator can `ls` or drop a script in without guesswork.
pub fn ensure_scripts_dirs(vm_name: Option<&str>) -> crate::WardenResult<()> {
    let user_dir = paths::scripts::user_scripts_dir()?;
    for hook_type in HOOK_TYPES {
        std::fs::create_dir_all(user_dir.join(hook_type))?;
    }
    if let Some(name) = vm_name {
        let vm_dir = paths::scripts::vm_scripts_dir(name)?;
        for hook_type in HOOK_TYPES {
            std::fs::create_dir_all(vm_dir.join(hook_type))?;
        }
    }
    Ok(())
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
    fn invalid_hook_type_is_rejected() {
        let _home = isolated_home();
        assert!(hook_scripts("v1", "shutdown").is_err());
    }

    #[test]
    fn merges_user_and_vm_scripts_alphabetically() {
        let _home = isolated_home();
        let user_dir = paths::scripts::user_scripts_dir().unwrap().join("boot");
        let vm_dir = paths::scripts::vm_scripts_dir("v1").unwrap().join("boot");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::create_dir_all(&vm_dir).unwrap();
        std::fs::write(user_dir.join("b_user.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(user_dir.join("a_user.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(vm_dir.join("a_vm.sh"), "#!/bin/sh\n").unwrap();

        let scripts = hook_scripts("v1", "boot").unwrap();
        let names: Vec<_> = scripts
            .iter()
            .map(|(_, p)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a_user.sh", "b_user.sh", "a_vm.sh"]);
    }

    #[tokio::test]
    async fn boot_hooks_are_noop_when_no_scripts_exist() {
        let _home = isolated_home();
        descriptor_store::save("v1", &VmDescriptor::new("jammy", 2222)).unwrap();
        run_boot_hooks("v1", "ubuntu").await.unwrap();
        let descriptor = descriptor_store::load("v1").unwrap();
        assert!(descriptor.first_boot_completed);
    }
}
