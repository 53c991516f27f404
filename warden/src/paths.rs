//! Path and directory layout under `$WARDEN_HOME` (default `~/.warden`).
//!
//! Mirrors the teacher's `runtime::constants` pattern: one place that knows
//! every on-disk path so the rest of the crate never hardcodes a join.

use std::path::{Path, PathBuf};

use crate::WardenResult;

pub const ENV_HOME: &str = "WARDEN_HOME";

/// Guest-visible proxy endpoint. `10.0.2.2` is the hypervisor's NAT gateway
/// address and is reserved; `10.0.2.100` is used instead.
pub const GUEST_PROXY_IP: &str = "10.0.2.100";
pub const GUEST_PROXY_PORT: u16 = 1080;

pub const DEFAULT_RULES_FILENAME: &str = "default-firewall-rules.conf";

/// Return `$WARDEN_HOME`, creating it if necessary. Defaults to `~/.warden`.
pub fn warden_home() -> WardenResult<PathBuf> {
    let home = match std::env::var_os(ENV_HOME) {
        Some(val) => PathBuf::from(val),
        None => dirs::home_dir()
            .ok_or_else(|| crate::WardenError::Config("could not determine home directory".into()))?
            .join(".warden"),
    };
    std::fs::create_dir_all(&home)?;
    Ok(home)
}

pub fn bases_dir() -> WardenResult<PathBuf> {
    let dir = warden_home()?.join("bases");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn vms_dir() -> WardenResult<PathBuf> {
    let dir = warden_home()?.join("vms");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn vm_dir(name: &str) -> WardenResult<PathBuf> {
    Ok(vms_dir()?.join(name))
}

pub fn vm_config_path(name: &str) -> WardenResult<PathBuf> {
    Ok(vm_dir(name)?.join("vm.toml"))
}

pub fn vm_disk_path(name: &str) -> WardenResult<PathBuf> {
    Ok(vm_dir(name)?.join("disk.qcow2"))
}

pub fn vm_pid_path(name: &str) -> WardenResult<PathBuf> {
    Ok(vm_dir(name)?.join("pid"))
}

pub fn vm_qmp_path(name: &str) -> WardenResult<PathBuf> {
    Ok(vm_dir(name)?.join("qmp.sock"))
}

pub fn vm_efivars_path(name: &str) -> WardenResult<PathBuf> {
    Ok(vm_dir(name)?.join("efivars.fd"))
}

pub fn vm_proxy_port_path(name: &str) -> WardenResult<PathBuf> {
    Ok(vm_dir(name)?.join("proxy_port"))
}

pub fn base_path(name: &str) -> WardenResult<PathBuf> {
    Ok(bases_dir()?.join(format!("{name}.qcow2")))
}

pub fn default_rules_path() -> WardenResult<PathBuf> {
    Ok(warden_home()?.join(DEFAULT_RULES_FILENAME))
}

/// Scripts directories, merged crate-builtin -> user-global -> per-vm.
pub mod scripts {
    use super::*;

    pub const HOOK_TYPES: [&str; 3] = ["create", "initial-boot", "boot"];

    pub fn user_scripts_dir() -> WardenResult<PathBuf> {
        Ok(warden_home()?.join("scripts"))
    }

    pub fn vm_scripts_dir(name: &str) -> WardenResult<PathBuf> {
        Ok(vm_dir(name)?.join("scripts"))
    }
}

/// Compute `backing.relative_to(overlay_parent)` for a qcow2 backing-file
/// pointer that must survive the VM directory being moved.
pub fn relative_backing_path(backing: &Path, overlay_parent: &Path) -> WardenResult<PathBuf> {
    pathdiff(backing, overlay_parent).ok_or_else(|| {
        crate::WardenError::Internal(format!(
            "could not compute relative path from {} to {}",
            overlay_parent.display(),
            backing.display()
        ))
    })
}

/// Minimal relative-path diff (no external dependency): both inputs must be
/// absolute and share some common ancestor, which is always true here since
/// both live under `$WARDEN_HOME`.
fn pathdiff(target: &Path, base: &Path) -> Option<PathBuf> {
    let target = target.canonicalize().ok()?;
    let base = base.canonicalize().ok()?;

    let mut target_comps: Vec<_> = target.components().collect();
    let mut base_comps: Vec<_> = base.components().collect();

    let mut common = 0;
    while common < target_comps.len()
        && common < base_comps.len()
        && target_comps[common] == base_comps[common]
    {
        common += 1;
    }

    target_comps.drain(..common);
    base_comps.drain(..common);

    let mut result = PathBuf::new();
    for _ in base_comps {
        result.push("..");
    }
    for comp in target_comps {
        result.push(comp.as_os_str());
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_backing_path_walks_up_and_back_down() {
        let tmp = tempfile::tempdir().unwrap();
        let bases = tmp.path().join("bases");
        let vms = tmp.path().join("vms").join("v1");
        std::fs::create_dir_all(&bases).unwrap();
        std::fs::create_dir_all(&vms).unwrap();
        let base_file = bases.join("jammy.qcow2");
        std::fs::write(&base_file, b"").unwrap();

        let rel = relative_backing_path(&base_file, &vms).unwrap();
        assert_eq!(rel, PathBuf::from("../../bases/jammy.qcow2"));
    }
}
