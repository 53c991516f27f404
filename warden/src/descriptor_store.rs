//! On-disk VM descriptor store: `vms/<name>/vm.toml`.
//!
//! Every mutation is a write-to-tempfile-then-rename so a reader never
//! observes a partial write. This is the layer [`crate::policy`] (C1) is
//! built directly on top of.

use std::io::Write;

use warden_shared::VmDescriptor;

use crate::paths;
use crate::{WardenError, WardenResult};

/// Load a VM's descriptor. Errors with [`WardenError::NotFound`] if the VM
/// doesn't exist.
pub fn load(name: &str) -> WardenResult<VmDescriptor> {
    let path = paths::vm_config_path(name)?;
    if !path.exists() {
        return Err(WardenError::NotFound(format!("VM '{name}' not found")));
    }
    let text = std::fs::read_to_string(&path)?;
    toml::from_str(&text)
        .map_err(|e| WardenError::Config(format!("malformed descriptor for '{name}': {e}")))
}

/// Atomically overwrite a VM's descriptor.
pub fn save(name: &str, descriptor: &VmDescriptor) -> WardenResult<()> {
    let path = paths::vm_config_path(name)?;
    let parent = path
        .parent()
        .ok_or_else(|| WardenError::Internal("descriptor path has no parent".into()))?;
    std::fs::create_dir_all(parent)?;

    let text = toml::to_string_pretty(descriptor)
        .map_err(|e| WardenError::Internal(format!("failed to serialize descriptor: {e}")))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(text.as_bytes())?;
    tmp.flush()?;
    tmp.persist(&path)
        .map_err(|e| WardenError::Io(e.error))?;
    Ok(())
}

/// True iff a descriptor exists for `name`.
pub fn exists(name: &str) -> WardenResult<bool> {
    Ok(paths::vm_config_path(name)?.exists())
}

/// List every VM with a valid descriptor, sorted by name.
pub fn list() -> WardenResult<Vec<String>> {
    let dir = paths::vms_dir()?;
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().join("vm.toml").exists() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Delete a VM's entire directory. Caller is responsible for checking it
/// isn't running first.
pub fn remove_dir(name: &str) -> WardenResult<()> {
    let dir = paths::vm_dir(name)?;
    if !dir.exists() {
        return Err(WardenError::NotFound(format!("VM '{name}' not found")));
    }
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

/// Pick the lowest SSH port at or above 2222 not already used by any
/// existing descriptor.
pub fn next_available_ssh_port() -> WardenResult<u16> {
    let used: std::collections::HashSet<u16> = list()?
        .iter()
        .filter_map(|name| load(name).ok())
        .map(|d| d.ssh_port)
        .collect();

    let mut candidate: u16 = 2222;
    loop {
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
        candidate = candidate.checked_add(1).ok_or_else(|| {
            WardenError::Internal("exhausted the u16 port space looking for an SSH port".into())
        })?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // $WARDEN_HOME is process-global env state; serialize tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

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
    fn round_trip_preserves_exact_values() {
        let _home = isolated_home();
        let mut desc = VmDescriptor::new("jammy", 2222);
        desc.ports.push("8080:80".parse().unwrap());
        desc.ports.push("2022:22".parse().unwrap());
        desc.firewall.insert(
            "140.82.121.4:443".to_string(),
            warden_shared::FirewallDecision::Allow,
        );

        save("v1", &desc).unwrap();
        let loaded = load("v1").unwrap();

        assert_eq!(loaded.base, "jammy");
        assert_eq!(loaded.ssh_port, 2222);
        assert_eq!(loaded.ports, desc.ports, "port forwards must stay ordered");
        assert_eq!(loaded.firewall, desc.firewall);
    }

    #[test]
    fn next_ssh_port_skips_used_ports() {
        let _home = isolated_home();
        save("a", &VmDescriptor::new("jammy", 2222)).unwrap();
        save("b", &VmDescriptor::new("jammy", 2223)).unwrap();

        let next = next_available_ssh_port().unwrap();
        assert_eq!(next, 2224);
    }

    #[test]
    fn next_ssh_port_fills_gaps() {
        let _home = isolated_home();
        save("a", &VmDescriptor::new("jammy", 2222)).unwrap();
        save("b", &VmDescriptor::new("jammy", 2224)).unwrap();

        let next = next_available_ssh_port().unwrap();
        assert_eq!(next, 2223);
    }

    #[test]
    fn load_missing_vm_is_not_found() {
        let _home = isolated_home();
        assert!(matches!(load("nope"), Err(WardenError::NotFound(_))));
    }
}
