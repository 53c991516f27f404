//! C1 — the per-VM firewall rule store.
//!
//! Rules live inside the VM's own descriptor (`vm.toml`'s `[firewall]`
//! table), keyed by the canonical `"ip:port"` string built by [`rule_key`].
//! Every write goes through [`crate::descriptor_store::save`], so it
//! inherits the atomic tempfile-then-rename guarantee.

use warden_shared::FirewallDecision;

use crate::descriptor_store;
use crate::WardenResult;

/// Canonical rule-table key for a destination.
pub fn rule_key(dest_ip: &str, dest_port: u16) -> String {
    format!("{dest_ip}:{dest_port}")
}

/// Look up an existing decision for this VM/destination, if any.
pub fn lookup(vm_name: &str, dest_ip: &str, dest_port: u16) -> WardenResult<Option<FirewallDecision>> {
    let descriptor = descriptor_store::load(vm_name)?;
    Ok(descriptor.firewall.get(&rule_key(dest_ip, dest_port)).copied())
}

/// Record a decision for this VM/destination, overwriting any prior one.
pub fn insert(
    vm_name: &str,
    dest_ip: &str,
    dest_port: u16,
    decision: FirewallDecision,
) -> WardenResult<()> {
    let mut descriptor = descriptor_store::load(vm_name)?;
    descriptor
        .firewall
        .insert(rule_key(dest_ip, dest_port), decision);
    descriptor_store::save(vm_name, &descriptor)
}

/// All rules currently recorded for a VM, in `"ip:port"` -> decision form.
pub fn list(vm_name: &str) -> WardenResult<Vec<(String, FirewallDecision)>> {
    let descriptor = descriptor_store::load(vm_name)?;
    Ok(descriptor
        .firewall
        .into_iter()
        .collect())
}

/// Remove a single rule so the next connection is re-prompted.
pub fn delete(vm_name: &str, dest_ip: &str, dest_port: u16) -> WardenResult<bool> {
    let mut descriptor = descriptor_store::load(vm_name)?;
    let removed = descriptor.firewall.remove(&rule_key(dest_ip, dest_port)).is_some();
    if removed {
        descriptor_store::save(vm_name, &descriptor)?;
    }
    Ok(removed)
}

/// Wipe every rule for a VM, e.g. before reverting it to a clean base image.
pub fn clear(vm_name: &str) -> WardenResult<()> {
    let mut descriptor = descriptor_store::load(vm_name)?;
    descriptor.firewall.clear();
    descriptor_store::save(vm_name, &descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct HomeGuard {
        _tmp: tempfile::TempDir,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    fn isolated_home() -> HomeGuard {
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let tmp = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var(crate::paths::ENV_HOME, tmp.path());
        }
        descriptor_store::save("v1", &warden_shared::VmDescriptor::new("jammy", 2222)).unwrap();
        HomeGuard {
            _tmp: tmp,
            _lock: lock,
        }
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let _home = isolated_home();
        insert("v1", "140.82.121.4", 443, FirewallDecision::Allow).unwrap();
        let found = lookup("v1", "140.82.121.4", 443).unwrap();
        assert_eq!(found, Some(FirewallDecision::Allow));
    }

    #[test]
    fn lookup_missing_rule_is_none() {
        let _home = isolated_home();
        assert_eq!(lookup("v1", "1.2.3.4", 80).unwrap(), None);
    }

    #[test]
    fn delete_removes_rule_and_reports_whether_present() {
        let _home = isolated_home();
        insert("v1", "1.2.3.4", 80, FirewallDecision::Deny).unwrap();
        assert!(delete("v1", "1.2.3.4", 80).unwrap());
        assert!(!delete("v1", "1.2.3.4", 80).unwrap());
        assert_eq!(lookup("v1", "1.2.3.4", 80).unwrap(), None);
    }

    #[test]
    fn clear_empties_all_rules() {
        let _home = isolated_home();
        insert("v1", "1.2.3.4", 80, FirewallDecision::Allow).unwrap();
        insert("v1", "5.6.7.8", 443, FirewallDecision::Deny).unwrap();
        clear("v1").unwrap();
        assert!(list("v1").unwrap().is_empty());
    }
}
