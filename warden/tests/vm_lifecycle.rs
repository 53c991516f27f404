//! Exercises the parts of `VmSupervisor::create` that don't require a real
//! `qemu-img` binary or a valid backing image — the checks that run before
//! any overlay disk is touched.

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
        std::env::set_var("WARDEN_HOME", tmp.path());
    }
    HomeGuard {
        _tmp: tmp,
        _lock: lock,
    }
}

#[tokio::test]
async fn create_rejects_unknown_base_image() {
    let _home = isolated_home();

    let result = warden::VmSupervisor::create("v1", "no-such-base", 1024, 1, Vec::new(), "ubuntu").await;
    assert!(matches!(result, Err(warden::WardenError::NotFound(_))));
}

#[tokio::test]
async fn create_rejects_duplicate_name_before_touching_disk() {
    let _home = isolated_home();

    // Pre-seed a descriptor directly (bypassing the disk-creation path
    // entirely) so the duplicate-name check is exercised in isolation.
    warden::descriptor_store::save("dup", &warden::VmDescriptor::new("jammy", 2222)).unwrap();

    let result = warden::VmSupervisor::create("dup", "jammy", 1024, 1, Vec::new(), "ubuntu").await;
    assert!(matches!(result, Err(warden::WardenError::AlreadyExists(_))));
}

#[test]
fn info_reports_not_running_for_freshly_created_descriptor() {
    let _home = isolated_home();
    warden::descriptor_store::save("v2", &warden::VmDescriptor::new("jammy", 2222)).unwrap();

    let info = warden::VmSupervisor::info("v2").unwrap();
    assert!(!info.running);
    assert_eq!(info.descriptor.base, "jammy");
}

#[test]
fn remove_deletes_descriptor_and_vm_directory() {
    let _home = isolated_home();
    warden::descriptor_store::save("v3", &warden::VmDescriptor::new("jammy", 2222)).unwrap();
    assert!(warden::descriptor_store::exists("v3").unwrap());

    warden::VmSupervisor::remove("v3").unwrap();
    assert!(!warden::descriptor_store::exists("v3").unwrap());
}
