//! The hypervisor child process: argv construction and spawn.
//!
//! The hypervisor itself is opaque — this module only knows how to build
//! its command line and hand back a handle. Everything about what's
//! actually running inside is out of this crate's concerns.

use std::path::{Path, PathBuf};

use tokio::process::{Child, Command};
use warden_shared::PortForward;

use crate::paths::{GUEST_PROXY_IP, GUEST_PROXY_PORT};
use crate::{disk, WardenResult};

pub enum DisplayMode {
    /// Host-native window (`cocoa` on macOS).
    Native,
    /// No display device, serial/console only.
    Headless,
}

impl DisplayMode {
    fn qemu_arg(&self) -> &'static str {
        match self {
            DisplayMode::Native => "cocoa",
            DisplayMode::Headless => "none",
        }
    }
}

pub struct StartSpec<'a> {
    pub disk_path: &'a Path,
    pub efivars_path: &'a Path,
    pub qmp_sock_path: &'a Path,
    pub memory_mb: u32,
    pub cpus: u8,
    pub ssh_port: u16,
    pub ports: &'a [PortForward],
    /// Host port the SOCKS5 gateway is bound to; wired as a `guestfwd` so
    /// the guest can reach it at `10.0.2.100:1080` without knowing the real
    /// host-side port.
    pub proxy_port: u16,
    pub display: DisplayMode,
}

/// Build the full `qemu-system-aarch64` argv for one VM start, then spawn
/// it. The returned `Child` must be waited on by the caller (the
/// supervisor's foreground thread blocks on its exit).
pub async fn spawn(spec: &StartSpec<'_>) -> WardenResult<Child> {
    let qemu_system = disk::qemu_system_binary()?;
    let firmware = disk::find_firmware_code()?;

    let mut netdev = format!("user,id=net0,hostfwd=tcp::{}-:22", spec.ssh_port);
    for port in spec.ports {
        netdev.push_str(&format!(",hostfwd=tcp::{}-:{}", port.host, port.guest));
    }
    netdev.push_str(&format!(
        ",guestfwd=tcp:{GUEST_PROXY_IP}:{GUEST_PROXY_PORT}-tcp:127.0.0.1:{}",
        spec.proxy_port
    ));

    let mut cmd = Command::new(&qemu_system);
    cmd.args(["-accel", "hvf"])
        .args(["-machine", "virt"])
        .args(["-cpu", "host"])
        .args(["-m", &spec.memory_mb.to_string()])
        .args(["-smp", &spec.cpus.to_string()])
        .arg("-drive")
        .arg(format!("if=pflash,format=raw,readonly=on,file={}", firmware.display()))
        .arg("-drive")
        .arg(format!("if=pflash,format=raw,snapshot=on,file={}", spec.efivars_path.display()))
        .arg("-drive")
        .arg(format!("if=virtio,format=qcow2,file={}", spec.disk_path.display()))
        .args(["-device", "qemu-xhci"])
        .args(["-device", "usb-kbd"])
        .args(["-device", "usb-tablet"])
        .args(["-device", "virtio-gpu-pci"])
        .args(["-device", "virtio-net-pci,netdev=net0"])
        .arg("-netdev")
        .arg(netdev)
        .arg("-qmp")
        .arg(format!("unix:{},server,nowait", spec.qmp_sock_path.display()))
        .arg(match spec.display {
            DisplayMode::Headless => "-nographic",
            DisplayMode::Native => "-display",
        });

    if matches!(spec.display, DisplayMode::Native) {
        cmd.arg(spec.display.qemu_arg());
    }

    cmd.kill_on_drop(false);

    tracing::info!(target: "warden::proxy", disk = %spec.disk_path.display(), "spawning hypervisor");
    Ok(cmd.spawn()?)
}

pub fn pid_of(child: &Child) -> Option<u32> {
    child.id()
}

/// True iff a process with this PID still exists. Uses `kill(pid, 0)`,
/// which sends no signal but reports `ESRCH` if the process is gone.
pub fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 is the documented existence-check idiom; no memory
    // is touched and no action is taken on the target process.
    unsafe { libc::kill(pid, 0) == 0 }
}

pub fn read_pid_file(path: &PathBuf) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
