//! `qemu-img` wrapper: overlay creation and UEFI firmware-vars staging.
//!
//! Mirrors the teacher's `qemu-img` helper — locate the binary on `PATH`,
//! shell out, surface a clear install hint on failure — generalized to the
//! overlay-disk and firmware-template operations this supervisor needs.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::{WardenError, WardenResult};

/// aarch64 UEFI firmware code (read-only) search path, platform by platform.
const FIRMWARE_CODE_CANDIDATES: &[&str] = &[
    "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
    "/usr/local/share/qemu/edk2-aarch64-code.fd",
    "/usr/share/qemu/edk2-aarch64-code.fd",
    "/usr/share/AAVMF/AAVMF_CODE.fd",
];

/// UEFI variable-store template search path.
const FIRMWARE_VARS_CANDIDATES: &[&str] = &[
    "/opt/homebrew/share/qemu/edk2-arm-vars.fd",
    "/usr/local/share/qemu/edk2-arm-vars.fd",
    "/usr/share/qemu/edk2-arm-vars.fd",
    "/usr/share/AAVMF/AAVMF_VARS.fd",
];

fn find_binary(name: &str) -> WardenResult<PathBuf> {
    for dir in std::env::var_os("PATH").into_iter().flat_map(|p| std::env::split_paths(&p).collect::<Vec<_>>()) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(WardenError::Config(format!(
        "'{name}' not found on PATH. Install QEMU (e.g. `brew install qemu`)."
    )))
}

pub fn qemu_img_binary() -> WardenResult<PathBuf> {
    find_binary("qemu-img")
}

pub fn qemu_system_binary() -> WardenResult<PathBuf> {
    find_binary("qemu-system-aarch64")
}

pub fn find_firmware_code() -> WardenResult<PathBuf> {
    find_first_existing(FIRMWARE_CODE_CANDIDATES)
        .ok_or_else(|| WardenError::Config("UEFI firmware for aarch64 not found. Install QEMU (e.g. `brew install qemu`).".into()))
}

pub fn find_firmware_vars_template() -> WardenResult<PathBuf> {
    find_first_existing(FIRMWARE_VARS_CANDIDATES)
        .ok_or_else(|| WardenError::Config("UEFI variable store template not found. Install QEMU (e.g. `brew install qemu`).".into()))
}

fn find_first_existing(candidates: &[&str]) -> Option<PathBuf> {
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Copy the UEFI vars template into the VM directory if it isn't there yet.
/// A no-op on subsequent starts, so guest NVRAM changes (boot order, etc.)
/// persist across restarts.
pub async fn ensure_efivars(efivars_path: &Path) -> WardenResult<()> {
    if efivars_path.exists() {
        return Ok(());
    }
    let template = find_firmware_vars_template()?;
    tokio::fs::copy(&template, efivars_path).await?;
    Ok(())
}

/// Create a qcow2 overlay backed by `backing_file`. `backing_file` should
/// already be relative to `overlay_path`'s directory (see
/// [`crate::paths::relative_backing_path`]) so the pair can be moved
/// together without breaking the link.
pub async fn create_overlay(backing_file: &Path, overlay_path: &Path) -> WardenResult<()> {
    let qemu_img = qemu_img_binary()?;
    tracing::info!(target: "warden::disk", overlay = %overlay_path.display(), backing = %backing_file.display(), "creating overlay disk");

    let output = Command::new(&qemu_img)
        .args(["create", "-f", "qcow2", "-b"])
        .arg(backing_file)
        .args(["-F", "qcow2"])
        .arg(overlay_path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(WardenError::Internal(format!(
            "qemu-img create failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// `qemu-img info --output=json`, parsed.
pub async fn image_info(image_path: &Path) -> WardenResult<serde_json::Value> {
    let qemu_img = qemu_img_binary()?;
    let output = Command::new(&qemu_img)
        .args(["info", "--output=json"])
        .arg(image_path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(WardenError::Internal(format!(
            "qemu-img info failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| WardenError::Internal(format!("failed to parse qemu-img info output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_first_existing_returns_none_for_bogus_paths() {
        assert!(find_first_existing(&["/definitely/not/a/real/path.fd"]).is_none());
    }
}
