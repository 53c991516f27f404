//! §4.9 — thin wrapper around the system `ssh`/`scp` binaries.
//!
//! No SSH library dependency: the teacher's disk helpers shell out to real
//! binaries rather than linking a protocol implementation, and that pattern
//! carries over cleanly here — these VMs already assume an `ssh` client is
//! on the operator's PATH.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::{WardenError, WardenResult};

/// Flags applied to every invocation: VMs are disposable and get fresh host
/// keys each time, so known-hosts checking would only ever get in the way.
const SSH_OPTIONS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "ConnectTimeout=10",
    "-o", "LogLevel=ERROR",
];

pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Poll with real SSH connection attempts (not just a TCP probe) until one
/// succeeds or `timeout` elapses.
pub async fn wait_for_ssh(host: &str, port: u16, user: &str, overall_timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + overall_timeout;
    loop {
        if run_command(host, port, user, "true", Duration::from_secs(10))
            .await
            .is_ok_and(|out| out.status == 0)
        {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Run a single command over SSH, returning its exit status and captured
/// output. Times out after `cmd_timeout` rather than hanging forever.
pub async fn run_command(
    host: &str,
    port: u16,
    user: &str,
    command: &str,
    cmd_timeout: Duration,
) -> WardenResult<CommandOutput> {
    let mut cmd = Command::new("ssh");
    cmd.args(SSH_OPTIONS)
        .arg("-p")
        .arg(port.to_string())
        .arg(format!("{user}@{host}"))
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    run_with_timeout(cmd, cmd_timeout).await
}

/// Copy a local file to the guest via `scp`.
pub async fn copy_file(
    host: &str,
    port: u16,
    user: &str,
    local_path: &std::path::Path,
    remote_path: &str,
    cmd_timeout: Duration,
) -> WardenResult<CommandOutput> {
    let mut cmd = Command::new("scp");
    cmd.args(SSH_OPTIONS)
        .arg("-P")
        .arg(port.to_string())
        .arg(local_path)
        .arg(format!("{user}@{host}:{remote_path}"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    run_with_timeout(cmd, cmd_timeout).await
}

/// Run a bash script body on the guest: write it to a temp file over SSH,
/// chmod +x, execute, then clean up. Cleanup failures are ignored — the
/// script's own exit status is what the caller cares about.
pub async fn run_script(
    host: &str,
    port: u16,
    user: &str,
    script_content: &str,
    cmd_timeout: Duration,
) -> WardenResult<CommandOutput> {
    const REMOTE_SCRIPT: &str = "/tmp/warden_hook_script.sh";

    let write_cmd = format!("cat > {REMOTE_SCRIPT} << 'WARDEN_HOOK_EOF'\n{script_content}\nWARDEN_HOOK_EOF");
    let write_result = run_command(host, port, user, &write_cmd, Duration::from_secs(30)).await?;
    if write_result.status != 0 {
        return Ok(CommandOutput {
            status: write_result.status,
            stdout: write_result.stdout,
            stderr: format!("failed to write script: {}", write_result.stderr),
        });
    }

    let exec_cmd = format!("chmod +x {REMOTE_SCRIPT} && {REMOTE_SCRIPT}");
    let result = run_command(host, port, user, &exec_cmd, cmd_timeout).await?;

    let _ = run_command(
        host,
        port,
        user,
        &format!("rm -f {REMOTE_SCRIPT}"),
        Duration::from_secs(10),
    )
    .await;

    Ok(result)
}

async fn run_with_timeout(mut cmd: Command, cmd_timeout: Duration) -> WardenResult<CommandOutput> {
    cmd.kill_on_drop(true);
    let child = cmd.spawn()?;

    match timeout(cmd_timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(WardenError::Io(e)),
        Err(_) => Ok(CommandOutput {
            status: -1,
            stdout: String::new(),
            stderr: "SSH command timed out".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_against_unreachable_host_fails_cleanly() {
        // Port 1 is never an SSH listener; ssh should fail fast rather than
        // this test hanging, thanks to ConnectTimeout=10 plus our own
        // per-call timeout.
        let result = run_command(
            "127.0.0.1",
            1,
            "nobody",
            "true",
            Duration::from_secs(15),
        )
        .await
        .unwrap();
        assert_ne!(result.status, 0);
    }
}
