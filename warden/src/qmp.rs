//! §4.8 — management socket client.
//!
//! Speaks the QEMU Monitor Protocol subset the supervisor needs: a JSON
//! object per line over a Unix domain socket, with a greeting to read and a
//! `qmp_capabilities` handshake to perform before anything else works.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::{WardenError, WardenResult};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct QmpClient {
    stream: UnixStream,
}

impl QmpClient {
    /// Connect to the socket, read the greeting, and negotiate capabilities.
    pub async fn connect(sock_path: &std::path::Path) -> WardenResult<Self> {
        let stream = UnixStream::connect(sock_path)
            .await
            .map_err(|e| WardenError::Management(format!("cannot connect to QMP socket: {e}")))?;

        let mut client = Self { stream };
        client.recv().await?; // greeting
        let resp = client.send_and_recv(&json!({"execute": "qmp_capabilities"})).await?;
        if let Some(err) = resp.get("error") {
            return Err(WardenError::Management(format!("QMP negotiation failed: {err}")));
        }
        Ok(client)
    }

    async fn send(&mut self, data: &Value) -> WardenResult<()> {
        let mut msg = serde_json::to_vec(data)
            .map_err(|e| WardenError::Management(format!("failed to encode QMP command: {e}")))?;
        msg.push(b'\n');
        self.stream
            .write_all(&msg)
            .await
            .map_err(|e| WardenError::Management(format!("QMP write failed: {e}")))
    }

    /// Read until a full JSON object has been buffered. QMP responses are
    /// not guaranteed to arrive in a single `read`, so this loops until
    /// `serde_json` successfully parses what's accumulated so far.
    async fn recv(&mut self) -> WardenResult<Value> {
        let mut buf = Vec::new();
        let result = timeout(RECV_TIMEOUT, async {
            loop {
                let mut chunk = [0u8; 4096];
                let n = self
                    .stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| WardenError::Management(format!("QMP read failed: {e}")))?;
                if n == 0 {
                    return Err(WardenError::Management("QMP connection closed".into()));
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Ok(value) = serde_json::from_slice::<Value>(&buf) {
                    return Ok(value);
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(WardenError::Management("QMP read timed out".into())),
        }
    }

    async fn send_and_recv(&mut self, data: &Value) -> WardenResult<Value> {
        self.send(data).await?;
        self.recv().await
    }

    pub async fn execute(&mut self, command: &str) -> WardenResult<Value> {
        self.send_and_recv(&json!({"execute": command})).await
    }

    /// Run a human monitor command (`savevm`, `loadvm`, `delvm`, `info
    /// snapshots`, ...) and return its textual output.
    pub async fn human_command(&mut self, cmd: &str) -> WardenResult<String> {
        let resp = self
            .send_and_recv(&json!({
                "execute": "human-monitor-command",
                "arguments": {"command-line": cmd},
            }))
            .await?;

        if let Some(err) = resp.get("error") {
            let desc = err
                .get("desc")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(WardenError::Management(desc));
        }

        Ok(resp
            .get("return")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn savevm(&mut self, name: &str) -> WardenResult<String> {
        self.human_command(&format!("savevm {name}")).await
    }

    pub async fn loadvm(&mut self, name: &str) -> WardenResult<String> {
        self.human_command(&format!("loadvm {name}")).await
    }

    pub async fn delvm(&mut self, name: &str) -> WardenResult<String> {
        self.human_command(&format!("delvm {name}")).await
    }

    pub async fn info_snapshots(&mut self) -> WardenResult<String> {
        self.human_command("info snapshots").await
    }

    pub async fn quit(&mut self) -> WardenResult<Value> {
        self.execute("quit").await
    }

    /// Send the ACPI shutdown signal. The guest OS decides whether and how
    /// fast to honor it — callers that need a hard deadline should poll
    /// [`crate::supervisor`]'s liveness check and fall back to a kill.
    pub async fn system_powerdown(&mut self) -> WardenResult<Value> {
        self.execute("system_powerdown").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// A tiny fake QMP server: greeting, then echoes back `{"return": {}}`
    /// for every command it receives.
    async fn spawn_fake_server(sock_path: std::path::PathBuf) {
        let listener = UnixListener::bind(&sock_path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"{\"QMP\": {\"version\": {}}}\n")
                .await
                .unwrap();

            let mut buf = [0u8; 4096];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let _: Value = match serde_json::from_slice(&buf[..n]) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if stream
                    .write_all(b"{\"return\": {}}\n")
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn connect_performs_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("qmp.sock");
        spawn_fake_server(sock_path.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = QmpClient::connect(&sock_path).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn human_command_returns_output_string() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("qmp.sock");
        spawn_fake_server(sock_path.clone()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = QmpClient::connect(&sock_path).await.unwrap();
        let out = client.savevm("snap1").await.unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn connect_to_missing_socket_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("does-not-exist.sock");
        let result = QmpClient::connect(&sock_path).await;
        assert!(matches!(result, Err(WardenError::Management(_))));
    }
}
