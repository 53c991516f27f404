//! C3 — connection enrichment for firewall prompts.
//!
//! Runs `/usr/local/bin/xray-enrich <ip> <port>` on the guest over SSH to
//! recover the domain name and process that triggered a connection; DNS
//! results are cached per VM so repeat connections to the same IP skip
//! straight to a cache hit on the domain (process info is always re-fetched,
//! since it changes connection to connection).
//!
//! All of it is best-effort: any failure just means the firewall prompt
//! falls back to showing a bare IP:port.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use crate::descriptor_store;

/// Fixed guest-side contract: every base image is expected to ship this
/// helper at this exact path.
const ENRICH_HELPER_PATH: &str = "/usr/local/bin/xray-enrich";

const ENRICH_TIMEOUT: Duration = Duration::from_secs(5);

const RECENT_CAPACITY: usize = 20;
const RECENT_DEFAULT_LIMIT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentResult {
    pub domain: Option<String>,
    pub process_name: Option<String>,
    pub process_pid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub timestamp_unix: i64,
    pub dest_ip: String,
    pub dest_port: u16,
    pub domain: Option<String>,
    pub process_name: Option<String>,
    pub decision: String,
}

struct State {
    dns_cache: HashMap<String, HashMap<String, String>>,
    recent: HashMap<String, VecDeque<ConnectionRecord>>,
}

static STATE: Mutex<Option<State>> = Mutex::new(None);

fn with_state<R>(f: impl FnOnce(&mut State) -> R) -> R {
    let mut guard = STATE.lock();
    let state = guard.get_or_insert_with(|| State {
        dns_cache: HashMap::new(),
        recent: HashMap::new(),
    });
    f(state)
}

/// Enrich a connection with domain/process info by SSHing into the guest.
/// Never errors outward — on any failure the result is simply empty (with a
/// cached domain, if one exists, still attached).
pub async fn enrich(vm_name: &str, dest_ip: &str, dest_port: u16) -> EnrichmentResult {
    let mut result = EnrichmentResult {
        domain: with_state(|s| {
            s.dns_cache
                .get(vm_name)
                .and_then(|cache| cache.get(dest_ip))
                .cloned()
        }),
        ..Default::default()
    };

    let descriptor = match descriptor_store::load(vm_name) {
        Ok(d) => d,
        Err(_) => return result,
    };

    let command = format!("{ENRICH_HELPER_PATH} {dest_ip} {dest_port}");
    let output = match crate::ssh::run_command(
        "127.0.0.1",
        descriptor.ssh_port,
        &descriptor.ssh_user,
        &command,
        ENRICH_TIMEOUT,
    )
    .await
    {
        Ok(out) => out,
        Err(e) => {
            tracing::debug!(vm = vm_name, error = %e, "enrichment ssh call failed");
            return result;
        }
    };

    if !output.stderr.trim().is_empty() {
        tracing::debug!(vm = vm_name, stderr = %output.stderr.trim(), "xray-enrich debug output");
    }

    if output.status != 0 && output.stdout.trim().is_empty() {
        tracing::debug!(vm = vm_name, status = output.status, "xray-enrich failed");
        return result;
    }

    for line in output.stdout.trim().lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "domain" if !value.is_empty() => result.domain = Some(value.to_string()),
            "process_name" if !value.is_empty() => result.process_name = Some(value.to_string()),
            "process_pid" if !value.is_empty() => result.process_pid = Some(value.to_string()),
            _ => {}
        }
    }

    if let Some(domain) = &result.domain {
        with_state(|s| {
            s.dns_cache
                .entry(vm_name.to_string())
                .or_default()
                .insert(dest_ip.to_string(), domain.clone());
        });
    }

    result
}

/// Record a firewall decision for later display in a future prompt's
/// "recent connections" list.
pub fn record_connection(
    vm_name: &str,
    dest_ip: &str,
    dest_port: u16,
    domain: Option<String>,
    process_name: Option<String>,
    decision: &str,
) {
    let record = ConnectionRecord {
        timestamp_unix: chrono::Utc::now().timestamp(),
        dest_ip: dest_ip.to_string(),
        dest_port,
        domain,
        process_name,
        decision: decision.to_string(),
    };
    with_state(|s| {
        let deque = s.recent.entry(vm_name.to_string()).or_default();
        if deque.len() == RECENT_CAPACITY {
            deque.pop_front();
        }
        deque.push_back(record);
    });
}

/// Most recent decisions for a VM, newest last, capped at `limit`.
pub fn recent_connections(vm_name: &str, limit: usize) -> Vec<ConnectionRecord> {
    with_state(|s| {
        let deque = s.recent.get(vm_name);
        match deque {
            Some(d) => {
                let skip = d.len().saturating_sub(limit);
                d.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    })
}

pub fn recent_connections_default(vm_name: &str) -> Vec<ConnectionRecord> {
    recent_connections(vm_name, RECENT_DEFAULT_LIMIT)
}

/// Drop all cached DNS entries and recent-connection history for a VM. Call
/// this on teardown so a respawned VM with the same name starts clean.
pub fn clear_vm_state(vm_name: &str) {
    with_state(|s| {
        s.dns_cache.remove(vm_name);
        s.recent.remove(vm_name);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_connections_caps_at_capacity_and_returns_newest_first() {
        clear_vm_state("t1");
        for i in 0..25u16 {
            record_connection("t1", "1.2.3.4", i, None, None, "allow");
        }
        let recent = recent_connections("t1", 100);
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent.last().unwrap().dest_port, 24);
        assert_eq!(recent.first().unwrap().dest_port, 5);
    }

    #[test]
    fn recent_connections_default_limit_is_five() {
        clear_vm_state("t2");
        for i in 0..10u16 {
            record_connection("t2", "1.2.3.4", i, None, None, "allow");
        }
        let recent = recent_connections_default("t2");
        assert_eq!(recent.len(), 5);
        assert_eq!(recent.last().unwrap().dest_port, 9);
    }

    #[test]
    fn clear_vm_state_removes_history() {
        clear_vm_state("t3");
        record_connection("t3", "1.2.3.4", 443, None, None, "allow");
        clear_vm_state("t3");
        assert!(recent_connections("t3", 100).is_empty());
    }
}
