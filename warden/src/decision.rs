//! C4 — the decision engine.
//!
//! `decide()` is the one call the SOCKS5 gateway (C5) makes per new
//! connection. It is allowed to block for minutes (the interactive prompt
//! step) — callers are expected to run it on the gateway's decision worker
//! pool, never inline in the accept loop.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use warden_shared::FirewallDecision;

use crate::enrich;
use crate::notifier::{FirewallNotifier, PromptContext};
use crate::policy;
use crate::ruleset;

/// Budget for the reverse-DNS fallback (step 4). A miss within budget and a
/// timeout are treated identically: fall through to the prompt.
const PTR_LOOKUP_BUDGET: Duration = Duration::from_secs(1);

/// One instance is shared across every VM's gateway: the prompt mutex is
/// process-global by design, so only one firewall dialog is ever on screen
/// at a time regardless of how many VMs are running.
pub struct DecisionEngine {
    notifier: Arc<dyn FirewallNotifier>,
    prompt_lock: AsyncMutex<()>,
}

impl DecisionEngine {
    pub fn new(notifier: Arc<dyn FirewallNotifier>) -> Self {
        Self {
            notifier,
            prompt_lock: AsyncMutex::new(()),
        }
    }

    /// Run the full 5-step algorithm for one connection attempt.
    pub async fn decide(&self, vm_name: &str, dest_ip: &str, dest_port: u16) -> FirewallDecision {
        // 1. Exact persisted rule.
        if let Ok(Some(decision)) = policy::lookup(vm_name, dest_ip, dest_port) {
            tracing::debug!(
                target: "warden::firewall",
                vm = vm_name, dest = format!("{dest_ip}:{dest_port}"), %decision,
                "existing rule"
            );
            enrich::record_connection(vm_name, dest_ip, dest_port, None, None, &decision.to_string());
            return decision;
        }

        // 2. Enrich once.
        let info = enrich::enrich(vm_name, dest_ip, dest_port).await;

        // 3. Default allow via domain.
        if let Some(domain) = &info.domain {
            if let Ok(Some(matched)) = ruleset::matches_default_domain(domain) {
                tracing::info!(
                    target: "warden::firewall",
                    vm = vm_name, dest = format!("{dest_ip}:{dest_port}"), domain, matched,
                    "auto-allowed (matches default domain)"
                );
                let _ = policy::insert(vm_name, dest_ip, dest_port, FirewallDecision::Allow);
                enrich::record_connection(
                    vm_name, dest_ip, dest_port, Some(domain.clone()), None, "allow",
                );
                return FirewallDecision::Allow;
            }
        }

        // 4. Default allow via reverse DNS.
        let ptr_hostname = reverse_dns_lookup(dest_ip).await;
        if let Some(hostname) = &ptr_hostname {
            if let Ok(Some(matched)) = ruleset::matches_default_domain(hostname) {
                tracing::info!(
                    target: "warden::firewall",
                    vm = vm_name, dest = format!("{dest_ip}:{dest_port}"), hostname, matched,
                    "auto-allowed (matches default domain via rDNS)"
                );
                let _ = policy::insert(vm_name, dest_ip, dest_port, FirewallDecision::Allow);
                enrich::record_connection(
                    vm_name, dest_ip, dest_port, Some(hostname.clone()), None, "allow",
                );
                return FirewallDecision::Allow;
            }
        }

        // 5. Interactive prompt, serialized process-wide.
        let _permit = self.prompt_lock.lock().await;

        // Re-check: another connection may have resolved this while we waited.
        if let Ok(Some(decision)) = policy::lookup(vm_name, dest_ip, dest_port) {
            tracing::debug!(
                target: "warden::firewall",
                vm = vm_name, dest = format!("{dest_ip}:{dest_port}"), %decision,
                "resolved while waiting for prompt lock"
            );
            enrich::record_connection(vm_name, dest_ip, dest_port, None, None, &decision.to_string());
            return decision;
        }

        let recent = enrich::recent_connections_default(vm_name);
        let ctx = PromptContext {
            vm_name: vm_name.to_string(),
            dest_ip: dest_ip.to_string(),
            dest_port,
            domain: info.domain.clone(),
            process_name: info.process_name.clone(),
            recent,
        };

        let decision = match tokio::time::timeout(
            crate::notifier::PROMPT_TIMEOUT,
            self.notifier.ask(&ctx),
        )
        .await
        {
            Ok(decision) => decision,
            Err(_) => {
                tracing::warn!(
                    target: "warden::firewall",
                    vm = vm_name, dest = format!("{dest_ip}:{dest_port}"),
                    "prompt timed out after 5 minutes, defaulting to deny"
                );
                FirewallDecision::Deny
            }
        };

        let _ = policy::insert(vm_name, dest_ip, dest_port, decision);

        let label = info.domain.clone().or(ptr_hostname);
        match &label {
            Some(l) => tracing::info!(
                target: "warden::firewall",
                vm = vm_name, dest = format!("{dest_ip}:{dest_port}"), %decision, domain = l,
                "user decision"
            ),
            None => tracing::info!(
                target: "warden::firewall",
                vm = vm_name, dest = format!("{dest_ip}:{dest_port}"), %decision,
                "user decision"
            ),
        }

        enrich::record_connection(
            vm_name,
            dest_ip,
            dest_port,
            info.domain,
            info.process_name,
            &decision.to_string(),
        );

        decision
    }
}

/// What the gateway calls per connection: either the full firewall
/// algorithm, or a trivial always-allow bypass that never touches
/// enrichment, the policy store, or the prompt lock.
pub enum Decider {
    AllowAll,
    Engine(DecisionEngine),
}

impl Decider {
    pub async fn decide(&self, vm_name: &str, dest_ip: &str, dest_port: u16) -> FirewallDecision {
        match self {
            Decider::AllowAll => FirewallDecision::Allow,
            Decider::Engine(engine) => engine.decide(vm_name, dest_ip, dest_port).await,
        }
    }
}

/// Best-effort PTR lookup with a hard 1-second budget. Any failure, timeout,
/// or unparsable address yields `None`.
async fn reverse_dns_lookup(dest_ip: &str) -> Option<String> {
    let ip = IpAddr::from_str(dest_ip).ok()?;
    let resolver = hickory_resolver::TokioAsyncResolver::tokio(
        hickory_resolver::config::ResolverConfig::default(),
        hickory_resolver::config::ResolverOpts::default(),
    );

    match tokio::time::timeout(PTR_LOOKUP_BUDGET, resolver.reverse_lookup(ip)).await {
        Ok(Ok(lookup)) => lookup.iter().next().map(|name| {
            name.to_string().trim_end_matches('.').to_string()
        }),
        _ => None,
    }
}
