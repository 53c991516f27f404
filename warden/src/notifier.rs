//! §4.x — the interactive prompt capability.
//!
//! The host OS notification backend itself is treated as opaque: this
//! module only defines the contract ([`FirewallNotifier`]) that [`crate::decision`]
//! calls into, plus a small always-deny stub used when no richer backend is
//! wired in (embedders are expected to supply their own, e.g. an
//! `osascript` dialog on macOS or a D-Bus notification on Linux).

use std::time::Duration;

use async_trait::async_trait;
use warden_shared::FirewallDecision;

use crate::enrich::ConnectionRecord;

/// A prompt's wall-clock budget. [`crate::decision`] treats anything beyond
/// this as abandoned and defaults to [`FirewallDecision::Deny`].
pub const PROMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything the decision engine knows about a pending connection, handed
/// to a notifier so it can render a useful prompt.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub vm_name: String,
    pub dest_ip: String,
    pub dest_port: u16,
    pub domain: Option<String>,
    pub process_name: Option<String>,
    pub recent: Vec<ConnectionRecord>,
}

/// The opaque `ask(destination) -> allow|deny` capability.
///
/// Implementors must not panic and should treat their own internal errors
/// as a reason to return `Deny` — [`crate::decision`] applies the 5-minute
/// timeout itself, so `ask` does not need to enforce one, but it also must
/// not hang forever past that budget since the caller's timeout only stops
/// *waiting*, it doesn't cancel the prompt.
#[async_trait]
pub trait FirewallNotifier: Send + Sync {
    async fn ask(&self, ctx: &PromptContext) -> FirewallDecision;
}

/// Always denies. Useful for headless operation and as the default when no
/// richer backend is configured.
pub struct DenyAllNotifier;

#[async_trait]
impl FirewallNotifier for DenyAllNotifier {
    async fn ask(&self, ctx: &PromptContext) -> FirewallDecision {
        tracing::warn!(
            target: "warden::notifier",
            vm = %ctx.vm_name,
            dest = format!("{}:{}", ctx.dest_ip, ctx.dest_port),
            "no notifier backend configured, defaulting to deny"
        );
        FirewallDecision::Deny
    }
}

/// Always allows. Used by [`crate::supervisor::StartOptions::allow_all`] to
/// bypass prompting entirely for trusted/batch VMs.
pub struct AllowAllNotifier;

#[async_trait]
impl FirewallNotifier for AllowAllNotifier {
    async fn ask(&self, _ctx: &PromptContext) -> FirewallDecision {
        FirewallDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PromptContext {
        PromptContext {
            vm_name: "v1".into(),
            dest_ip: "1.2.3.4".into(),
            dest_port: 443,
            domain: None,
            process_name: None,
            recent: Vec::new(),
        }
    }

    #[tokio::test]
    async fn deny_all_notifier_always_denies() {
        let n = DenyAllNotifier;
        assert_eq!(n.ask(&ctx()).await, FirewallDecision::Deny);
    }

    #[tokio::test]
    async fn allow_all_notifier_always_allows() {
        let n = AllowAllNotifier;
        assert_eq!(n.ask(&ctx()).await, FirewallDecision::Allow);
    }
}
