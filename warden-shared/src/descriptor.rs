//! The persisted shape of a VM: `vms/<name>/vm.toml`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::WardenError;

/// A `host:guest` TCP port forward configured for a VM's hypervisor NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

impl PortForward {
    pub fn new(host: u16, guest: u16) -> Self {
        Self { host, guest }
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.guest)
    }
}

impl FromStr for PortForward {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, guest) = s.split_once(':').ok_or_else(|| {
            WardenError::Config(format!(
                "invalid port mapping '{s}'. Use format: host_port:guest_port"
            ))
        })?;
        let parse_port = |part: &str| -> Result<u16, WardenError> {
            part.parse::<u16>()
                .ok()
                .filter(|p| *p >= 1)
                .ok_or_else(|| {
                    WardenError::Config(format!(
                        "invalid port number in '{s}'. Ports must be 1-65535"
                    ))
                })
        };
        Ok(Self {
            host: parse_port(host)?,
            guest: parse_port(guest)?,
        })
    }
}

impl TryFrom<String> for PortForward {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortForward> for String {
    fn from(value: PortForward) -> Self {
        value.to_string()
    }
}

/// A firewall decision. Deliberately a closed variant — unknown strings
/// fail to deserialize rather than silently collapsing to `Deny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallDecision {
    Allow,
    Deny,
}

impl fmt::Display for FirewallDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallDecision::Allow => write!(f, "allow"),
            FirewallDecision::Deny => write!(f, "deny"),
        }
    }
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

/// The full persisted descriptor for one VM, round-tripped as `vm.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub base: String,
    #[serde(default = "default_memory")]
    pub memory: u32,
    #[serde(default = "default_cpus")]
    pub cpus: u8,
    #[serde(default)]
    pub ports: Vec<PortForward>,
    pub ssh_port: u16,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub first_boot_completed: bool,
    /// Keyed by canonical `"ip:port"` strings.
    #[serde(default)]
    pub firewall: BTreeMap<String, FirewallDecision>,
    /// Nested, plugin-owned settings. Opaque to the core.
    #[serde(default)]
    pub plugins: toml::Table,
}

fn default_memory() -> u32 {
    2048
}

fn default_cpus() -> u8 {
    2
}

impl VmDescriptor {
    pub fn new(base: impl Into<String>, ssh_port: u16) -> Self {
        Self {
            base: base.into(),
            memory: default_memory(),
            cpus: default_cpus(),
            ports: Vec::new(),
            ssh_port,
            ssh_user: default_ssh_user(),
            first_boot_completed: false,
            firewall: BTreeMap::new(),
            plugins: toml::Table::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_forward_round_trips_through_display() {
        let p = PortForward::new(8080, 80);
        assert_eq!(p.to_string(), "8080:80");
        assert_eq!(p, "8080:80".parse().unwrap());
    }

    #[test]
    fn port_forward_rejects_malformed_mapping() {
        assert!("8080".parse::<PortForward>().is_err());
        assert!("0:80".parse::<PortForward>().is_err());
        assert!("abc:80".parse::<PortForward>().is_err());
    }

    #[test]
    fn firewall_decision_rejects_unknown_variant() {
        let toml_str = r#"
            base = "jammy"
            ssh_port = 2222
            [firewall]
            "1.2.3.4:443" = "maybe"
        "#;
        let result: Result<VmDescriptor, _> = toml::from_str(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn descriptor_defaults_are_applied() {
        let toml_str = r#"
            base = "jammy"
            ssh_port = 2222
        "#;
        let desc: VmDescriptor = toml::from_str(toml_str).unwrap();
        assert_eq!(desc.memory, 2048);
        assert_eq!(desc.cpus, 2);
        assert_eq!(desc.ssh_user, "ubuntu");
        assert!(!desc.first_boot_completed);
        assert!(desc.firewall.is_empty());
    }
}
