//! warden — VM lifecycle supervisor and per-VM SOCKS5 firewall proxy.
//!
//! A `warden` VM is a disposable guest backed by a hypervisor child process.
//! Its only route to the outside world is a per-VM SOCKS5 gateway ([`gateway`])
//! that consults the [`decision`] engine before allowing a CONNECT to proceed.
//! The [`supervisor`] module wires the gateway into the guest's user-mode NAT,
//! spawns the hypervisor, runs boot hooks, and tears everything down.

pub mod decision;
pub mod descriptor_store;
pub mod disk;
pub mod enrich;
pub mod gateway;
pub mod hooks;
pub mod hypervisor;
pub mod notifier;
pub mod paths;
pub mod policy;
pub mod qmp;
pub mod ruleset;
pub mod ssh;
pub mod supervisor;

pub use warden_shared::{FirewallDecision, PortForward, VmDescriptor, WardenError, WardenResult};

pub use supervisor::{StartOptions, VmSupervisor};
