//! Shared types used across the warden workspace: the typed error enum and
//! the on-disk VM descriptor shape.
//!
//! Kept dependency-light (`serde`, `thiserror`, `toml` only) so it can be
//! used both by the core library and, eventually, by any CLI or embedder
//! without pulling in the async runtime.

pub mod descriptor;
pub mod errors;

pub use descriptor::{FirewallDecision, PortForward, VmDescriptor};
pub use errors::{WardenError, WardenResult};
