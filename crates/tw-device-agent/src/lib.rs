//! Thingwire device agent: library crate behind the `tw-agent` binary.
//!
//! Re-exports all modules so external crates (e.g. `tw-e2e-tests`) can
//! drive `ProvisioningFlow` and `TunnelWatcher` against a mock channel.

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod mqtt_loop;
pub mod provisioning;
pub mod tunnel;

pub use error::{AgentError, AgentResult};
