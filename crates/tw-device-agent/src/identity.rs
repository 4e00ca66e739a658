//! Hardware address lookup and thing identity resolution.
//!
//! Reads interface addresses from `/sys/class/net`. `eth0` wins when it
//! has an address; otherwise the first non-loopback interface by name.

use std::path::Path;

use tw_protocol::UniqueId;

use crate::error::{AgentError, AgentResult};

const SYS_CLASS_NET: &str = "/sys/class/net";
const PREFERRED_INTERFACE: &str = "eth0";
const NULL_ADDRESS: &str = "00:00:00:00:00:00";

/// A network interface and its hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareAddress {
    pub interface: String,
    pub address: String,
}

impl HardwareAddress {
    pub fn unique_id(&self) -> AgentResult<UniqueId> {
        UniqueId::from_hardware_address(&self.address).map_err(|e| AgentError::Identity(e.to_string()))
    }
}

/// Hardware address of this machine's primary interface.
pub async fn local_hardware_address() -> AgentResult<HardwareAddress> {
    lookup_in(Path::new(SYS_CLASS_NET)).await
}

/// Hardware address lookup against a `sys/class/net`-shaped directory.
pub async fn lookup_in(root: &Path) -> AgentResult<HardwareAddress> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| AgentError::Identity(format!("cannot list {}: {e}", root.display())))?;

    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AgentError::Identity(e.to_string()))?
    {
        let interface = entry.file_name().to_string_lossy().into_owned();
        if interface == "lo" {
            continue;
        }
        let Ok(raw) = tokio::fs::read_to_string(entry.path().join("address")).await else {
            continue;
        };
        let address = raw.trim().to_string();
        if address.is_empty() || address == NULL_ADDRESS {
            continue;
        }
        candidates.push(HardwareAddress { interface, address });
    }

    candidates.sort_by(|a, b| a.interface.cmp(&b.interface));
    let preferred = candidates
        .iter()
        .position(|c| c.interface == PREFERRED_INTERFACE)
        .unwrap_or(0);
    if candidates.is_empty() {
        return Err(AgentError::Identity(format!(
            "no interface with a hardware address under {}",
            root.display()
        )));
    }
    Ok(candidates.swap_remove(preferred))
}

/// The configured thing name, or one derived from the hardware address.
pub async fn resolve_thing_name(configured: Option<&str>) -> AgentResult<String> {
    if let Some(name) = configured.filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }
    let hardware = local_hardware_address().await?;
    let id = hardware.unique_id()?;
    tracing::info!(interface = %hardware.interface, thing_name = %id, "derived thing name from hardware address");
    Ok(id.into_string())
}
