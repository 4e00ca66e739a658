//! Agent configuration, loadable from TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tw_mqtt_channel::MqttConfig;

use crate::error::{AgentError, AgentResult};

/// Top-level configuration for the device agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// IoT Core thing name. Derived from the hardware address when unset.
    #[serde(default)]
    pub thing_name: Option<String>,
    /// MQTT connection settings.
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

/// Fleet provisioning settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfig {
    /// Provisioning template to register against.
    #[serde(default)]
    pub template_name: String,
    /// Directory the issued certificate, key and record are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Template parameters. `UniqueId` is always replaced by the device identity.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            template_name: String::new(),
            output_dir: default_output_dir(),
            parameters: BTreeMap::new(),
        }
    }
}

/// Secure tunneling settings for the destination-side proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Proxy executable, looked up on `PATH` unless it contains a slash.
    #[serde(default = "default_proxy_binary")]
    pub proxy_binary: String,
    /// Local service the tunnel forwards to.
    #[serde(default = "default_destination_app")]
    pub destination_app: String,
    #[serde(default)]
    pub proxy_scheme: Option<String>,
    #[serde(default)]
    pub no_ssl_host_verify: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            proxy_binary: default_proxy_binary(),
            destination_app: default_destination_app(),
            proxy_scheme: None,
            no_ssl_host_verify: false,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_proxy_binary() -> String {
    "localproxy".to_string()
}

fn default_destination_app() -> String {
    "localhost:22".to_string()
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &Path) -> AgentResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> AgentResult<Self> {
        toml::from_str(contents).map_err(|e| AgentError::Config(e.to_string()))
    }
}
