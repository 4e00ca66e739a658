//! Secure tunnel watcher and local proxy launcher.
//!
//! The watcher waits on `tunnels/notify` for one SSH tunnel in destination
//! mode and hands its access token and region to a [`ProxyLauncher`]. It is
//! single-shot: after a launch it refuses to watch again.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tw_mqtt_channel::{Channel, Exchange, MqttError};
use tw_protocol::topics;
use tw_protocol::tunnels::{SshTunnel, TunnelNotification};

use crate::config::TunnelConfig;
use crate::error::{AgentError, AgentResult};

// ── Proxy parameters ──────────────────────────────────────────

/// Where the proxy connects to the tunneling service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEndpoint {
    Region(String),
    Host(String),
}

impl ProxyEndpoint {
    pub fn host(&self) -> String {
        match self {
            ProxyEndpoint::Region(region) => format!("data.tunneling.iot.{region}.amazonaws.com"),
            ProxyEndpoint::Host(host) => host.clone(),
        }
    }
}

/// Which end of the tunnel the proxy serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMode {
    /// Listen locally and forward into the tunnel.
    Source { listen_port: u16 },
    /// Forward tunnel traffic to a local service (`host:port`).
    Destination { app: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyParams {
    pub access_token: String,
    pub endpoint: ProxyEndpoint,
    pub mode: ProxyMode,
    pub proxy_scheme: Option<String>,
    pub no_ssl_host_verify: bool,
}

impl std::fmt::Debug for ProxyParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyParams")
            .field("access_token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("mode", &self.mode)
            .field("proxy_scheme", &self.proxy_scheme)
            .field("no_ssl_host_verify", &self.no_ssl_host_verify)
            .finish()
    }
}

impl ProxyParams {
    /// Destination-side parameters for a validated tunnel notification.
    pub fn destination(tunnel: SshTunnel, settings: &TunnelConfig) -> Self {
        Self {
            access_token: tunnel.access_token,
            endpoint: ProxyEndpoint::Region(tunnel.region),
            mode: ProxyMode::Destination {
                app: settings.destination_app.clone(),
            },
            proxy_scheme: settings.proxy_scheme.clone(),
            no_ssl_host_verify: settings.no_ssl_host_verify,
        }
    }

    /// Command-line arguments in `localproxy` syntax.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-access-token".to_string(), self.access_token.clone()];
        match &self.endpoint {
            ProxyEndpoint::Region(region) => args.extend(["-region".to_string(), region.clone()]),
            ProxyEndpoint::Host(host) => args.extend(["-proxy-endpoint".to_string(), host.clone()]),
        }
        match &self.mode {
            ProxyMode::Source { listen_port } => {
                args.extend(["-source-listen-port".to_string(), listen_port.to_string()]);
            }
            ProxyMode::Destination { app } => {
                args.extend(["-destination-app".to_string(), app.clone()]);
            }
        }
        if let Some(scheme) = &self.proxy_scheme {
            args.extend(["-proxy-scheme".to_string(), scheme.clone()]);
        }
        if self.no_ssl_host_verify {
            args.push("-no-ssl-host-verify".to_string());
        }
        args
    }
}

// ── Launchers ─────────────────────────────────────────────────

/// Starts the external tunnel proxy.
#[async_trait]
pub trait ProxyLauncher: Send + Sync {
    /// Check the proxy can be launched at all, before any tunnel is awaited.
    fn check_available(&self) -> AgentResult<()>;

    /// Run the proxy. Launch failure or a non-zero exit is an error.
    async fn launch(&self, params: &ProxyParams) -> AgentResult<()>;
}

/// Runs a `localproxy`-compatible executable and waits for it to exit.
#[derive(Debug, Clone)]
pub struct LocalProxyLauncher {
    binary: String,
}

impl LocalProxyLauncher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn resolve(&self) -> Option<PathBuf> {
        if self.binary.contains('/') {
            let path = PathBuf::from(&self.binary);
            return path.is_file().then_some(path);
        }
        let search = std::env::var_os("PATH")?;
        std::env::split_paths(&search)
            .map(|dir| dir.join(&self.binary))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[async_trait]
impl ProxyLauncher for LocalProxyLauncher {
    fn check_available(&self) -> AgentResult<()> {
        self.resolve()
            .map(|_| ())
            .ok_or_else(|| AgentError::ProxyLaunch(format!("{} not found in PATH", self.binary)))
    }

    async fn launch(&self, params: &ProxyParams) -> AgentResult<()> {
        let binary = self
            .resolve()
            .ok_or_else(|| AgentError::ProxyLaunch(format!("{} not found in PATH", self.binary)))?;

        tracing::info!(
            binary = %binary.display(),
            endpoint = %params.endpoint.host(),
            mode = ?params.mode,
            "starting local proxy"
        );
        let status = Command::new(&binary)
            .args(params.args())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| AgentError::ProxyLaunch(format!("{}: {e}", binary.display())))?;

        if !status.success() {
            return Err(AgentError::ProxyLaunch(format!(
                "{} exited with {status}",
                binary.display()
            )));
        }
        tracing::info!("local proxy exited");
        Ok(())
    }
}

/// Launcher that records invocations instead of running anything.
#[derive(Debug, Default)]
pub struct RecordingProxyLauncher {
    launches: Mutex<Vec<ProxyParams>>,
    unavailable: bool,
}

impl RecordingProxyLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A launcher whose availability check fails.
    pub fn unavailable() -> Self {
        Self {
            launches: Mutex::new(Vec::new()),
            unavailable: true,
        }
    }

    pub fn launches(&self) -> Vec<ProxyParams> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyLauncher for RecordingProxyLauncher {
    fn check_available(&self) -> AgentResult<()> {
        if self.unavailable {
            return Err(AgentError::ProxyLaunch("proxy not installed".into()));
        }
        Ok(())
    }

    async fn launch(&self, params: &ProxyParams) -> AgentResult<()> {
        self.launches.lock().unwrap().push(params.clone());
        Ok(())
    }
}

// ── Watcher ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Waiting for a tunnel notification.
    Idle,
    /// A proxy was launched for a notification.
    Proxying,
}

pub struct TunnelWatcher<'a, C: Channel + ?Sized> {
    channel: &'a C,
    launcher: &'a dyn ProxyLauncher,
    thing_name: String,
    settings: TunnelConfig,
    state: WatcherState,
}

impl<'a, C: Channel + ?Sized> TunnelWatcher<'a, C> {
    pub fn new(
        channel: &'a C,
        launcher: &'a dyn ProxyLauncher,
        thing_name: impl Into<String>,
        settings: TunnelConfig,
    ) -> Self {
        Self {
            channel,
            launcher,
            thing_name: thing_name.into(),
            settings,
            state: WatcherState::Idle,
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state
    }

    /// Wait for one tunnel notification and launch the proxy for it.
    ///
    /// A notification that is not a single SSH service in destination mode
    /// ends the watch with [`MqttError::ProtocolViolation`] and launches
    /// nothing.
    pub async fn watch(&mut self, cancel: &CancellationToken) -> AgentResult<SshTunnel> {
        if self.state == WatcherState::Proxying {
            return Err(AgentError::TunnelAlreadyTriggered);
        }
        self.launcher.check_available()?;

        let topic = topics::tunnels_notify(&self.thing_name);
        tracing::info!(topic = %topic, "waiting for tunnel notification");
        let payload = Exchange::new()
            .accepted(topic)
            .perform(self.channel, cancel)
            .await?
            .into_payload()?;

        let tunnel = TunnelNotification::parse(&payload)
            .and_then(TunnelNotification::validate)
            .map_err(|e| MqttError::ProtocolViolation(e.to_string()))?;

        tracing::info!(thing = %self.thing_name, region = %tunnel.region, "tunnel requested");
        self.state = WatcherState::Proxying;
        let params = ProxyParams::destination(tunnel.clone(), &self.settings);
        self.launcher.launch(&params).await?;
        Ok(tunnel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_mqtt_channel::MockChannel;

    const NOTIFY: &str = "$aws/things/rpi-001/tunnels/notify";

    #[test]
    fn destination_args() {
        let params = ProxyParams::destination(
            SshTunnel {
                access_token: "tok".into(),
                region: "us-east-1".into(),
            },
            &TunnelConfig::default(),
        );
        assert_eq!(
            params.args(),
            vec![
                "-access-token",
                "tok",
                "-region",
                "us-east-1",
                "-destination-app",
                "localhost:22"
            ]
        );
        assert_eq!(params.endpoint.host(), "data.tunneling.iot.us-east-1.amazonaws.com");
    }

    #[test]
    fn source_args_with_endpoint_and_flags() {
        let params = ProxyParams {
            access_token: "tok".into(),
            endpoint: ProxyEndpoint::Host("proxy.example.com".into()),
            mode: ProxyMode::Source { listen_port: 2222 },
            proxy_scheme: Some("ws".into()),
            no_ssl_host_verify: true,
        };
        assert_eq!(
            params.args(),
            vec![
                "-access-token",
                "tok",
                "-proxy-endpoint",
                "proxy.example.com",
                "-source-listen-port",
                "2222",
                "-proxy-scheme",
                "ws",
                "-no-ssl-host-verify"
            ]
        );
    }

    #[test]
    fn debug_hides_access_token() {
        let params = ProxyParams {
            access_token: "secret-token".into(),
            endpoint: ProxyEndpoint::Region("eu-west-1".into()),
            mode: ProxyMode::Source { listen_port: 2222 },
            proxy_scheme: None,
            no_ssl_host_verify: false,
        };
        assert!(!format!("{params:?}").contains("secret-token"));
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let launcher = LocalProxyLauncher::new("/nonexistent/localproxy");
        assert!(matches!(launcher.check_available(), Err(AgentError::ProxyLaunch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_launch_error() {
        let launcher = LocalProxyLauncher::new("false");
        if launcher.check_available().is_err() {
            return;
        }
        let params = ProxyParams {
            access_token: "tok".into(),
            endpoint: ProxyEndpoint::Region("us-east-1".into()),
            mode: ProxyMode::Source { listen_port: 2222 },
            proxy_scheme: None,
            no_ssl_host_verify: false,
        };
        let err = launcher.launch(&params).await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn valid_notification_launches_once() {
        let mock = MockChannel::new();
        mock.reply_on_subscribe(
            NOTIFY,
            NOTIFY,
            br#"{"clientAccessToken":"tok","clientMode":"destination","region":"us-east-1","services":["SSH"]}"#,
        );
        let launcher = RecordingProxyLauncher::new();
        let mut watcher = TunnelWatcher::new(&mock, &launcher, "rpi-001", TunnelConfig::default());

        let tunnel = watcher.watch(&CancellationToken::new()).await.unwrap();

        assert_eq!(tunnel.access_token, "tok");
        assert_eq!(watcher.state(), WatcherState::Proxying);
        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].access_token, "tok");
        assert_eq!(launches[0].endpoint, ProxyEndpoint::Region("us-east-1".into()));
        assert!(mock.active_filters().is_empty());

        let again = watcher.watch(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(again, AgentError::TunnelAlreadyTriggered));
    }

    #[tokio::test]
    async fn multi_service_notification_is_protocol_violation() {
        let mock = MockChannel::new();
        mock.reply_on_subscribe(
            NOTIFY,
            NOTIFY,
            br#"{"clientAccessToken":"tok","clientMode":"destination","region":"us-east-1","services":["SSH","HTTP"]}"#,
        );
        let launcher = RecordingProxyLauncher::new();
        let mut watcher = TunnelWatcher::new(&mock, &launcher, "rpi-001", TunnelConfig::default());

        let err = watcher.watch(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AgentError::Mqtt(MqttError::ProtocolViolation(_))));
        assert!(launcher.launches().is_empty());
        assert_eq!(watcher.state(), WatcherState::Idle);
        assert!(mock.active_filters().is_empty());
    }

    #[tokio::test]
    async fn unavailable_proxy_fails_before_subscribing() {
        let mock = MockChannel::new();
        let launcher = RecordingProxyLauncher::unavailable();
        let mut watcher = TunnelWatcher::new(&mock, &launcher, "rpi-001", TunnelConfig::default());

        let err = watcher.watch(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AgentError::ProxyLaunch(_)));
        assert!(mock.subscriptions().is_empty());
    }
}
