//! Command-line interface of the `tw-agent` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::TunnelConfig;
use crate::error::{AgentError, AgentResult};
use crate::tunnel::{ProxyEndpoint, ProxyMode, ProxyParams};

#[derive(Debug, Parser)]
#[command(name = "tw-agent", version, about = "Thingwire device agent for AWS IoT Core")]
pub struct Cli {
    /// Agent configuration file (TOML).
    #[arg(
        long,
        global = true,
        env = "THINGWIRE_CONFIG",
        default_value = "/etc/thingwire/agent.toml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision this device: issue a certificate and register the thing.
    Register {
        /// Provisioning template, overriding the config file.
        #[arg(long)]
        template: Option<String>,
        /// JSON file of template parameters, merged over the config file's.
        #[arg(long)]
        parameters: Option<PathBuf>,
        /// Directory for the issued credentials, overriding the config file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the hardware address and the identity derived from it.
    MacAddress,
    /// Connect to the broker and wait for it to accept the session.
    CheckMqtt,
    /// Wait for a secure tunnel notification and run the proxy for it.
    ListenForTunnel,
    /// Run the local proxy directly.
    Proxy(ProxyArgs),
    /// Device shadow operations.
    Shadow {
        /// Named shadow; the classic shadow when omitted.
        #[arg(long, global = true)]
        name: Option<String>,
        #[command(subcommand)]
        action: ShadowAction,
    },
    /// Jobs notifications.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ShadowAction {
    /// Print the shadow document.
    Get,
    /// Delete the shadow.
    Delete,
    /// Publish an update document.
    Update { document: String },
    /// Publish to `update/documents`.
    UpdateDocument { document: String },
    /// Print update verdicts until interrupted.
    Watch,
}

#[derive(Debug, Subcommand)]
pub enum JobsAction {
    /// Print job notifications until interrupted.
    Listen,
    /// Request the next pending job and print the reply.
    Next,
}

#[derive(Debug, Args)]
pub struct ProxyArgs {
    #[arg(long)]
    pub access_token: String,
    #[arg(long, conflicts_with = "proxy_endpoint", required_unless_present = "proxy_endpoint")]
    pub region: Option<String>,
    #[arg(long)]
    pub proxy_endpoint: Option<String>,
    #[arg(
        long,
        conflicts_with = "destination_app",
        required_unless_present = "destination_app"
    )]
    pub source_listen_port: Option<u16>,
    #[arg(long)]
    pub destination_app: Option<String>,
    #[arg(long)]
    pub proxy_scheme: Option<String>,
    #[arg(long)]
    pub no_ssl_host_verify: bool,
}

impl ProxyArgs {
    /// Proxy parameters; flags left unset fall back to the tunnel config.
    pub fn into_params(self, defaults: &TunnelConfig) -> AgentResult<ProxyParams> {
        if self.access_token.is_empty() {
            return Err(AgentError::Config("access token must not be empty".into()));
        }
        let endpoint = match (self.region, self.proxy_endpoint) {
            (Some(region), None) => ProxyEndpoint::Region(region),
            (None, Some(host)) => ProxyEndpoint::Host(host),
            _ => {
                return Err(AgentError::Config(
                    "exactly one of --region or --proxy-endpoint is required".into(),
                ));
            }
        };
        let mode = match (self.source_listen_port, self.destination_app) {
            (Some(listen_port), None) => ProxyMode::Source { listen_port },
            (None, Some(app)) => ProxyMode::Destination { app },
            _ => {
                return Err(AgentError::Config(
                    "exactly one of --source-listen-port or --destination-app is required".into(),
                ));
            }
        };
        Ok(ProxyParams {
            access_token: self.access_token,
            endpoint,
            mode,
            proxy_scheme: self.proxy_scheme.or_else(|| defaults.proxy_scheme.clone()),
            no_ssl_host_verify: self.no_ssl_host_verify || defaults.no_ssl_host_verify,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn register_with_overrides() {
        let cli = parse(&[
            "tw-agent",
            "--config",
            "/tmp/agent.toml",
            "register",
            "--template",
            "FleetTemplate",
            "--parameters",
            "params.json",
        ]);
        assert_eq!(cli.config, PathBuf::from("/tmp/agent.toml"));
        match cli.command {
            Command::Register {
                template,
                parameters,
                output,
            } => {
                assert_eq!(template.as_deref(), Some("FleetTemplate"));
                assert_eq!(parameters, Some(PathBuf::from("params.json")));
                assert!(output.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn named_shadow_update() {
        let cli = parse(&["tw-agent", "shadow", "--name", "config", "update", "{}"]);
        match cli.command {
            Command::Shadow {
                name,
                action: ShadowAction::Update { document },
            } => {
                assert_eq!(name.as_deref(), Some("config"));
                assert_eq!(document, "{}");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn proxy_requires_endpoint_choice() {
        assert!(
            Cli::try_parse_from([
                "tw-agent",
                "proxy",
                "--access-token",
                "tok",
                "--source-listen-port",
                "2222"
            ])
            .is_err()
        );
        assert!(
            Cli::try_parse_from([
                "tw-agent",
                "proxy",
                "--access-token",
                "tok",
                "--region",
                "us-east-1",
                "--proxy-endpoint",
                "host",
                "--source-listen-port",
                "2222"
            ])
            .is_err()
        );
    }

    #[test]
    fn proxy_args_become_params() {
        let cli = parse(&[
            "tw-agent",
            "proxy",
            "--access-token",
            "tok",
            "--region",
            "us-east-1",
            "--destination-app",
            "localhost:22",
        ]);
        let Command::Proxy(args) = cli.command else {
            panic!("expected proxy command");
        };
        let defaults = TunnelConfig {
            proxy_scheme: Some("wss".into()),
            ..TunnelConfig::default()
        };

        let params = args.into_params(&defaults).unwrap();

        assert_eq!(params.endpoint, ProxyEndpoint::Region("us-east-1".into()));
        assert_eq!(
            params.mode,
            ProxyMode::Destination {
                app: "localhost:22".into()
            }
        );
        assert_eq!(params.proxy_scheme.as_deref(), Some("wss"));
    }

    #[test]
    fn jobs_next_parses() {
        let cli = parse(&["tw-agent", "jobs", "next"]);
        assert!(matches!(
            cli.command,
            Command::Jobs {
                action: JobsAction::Next
            }
        ));
    }
}
