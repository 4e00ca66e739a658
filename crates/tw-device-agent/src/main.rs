//! Thingwire device agent: provisioning, shadows, jobs and secure tunnels
//! for one AWS IoT thing.

use std::path::Path;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tw_device_agent::cli::{Cli, Command, JobsAction, ShadowAction};
use tw_device_agent::config::{AgentConfig, TunnelConfig};
use tw_device_agent::provisioning::{FileCredentialStore, ProvisioningFlow, load_parameters};
use tw_device_agent::tunnel::{LocalProxyLauncher, ProxyLauncher, TunnelWatcher};
use tw_device_agent::{identity, mqtt_loop};
use tw_mqtt_channel::{JobsClient, MqttChannel, ShadowClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "tw-agent starting");

    // ── Shutdown ────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::MacAddress => {
            let hardware = identity::local_hardware_address().await?;
            println!("interface: {}", hardware.interface);
            println!("address:   {}", hardware.address);
            println!("unique id: {}", hardware.unique_id()?);
        }
        Command::Proxy(args) => {
            let tunnel = tunnel_defaults(&cli.config);
            let params = args.into_params(&tunnel)?;
            let launcher = LocalProxyLauncher::new(&tunnel.proxy_binary);
            launcher.check_available()?;
            tokio::select! {
                result = launcher.launch(&params) => result?,
                () = cancel.cancelled() => {}
            }
        }
        Command::CheckMqtt => {
            let config = AgentConfig::from_file(&cli.config)?;
            let thing_name = identity::resolve_thing_name(config.thing_name.as_deref()).await?;
            let (_channel, mut eventloop) = MqttChannel::new(&config.mqtt, &thing_name)?;
            mqtt_loop::wait_connected(&mut eventloop, &cancel).await?;
            println!("connected to {} as {}", config.mqtt.broker_host, config.mqtt.client_id_or(&thing_name));
        }
        command => {
            let config = AgentConfig::from_file(&cli.config)?;
            let thing_name = identity::resolve_thing_name(config.thing_name.as_deref()).await?;
            let (channel, eventloop) = MqttChannel::new(&config.mqtt, &thing_name)?;
            let driver = tokio::spawn(mqtt_loop::run(eventloop, channel.router(), cancel.clone()));

            let result = run_connected(command, &config, &channel, &cancel).await;

            cancel.cancel();
            if let Err(e) = driver.await {
                tracing::warn!(error = %e, "MQTT driver task failed");
            }
            result?;
        }
    }

    Ok(())
}

/// Commands that need a live MQTT session.
async fn run_connected(
    command: Command,
    config: &AgentConfig,
    channel: &MqttChannel,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let thing_name = channel.thing_name();

    match command {
        Command::Register {
            template,
            parameters,
            output,
        } => {
            let mut merged = config.provisioning.parameters.clone();
            if let Some(path) = parameters {
                merged.extend(load_parameters(&path)?);
            }
            let template = template.unwrap_or_else(|| config.provisioning.template_name.clone());
            let store = FileCredentialStore::new(
                output.unwrap_or_else(|| config.provisioning.output_dir.clone()),
            );

            let registration = ProvisioningFlow::new(channel, &store, template, thing_name)
                .run(merged, cancel)
                .await?;
            println!("{}", registration.thing_name);
        }
        Command::ListenForTunnel => {
            let launcher = LocalProxyLauncher::new(&config.tunnel.proxy_binary);
            let mut watcher = TunnelWatcher::new(channel, &launcher, thing_name, config.tunnel.clone());
            watcher.watch(cancel).await?;
        }
        Command::Shadow { name, action } => {
            let shadow = match name {
                Some(name) => ShadowClient::named(channel, thing_name, name),
                None => ShadowClient::new(channel, thing_name),
            };
            match action {
                ShadowAction::Get => print_payload(&shadow.get(cancel).await?),
                ShadowAction::Delete => shadow.delete(cancel).await?,
                ShadowAction::Update { document } => shadow.update(document.as_bytes()).await?,
                ShadowAction::UpdateDocument { document } => {
                    shadow.update_document(document.as_bytes()).await?;
                }
                ShadowAction::Watch => {
                    let mut changes = shadow.subscribe_for_changes().await?;
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            Some(msg) = changes.accepted.recv() => print_payload(&msg.payload),
                            Some(msg) = changes.rejected.recv() => {
                                tracing::warn!(topic = %msg.topic, "shadow update rejected");
                                print_payload(&msg.payload);
                            }
                            else => break,
                        }
                    }
                    shadow.unsubscribe_changes(changes).await?;
                }
            }
        }
        Command::Jobs { action } => {
            let jobs = JobsClient::new(channel, thing_name);
            match action {
                JobsAction::Next => print_payload(&jobs.get_next(cancel).await?),
                JobsAction::Listen => {
                    let mut notifications = jobs.listen().await?;
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            payload = notifications.recv() => match payload {
                                Some(payload) => print_payload(&payload),
                                None => break,
                            },
                        }
                    }
                    jobs.unsubscribe_all().await?;
                }
            }
        }
        Command::MacAddress | Command::CheckMqtt | Command::Proxy(_) => {}
    }

    Ok(())
}

fn print_payload(payload: &[u8]) {
    println!("{}", String::from_utf8_lossy(payload));
}

fn tunnel_defaults(config_path: &Path) -> TunnelConfig {
    match AgentConfig::from_file(config_path) {
        Ok(config) => config.tunnel,
        Err(e) => {
            tracing::debug!(error = %e, "no usable config, using default proxy settings");
            TunnelConfig::default()
        }
    }
}
