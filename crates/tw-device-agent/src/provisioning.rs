//! Fleet provisioning by claim.
//!
//! Two chained exchanges: CreateKeysAndCertificate issues a certificate and
//! ownership token, which are persisted before RegisterThing binds them to a
//! new thing through the provisioning template. A failed registration leaves
//! the persisted credentials in place.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tw_mqtt_channel::{Channel, Exchange, MqttError};
use tw_protocol::provisioning::{
    CredentialBundle, RegisterThingRequest, RegisterThingResponse, UNIQUE_ID_PARAMETER,
};
use tw_protocol::shadows::EMPTY_REQUEST;
use tw_protocol::topics;

use crate::error::{AgentError, AgentResult};

pub const CERTIFICATE_FILE: &str = "device.certificate.pem";
pub const PRIVATE_KEY_FILE: &str = "device.private.key";
pub const RECORD_FILE: &str = "cert.json";

// ── Credential storage ────────────────────────────────────────

/// Durable storage for issued credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Write one named artifact. `secret` artifacts must not be readable by
    /// other users.
    async fn write(&self, artifact: &str, contents: &[u8], secret: bool) -> AgentResult<()>;
}

/// Writes the certificate, private key and JSON record of a bundle.
pub async fn persist_bundle(store: &dyn CredentialStore, bundle: &CredentialBundle) -> AgentResult<()> {
    let record = serde_json::to_vec_pretty(bundle).map_err(|e| AgentError::Persistence {
        artifact: RECORD_FILE.to_string(),
        reason: e.to_string(),
    })?;

    store
        .write(CERTIFICATE_FILE, bundle.certificate_pem.as_bytes(), false)
        .await?;
    store
        .write(PRIVATE_KEY_FILE, bundle.private_key.as_bytes(), true)
        .await?;
    store.write(RECORD_FILE, &record, true).await
}

/// Stores artifacts as files in one directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_of(&self, artifact: &str) -> PathBuf {
        self.dir.join(artifact)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn write(&self, artifact: &str, contents: &[u8], secret: bool) -> AgentResult<()> {
        let path = self.path_of(artifact);
        let failed = |e: std::io::Error| AgentError::Persistence {
            artifact: path.display().to_string(),
            reason: e.to_string(),
        };

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        if secret {
            owner_only(&mut options);
        }

        let mut file = options.open(&path).await.map_err(failed)?;
        if secret {
            // An existing file keeps its old mode on open.
            restrict(&path).await.map_err(failed)?;
        }
        file.write_all(contents).await.map_err(failed)?;
        file.flush().await.map_err(failed)?;

        tracing::info!(path = %path.display(), "credential artifact written");
        Ok(())
    }
}

#[cfg(unix)]
fn owner_only(options: &mut tokio::fs::OpenOptions) {
    options.mode(0o600);
}

#[cfg(not(unix))]
fn owner_only(_options: &mut tokio::fs::OpenOptions) {}

#[cfg(unix)]
async fn restrict(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    artifacts: Mutex<HashMap<String, (Vec<u8>, bool)>>,
    failing: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes of `artifact` fail.
    pub fn fail_on(&self, artifact: &str) {
        *self.failing.lock().unwrap() = Some(artifact.to_string());
    }

    pub fn get(&self, artifact: &str) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .unwrap()
            .get(artifact)
            .map(|(contents, _)| contents.clone())
    }

    pub fn is_secret(&self, artifact: &str) -> bool {
        self.artifacts
            .lock()
            .unwrap()
            .get(artifact)
            .is_some_and(|(_, secret)| *secret)
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn write(&self, artifact: &str, contents: &[u8], secret: bool) -> AgentResult<()> {
        if self.failing.lock().unwrap().as_deref() == Some(artifact) {
            return Err(AgentError::Persistence {
                artifact: artifact.to_string(),
                reason: "storage unavailable".to_string(),
            });
        }
        self.artifacts
            .lock()
            .unwrap()
            .insert(artifact.to_string(), (contents.to_vec(), secret));
        Ok(())
    }
}

// ── Parameters ────────────────────────────────────────────────

/// Load template parameters from a JSON object of strings.
pub fn load_parameters(path: &Path) -> AgentResult<BTreeMap<String, String>> {
    let contents = std::fs::read(path)
        .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_slice(&contents).map_err(|e| {
        AgentError::Config(format!(
            "{} is not a JSON object of strings: {e}",
            path.display()
        ))
    })
}

// ── Flow ──────────────────────────────────────────────────────

/// Outcome of a completed provisioning flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub thing_name: String,
    pub certificate_id: String,
    pub device_configuration: BTreeMap<String, String>,
}

pub struct ProvisioningFlow<'a, C: Channel + ?Sized> {
    channel: &'a C,
    store: &'a dyn CredentialStore,
    template_name: String,
    unique_id: String,
}

impl<'a, C: Channel + ?Sized> ProvisioningFlow<'a, C> {
    pub fn new(
        channel: &'a C,
        store: &'a dyn CredentialStore,
        template_name: impl Into<String>,
        unique_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            store,
            template_name: template_name.into(),
            unique_id: unique_id.into(),
        }
    }

    /// Create credentials, persist them, then register the thing.
    pub async fn run(
        &self,
        parameters: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> AgentResult<Registration> {
        if self.template_name.is_empty() {
            return Err(AgentError::Config("no provisioning template configured".into()));
        }

        let bundle = self.create_credentials(cancel).await?;
        persist_bundle(self.store, &bundle).await?;

        let response = self
            .register(&bundle.certificate_ownership_token, parameters, cancel)
            .await?;
        tracing::info!(
            thing_name = %response.thing_name,
            certificate_id = %bundle.certificate_id,
            template = %self.template_name,
            "thing registered"
        );

        Ok(Registration {
            thing_name: response.thing_name,
            certificate_id: bundle.certificate_id,
            device_configuration: response.device_configuration,
        })
    }

    async fn create_credentials(&self, cancel: &CancellationToken) -> AgentResult<CredentialBundle> {
        let topic = topics::certificates_create();
        let payload = Exchange::request_reply(&topic)
            .trigger(topic.clone(), EMPTY_REQUEST, QoS::AtMostOnce)
            .perform(self.channel, cancel)
            .await?
            .into_payload()?;

        let bundle: CredentialBundle = serde_json::from_slice(&payload).map_err(|e| {
            MqttError::ProtocolViolation(format!("create reply is not a credential bundle: {e}"))
        })?;
        if bundle.certificate_ownership_token.is_empty() {
            return Err(MqttError::ProtocolViolation(
                "create reply carries an empty certificate ownership token".into(),
            )
            .into());
        }

        tracing::info!(certificate_id = %bundle.certificate_id, "certificate issued");
        Ok(bundle)
    }

    async fn register(
        &self,
        ownership_token: &str,
        mut parameters: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> AgentResult<RegisterThingResponse> {
        parameters.insert(UNIQUE_ID_PARAMETER.to_string(), self.unique_id.clone());
        let request = RegisterThingRequest {
            certificate_ownership_token: ownership_token.to_string(),
            parameters,
        };

        let topic = topics::provision(&self.template_name);
        let payload = Exchange::request_reply(&topic)
            .trigger_json(topic.clone(), &request, QoS::AtMostOnce)?
            .perform(self.channel, cancel)
            .await?
            .into_payload()?;

        serde_json::from_slice(&payload).map_err(|e| {
            AgentError::from(MqttError::ProtocolViolation(format!(
                "register reply has no thing name: {e}"
            )))
        })
    }
}
