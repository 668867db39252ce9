use super::{AuthError, AuthResult, DeviceAuthService, ProtocolType, SecretCredentials};
use crate::error::{Result, TransportError};
use crate::session::{DataFormat, DeviceIdentity, NodeType};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, Salt, SaltString};
use argon2::Argon2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// One provisioned device in a directory file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Argon2 PHC string, see [`DeviceDirectoryAuthService::hash_secret`].
    pub secret_hash: String,
    pub device_id: String,
    pub product_id: String,
    pub data_format: DataFormat,
    #[serde(default)]
    pub device_code: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<NodeType>,
}

impl DeviceRecord {
    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id.clone(),
            product_id: self.product_id.clone(),
            data_format: self.data_format,
            device_code: self.device_code.clone(),
            tenant_id: self.tenant_id.clone(),
            node_type: self.node_type,
        }
    }
}

/// On-disk layout of a device directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDirectoryFile {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

/// Authenticates devices against a local table of provisioned secrets.
///
/// File format (JSON):
///
/// ```json
/// { "devices": [ { "client_id": "...", "secret_hash": "$argon2id$...",
///                  "device_id": "...", "product_id": "...", "data_format": "JSON" } ] }
/// ```
#[derive(Debug, Default)]
pub struct DeviceDirectoryAuthService {
    devices: Arc<RwLock<HashMap<String, DeviceRecord>>>,
    directory_file: Option<PathBuf>,
}

impl DeviceDirectoryAuthService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory backed by a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let service = Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            directory_file: Some(path.as_ref().to_path_buf()),
        };
        service.reload().await?;
        Ok(service)
    }

    /// Re-reads the directory file, replacing the table in one step. Does
    /// nothing for a directory built in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed; the previous
    /// table stays in place
    pub async fn reload(&self) -> Result<()> {
        let Some(ref path) = self.directory_file else {
            return Ok(());
        };

        let content = fs::read_to_string(path).await.map_err(|e| {
            TransportError::Config(format!(
                "Failed to read device directory {}: {e}",
                path.display()
            ))
        })?;
        let file: DeviceDirectoryFile = serde_json::from_str(&content).map_err(|e| {
            TransportError::Config(format!(
                "Failed to parse device directory {}: {e}",
                path.display()
            ))
        })?;

        let mut devices = HashMap::with_capacity(file.devices.len());
        for record in file.devices {
            if record.client_id.is_empty() {
                warn!(device_id = %record.device_id, "Skipping directory entry with empty client id");
                continue;
            }
            if let Some(previous) = devices.insert(record.client_id.clone(), record) {
                warn!(client_id = %previous.client_id, "Duplicate client id in device directory, last entry wins");
            }
        }

        let count = devices.len();
        *self.devices.write() = devices;
        info!(path = %path.display(), devices = count, "Loaded device directory");
        Ok(())
    }

    pub fn add_device(&self, record: DeviceRecord) {
        self.devices.write().insert(record.client_id.clone(), record);
    }

    pub fn remove_device(&self, client_id: &str) -> bool {
        self.devices.write().remove(client_id).is_some()
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Generates an Argon2 hash for a device secret.
    ///
    /// # Errors
    ///
    /// Returns an error if salt generation or hashing fails
    pub fn hash_secret(secret: &str) -> std::result::Result<String, AuthError> {
        let mut bytes = [0u8; Salt::RECOMMENDED_LENGTH];
        getrandom::fill(&mut bytes).map_err(|e| {
            error!("Failed to generate random salt: {e}");
            AuthError::Unavailable("salt generation failed".into())
        })?;
        let salt = SaltString::encode_b64(&bytes).map_err(|e| {
            error!("Failed to encode salt: {e}");
            AuthError::Unavailable("salt encoding failed".into())
        })?;
        Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| {
                error!("Failed to hash secret: {e}");
                AuthError::Unavailable("secret hashing failed".into())
            })
    }

    #[must_use]
    pub fn verify_secret(secret: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash).map_err(|e| {
            error!("Failed to parse secret hash: {e}");
        }) else {
            return false;
        };
        Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok()
    }
}

impl DeviceAuthService for DeviceDirectoryAuthService {
    fn authenticate_by_secret<'a>(
        &'a self,
        protocol: ProtocolType,
        credentials: &'a SecretCredentials,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<AuthResult, AuthError>> + Send + 'a>> {
        Box::pin(async move {
            let record = self.devices.read().get(&credentials.client_id).cloned();
            let Some(record) = record else {
                warn!(client_id = %credentials.client_id, ?protocol, "Unknown device");
                return Ok(AuthResult::rejected());
            };

            if record.username.is_some() && record.username != credentials.username {
                warn!(client_id = %credentials.client_id, "Username mismatch");
                return Ok(AuthResult::rejected());
            }

            // argon2 verification is CPU-bound
            let secret = credentials.password.clone();
            let hash = record.secret_hash.clone();
            let verified = tokio::task::spawn_blocking(move || Self::verify_secret(&secret, &hash))
                .await
                .map_err(|e| AuthError::Unavailable(format!("verification task failed: {e}")))?;

            if verified {
                debug!(client_id = %credentials.client_id, device_id = %record.device_id, "Device authenticated");
                Ok(AuthResult::authenticated(record.identity()))
            } else {
                warn!(client_id = %credentials.client_id, "Secret mismatch");
                Ok(AuthResult::rejected())
            }
        })
    }
}
