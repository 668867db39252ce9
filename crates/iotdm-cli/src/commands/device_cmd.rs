use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use iotdm_mqtt::{DataFormat, DeviceDirectoryAuthService, DeviceDirectoryFile, DeviceRecord};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct DeviceCommand {
    #[command(subcommand)]
    pub action: DeviceAction,
}

#[derive(Subcommand)]
pub enum DeviceAction {
    /// Add or replace a device in a directory file
    Add(AddDevice),
    /// Remove a device from a directory file
    Remove(RemoveDevice),
    /// Print the Argon2 hash of a secret
    HashSecret {
        /// Device secret
        secret: String,
    },
}

#[derive(Args)]
pub struct AddDevice {
    /// MQTT client id the device connects with
    pub client_id: String,

    #[arg(long)]
    pub device_id: String,

    #[arg(long)]
    pub product_id: String,

    /// Device secret (WARNING: visible in process list)
    #[arg(long)]
    pub secret: String,

    /// Username the device must present, if any
    #[arg(long)]
    pub username: Option<String>,

    #[arg(long, value_enum, default_value = "json")]
    pub format: Format,

    #[arg(long)]
    pub tenant_id: Option<String>,

    /// Directory file; created if missing
    #[arg(long, short)]
    pub file: PathBuf,
}

#[derive(Args)]
pub struct RemoveDevice {
    pub client_id: String,

    #[arg(long, short)]
    pub file: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Format {
    Json,
    Binary,
}

impl From<Format> for DataFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => DataFormat::Json,
            Format::Binary => DataFormat::Binary,
        }
    }
}

pub fn execute(cmd: DeviceCommand) -> Result<()> {
    match cmd.action {
        DeviceAction::Add(add) => add_device(add),
        DeviceAction::Remove(remove) => remove_device(&remove.client_id, &remove.file),
        DeviceAction::HashSecret { secret } => {
            let hash = DeviceDirectoryAuthService::hash_secret(&secret)?;
            println!("{hash}");
            Ok(())
        }
    }
}

fn add_device(add: AddDevice) -> Result<()> {
    if add.client_id.is_empty() {
        bail!("Client id cannot be empty");
    }

    let mut directory = read_directory(&add.file)?;
    let record = DeviceRecord {
        client_id: add.client_id.clone(),
        username: add.username,
        secret_hash: DeviceDirectoryAuthService::hash_secret(&add.secret)?,
        device_id: add.device_id,
        product_id: add.product_id,
        data_format: add.format.into(),
        device_code: None,
        tenant_id: add.tenant_id,
        node_type: None,
    };

    let replaced = directory.devices.iter().any(|d| d.client_id == record.client_id);
    directory.devices.retain(|d| d.client_id != record.client_id);
    directory.devices.push(record);
    write_directory(&add.file, &directory)?;

    if replaced {
        println!("Updated device {}", add.client_id);
    } else {
        println!("Added device {}", add.client_id);
    }
    Ok(())
}

fn remove_device(client_id: &str, path: &Path) -> Result<()> {
    let mut directory = read_directory(path)?;
    let before = directory.devices.len();
    directory.devices.retain(|d| d.client_id != client_id);
    if directory.devices.len() == before {
        bail!("Device {client_id} not found in {}", path.display());
    }
    write_directory(path, &directory)?;
    println!("Removed device {client_id}");
    Ok(())
}

fn read_directory(path: &Path) -> Result<DeviceDirectoryFile> {
    if !path.exists() {
        return Ok(DeviceDirectoryFile::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read device directory {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse device directory {}", path.display()))
}

fn write_directory(path: &Path, directory: &DeviceDirectoryFile) -> Result<()> {
    let contents = serde_json::to_string_pretty(directory)?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write device directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(file: &Path, client_id: &str, secret: &str) -> AddDevice {
        AddDevice {
            client_id: client_id.to_string(),
            device_id: format!("dev-{client_id}"),
            product_id: "prod-1".to_string(),
            secret: secret.to_string(),
            username: None,
            format: Format::Binary,
            tenant_id: None,
            file: file.to_path_buf(),
        }
    }

    #[test]
    fn test_add_replace_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("devices.json");

        add_device(add(&file, "c1", "one")).unwrap();
        add_device(add(&file, "c2", "two")).unwrap();
        add_device(add(&file, "c1", "three")).unwrap();

        let directory = read_directory(&file).unwrap();
        assert_eq!(directory.devices.len(), 2);
        let c1 = directory.devices.iter().find(|d| d.client_id == "c1").unwrap();
        assert_eq!(c1.data_format, DataFormat::Binary);
        assert!(DeviceDirectoryAuthService::verify_secret("three", &c1.secret_hash));

        remove_device("c2", &file).unwrap();
        assert_eq!(read_directory(&file).unwrap().devices.len(), 1);
        assert!(remove_device("c2", &file).is_err());
    }

    #[tokio::test]
    async fn test_written_directory_loads() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("devices.json");
        add_device(add(&file, "c1", "one")).unwrap();

        let service = DeviceDirectoryAuthService::from_file(&file).await.unwrap();
        assert_eq!(service.device_count(), 1);
    }
}
