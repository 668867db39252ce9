use anyhow::{Context, Result};
use clap::Args;
use iotdm_mqtt::{
    DeviceDirectoryAuthService, LoggingEventHandler, SessionRegistry, TransportConfig,
    TransportContext, TransportServer,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};

#[derive(Args)]
pub struct ServeCommand {
    /// Configuration file path (JSON format)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// TCP bind address (e.g., `0.0.0.0:1883`), overrides the config file
    #[arg(long, short = 'H')]
    pub host: Option<SocketAddr>,

    /// Device directory file (JSON, see `device add`)
    #[arg(long, short = 'd', env = "IOTDM_DEVICE_FILE")]
    pub device_file: PathBuf,

    /// Maximum number of concurrent device connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds to wait for device authentication before refusing the CONNECT
    #[arg(long)]
    pub auth_timeout_secs: Option<u64>,
}

impl ServeCommand {
    /// Config file (or defaults) with command-line overrides applied.
    async fn resolve_config(&self) -> Result<TransportConfig> {
        let mut config = match &self.config {
            Some(path) => {
                debug!("Loading configuration from: {:?}", path);
                load_config_from_file(path)
                    .await
                    .with_context(|| format!("Failed to load config from {path:?}"))?
            }
            None => TransportConfig::default(),
        };

        if let Some(host) = self.host {
            config = config.with_bind_address(host);
        }
        if let Some(max) = self.max_connections {
            config = config.with_max_connections(max);
        }
        if let Some(secs) = self.auth_timeout_secs {
            config = config.with_auth_timeout(Duration::from_secs(secs));
        }

        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }
}

pub async fn execute(cmd: ServeCommand, verbose: bool, debug: bool) -> Result<()> {
    crate::init_basic_tracing(verbose, debug);

    let config = cmd.resolve_config().await?;
    let auth = Arc::new(
        DeviceDirectoryAuthService::from_file(&cmd.device_file)
            .await
            .with_context(|| format!("Failed to load device directory {:?}", cmd.device_file))?,
    );

    let ctx = TransportContext::new(
        Arc::new(config),
        Arc::clone(&auth) as Arc<dyn iotdm_mqtt::DeviceAuthService>,
        Arc::new(SessionRegistry::new()),
        Arc::new(LoggingEventHandler),
    );
    let server = TransportServer::bind(ctx)
        .await
        .context("Failed to start device transport")?;

    let addr = server.local_addr()?;
    println!("iotdm device transport listening on {addr}");
    println!("  devices: {}", auth.device_count());
    println!("  press Ctrl+C to stop");

    #[cfg(unix)]
    spawn_reload_on_hangup(Arc::clone(&auth));

    let shutdown = server.shutdown_handle();
    let mut server_task = tokio::spawn(server.run());

    tokio::select! {
        result = &mut server_task => {
            result.context("Transport task failed")?.context("Transport error")?;
            info!("Transport stopped");
            return Ok(());
        }
        res = signal::ctrl_c() => {
            if let Err(err) = res {
                error!("Unable to listen for shutdown signal: {err}");
            }
            println!("\nReceived Ctrl+C, shutting down...");
        }
    }

    shutdown.shutdown();
    server_task
        .await
        .context("Transport task failed")?
        .context("Transport error")?;
    println!("Device transport stopped");
    Ok(())
}

/// Re-reads the device directory on SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_hangup(auth: Arc<DeviceDirectoryAuthService>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Unable to listen for SIGHUP: {e}");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match auth.reload().await {
                Ok(()) => info!(devices = auth.device_count(), "Device directory reloaded"),
                Err(e) => error!("Device directory reload failed: {e}"),
            }
        }
    });
}

async fn load_config_from_file(config_path: &Path) -> Result<TransportConfig> {
    let contents = tokio::fs::read_to_string(config_path)
        .await
        .context("Failed to read config file")?;

    serde_json::from_str(&contents).context("Failed to parse config file as JSON")
}
