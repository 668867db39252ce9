use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{device_cmd, serve_cmd};

#[derive(Parser)]
#[command(name = "iotdm-transport")]
#[command(about = "MQTT device transport for the iotdm platform")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device transport server
    Serve(serve_cmd::ServeCommand),
    /// Manage the device directory file
    Device(device_cmd::DeviceCommand),
}

/// Installs a fmt subscriber. `RUST_LOG` wins over the flags.
pub fn init_basic_tracing(verbose: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "iotdm_mqtt={default_level},iotdm_transport={default_level}"
        ))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(cmd) => serve_cmd::execute(cmd, cli.verbose, cli.debug).await,
        Commands::Device(cmd) => {
            init_basic_tracing(cli.verbose, cli.debug);
            device_cmd::execute(cmd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from([
            "iotdm-transport",
            "serve",
            "--device-file",
            "devices.json",
            "--host",
            "127.0.0.1:2883",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Serve(cmd) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(cmd.host, Some("127.0.0.1:2883".parse().unwrap()));
    }
}
