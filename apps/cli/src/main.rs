//! hopwire CLI
//!
//! Runs the panel and inspects its configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hopwire_logging::LogLevel;
use hopwire_server::{Panel, PanelConfig};
use tracing::info;

/// hopwire - control plane for traffic-forwarding edge nodes
#[derive(Parser)]
#[command(name = "hopwire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the panel
    Serve {
        /// Listen address, overrides the config file
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// JSON state file, overrides the config file
        #[arg(short, long)]
        data: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Write the effective configuration back to the config file
        #[arg(long)]
        write: bool,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<(PathBuf, PanelConfig)> {
    let path = path.unwrap_or_else(PanelConfig::default_path);
    let config = PanelConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    Ok((path, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    hopwire_logging::init(LogLevel::from_verbosity(cli.verbose));

    let (path, mut config) = load_config(cli.config)?;

    match cli.command {
        Commands::Serve { listen, data } => {
            if let Some(listen) = listen {
                config.listen_addr = listen.to_string();
            }
            if let Some(data) = data {
                config.data_path = Some(data);
            }
            info!("Using config {}", path.display());

            let panel = Panel::new(config).context("Failed to start panel")?;
            panel.serve().await.context("Panel stopped with an error")?;
        }
        Commands::Config { write } => {
            let rendered =
                serde_json::to_string_pretty(&config).context("Failed to render config")?;
            println!("{}", rendered);
            if write {
                config
                    .save(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Wrote {}", path.display());
            }
        }
    }

    Ok(())
}
