use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{self, WrapErr};
use lxd_common::{BlockDeviceInfo, Instance, Vif};
use lxd_driver::session::{HostEnvironment, HostInfo};
use lxd_driver::{DriverConfig, ProfileBuilder, RestSession, Session};
use serde::de::DeserializeOwned;
use tracing::info;

/// Operator tooling for the LXD compute driver. Settings come from `LXD_*`
/// environment variables (a `.env` file is honored).
#[derive(Parser)]
#[command(name = "lxd-driver", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Render the profile an instance would be spawned with.
    Profile(ProfileArgs),
    /// Print a container's runtime state.
    State { name: String },
    /// List containers on the host.
    List,
}

#[derive(Args)]
struct ProfileArgs {
    /// Instance description (JSON).
    #[arg(long)]
    instance: PathBuf,
    /// Network info: a JSON array of VIFs.
    #[arg(long)]
    network: Option<PathBuf>,
    /// Block device info (JSON).
    #[arg(long)]
    block_devices: Option<PathBuf>,
    /// Storage backend to assume instead of asking the server.
    #[arg(long)]
    storage: Option<String>,
    /// API extensions to assume present; only used with --storage.
    #[arg(long = "extension")]
    extensions: Vec<String>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> eyre::Result<T> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).wrap_err_with(|| format!("parsing {}", path.display()))
}

async fn render_profile(config: &DriverConfig, args: ProfileArgs) -> eyre::Result<()> {
    let instance: Instance = read_json(&args.instance)?;
    let network_info: Vec<Vif> = match &args.network {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let block_device_info: BlockDeviceInfo = match &args.block_devices {
        Some(path) => read_json(path)?,
        None => BlockDeviceInfo::default(),
    };

    let host = match args.storage {
        Some(storage) => HostInfo {
            api_extensions: args.extensions,
            environment: HostEnvironment {
                storage,
                ..Default::default()
            },
        },
        None => {
            info!(endpoint = %config.endpoint, "Reading host facts from server");
            RestSession::new(config)?.host_info().await?
        }
    };

    let profile = ProfileBuilder::new(config).build(
        &instance,
        &network_info,
        &block_device_info,
        &host,
    )?;
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = DriverConfig::from_env()?;

    match cli.command {
        Command::Profile(args) => render_profile(&config, args).await?,
        Command::State { name } => {
            let state = RestSession::new(&config)?.container_state(&name).await?;
            println!("{name}: {} ({})", state.status, state.status_code);
        }
        Command::List => {
            for name in RestSession::new(&config)?.container_list().await? {
                println!("{name}");
            }
        }
    }
    Ok(())
}
