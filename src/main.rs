use std::env;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use scanout::kms::{
    fourcc_string, open_display, Authority, KmsDevice, KmsSession, Resolution,
};
use scanout_config::{Config, GuiSizeLimit};
use serde::Serialize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the config file (default: `$XDG_CONFIG_HOME/scanout/config.kdl`).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Skip devices without a connected display.
    #[arg(long, global = true)]
    require_connector: bool,
    /// Cap the GUI size on large screens, from 0 (no cap) to 4.
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(0..=4))]
    limit_gui_size: Option<u8>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the connector, CRTC and planes chosen to drive the display.
    Probe {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List the modes of the chosen connector.
    Modes {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct Probe<'a> {
    device: &'a Path,
    driver: Option<String>,
    connector: &'a str,
    encoder: u32,
    crtc: u32,
    original_crtc: u32,
    gui_plane: u32,
    gui_format: String,
    video_plane: Option<u32>,
    authority: Authority,
    gui_size_limit: u8,
    resolution: Resolution,
}

fn default_config_path() -> Option<PathBuf> {
    let dirs = ProjectDirs::from("", "", "scanout")?;
    Some(dirs.config_dir().join("config.kdl"))
}

fn load_config(path: Option<PathBuf>) -> Config {
    let Some(path) = path.or_else(default_config_path) else {
        warn!("error getting the config directory; using the default config");
        return Config::default();
    };

    match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            warn!("{err:?}");
            Config::default()
        }
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(io::stdout().lock(), value).context("error writing JSON")?;
    println!();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let directives = env::var("RUST_LOG").unwrap_or_else(|_| "scanout=debug".to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .compact()
        .with_writer(io::stderr)
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config);
    if cli.require_connector {
        config.display.require_connector = true;
    }
    if let Some(limit) = cli.limit_gui_size.and_then(GuiSizeLimit::from_setting) {
        config.display.limit_gui_size = limit;
    }
    debug!("{:?}", config.display);

    let display = open_display(&config.display).context("error opening the display device")?;
    let driver = display.card.driver_info().ok().map(|info| info.name);
    let path = display.path.clone();

    let session = KmsSession::initialize(display.card, config.display.limit_gui_size)
        .context("error initializing the display")?;

    match cli.command {
        Command::Probe { json } => {
            let probe = Probe {
                device: &path,
                driver,
                connector: &session.connector().name,
                encoder: session.encoder().id,
                crtc: session.crtc().id,
                original_crtc: session.original_crtc().id,
                gui_plane: session.gui_plane().id,
                gui_format: fourcc_string(session.gui_format() as u32),
                video_plane: session.video_plane().map(|plane| plane.id),
                authority: session.authority(),
                gui_size_limit: config.display.limit_gui_size.setting(),
                resolution: session.current_resolution(),
            };

            if json {
                print_json(&probe)?;
            } else {
                println!("device:     {}", probe.device.display());
                if let Some(driver) = &probe.driver {
                    println!("driver:     {driver}");
                }
                println!("connector:  {}", probe.connector);
                println!("encoder:    {}", probe.encoder);
                println!("crtc:       {} (was {})", probe.crtc, probe.original_crtc);
                println!("gui plane:  {} ({})", probe.gui_plane, probe.gui_format);
                match probe.video_plane {
                    Some(plane) => println!("video plane: {plane}"),
                    None => println!("video plane: none"),
                }
                println!("authority:  {:?}", probe.authority);
                println!("gui limit:  {}", probe.gui_size_limit);
                println!("mode:       {}", probe.resolution);
            }
        }
        Command::Modes { json } => {
            let modes = session.modes();
            if json {
                print_json(&modes)?;
            } else {
                let current = session.current_mode();
                for mode in &modes {
                    let marker = if mode.id == Some(current) { '*' } else { ' ' };
                    println!("{marker} {mode}");
                }
            }
        }
    }

    Ok(())
}
