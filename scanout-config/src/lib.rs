//! Configuration for scanout, decoded from KDL.

use std::path::Path;

use miette::{IntoDiagnostic, WrapErr};
use tracing::debug;

mod display;

pub use display::{Display, GuiSizeLimit};

#[derive(knuffel::Decode, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[knuffel(child, default)]
    pub display: Display,
}

impl Config {
    /// Parses a config from KDL text.
    pub fn parse(filename: &str, text: &str) -> Result<Self, knuffel::Error> {
        let _span = tracy_client::span!("Config::parse");
        knuffel::parse(filename, text)
    }

    /// Loads the config at `path`, falling back to defaults if the file doesn't exist.
    pub fn load(path: &Path) -> miette::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("config file at {path:?} not found, using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("error reading {path:?}"));
            }
        };

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("config.kdl");
        let config = Self::parse(filename, &contents).wrap_err("error parsing config")?;
        debug!("loaded config from {path:?}");

        Ok(config)
    }
}
