use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};

#[derive(RustEmbed)]
#[folder = "src/conf/"]
#[include = "*.toml"]
struct EmbeddedConfigFS;

const DEFAULT_CONFIG: &str = "default_config.toml";
const ENV_PREFIX: &str = "GANTRY_";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub docker: Docker,
    pub execution: Execution,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct General {
    pub log_level: String,
    pub log_format: LogFormat,
    pub no_color: bool,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Docker {
    pub socket: String,
    /// The total amount of time any request is allowed to be pending for in seconds.
    pub timeout: u64,
    pub buildkit: bool,
    pub stream_passthrough: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub max_parallelism: usize,
    pub cleanup_after_success: bool,
    pub cleanup_after_failure: bool,
    pub stop_timeout: i64, // in seconds
}

impl Config {
    /// Reads the configuration. Later sources win: the embedded defaults, then either `path_override` or the
    /// default configuration paths, then `GANTRY_` environment variables (`__` separates nested keys, so
    /// `GANTRY_DOCKER__SOCKET` sets `docker.socket`).
    pub fn load(path_override: Option<&Path>) -> Result<Self> {
        let paths = match path_override {
            Some(path) => {
                if !path.is_file() {
                    bail!("configuration file '{}' does not exist", path.display());
                }
                vec![path.to_path_buf()]
            }
            None => config_paths(),
        };

        Self::from_sources(&paths)
    }

    fn from_sources(paths: &[PathBuf]) -> Result<Self> {
        let mut figment = Figment::from(Toml::string(&default_config()?));

        for path in paths {
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Could not parse configuration")
    }
}

fn default_config() -> Result<String> {
    let file = EmbeddedConfigFS::get(DEFAULT_CONFIG)
        .with_context(|| format!("embedded {DEFAULT_CONFIG} is missing"))?;

    String::from_utf8(file.data.into_owned()).context("embedded default configuration is not UTF-8")
}

/// Configuration files searched when no path is given; later files override earlier ones.
fn config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/gantry/gantry.toml")];

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join("gantry.toml"));
    }

    paths
}
