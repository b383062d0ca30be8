use std::{
    fs,
    path::{Path, PathBuf},
};

use fedgate_core::{
    config::GatewayConfig,
    err::{Context, Result},
};
use fedgate_logging::{info, warn};
use once_cell::sync::OnceCell;

pub const DEFAULT_CONFIG_PATH: &str = "fedgate.yaml";

/// We store our gateway configuration in a global static variable
static GATEWAY_CONFIG: OnceCell<GatewayConfig> = OnceCell::new();
static GATEWAY_CONFIG_PATH: OnceCell<PathBuf> = OnceCell::new();

/// Initialises the global config state
pub fn init_conf(config_path: &Path) -> Result<()> {
    info!("Loading configuration...");

    let conf = load_conf(config_path)?;
    GATEWAY_CONFIG.get_or_init(|| conf);
    GATEWAY_CONFIG_PATH.get_or_init(|| config_path.to_path_buf());

    Ok(())
}

/// Loads the config file, falling back to defaults when it does not exist
pub fn load_conf(config_path: &Path) -> Result<GatewayConfig> {
    if !config_path.exists() {
        warn!(
            "Config file {} not found, using defaults",
            config_path.display()
        );
        return Ok(GatewayConfig::default());
    }

    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config: {}", config_path.display()))?;

    serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config: {}", config_path.display()))
}

/// Gets the global gateway configuration
pub fn conf() -> &'static GatewayConfig {
    GATEWAY_CONFIG
        .get()
        .expect("Tried to retrieve gateway config before initialised")
}

/// Gets the global config path
pub fn conf_path() -> &'static Path {
    GATEWAY_CONFIG_PATH
        .get()
        .expect("Tried to retrieve gateway config path before initialised")
}

/// Prints the effective configuration, after defaulting, to stdout
pub fn dump_conf(config_path: &Path) -> Result<()> {
    let conf = load_conf(config_path)?;
    println!(
        "{}",
        serde_yaml::to_string(&conf).context("Failed to serialize config")?
    );
    Ok(())
}
