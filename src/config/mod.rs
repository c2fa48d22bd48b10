//! Configuration management
//!
//! Layered: built-in defaults, then an optional `config.{toml,json,yaml}` in
//! the config directory, then `DOP_*` environment variables.

use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::device::{DeviceClass, PageData};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub hardware: HardwareBackend,

    /// Virtual devices plugged in at startup when running on the simulator.
    #[serde(default = "default_simulated_devices")]
    pub simulated_devices: Vec<DeviceClass>,

    /// Pages registered on every device when it arrives.
    #[serde(default)]
    pub pages: Vec<PageConfig>,

    /// Write the last pressed soft button to the top line of the shown page.
    #[serde(default)]
    pub echo_buttons: bool,
}

fn default_port() -> u16 {
    8087
}

fn default_simulated_devices() -> Vec<DeviceClass> {
    vec![DeviceClass::X52Pro]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareBackend {
    /// In-process device simulator. The vendor SDK shim plugs in as another
    /// `DirectOutput` implementation.
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageConfig {
    pub index: u32,
    #[serde(flatten)]
    pub data: PageData,
}

impl Config {
    /// Default pages keyed by index; a later entry wins over an earlier one.
    pub fn default_pages(&self) -> BTreeMap<u32, PageData> {
        self.pages
            .iter()
            .map(|p| (p.index, p.data.clone()))
            .collect()
    }
}

/// Get config directory (DOP_CONFIG_DIR or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DOP_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/direct-output-proxy");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("direct-output-proxy");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/direct-output-proxy");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("direct-output-proxy");
        }
    }

    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("port", default_port() as i64)?
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // DOP_PORT, DOP_SIMULATED_DEVICES=x52pro,fip, ...
        .add_source(
            ::config::Environment::with_prefix("DOP")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("simulated_devices")
                .try_parsing(true),
        );

    // Precedence: DOP_PORT > PORT > config file > default
    if let Ok(port) = std::env::var("DOP_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    } else if let Ok(port) = std::env::var("PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    }

    let config = builder.build()?;
    Ok(config.try_deserialize()?)
}
