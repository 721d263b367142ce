//! Locating, layering and persisting `serial-engine.toml`.
//!
//! A configuration is built in three layers: built-in defaults, the keys the
//! file names, and `SERIAL_ENGINE_<SECTION>_<KEY>` environment variables.
//! The file and the environment are merged as TOML tables before anything is
//! deserialized, so a variable accepts exactly the spellings the file does.

use super::error::{ConfigError, ConfigResult};
use super::schema::{Config, DispatcherKind, LogFormat};
use crate::settings::{Handshake, Parity, StopBits};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use toml::{Table, Value};

const ENV_PREFIX: &str = "SERIAL_ENGINE";

const CONFIG_FILE_NAME: &str = "serial-engine.toml";

/// Directory under the platform config root.
const APP_DIR_NAME: &str = "serial-engine";

/// Names a file explicitly, ahead of every search location.
const CONFIG_PATH_ENV: &str = "SERIAL_ENGINE_CONFIG";

/// Where a loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// `SERIAL_ENGINE_CONFIG`, or a path handed to [`ConfigLoader::load_from`].
    Explicit,
    /// `./serial-engine.toml`
    WorkingDirectory,
    /// The per-user config directory.
    UserDirectory,
    /// No file; built-in defaults plus environment.
    Defaults,
}

/// Loaded configuration together with the file it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub config_path: Option<PathBuf>,
    pub config: Config,
    source: ConfigSource,
}

impl ConfigLoader {
    /// Search the standard locations, first match wins:
    ///
    /// 1. the file named by `SERIAL_ENGINE_CONFIG`
    /// 2. `./serial-engine.toml`
    /// 3. `serial-engine/serial-engine.toml` under `XDG_CONFIG_HOME`,
    ///    `~/.config`, or `%APPDATA%` on Windows
    ///
    /// Without a file the defaults are used. Environment overrides apply in
    /// every case.
    pub fn load() -> ConfigResult<Self> {
        match locate() {
            Some((source, path)) => Self::read(path, source),
            None => Ok(Self {
                config_path: None,
                config: build(Table::new())?,
                source: ConfigSource::Defaults,
            }),
        }
    }

    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::read(path.as_ref().to_path_buf(), ConfigSource::Explicit)
    }

    /// Defaults plus environment, with no backing file. Malformed overrides
    /// are skipped here; [`load`](Self::load) reports them.
    pub fn with_defaults() -> Self {
        let config = build(Table::new()).unwrap_or_else(|e| {
            tracing::debug!("Ignoring environment overrides: {}", e);
            Config::default()
        });
        Self {
            config_path: None,
            config,
            source: ConfigSource::Defaults,
        }
    }

    fn read(path: PathBuf, source: ConfigSource) -> ConfigResult<Self> {
        let config = build(read_table(&path)?)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(Self {
            config_path: Some(path),
            config,
            source,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Write back to the file this configuration was loaded from.
    pub fn save(&self) -> ConfigResult<()> {
        let path = self.config_path.as_deref().ok_or_else(|| {
            ConfigError::MissingRequired("configuration was not loaded from a file".to_string())
        })?;
        write_config(&self.config, path)
    }

    /// Write to `path`, creating parent directories as needed.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        write_config(&self.config, path.as_ref())
    }

    /// Re-read the backing file. Does nothing for a file-less loader.
    pub fn reload(&mut self) -> ConfigResult<()> {
        if let Some(path) = &self.config_path {
            self.config = build(read_table(path)?)?;
        }
        Ok(())
    }
}

/// First existing file among the search locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    locate().map(|(_, path)| path)
}

fn locate() -> Option<(ConfigSource, PathBuf)> {
    let explicit = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let candidates = [
        (ConfigSource::Explicit, explicit),
        (
            ConfigSource::WorkingDirectory,
            Some(PathBuf::from(CONFIG_FILE_NAME)),
        ),
        (ConfigSource::UserDirectory, get_default_config_path()),
    ];
    candidates
        .into_iter()
        .find_map(|(source, path)| path.filter(|p| p.is_file()).map(|p| (source, p)))
}

fn user_config_root() -> Option<PathBuf> {
    if cfg!(windows) {
        return std::env::var_os("APPDATA").map(PathBuf::from);
    }
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

/// Per-user directory new configuration files go into.
pub fn get_default_config_dir() -> Option<PathBuf> {
    user_config_root().map(|root| root.join(APP_DIR_NAME))
}

pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

fn read_table(path: &Path) -> ConfigResult<Table> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Layer the environment over `table` and deserialize the result.
fn build(mut table: Table) -> ConfigResult<Config> {
    apply_env_overrides(&mut table)?;
    Ok(Value::Table(table).try_into()?)
}

fn write_config(config: &Config, path: &Path) -> ConfigResult<()> {
    let write_error = |source| ConfigError::WriteError {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_error)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(write_error)
}

/// One `SERIAL_ENGINE_<SECTION>_<KEY>` variable and how its text becomes a
/// TOML value.
struct Override {
    section: &'static str,
    key: &'static str,
    parse: fn(&str) -> Result<Value, String>,
}

const OVERRIDES: &[Override] = &[
    Override { section: "port", key: "name", parse: text },
    Override { section: "port", key: "baud_rate", parse: integer },
    Override { section: "port", key: "data_bits", parse: integer },
    Override { section: "port", key: "parity", parse: word::<Parity> },
    Override { section: "port", key: "stop_bits", parse: word::<StopBits> },
    Override { section: "port", key: "handshake", parse: word::<Handshake> },
    Override { section: "port", key: "dtr", parse: flag },
    Override { section: "port", key: "rts", parse: flag },
    Override { section: "port", key: "discard_null", parse: flag },
    Override { section: "port", key: "read_timeout_ms", parse: integer },
    Override { section: "port", key: "write_timeout_ms", parse: integer },
    Override { section: "port", key: "received_bytes_threshold", parse: integer },
    Override { section: "logging", key: "level", parse: text },
    Override { section: "logging", key: "format", parse: word::<LogFormat> },
    Override { section: "engine", key: "dispatcher", parse: word::<DispatcherKind> },
    Override { section: "engine", key: "close_wait_ms", parse: integer },
];

impl Override {
    fn var(&self) -> String {
        format!(
            "{}_{}_{}",
            ENV_PREFIX,
            self.section.to_ascii_uppercase(),
            self.key.to_ascii_uppercase()
        )
    }
}

fn text(val: &str) -> Result<Value, String> {
    Ok(Value::String(val.to_string()))
}

fn integer(val: &str) -> Result<Value, String> {
    val.trim()
        .parse::<i64>()
        .map(Value::Integer)
        .map_err(|_| "Expected an integer".to_string())
}

fn flag(val: &str) -> Result<Value, String> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Value::Boolean(true)),
        "0" | "false" | "no" | "off" => Ok(Value::Boolean(false)),
        _ => Err("Expected a boolean".to_string()),
    }
}

/// An enum spelled as in the file, case-insensitively.
fn word<T: DeserializeOwned>(val: &str) -> Result<Value, String> {
    let value = Value::String(val.trim().to_ascii_lowercase());
    T::deserialize(value.clone())
        .map(|_| value)
        .map_err(|e| e.to_string())
}

fn apply_env_overrides(table: &mut Table) -> ConfigResult<()> {
    for item in OVERRIDES {
        let var = item.var();
        let Ok(raw) = std::env::var(&var) else {
            continue;
        };
        let value = (item.parse)(&raw).map_err(|message| ConfigError::env_parse(&var, message))?;
        let section = table
            .entry(item.section)
            .or_insert(Value::Table(Table::new()));
        match section {
            Value::Table(section) => {
                section.insert(item.key.to_string(), value);
            }
            _ => {
                return Err(ConfigError::env_parse(
                    var,
                    format!("[{}] is not a table in the configuration file", item.section),
                ))
            }
        }
    }
    Ok(())
}
