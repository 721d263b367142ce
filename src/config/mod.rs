//! Configuration for the `serial-engine` binary and for applications that
//! want file-driven port settings.
//!
//! [`ConfigLoader::load`] uses the file named by `SERIAL_ENGINE_CONFIG`,
//! then `./serial-engine.toml`, then `serial-engine/serial-engine.toml` in
//! the per-user config directory, and falls back to built-in defaults.
//!
//! Environment variables named `SERIAL_ENGINE_<SECTION>_<KEY>` override the
//! file, for example:
//! - `SERIAL_ENGINE_PORT_NAME=/dev/ttyUSB0`
//! - `SERIAL_ENGINE_PORT_BAUD_RATE=115200`
//! - `SERIAL_ENGINE_LOGGING_LEVEL=debug`
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_engine::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let port = loader.config().port.to_configuration()?;
//! println!("{} at {} baud", port.port_name, port.baud_rate);
//! # Ok::<(), serial_engine::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
    ConfigSource,
};
pub use schema::{Config, DispatcherKind, EngineSection, LogFormat, LoggingConfig, PortSection};
