//! Configuration system for the coprox Copilot proxy.
//!
//! Provides TOML-based configuration with:
//! - `[server]`, `[auth]` and `[upstream]` sections, every field defaulted
//! - Config file layering (user config dir + project-local `coprox.toml`)
//! - Environment overrides for the deployment knobs (`HOST`, `PORT`, `API_KEY`)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
