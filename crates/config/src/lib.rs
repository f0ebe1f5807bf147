//! Configuration loading and validation for `mcp-remote`.
//!
//! Config files: `mcp-remote.toml`, `mcp-remote.yaml` or `mcp-remote.json`,
//! searched in `./` then in the user config directory.

mod env_subst;
pub mod loader;
pub mod schema;
pub mod template;
pub mod validate;

pub use {
    loader::{
        CONFIG_DIR_ENV, clear_config_dir, config_dir, discover_and_load, init_config,
        load_config, set_config_dir,
    },
    schema::{AuthSettings, CallbackSettings, ClientSettings, RemoteConfig, StorageSettings},
    validate::{Diagnostic, Severity, validate},
};
