use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::RemoteConfig, template::default_config_template};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "mcp-remote.toml",
    "mcp-remote.yaml",
    "mcp-remote.yml",
    "mcp-remote.json",
];

/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "MCP_REMOTE_CONFIG_DIR";

static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Override the config directory for the rest of the process (e.g. `--config-dir`).
pub fn set_config_dir(dir: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(dir);
}

/// Drop a programmatic override set with [`set_config_dir`].
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = None;
}

/// Returns the config directory.
///
/// Resolution order:
/// 1. programmatic override ([`set_config_dir`])
/// 2. `MCP_REMOTE_CONFIG_DIR`
/// 3. the platform config dir (`~/.config/mcp-remote` on Linux)
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
    {
        return Some(dir);
    }
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    directories::ProjectDirs::from("", "", "mcp-remote").map(|d| d.config_dir().to_path_buf())
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<RemoteConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&substitute_env(&raw), path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./mcp-remote.{toml,yaml,yml,json}` (project-local)
/// 2. `<config_dir>/mcp-remote.{toml,yaml,yml,json}` (user-global)
///
/// Returns `RemoteConfig::default()` if no config file is found or the file
/// does not parse.
pub fn discover_and_load() -> RemoteConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    RemoteConfig::default()
}

/// Write the documented default config to `<config_dir>/mcp-remote.toml`.
///
/// An existing file is left untouched; returns its path either way.
pub fn init_config() -> anyhow::Result<PathBuf> {
    let dir = config_dir().ok_or_else(|| anyhow::anyhow!("no config directory available"))?;
    let path = dir.join(CONFIG_FILENAMES[0]);
    if path.exists() {
        debug!(path = %path.display(), "config file already exists");
        return Ok(path);
    }
    std::fs::create_dir_all(&dir)?;
    std::fs::write(&path, default_config_template())?;
    Ok(path)
}

fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists());
    if local.is_some() {
        return local;
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<RemoteConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("mcp-remote.toml");
        std::fs::write(&toml_path, "[callback]\nport = 3334\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().callback.port, Some(3334));

        let yaml_path = dir.path().join("mcp-remote.yaml");
        std::fs::write(&yaml_path, "auth:\n  timeout_secs: 42\n").unwrap();
        assert_eq!(load_config(&yaml_path).unwrap().auth.timeout_secs, 42);

        let json_path = dir.path().join("mcp-remote.json");
        std::fs::write(&json_path, r#"{"client":{"name":"ci-runner"}}"#).unwrap();
        assert_eq!(load_config(&json_path).unwrap().client.name, "ci-runner");
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-remote.ini");
        std::fs::write(&path, "x=1").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("nope.toml")).is_err());
    }

    #[test]
    fn expands_env_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp-remote.toml");
        std::fs::write(&path, "[client]\nname = \"${MCP_REMOTE_UNSET_FOR_TEST}\"\n").unwrap();
        assert_eq!(
            load_config(&path).unwrap().client.name,
            "${MCP_REMOTE_UNSET_FOR_TEST}"
        );
    }

    #[test]
    fn programmatic_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        set_config_dir(dir.path().to_path_buf());
        assert_eq!(config_dir().as_deref(), Some(dir.path()));

        let path = init_config().unwrap();
        assert_eq!(path, dir.path().join("mcp-remote.toml"));
        assert_eq!(load_config(&path).unwrap(), RemoteConfig::default());
        std::fs::write(&path, "[auth]\ntimeout_secs = 9\n").unwrap();
        init_config().unwrap();
        assert_eq!(load_config(&path).unwrap().auth.timeout_secs, 9);
        clear_config_dir();
    }
}
