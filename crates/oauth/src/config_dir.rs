use std::path::PathBuf;

/// Returns the configured mcp-remote config directory.
///
/// Resolution order comes from `mcp_remote_config::config_dir()`:
/// 1. programmatic override (`set_config_dir`)
/// 2. `MCP_REMOTE_CONFIG_DIR`
/// 3. the platform config directory for `mcp-remote`
pub fn remote_config_dir() -> PathBuf {
    mcp_remote_config::config_dir().unwrap_or_else(|| PathBuf::from(".config/mcp-remote"))
}

/// Root of the per-server credential namespaces.
pub fn credentials_dir() -> PathBuf {
    remote_config_dir().join("servers")
}
