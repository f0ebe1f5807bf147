//! Default configuration file written by `mcp-remote config init`.
//!
//! Every option is present and commented out, so the file parses to
//! [`RemoteConfig::default()`](crate::RemoteConfig).

pub fn default_config_template() -> String {
    r#"# mcp-remote configuration
#
# Values may reference environment variables as ${NAME}.

[auth]
# Seconds allowed for the browser round trip, and for waiting on another
# process that is already authorizing the same server.
# timeout_secs = 300

# Age in seconds after which another process may take over an authorization
# lock even if its owner is still running. Defaults to timeout_secs + 30.
# stale_lock_secs = 330

# How often (milliseconds) a waiting process re-checks the lock.
# poll_interval_ms = 500

# Acquisition attempts before a waiting process gives up.
# max_attempts = 3

[callback]
# Where the authorization server redirects the browser. Leave port unset to
# let the OS pick a free port.
# host = "127.0.0.1"
# port = 3334
# path = "/oauth/callback"

[client]
# Metadata sent with dynamic client registration.
# name = "mcp-remote"
# uri = "https://example.com"
# software_id = "mcp-remote"
# software_version = "1.0.0"
# scopes = ["openid"]

[storage]
# Credential directory. Defaults to <config dir>/servers.
# dir = "${HOME}/.config/mcp-remote/servers"
"#
    .to_string()
}
