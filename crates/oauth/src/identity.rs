//! Stable per-server namespace key.

use std::fmt;

use {
    sha2::{Digest, Sha256},
    url::Url,
};

/// SHA-256 of the normalized server URL (plus resource indicator, if any),
/// rendered as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    hash: String,
    server_url: String,
}

impl ServerIdentity {
    pub fn from_url(server_url: &str) -> Self {
        Self::derive(server_url, None)
    }

    /// Identity for a server used with a specific RFC 8707 resource indicator.
    pub fn with_resource(server_url: &str, resource: Option<&str>) -> Self {
        Self::derive(server_url, resource.filter(|r| !r.is_empty()))
    }

    fn derive(server_url: &str, resource: Option<&str>) -> Self {
        let normalized = normalize_url(server_url);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        if let Some(resource) = resource {
            hasher.update(b"\0resource=");
            hasher.update(normalize_url(resource).as_bytes());
        }
        Self {
            hash: format!("{:x}", hasher.finalize()),
            server_url: normalized,
        }
    }

    /// The hex digest, used as directory and lock name.
    pub fn as_str(&self) -> &str {
        &self.hash
    }

    /// Normalized form of the URL the identity was derived from.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.hash[..12]
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}

/// Lowercases scheme and host, drops default ports and fragments. Strings
/// that do not parse as URLs are only trimmed.
fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        },
        Err(_) => trimmed.to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn same_url_same_identity() {
        let a = ServerIdentity::from_url("https://mcp.example.com/sse");
        let b = ServerIdentity::from_url("https://mcp.example.com/sse");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[rstest]
    #[case("HTTPS://MCP.Example.com/sse", "https://mcp.example.com/sse")]
    #[case("https://mcp.example.com:443/sse", "https://mcp.example.com/sse")]
    #[case("https://mcp.example.com/sse#frag", "https://mcp.example.com/sse")]
    #[case("  https://mcp.example.com/sse ", "https://mcp.example.com/sse")]
    fn equivalent_urls_collapse(#[case] a: &str, #[case] b: &str) {
        assert_eq!(ServerIdentity::from_url(a), ServerIdentity::from_url(b));
    }

    #[rstest]
    #[case("https://mcp.example.com/sse", "https://mcp.example.com/mcp")]
    #[case("https://mcp.example.com/sse", "http://mcp.example.com/sse")]
    #[case("https://a.example.com/", "https://b.example.com/")]
    #[case("https://mcp.example.com/sse?tenant=1", "https://mcp.example.com/sse?tenant=2")]
    fn distinct_urls_differ(#[case] a: &str, #[case] b: &str) {
        assert_ne!(ServerIdentity::from_url(a), ServerIdentity::from_url(b));
    }

    #[test]
    fn resource_gets_its_own_namespace() {
        let plain = ServerIdentity::from_url("https://mcp.example.com/sse");
        let scoped =
            ServerIdentity::with_resource("https://mcp.example.com/sse", Some("https://api.example.com"));
        assert_ne!(plain, scoped);
        assert_eq!(
            plain,
            ServerIdentity::with_resource("https://mcp.example.com/sse", Some(""))
        );
    }

    #[test]
    fn unparseable_input_still_hashes() {
        let id = ServerIdentity::from_url("not a url");
        assert_eq!(id.server_url(), "not a url");
        assert_eq!(id.short().len(), 12);
    }
}
