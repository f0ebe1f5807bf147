//! Credentials injected through the process environment.
//!
//! Each artifact has a plain JSON variable and a base64 variant with a
//! `_B64` suffix. The base64 variant is checked first.

use {
    base64::{
        Engine,
        engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD},
    },
    tracing::{debug, warn},
};

use crate::{
    Error, Result,
    storage::Artifact,
    types::{ClientRegistration, TokenSet},
};

pub const CLIENT_INFO_VAR: &str = "MCP_REMOTE_CLIENT_INFO";
pub const TOKENS_VAR: &str = "MCP_REMOTE_TOKENS";
const B64_SUFFIX: &str = "_B64";

/// Credentials found in the environment, read once per process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    pub client_info: Option<ClientRegistration>,
    pub tokens: Option<TokenSet>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through a custom lookup; tests use this instead of
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            client_info: read_override(CLIENT_INFO_VAR, &lookup),
            tokens: read_override(TOKENS_VAR, &lookup),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.client_info.is_none() && self.tokens.is_none()
    }
}

/// Parse `<base>_B64`, then `<base>`, as artifact `A`.
///
/// Unset variables give `None`. A variable that is set but does not decode
/// or validate is logged and skipped.
pub fn read_override<A: Artifact>(base: &str, lookup: impl Fn(&str) -> Option<String>) -> Option<A> {
    let b64_name = format!("{base}{B64_SUFFIX}");
    if let Some(raw) = lookup(&b64_name).filter(|v| !v.trim().is_empty()) {
        match decode_b64::<A>(&raw) {
            Ok(artifact) => {
                debug!(var = %b64_name, artifact = %A::KIND, "using credential override");
                return Some(artifact);
            },
            Err(e) => warn!(var = %b64_name, error = %e, "ignoring malformed credential override"),
        }
    }

    let raw = lookup(base).filter(|v| !v.trim().is_empty())?;
    match A::decode(raw.trim().as_bytes()) {
        Ok(artifact) => {
            debug!(var = %base, artifact = %A::KIND, "using credential override");
            Some(artifact)
        },
        Err(e) => {
            warn!(var = %base, error = %e, "ignoring malformed credential override");
            None
        },
    }
}

/// Accepts the standard and URL-safe alphabets, padded or not.
fn decode_b64<A: Artifact>(raw: &str) -> Result<A> {
    let raw = raw.trim();
    let bytes = match STANDARD.decode(raw) {
        Ok(bytes) => bytes,
        Err(e) => [STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(raw).ok())
            .ok_or_else(|| Error::schema(A::KIND.label(), format!("not valid base64: {e}")))?,
    };
    A::decode(&bytes)
}
