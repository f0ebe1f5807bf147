use std::{fmt, time::SystemTime};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::{Error, Result};

// ── Client registration (RFC 7591) ──────────────────────────────────────────

/// Client information issued by the authorization server, or handed to us
/// statically / through the environment.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_secret: Option<Secret<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grant_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
    /// Any further metadata the server returned.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClientRegistration {
    /// A public client known only by its id.
    pub fn public(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uris: Vec::new(),
            grant_types: Vec::new(),
            response_types: Vec::new(),
            token_endpoint_auth_method: None,
            client_name: None,
            client_uri: None,
            software_id: None,
            software_version: None,
            client_id_issued_at: None,
            client_secret_expires_at: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::schema("client registration", "client_id is empty"));
        }
        Ok(())
    }
}

impl PartialEq for ClientRegistration {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id
            && self.client_secret.as_ref().map(|s| s.expose_secret())
                == other.client_secret.as_ref().map(|s| s.expose_secret())
            && self.redirect_uris == other.redirect_uris
            && self.grant_types == other.grant_types
            && self.response_types == other.response_types
            && self.token_endpoint_auth_method == other.token_endpoint_auth_method
            && self.client_name == other.client_name
            && self.client_uri == other.client_uri
            && self.software_id == other.software_id
            && self.software_version == other.software_version
            && self.client_id_issued_at == other.client_id_issued_at
            && self.client_secret_expires_at == other.client_secret_expires_at
            && self.extra == other.extra
    }
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("redirect_uris", &self.redirect_uris)
            .field("grant_types", &self.grant_types)
            .field("token_endpoint_auth_method", &self.token_endpoint_auth_method)
            .field("client_name", &self.client_name)
            .field("software_id", &self.software_id)
            .field("software_version", &self.software_version)
            .finish_non_exhaustive()
    }
}

/// Metadata this client registers with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub client_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ClientMetadata {
    /// Public-client metadata for the authorization code + refresh grants.
    pub fn public_client(client_name: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uris: vec![redirect_uri.into()],
            grant_types: vec!["authorization_code".into(), "refresh_token".into()],
            response_types: vec!["code".into()],
            token_endpoint_auth_method: "none".into(),
            client_name: client_name.into(),
            client_uri: None,
            software_id: None,
            software_version: None,
            scope: None,
        }
    }

    pub fn redirect_uri(&self) -> Option<&str> {
        self.redirect_uris.first().map(String::as_str)
    }
}

// ── Tokens ──────────────────────────────────────────────────────────────────

/// `expires_in` exactly as it was received or stored.
///
/// Kept as raw JSON so a malformed value survives a round trip and can be
/// reported instead of being silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpiresIn(serde_json::Value);

impl ExpiresIn {
    pub fn raw(&self) -> &serde_json::Value {
        &self.0
    }

    /// Lifetime in seconds when the value is a non-negative number.
    pub fn seconds(&self) -> Option<u64> {
        match &self.0 {
            serde_json::Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.seconds().is_some()
    }
}

impl From<u64> for ExpiresIn {
    fn from(secs: u64) -> Self {
        Self(secs.into())
    }
}

impl From<i64> for ExpiresIn {
    fn from(secs: i64) -> Self {
        Self(secs.into())
    }
}

impl From<serde_json::Value> for ExpiresIn {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

fn default_token_type() -> String {
    "Bearer".into()
}

/// Access/refresh token pair for one server.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSet {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<ExpiresIn>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Unix timestamp at which the tokens were issued to us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obtained_at: Option<u64>,
}

impl TokenSet {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            expires_in: None,
            token_type: default_token_type(),
            scope: None,
            obtained_at: None,
        }
    }

    #[must_use]
    pub fn with_expires_in(mut self, expires_in: impl Into<ExpiresIn>) -> Self {
        self.expires_in = Some(expires_in.into());
        self
    }

    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token.into()));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.access_token.expose_secret().trim().is_empty() {
            return Err(Error::schema("token set", "access_token is empty"));
        }
        Ok(())
    }

    /// Diagnostic for an `expires_in` that is present but not a non-negative number.
    pub fn expiry_diagnostic(&self) -> Option<ExpiryDiagnostic> {
        let expires_in = self.expires_in.as_ref()?;
        if expires_in.is_valid() {
            return None;
        }
        Some(ExpiryDiagnostic {
            value: expires_in.raw().clone(),
        })
    }

    /// Unix timestamp after which the access token is no longer valid, when
    /// both the issue time and a usable lifetime are known.
    pub fn expires_at(&self) -> Option<u64> {
        let lifetime = self.expires_in.as_ref()?.seconds()?;
        Some(self.obtained_at?.saturating_add(lifetime))
    }

    /// Expired or within `skew_secs` of expiring. Tokens without expiry
    /// information are assumed valid.
    pub fn is_expired(&self, skew_secs: u64) -> bool {
        match self.expires_at() {
            Some(expires_at) => unix_now().saturating_add(skew_secs) >= expires_at,
            None => false,
        }
    }
}

impl PartialEq for TokenSet {
    fn eq(&self, other: &Self) -> bool {
        self.access_token.expose_secret() == other.access_token.expose_secret()
            && self.refresh_token.as_ref().map(|s| s.expose_secret())
                == other.refresh_token.as_ref().map(|s| s.expose_secret())
            && self.expires_in == other.expires_in
            && self.token_type == other.token_type
            && self.scope == other.scope
            && self.obtained_at == other.obtained_at
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// An `expires_in` that is negative or not a number. The token set is still
/// served; callers judge freshness themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryDiagnostic {
    pub value: serde_json::Value,
}

impl fmt::Display for ExpiryDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expires_in should be a non-negative number, got {}",
            self.value
        )
    }
}

// ── PKCE ────────────────────────────────────────────────────────────────────

/// PKCE challenge pair.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

/// Persisted PKCE code verifier.
#[derive(Clone)]
pub struct CodeVerifier(Secret<String>);

impl CodeVerifier {
    pub fn new(verifier: impl Into<String>) -> Self {
        Self(Secret::new(verifier.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for CodeVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CodeVerifier([REDACTED])")
    }
}

impl PartialEq for CodeVerifier {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

/// Serialize a `Secret<String>` by exposing its inner value.
/// Use only for fields that must round-trip through storage.
pub fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Serialize an `Option<Secret<String>>` by exposing its inner value.
pub fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {rstest::rstest, serde_json::json};

    use super::*;

    #[rstest]
    #[case(json!(3600), Some(3600))]
    #[case(json!(0), Some(0))]
    #[case(json!(12.0), Some(12))]
    #[case(json!(-5), None)]
    #[case(json!("3600"), None)]
    #[case(json!(null), None)]
    fn expires_in_seconds(#[case] raw: serde_json::Value, #[case] expected: Option<u64>) {
        assert_eq!(ExpiresIn::from(raw).seconds(), expected);
    }

    #[test]
    fn negative_expires_in_survives_serde() {
        let tokens = TokenSet::bearer("tok").with_expires_in(-5i64);
        let json = serde_json::to_string(&tokens).unwrap();
        let back: TokenSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expires_in.unwrap().raw(), &json!(-5));
        assert!(tokens.expiry_diagnostic().is_some());
    }

    #[test]
    fn missing_token_type_defaults_to_bearer() {
        let tokens: TokenSet = serde_json::from_value(json!({"access_token": "a"})).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert!(tokens.expiry_diagnostic().is_none());
    }

    #[test]
    fn expiry_uses_obtained_at() {
        let mut tokens = TokenSet::bearer("a").with_expires_in(3600u64);
        assert!(!tokens.is_expired(60), "no issue time means unknown expiry");

        tokens.obtained_at = Some(unix_now() - 4000);
        assert!(tokens.is_expired(60));

        tokens.obtained_at = Some(unix_now());
        assert!(!tokens.is_expired(60));
        assert!(tokens.is_expired(3600));
    }

    #[test]
    fn registration_keeps_unknown_members() {
        let reg: ClientRegistration = serde_json::from_value(json!({
            "client_id": "abc",
            "client_secret": "s3cret",
            "logo_uri": "https://example.com/logo.png"
        }))
        .unwrap();
        assert_eq!(reg.extra.get("logo_uri"), Some(&json!("https://example.com/logo.png")));

        let back = serde_json::to_value(&reg).unwrap();
        assert_eq!(back["logo_uri"], "https://example.com/logo.png");
        assert_eq!(back["client_secret"], "s3cret");
    }

    #[test]
    fn empty_client_id_is_invalid() {
        let reg = ClientRegistration::public("  ");
        assert!(matches!(reg.validate(), Err(Error::SchemaInvalid { .. })));
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut reg = ClientRegistration::public("id");
        reg.client_secret = Some(Secret::new("hunter2".into()));
        let tokens = TokenSet::bearer("tok-secret").with_refresh_token("refresh-secret");
        let verifier = CodeVerifier::new("verifier-secret");

        let out = format!("{reg:?} {tokens:?} {verifier:?}");
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("tok-secret"));
        assert!(!out.contains("refresh-secret"));
        assert!(!out.contains("verifier-secret"));
    }
}
