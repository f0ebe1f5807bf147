//! Per-process credential facade used by the authorization flow.
//!
//! Client information resolves static > environment > store; tokens resolve
//! environment > store. Each level is a [`CredentialSource`] tried in order.

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    mcp_remote_config::ClientSettings,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    Error, Result,
    env_override::EnvOverrides,
    identity::ServerIdentity,
    storage::{ArtifactKind, CredentialStore},
    types::{ClientMetadata, ClientRegistration, CodeVerifier, ExpiryDiagnostic, TokenSet},
};

// ── Sources ─────────────────────────────────────────────────────────────────

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    Static,
    Environment,
    Store,
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Environment => write!(f, "environment"),
            Self::Store => write!(f, "store"),
        }
    }
}

/// One level of the precedence chain.
pub trait CredentialSource: Send + Sync {
    fn origin(&self) -> SourceOrigin;

    fn client_info(&self) -> Option<ClientRegistration> {
        None
    }

    fn tokens(&self) -> Option<TokenSet> {
        None
    }
}

/// Client information handed to the process by its caller.
pub struct StaticSource {
    client_info: ClientRegistration,
}

impl StaticSource {
    pub fn new(client_info: ClientRegistration) -> Self {
        Self { client_info }
    }
}

impl CredentialSource for StaticSource {
    fn origin(&self) -> SourceOrigin {
        SourceOrigin::Static
    }

    fn client_info(&self) -> Option<ClientRegistration> {
        Some(self.client_info.clone())
    }
}

impl CredentialSource for EnvOverrides {
    fn origin(&self) -> SourceOrigin {
        SourceOrigin::Environment
    }

    fn client_info(&self) -> Option<ClientRegistration> {
        self.client_info.clone()
    }

    fn tokens(&self) -> Option<TokenSet> {
        self.tokens.clone()
    }
}

/// Reads through to the on-disk store on every call.
pub struct StoreSource {
    store: CredentialStore,
    server: ServerIdentity,
}

impl CredentialSource for StoreSource {
    fn origin(&self) -> SourceOrigin {
        SourceOrigin::Store
    }

    fn client_info(&self) -> Option<ClientRegistration> {
        self.store.read(&self.server)
    }

    fn tokens(&self) -> Option<TokenSet> {
        self.store.read(&self.server)
    }
}

// ── Browser ─────────────────────────────────────────────────────────────────

pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

/// Opens URLs with the platform's default handler.
#[derive(Debug, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

/// Outcome of [`CredentialProvider::initiate_authorization`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationPrompt {
    /// The browser was launched on `url`.
    Opened { url: String },
    /// The browser could not be launched; the user has to open `url`.
    Manual { url: String, reason: String },
}

impl AuthorizationPrompt {
    pub fn url(&self) -> &str {
        match self {
            Self::Opened { url } | Self::Manual { url, .. } => url,
        }
    }
}

// ── Invalidation ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    All,
    Client,
    Tokens,
    Verifier,
}

impl InvalidateScope {
    fn kinds(self) -> &'static [ArtifactKind] {
        match self {
            Self::All => &ArtifactKind::ALL,
            Self::Client => &[ArtifactKind::ClientInfo],
            Self::Tokens => &[ArtifactKind::Tokens],
            Self::Verifier => &[ArtifactKind::CodeVerifier],
        }
    }
}

impl FromStr for InvalidateScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "client" => Ok(Self::Client),
            "tokens" => Ok(Self::Tokens),
            "verifier" => Ok(Self::Verifier),
            other => Err(Error::UnknownInvalidateScope(other.to_string())),
        }
    }
}

impl fmt::Display for InvalidateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Client => "client",
            Self::Tokens => "tokens",
            Self::Verifier => "verifier",
        })
    }
}

// ── Provider ────────────────────────────────────────────────────────────────

/// Credential access for one server, constructed once per process.
pub struct CredentialProvider {
    server: ServerIdentity,
    store: CredentialStore,
    sources: Vec<Box<dyn CredentialSource>>,
    client: ClientSettings,
    resource: Option<String>,
    browser: Arc<dyn BrowserLauncher>,
    client_info_from_env: AtomicBool,
    tokens_from_env: AtomicBool,
    diagnostics: Mutex<Vec<ExpiryDiagnostic>>,
}

impl CredentialProvider {
    /// Provider backed by `store`, with environment overrides read from the
    /// process environment.
    pub fn new(server: ServerIdentity, store: CredentialStore) -> Self {
        Self::with_env(server, store, EnvOverrides::from_env())
    }

    /// Provider with explicitly supplied environment overrides.
    pub fn with_env(server: ServerIdentity, store: CredentialStore, env: EnvOverrides) -> Self {
        let mut sources: Vec<Box<dyn CredentialSource>> = Vec::with_capacity(3);
        if !env.is_empty() {
            sources.push(Box::new(env));
        }
        sources.push(Box::new(StoreSource {
            store: store.clone(),
            server: server.clone(),
        }));
        Self {
            server,
            store,
            sources,
            client: ClientSettings::default(),
            resource: None,
            browser: Arc::new(SystemBrowser),
            client_info_from_env: AtomicBool::new(false),
            tokens_from_env: AtomicBool::new(false),
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    /// Use fixed client information ahead of every other source.
    #[must_use]
    pub fn with_static_client_info(mut self, client_info: ClientRegistration) -> Self {
        self.sources.insert(0, Box::new(StaticSource::new(client_info)));
        self
    }

    #[must_use]
    pub fn with_client_settings(mut self, client: ClientSettings) -> Self {
        self.client = client;
        self
    }

    /// RFC 8707 resource indicator added to every authorization URL.
    #[must_use]
    pub fn with_resource(mut self, resource: Option<String>) -> Self {
        self.resource = resource.filter(|r| !r.is_empty());
        self
    }

    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Registration metadata for a client that will receive the redirect
    /// at `redirect_uri`.
    pub fn client_metadata(&self, redirect_uri: &str) -> ClientMetadata {
        let mut metadata = ClientMetadata::public_client(&self.client.name, redirect_uri);
        metadata.client_uri = self.client.uri.clone();
        metadata.software_id = self.client.software_id.clone();
        metadata.software_version = self.client.software_version.clone();
        if !self.client.scopes.is_empty() {
            metadata.scope = Some(self.client.scopes.join(" "));
        }
        metadata
    }

    pub fn client_info_from_env(&self) -> bool {
        self.client_info_from_env.load(Ordering::Acquire)
    }

    pub fn tokens_from_env(&self) -> bool {
        self.tokens_from_env.load(Ordering::Acquire)
    }

    /// Any credential served so far came from the environment.
    pub fn is_non_interactive(&self) -> bool {
        self.client_info_from_env() || self.tokens_from_env()
    }

    /// Expiry diagnostics recorded by reads and writes of this provider.
    pub fn diagnostics(&self) -> Vec<ExpiryDiagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn client_registration(&self) -> Option<ClientRegistration> {
        self.client_registration_with_origin().map(|(_, reg)| reg)
    }

    /// Like [`Self::client_registration`], also naming the source that served it.
    pub fn client_registration_with_origin(&self) -> Option<(SourceOrigin, ClientRegistration)> {
        let (origin, reg) = self
            .sources
            .iter()
            .find_map(|s| s.client_info().map(|reg| (s.origin(), reg)))?;
        if origin == SourceOrigin::Environment {
            self.client_info_from_env.store(true, Ordering::Release);
        }
        debug!(server = %self.server.short(), %origin, client_id = %reg.client_id, "client registration resolved");
        Some((origin, reg))
    }

    /// Persist a registration. Always writes: a fresh registration replaces
    /// whatever was there, whichever source served the previous one.
    pub fn save_client_registration(&self, reg: &ClientRegistration) -> Result<()> {
        reg.validate()?;
        self.store.write(&self.server, reg)
    }

    pub fn tokens(&self) -> Option<TokenSet> {
        let (origin, tokens) = self
            .sources
            .iter()
            .find_map(|s| s.tokens().map(|t| (s.origin(), t)))?;
        if origin == SourceOrigin::Environment {
            self.tokens_from_env.store(true, Ordering::Release);
        }
        self.record_expiry_diagnostic(&tokens);
        debug!(server = %self.server.short(), %origin, "tokens resolved");
        Some(tokens)
    }

    /// Persist tokens. An unusable `expires_in` is reported but never blocks
    /// the write.
    pub fn save_tokens(&self, tokens: &TokenSet) -> Result<()> {
        self.record_expiry_diagnostic(tokens);
        self.store.write(&self.server, tokens)
    }

    pub fn save_code_verifier(&self, verifier: &CodeVerifier) -> Result<()> {
        self.store.write(&self.server, verifier)
    }

    pub fn code_verifier(&self) -> Result<CodeVerifier> {
        self.store
            .read(&self.server)
            .ok_or_else(|| Error::SessionMissing {
                server: self.server.server_url().to_string(),
            })
    }

    /// Send the user to `url`.
    ///
    /// Refused outright once any credential came from the environment. A
    /// browser that fails to launch is not an error: the URL comes back in
    /// [`AuthorizationPrompt::Manual`].
    pub fn initiate_authorization(&self, url: &Url) -> Result<AuthorizationPrompt> {
        self.ensure_interactive()?;

        let url = self.decorate(url).to_string();
        match self.browser.open(&url) {
            Ok(()) => {
                info!(server = %self.server.short(), "opened browser for authorization");
                Ok(AuthorizationPrompt::Opened { url })
            },
            Err(e) => {
                warn!(server = %self.server.short(), error = %e, "failed to open browser");
                Ok(AuthorizationPrompt::Manual {
                    url,
                    reason: e.to_string(),
                })
            },
        }
    }

    /// Fails with [`Error::NonInteractiveMode`] once any credential served
    /// by this provider came from the environment.
    pub fn ensure_interactive(&self) -> Result<()> {
        let source_desc = match (self.client_info_from_env(), self.tokens_from_env()) {
            (true, true) => "client information and tokens",
            (true, false) => "client information",
            (false, true) => "tokens",
            (false, false) => return Ok(()),
        };
        warn!(server = %self.server.short(), source_desc, "refusing interactive authorization");
        Err(Error::NonInteractiveMode { source_desc })
    }

    pub fn invalidate(&self, scope: InvalidateScope) -> Result<()> {
        for kind in scope.kinds() {
            self.store.delete(&self.server, *kind)?;
        }
        info!(server = %self.server.short(), %scope, "credentials invalidated");
        Ok(())
    }

    fn decorate(&self, url: &Url) -> Url {
        let mut url = url.clone();
        if let Some(resource) = &self.resource
            && !url.query_pairs().any(|(k, _)| k == "resource")
        {
            url.query_pairs_mut().append_pair("resource", resource);
        }
        url
    }

    /// Each distinct diagnostic is kept, and logged, once.
    fn record_expiry_diagnostic(&self, tokens: &TokenSet) {
        let Some(diag) = tokens.expiry_diagnostic() else {
            return;
        };
        let mut diagnostics = self.diagnostics.lock().unwrap_or_else(|e| e.into_inner());
        if !diagnostics.contains(&diag) {
            warn!(server = %self.server.short(), %diag, "token set has an unusable expires_in");
            diagnostics.push(diag);
        }
    }
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("server", &self.server)
            .field("sources", &self.sources.iter().map(|s| s.origin()).collect::<Vec<_>>())
            .field("client_info_from_env", &self.client_info_from_env())
            .field("tokens_from_env", &self.tokens_from_env())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        rstest::rstest,
        secrecy::ExposeSecret,
        std::{collections::HashMap, io},
    };

    use super::*;

    #[derive(Default)]
    struct RecordingBrowser {
        fail: bool,
        opened: Mutex<Vec<String>>,
    }

    impl BrowserLauncher for RecordingBrowser {
        fn open(&self, url: &str) -> io::Result<()> {
            self.opened.lock().unwrap().push(url.to_string());
            if self.fail {
                Err(io::Error::other("no display"))
            } else {
                Ok(())
            }
        }
    }

    fn store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::with_root(dir.path().to_path_buf());
        (dir, store)
    }

    fn server() -> ServerIdentity {
        ServerIdentity::from_url("https://mcp.example.com/sse")
    }

    fn env(vars: &[(&str, &str)]) -> EnvOverrides {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvOverrides::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn client_precedence_static_env_store() {
        let (_dir, store) = store();
        store.write(&server(), &ClientRegistration::public("from-store")).unwrap();

        let provider = CredentialProvider::with_env(server(), store.clone(), EnvOverrides::default());
        assert_eq!(provider.client_registration().unwrap().client_id, "from-store");
        assert!(!provider.client_info_from_env());

        let provider = CredentialProvider::with_env(
            server(),
            store.clone(),
            env(&[("MCP_REMOTE_CLIENT_INFO", r#"{"client_id":"from-env"}"#)]),
        );
        assert_eq!(provider.client_registration().unwrap().client_id, "from-env");
        assert!(provider.client_info_from_env());

        let provider = CredentialProvider::with_env(
            server(),
            store,
            env(&[("MCP_REMOTE_CLIENT_INFO", r#"{"client_id":"from-env"}"#)]),
        )
        .with_static_client_info(ClientRegistration::public("static"));
        assert_eq!(provider.client_registration().unwrap().client_id, "static");
        assert!(!provider.client_info_from_env());
    }

    #[test]
    fn env_tokens_win_over_store() {
        let (_dir, store) = store();
        store.write(&server(), &TokenSet::bearer("disk")).unwrap();

        let provider = CredentialProvider::with_env(
            server(),
            store,
            env(&[("MCP_REMOTE_TOKENS", r#"{"access_token":"env"}"#)]),
        );
        assert!(!provider.tokens_from_env());
        let tokens = provider.tokens().unwrap();
        assert_eq!(tokens.access_token.expose_secret(), "env");
        assert!(provider.tokens_from_env());
        assert!(provider.is_non_interactive());
    }

    #[test]
    fn save_registration_writes_even_when_static() {
        let (_dir, store) = store();
        let provider = CredentialProvider::with_env(server(), store.clone(), EnvOverrides::default())
            .with_static_client_info(ClientRegistration::public("static"));
        provider
            .save_client_registration(&ClientRegistration::public("dynamic"))
            .unwrap();
        assert_eq!(
            store.read::<ClientRegistration>(&server()).unwrap().client_id,
            "dynamic"
        );
    }

    #[test]
    fn negative_expires_in_is_kept_and_flagged() {
        let (_dir, store) = store();
        let provider = CredentialProvider::with_env(server(), store, EnvOverrides::default());
        let tokens = TokenSet::bearer("tok").with_expires_in(-5i64);

        provider.save_tokens(&tokens).unwrap();
        assert_eq!(provider.diagnostics().len(), 1);

        let back = provider.tokens().unwrap();
        assert_eq!(back, tokens);
        assert_eq!(back.expires_in.unwrap().raw(), &serde_json::json!(-5));
        assert_eq!(provider.diagnostics().len(), 1);
    }

    #[test]
    fn repeated_reads_record_each_diagnostic_once() {
        let (_dir, store) = store();
        let provider = CredentialProvider::with_env(server(), store, EnvOverrides::default());
        provider
            .save_tokens(&TokenSet::bearer("tok").with_expires_in(-5i64))
            .unwrap();
        for _ in 0..10 {
            provider.tokens().unwrap();
        }
        assert_eq!(provider.diagnostics().len(), 1);

        provider
            .save_tokens(&TokenSet::bearer("tok").with_expires_in(-7i64))
            .unwrap();
        provider.tokens().unwrap();
        let values: Vec<_> = provider.diagnostics().into_iter().map(|d| d.value).collect();
        assert_eq!(values, [serde_json::json!(-5), serde_json::json!(-7)]);
    }

    #[test]
    fn missing_verifier_is_session_missing() {
        let (_dir, store) = store();
        let provider = CredentialProvider::with_env(server(), store, EnvOverrides::default());
        assert!(matches!(
            provider.code_verifier(),
            Err(Error::SessionMissing { .. })
        ));

        provider.save_code_verifier(&CodeVerifier::new("v1")).unwrap();
        assert_eq!(provider.code_verifier().unwrap().expose(), "v1");
    }

    #[rstest]
    #[case("https://auth.example.com/authorize")]
    #[case("https://other.example.com/authorize?client_id=x")]
    fn env_credentials_forbid_browser(#[case] url: &str) {
        let (_dir, store) = store();
        let browser = Arc::new(RecordingBrowser::default());
        let provider = CredentialProvider::with_env(
            server(),
            store,
            env(&[("MCP_REMOTE_CLIENT_INFO", r#"{"client_id":"ci"}"#)]),
        )
        .with_browser(browser.clone());
        provider.client_registration();

        let err = provider
            .initiate_authorization(&Url::parse(url).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::NonInteractiveMode { source_desc: "client information" }));
        assert!(browser.opened.lock().unwrap().is_empty());
    }

    #[test]
    fn browser_failure_returns_manual_url() {
        let (_dir, store) = store();
        let browser = Arc::new(RecordingBrowser {
            fail: true,
            ..Default::default()
        });
        let provider = CredentialProvider::with_env(server(), store, EnvOverrides::default())
            .with_resource(Some("https://api.example.com".into()))
            .with_browser(browser);

        let prompt = provider
            .initiate_authorization(&Url::parse("https://auth.example.com/authorize?a=1").unwrap())
            .unwrap();
        let AuthorizationPrompt::Manual { url, reason } = prompt else {
            panic!("expected manual prompt");
        };
        assert!(url.contains("resource=https%3A%2F%2Fapi.example.com"));
        assert_eq!(reason, "no display");
    }

    #[test]
    fn existing_resource_parameter_is_kept() {
        let (_dir, store) = store();
        let browser = Arc::new(RecordingBrowser::default());
        let provider = CredentialProvider::with_env(server(), store, EnvOverrides::default())
            .with_resource(Some("https://api.example.com".into()))
            .with_browser(browser.clone());

        let url = Url::parse("https://auth.example.com/authorize?resource=https%3A%2F%2Fmcp").unwrap();
        let prompt = provider.initiate_authorization(&url).unwrap();
        assert!(matches!(prompt, AuthorizationPrompt::Opened { .. }));
        assert_eq!(prompt.url(), url.as_str());
        assert_eq!(browser.opened.lock().unwrap().len(), 1);
    }

    #[rstest]
    #[case(InvalidateScope::All, &[])]
    #[case(InvalidateScope::Client, &[ArtifactKind::Tokens, ArtifactKind::CodeVerifier])]
    #[case(InvalidateScope::Tokens, &[ArtifactKind::ClientInfo, ArtifactKind::CodeVerifier])]
    #[case(InvalidateScope::Verifier, &[ArtifactKind::ClientInfo, ArtifactKind::Tokens])]
    fn invalidate_removes_only_scope(#[case] scope: InvalidateScope, #[case] left: &[ArtifactKind]) {
        let (_dir, store) = store();
        let provider = CredentialProvider::with_env(server(), store.clone(), EnvOverrides::default());
        provider
            .save_client_registration(&ClientRegistration::public("c"))
            .unwrap();
        provider.save_tokens(&TokenSet::bearer("t")).unwrap();
        provider.save_code_verifier(&CodeVerifier::new("v")).unwrap();

        provider.invalidate(scope).unwrap();

        for kind in ArtifactKind::ALL {
            assert_eq!(store.exists(&server(), kind), left.contains(&kind), "{kind}");
        }
    }

    #[test]
    fn unknown_scope_is_an_error() {
        assert!(matches!(
            "everything".parse::<InvalidateScope>(),
            Err(Error::UnknownInvalidateScope(s)) if s == "everything"
        ));
        assert_eq!("tokens".parse::<InvalidateScope>().unwrap(), InvalidateScope::Tokens);
    }
}
