//! Obtaining usable tokens for a server, coordinated across processes.
//!
//! Fresh tokens are served straight from the provider. Otherwise one process
//! acquires the lock and refreshes or runs the browser flow while the others
//! wait and then pick up what it stored.

use std::{fmt, sync::Arc};

use {
    mcp_remote_config::RemoteConfig,
    secrecy::ExposeSecret,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    Error, Result,
    callback_server::CallbackServer,
    coordinator::{Acquisition, Coordinator, OwnerGuard, ReleaseOutcome, WaitOutcome},
    discovery::{ServerEndpoints, discover, register_client},
    flow::{FlowConfig, OAuthFlow},
    provider::{AuthorizationPrompt, CredentialProvider, InvalidateScope, SourceOrigin},
    types::{ClientRegistration, CodeVerifier, TokenSet},
};

/// Tokens closer than this to expiry are refreshed.
pub const EXPIRY_SKEW_SECS: u64 = 60;

/// How [`Authorizer::ensure_tokens`] came by its tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    /// Already valid in the environment or the store.
    Cached,
    /// Written by another process that owned the authorization.
    OtherProcess,
    Refreshed,
    /// Interactive browser flow run by this process.
    Authorized,
}

impl fmt::Display for TokenOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached => write!(f, "cached"),
            Self::OtherProcess => write!(f, "from another process"),
            Self::Refreshed => write!(f, "refreshed"),
            Self::Authorized => write!(f, "authorized"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Authorized {
    pub tokens: TokenSet,
    pub origin: TokenOrigin,
}

type PromptHandler = Arc<dyn Fn(&AuthorizationPrompt) + Send + Sync>;

pub struct Authorizer {
    server_url: Url,
    provider: Arc<CredentialProvider>,
    coordinator: Coordinator,
    config: RemoteConfig,
    http: reqwest::Client,
    www_authenticate: Option<String>,
    on_prompt: PromptHandler,
}

impl Authorizer {
    pub fn new(
        server_url: Url,
        provider: Arc<CredentialProvider>,
        coordinator: Coordinator,
        config: RemoteConfig,
    ) -> Self {
        Self {
            server_url,
            provider,
            coordinator,
            config,
            http: reqwest::Client::new(),
            www_authenticate: None,
            on_prompt: Arc::new(|prompt| match prompt {
                AuthorizationPrompt::Opened { url } => {
                    info!(%url, "complete authorization in your browser");
                },
                AuthorizationPrompt::Manual { url, reason } => {
                    warn!(%url, %reason, "open this URL to authorize");
                },
            }),
        }
    }

    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// `WWW-Authenticate` header from a 401, used to locate resource metadata.
    #[must_use]
    pub fn with_www_authenticate(mut self, header: Option<String>) -> Self {
        self.www_authenticate = header;
        self
    }

    /// Called once the authorization URL is ready for the user.
    #[must_use]
    pub fn with_prompt_handler(
        mut self,
        handler: impl Fn(&AuthorizationPrompt) + Send + Sync + 'static,
    ) -> Self {
        self.on_prompt = Arc::new(handler);
        self
    }

    pub fn provider(&self) -> &CredentialProvider {
        &self.provider
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Valid tokens for the server, authorizing if needed.
    ///
    /// Dropping the returned future while this process owns the lock
    /// releases the lock as abandoned.
    pub async fn ensure_tokens(&self) -> Result<Authorized> {
        if let Some(tokens) = self.usable_tokens() {
            return Ok(Authorized {
                tokens,
                origin: TokenOrigin::Cached,
            });
        }

        let server = self.provider.server().clone();
        let max_attempts = self.config.auth.max_attempts.max(1);
        let timeout = self.config.auth.timeout();

        for attempt in 1..=max_attempts {
            match self.coordinator.acquire(&server)? {
                Acquisition::Owner(mut guard) => {
                    let result = self.run_as_owner(&mut guard).await;
                    let outcome = if result.is_ok() {
                        ReleaseOutcome::Completed
                    } else {
                        ReleaseOutcome::Failed
                    };
                    if let Err(e) = guard.release(outcome) {
                        warn!(
                            server = %server.short(),
                            %outcome,
                            error = %e,
                            "failed to release authorization lock"
                        );
                    }
                    return result;
                },
                Acquisition::Waiter(seen) => {
                    match self
                        .coordinator
                        .wait_for_release(&server, seen.as_ref(), timeout)
                        .await
                    {
                        Ok(WaitOutcome::Released) => {
                            if let Some(tokens) = self.usable_tokens() {
                                info!(
                                    server = %server.short(),
                                    "using tokens stored by another process"
                                );
                                return Ok(Authorized {
                                    tokens,
                                    origin: TokenOrigin::OtherProcess,
                                });
                            }
                            debug!(
                                server = %server.short(),
                                attempt,
                                "owner released without usable tokens"
                            );
                        },
                        Ok(WaitOutcome::OwnerVanished) => {
                            debug!(
                                server = %server.short(),
                                attempt,
                                "owner vanished, retrying acquisition"
                            );
                        },
                        Err(e) if e.is_recoverable() && attempt < max_attempts => {
                            warn!(
                                server = %server.short(),
                                attempt,
                                error = %e,
                                "retrying authorization"
                            );
                        },
                        Err(e) => return Err(e),
                    }
                },
            }
        }

        Err(Error::message(format!(
            "no usable tokens for {} after {max_attempts} attempts",
            server.server_url()
        )))
    }

    /// Tokens that need no further work: from the environment (whose
    /// freshness is the injector's business) or unexpired.
    fn usable_tokens(&self) -> Option<TokenSet> {
        let tokens = self.provider.tokens()?;
        if self.provider.tokens_from_env() || !tokens.is_expired(EXPIRY_SKEW_SECS) {
            Some(tokens)
        } else {
            None
        }
    }

    async fn run_as_owner(&self, guard: &mut OwnerGuard) -> Result<Authorized> {
        // Someone may have finished between our first look and acquiring.
        if let Some(tokens) = self.usable_tokens() {
            return Ok(Authorized {
                tokens,
                origin: TokenOrigin::Cached,
            });
        }

        let registration = self.provider.client_registration_with_origin();
        let refreshable = self
            .provider
            .tokens()
            .filter(|t| t.refresh_token.is_some() && registration.is_some());
        if refreshable.is_none() {
            // Fail before any network traffic if the browser flow is off limits.
            self.provider.ensure_interactive()?;
        }

        let endpoints = discover(
            &self.http,
            &self.server_url,
            self.www_authenticate.as_deref(),
        )
        .await?;

        if let (Some(tokens), Some((_, reg))) = (&refreshable, &registration) {
            match self.refresh(&endpoints, reg, tokens).await {
                Ok(Some(authorized)) => return Ok(authorized),
                Ok(None) => {},
                Err(e) => {
                    warn!(error = %e, "token refresh failed, falling back to browser authorization");
                },
            }
        }

        self.authorize_interactively(guard, &endpoints, registration).await
    }

    async fn refresh(
        &self,
        endpoints: &ServerEndpoints,
        registration: &ClientRegistration,
        tokens: &TokenSet,
    ) -> Result<Option<Authorized>> {
        let Some(refresh_token) = &tokens.refresh_token else {
            return Ok(None);
        };
        let flow = OAuthFlow::with_client(
            self.flow_config(registration, endpoints, String::new()),
            self.http.clone(),
        );

        match flow.refresh(refresh_token).await {
            Ok(fresh) => {
                self.provider.save_tokens(&fresh)?;
                Ok(Some(Authorized {
                    tokens: fresh,
                    origin: TokenOrigin::Refreshed,
                }))
            },
            Err(e) if e.is_invalid_grant() => {
                // Another process may have rotated the refresh token already.
                if let Some(stored) = self.provider.tokens()
                    && stored.access_token.expose_secret() != tokens.access_token.expose_secret()
                    && !stored.is_expired(EXPIRY_SKEW_SECS)
                {
                    info!("refresh token was already used; picked up newer tokens from the store");
                    return Ok(Some(Authorized {
                        tokens: stored,
                        origin: TokenOrigin::OtherProcess,
                    }));
                }
                self.provider.invalidate(InvalidateScope::Tokens)?;
                Err(e)
            },
            Err(e) => Err(e),
        }
    }

    async fn authorize_interactively(
        &self,
        guard: &mut OwnerGuard,
        endpoints: &ServerEndpoints,
        existing: Option<(SourceOrigin, ClientRegistration)>,
    ) -> Result<Authorized> {
        self.provider.ensure_interactive()?;

        let callback = self.bind_callback(existing.as_ref().map(|(_, reg)| reg)).await?;
        guard.set_callback_port(callback.port())?;
        let redirect_uri = callback.redirect_uri().to_string();

        // A stored dynamic registration is redone when its redirect URI no
        // longer matches; static and injected ones are used as given.
        let registration = match existing {
            Some((origin, reg))
                if origin != SourceOrigin::Store
                    || reg.redirect_uris.is_empty()
                    || reg.redirect_uris.contains(&redirect_uri) =>
            {
                reg
            },
            _ => self.register(endpoints, &redirect_uri).await?,
        };

        let flow = OAuthFlow::with_client(
            self.flow_config(&registration, endpoints, redirect_uri),
            self.http.clone(),
        );
        let request = flow.start()?;
        self.provider
            .save_code_verifier(&CodeVerifier::new(request.pkce.verifier.clone()))?;

        let prompt = self.provider.initiate_authorization(&Url::parse(&request.url)?)?;
        (self.on_prompt)(&prompt);

        let callback = callback
            .wait_for_code(&request.state, self.config.auth.timeout())
            .await?;
        let verifier = self.provider.code_verifier()?;
        let tokens = flow.exchange(&callback.code, verifier.expose()).await?;

        self.provider.save_tokens(&tokens)?;
        self.provider.invalidate(InvalidateScope::Verifier)?;
        info!(server = %self.provider.server().short(), "authorization complete");

        Ok(Authorized {
            tokens,
            origin: TokenOrigin::Authorized,
        })
    }

    /// Bind the configured port, or the one a stored registration was issued
    /// for so it stays valid, or any free port.
    async fn bind_callback(
        &self,
        existing: Option<&ClientRegistration>,
    ) -> Result<CallbackServer> {
        let mut settings = self.config.callback.clone();
        if settings.port.is_some() {
            return CallbackServer::bind(&settings).await;
        }

        if let Some(port) = existing.and_then(registered_port) {
            settings.port = Some(port);
            match CallbackServer::bind(&settings).await {
                Ok(server) => return Ok(server),
                Err(e) => debug!(port, error = %e, "registered callback port unavailable"),
            }
            settings.port = None;
        }
        CallbackServer::bind(&settings).await
    }

    async fn register(
        &self,
        endpoints: &ServerEndpoints,
        redirect_uri: &str,
    ) -> Result<ClientRegistration> {
        let endpoint = endpoints.registration_endpoint.as_deref().ok_or_else(|| {
            Error::message(
                "server does not support dynamic client registration; provide client information",
            )
        })?;
        let metadata = self.provider.client_metadata(redirect_uri);
        let registration = register_client(&self.http, endpoint, &metadata).await?;
        self.provider.save_client_registration(&registration)?;
        Ok(registration)
    }

    fn flow_config(
        &self,
        registration: &ClientRegistration,
        endpoints: &ServerEndpoints,
        redirect_uri: String,
    ) -> FlowConfig {
        let mut config = FlowConfig::new(registration, endpoints, redirect_uri)
            .with_scopes(self.config.client.scopes.clone());
        if let Some(resource) = self.provider.resource() {
            config.resource = Some(resource.to_string());
        }
        config
    }
}

fn registered_port(registration: &ClientRegistration) -> Option<u16> {
    registration
        .redirect_uris
        .iter()
        .filter_map(|uri| Url::parse(uri).ok())
        .find(|url| matches!(url.host_str(), Some("127.0.0.1" | "localhost" | "[::1]")))
        .and_then(|url| url.port())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_port_picks_loopback() {
        let mut reg = ClientRegistration::public("c");
        reg.redirect_uris = vec![
            "https://example.com/cb".into(),
            "http://127.0.0.1:6274/oauth/callback".into(),
        ];
        assert_eq!(registered_port(&reg), Some(6274));

        reg.redirect_uris = vec!["https://example.com:8443/cb".into()];
        assert_eq!(registered_port(&reg), None);
    }
}
