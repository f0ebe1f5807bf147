use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    Error, Result,
    discovery::ServerEndpoints,
    pkce::{generate_pkce, generate_state},
    types::{ClientRegistration, PkceChallenge, TokenSet, unix_now},
};

/// Parameters of the authorization code flow for one server and client.
#[derive(Clone)]
pub struct FlowConfig {
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub resource: Option<String>,
}

impl FlowConfig {
    /// Combine a client registration with discovered endpoints.
    pub fn new(
        registration: &ClientRegistration,
        endpoints: &ServerEndpoints,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: registration.client_id.clone(),
            client_secret: registration.client_secret.clone(),
            authorization_endpoint: endpoints.authorization_endpoint.clone(),
            token_endpoint: endpoints.token_endpoint.clone(),
            redirect_uri: redirect_uri.into(),
            scopes: Vec::new(),
            resource: Some(endpoints.resource.clone()),
        }
    }

    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }
}

/// Manages the OAuth 2.0 authorization code flow with PKCE.
pub struct OAuthFlow {
    config: FlowConfig,
    client: reqwest::Client,
}

/// Result of starting the OAuth flow.
pub struct AuthorizationRequest {
    pub url: String,
    pub pkce: PkceChallenge,
    pub state: String,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl OAuthFlow {
    pub fn new(config: FlowConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: FlowConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Build the authorization URL and generate PKCE + state.
    pub fn start(&self) -> Result<AuthorizationRequest> {
        let pkce = generate_pkce();
        let state = generate_state();

        let mut url = Url::parse(&self.config.authorization_endpoint).map_err(|source| {
            Error::external(
                format!("invalid authorization endpoint {}", self.config.authorization_endpoint),
                source,
            )
        })?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state);

        if !self.config.scopes.is_empty() {
            url.query_pairs_mut()
                .append_pair("scope", &self.config.scopes.join(" "));
        }

        if let Some(resource) = &self.config.resource {
            url.query_pairs_mut().append_pair("resource", resource);
        }

        debug!(endpoint = %self.config.authorization_endpoint, "built authorization URL");

        Ok(AuthorizationRequest {
            url: url.to_string(),
            pkce,
            state,
        })
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange(&self, code: &str, verifier: &str) -> Result<TokenSet> {
        let form = self.form(vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("code_verifier", verifier.to_string()),
        ]);

        let tokens = self.token_request(&form).await?;
        info!(endpoint = %self.config.token_endpoint, "authorization code exchanged");
        Ok(tokens)
    }

    /// Refresh an access token. A server that does not rotate refresh tokens
    /// leaves the previous one in place.
    pub async fn refresh(&self, refresh_token: &Secret<String>) -> Result<TokenSet> {
        let form = self.form(vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.expose_secret().clone()),
        ]);

        let mut tokens = self.token_request(&form).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.clone());
        }
        info!(endpoint = %self.config.token_endpoint, "access token refreshed");
        Ok(tokens)
    }

    fn form(&self, mut pairs: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        pairs.push(("client_id", self.config.client_id.clone()));
        if let Some(secret) = &self.config.client_secret {
            pairs.push(("client_secret", secret.expose_secret().clone()));
        }
        if let Some(resource) = &self.config.resource {
            pairs.push(("resource", resource.clone()));
        }
        pairs
    }

    async fn token_request(&self, form: &[(&'static str, String)]) -> Result<TokenSet> {
        let resp = self
            .client
            .post(&self.config.token_endpoint)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let rejected = match serde_json::from_str::<OAuthErrorBody>(&body) {
                Ok(e) => Error::TokenRejected {
                    status: status.as_u16(),
                    error: e.error,
                    description: e.error_description,
                },
                Err(_) => Error::TokenRejected {
                    status: status.as_u16(),
                    error: body.chars().take(200).collect(),
                    description: None,
                },
            };
            warn!(endpoint = %self.config.token_endpoint, error = %rejected, "token request failed");
            return Err(rejected);
        }

        parse_token_response(&body)
    }
}

fn parse_token_response(body: &str) -> Result<TokenSet> {
    let mut tokens: TokenSet = serde_json::from_str(body)
        .map_err(|e| Error::schema("token response", e.to_string()))?;
    tokens.validate()?;
    tokens.obtained_at = Some(unix_now());
    if let Some(diag) = tokens.expiry_diagnostic() {
        warn!(%diag, "token response carries an unusable expires_in");
    }
    Ok(tokens)
}
