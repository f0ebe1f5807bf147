//! Locating a server's OAuth endpoints and registering a client with it.
//!
//! Protected resource metadata (RFC 9728) names the authorization server,
//! whose metadata (RFC 8414) names the endpoints. Registration follows
//! RFC 7591.

use {
    reqwest::Client,
    serde::{Deserialize, de::DeserializeOwned},
    tracing::{debug, info},
    url::Url,
};

use crate::{
    Error, Result,
    types::{ClientMetadata, ClientRegistration},
};

const RESOURCE_DOC: &str = "oauth-protected-resource";
const AS_DOC: &str = "oauth-authorization-server";

#[derive(Debug, Deserialize)]
struct ResourceMetadata {
    resource: String,
    #[serde(default)]
    authorization_servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AuthServerMetadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    scopes_supported: Vec<String>,
}

/// Everything needed to run the authorization code flow against one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEndpoints {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
    pub scopes_supported: Vec<String>,
    /// RFC 8707 resource indicator for this server.
    pub resource: String,
}

/// Resolve the OAuth endpoints of an MCP server.
///
/// Protected resource metadata is tried first (from the `WWW-Authenticate`
/// hint when given, else the server URL, else its origin). Without it the
/// server URL and then its origin are asked for authorization server
/// metadata directly, and the origin becomes the resource indicator.
pub async fn discover(
    client: &Client,
    server_url: &Url,
    www_authenticate: Option<&str>,
) -> Result<ServerEndpoints> {
    let origin = origin_url(server_url);
    let has_path = !matches!(server_url.path(), "" | "/");
    debug!(server_url = %server_url, has_path, "starting OAuth discovery");

    let resource_meta: Result<ResourceMetadata> =
        match www_authenticate.and_then(parse_www_authenticate) {
            Some(hint) => {
                debug!(url = %hint, "following resource_metadata hint");
                fetch_json(client, &Url::parse(&hint)?, RESOURCE_DOC).await
            },
            None => {
                let at_path = fetch_well_known(client, server_url, RESOURCE_DOC).await;
                if at_path.is_err() && has_path {
                    fetch_well_known(client, &origin, RESOURCE_DOC).await.or(at_path)
                } else {
                    at_path
                }
            },
        };

    let (meta, resource) = match resource_meta {
        Ok(prm) => {
            let issuer = prm.authorization_servers.first().ok_or_else(|| {
                Error::message("no authorization_servers in protected resource metadata")
            })?;
            let meta: AuthServerMetadata =
                fetch_well_known(client, &Url::parse(issuer)?, AS_DOC).await?;
            (meta, prm.resource)
        },
        Err(e) => {
            debug!(error = %e, "no protected resource metadata, asking the server directly");
            let at_path = fetch_well_known(client, server_url, AS_DOC).await;
            let meta: AuthServerMetadata = match at_path {
                Ok(meta) => meta,
                Err(path_err) if has_path => fetch_well_known(client, &origin, AS_DOC)
                    .await
                    .map_err(|origin_err| {
                        Error::message(format!(
                            "AS metadata unavailable at both {server_url} ({path_err}) and \
                             {origin} ({origin_err})"
                        ))
                    })?,
                Err(e) => return Err(e),
            };
            (meta, origin_resource(server_url))
        },
    };

    info!(
        issuer = %meta.issuer,
        token_endpoint = %meta.token_endpoint,
        can_register = meta.registration_endpoint.is_some(),
        resource = %resource,
        "resolved OAuth endpoints"
    );

    Ok(ServerEndpoints {
        authorization_endpoint: meta.authorization_endpoint,
        token_endpoint: meta.token_endpoint,
        registration_endpoint: meta.registration_endpoint,
        scopes_supported: meta.scopes_supported,
        resource,
    })
}

/// Register `metadata` at the given endpoint and return what the server issued.
///
/// Metadata the server echoes back but we do not model lands in
/// [`ClientRegistration::extra`].
pub async fn register_client(
    client: &Client,
    registration_endpoint: &str,
    metadata: &ClientMetadata,
) -> Result<ClientRegistration> {
    debug!(
        endpoint = %registration_endpoint,
        client_name = %metadata.client_name,
        redirect_uri = ?metadata.redirect_uri(),
        "registering dynamic OAuth client"
    );

    let resp = client
        .post(registration_endpoint)
        .json(metadata)
        .send()
        .await
        .map_err(|source| Error::external("failed to register OAuth client", source))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::message(format!(
            "dynamic client registration returned HTTP {status}: {body}"
        )));
    }

    let mut reg: ClientRegistration = resp.json().await.map_err(|source| {
        Error::external("failed to parse client registration response", source)
    })?;
    reg.validate()?;

    // Servers are allowed to omit metadata they accepted unchanged.
    if reg.redirect_uris.is_empty() {
        reg.redirect_uris = metadata.redirect_uris.clone();
    }
    if reg.client_name.is_none() {
        reg.client_name = Some(metadata.client_name.clone());
    }
    if reg.token_endpoint_auth_method.is_none() {
        reg.token_endpoint_auth_method = Some(metadata.token_endpoint_auth_method.clone());
    }

    info!(client_id = %reg.client_id, "registered dynamic OAuth client");

    Ok(reg)
}

/// The `resource_metadata` parameter of a Bearer challenge, if any.
#[must_use]
pub fn parse_www_authenticate(header: &str) -> Option<String> {
    let (scheme, params) = header.trim().split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    params.split(',').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        let value = value.trim().trim_matches('"');
        (name.trim() == "resource_metadata" && !value.is_empty()).then(|| value.to_string())
    })
}

/// GET `<base>/.well-known/<doc>`, keeping any path on `base`.
async fn fetch_well_known<T: DeserializeOwned>(
    client: &Client,
    base: &Url,
    doc: &str,
) -> Result<T> {
    let path = base.path().trim_end_matches('/');
    let mut url = base.clone();
    url.set_path(&format!("{path}/.well-known/{doc}"));
    url.set_query(None);
    url.set_fragment(None);
    fetch_json(client, &url, doc).await
}

async fn fetch_json<T: DeserializeOwned>(client: &Client, url: &Url, doc: &str) -> Result<T> {
    debug!(%url, doc, "fetching metadata");
    let resp = client
        .get(url.as_str())
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|source| Error::external(format!("failed to fetch {doc} metadata"), source))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::message(format!(
            "{doc} metadata at {url} returned HTTP {status}: {body}"
        )));
    }
    resp.json()
        .await
        .map_err(|source| Error::external(format!("failed to parse {doc} metadata"), source))
}

fn origin_url(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

/// Scheme + host (+ explicit port), no path.
fn origin_resource(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}://{host}:{port}", url.scheme()),
        (Some(host), None) => format!("{}://{host}", url.scheme()),
        _ => url.to_string(),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(r#"Bearer resource_metadata="https://ex.com/meta""#, Some("https://ex.com/meta"))]
    #[case(
        r#"bearer realm="mcp", resource_metadata = "https://ex.com/meta", scope="read""#,
        Some("https://ex.com/meta")
    )]
    #[case(r#"Bearer realm="mcp""#, None)]
    #[case(r#"Basic resource_metadata="https://ex.com/meta""#, None)]
    #[case(r#"Bearer resource_metadata="""#, None)]
    #[case("", None)]
    fn resource_metadata_hint(#[case] header: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_www_authenticate(header).as_deref(), expected);
    }

    #[test]
    fn origin_resource_keeps_explicit_port() {
        let url = Url::parse("http://127.0.0.1:8080/mcp/sse").unwrap();
        assert_eq!(origin_resource(&url), "http://127.0.0.1:8080");
        let url = Url::parse("https://mcp.example.com/v1").unwrap();
        assert_eq!(origin_resource(&url), "https://mcp.example.com");
    }

    fn as_metadata_body(base: &str) -> String {
        serde_json::json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "registration_endpoint": format!("{base}/register"),
            "scopes_supported": ["mcp"],
            "code_challenge_methods_supported": ["S256"]
        })
        .to_string()
    }

    fn prm_body(resource: &str, servers: &[String]) -> String {
        serde_json::json!({
            "resource": resource,
            "authorization_servers": servers,
        })
        .to_string()
    }

    #[tokio::test]
    async fn register_client_posts_metadata() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/register")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "client_name": "mcp-remote",
                "redirect_uris": ["http://127.0.0.1:9999/oauth/callback"],
                "token_endpoint_auth_method": "none"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                serde_json::json!({
                    "client_id": "abc123",
                    "client_secret": "secret456",
                    "client_id_issued_at": 1700000000u64,
                    "logo_uri": "https://example.com/logo.png"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let metadata =
            ClientMetadata::public_client("mcp-remote", "http://127.0.0.1:9999/oauth/callback");
        let reg = register_client(&Client::new(), &format!("{}/register", server.url()), &metadata)
            .await
            .unwrap();

        assert_eq!(reg.client_id, "abc123");
        assert!(reg.client_secret.is_some());
        assert_eq!(reg.client_id_issued_at, Some(1700000000));
        assert_eq!(reg.redirect_uris, metadata.redirect_uris);
        assert_eq!(reg.client_name.as_deref(), Some("mcp-remote"));
        assert!(reg.extra.contains_key("logo_uri"));
        mock.assert_async().await;
    }

    #[rstest]
    #[case(400, r#"{"error":"invalid_client_metadata"}"#)]
    #[case(201, r#"{"client_id": ""}"#)]
    #[tokio::test]
    async fn register_client_rejects_bad_responses(#[case] status: usize, #[case] body: &str) {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/register")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await;

        let metadata = ClientMetadata::public_client("mcp-remote", "http://127.0.0.1:1/cb");
        let err = register_client(&Client::new(), &format!("{}/register", server.url()), &metadata)
            .await
            .unwrap_err();
        if status == 400 {
            assert!(err.to_string().contains("400"));
        } else {
            assert!(matches!(err, Error::SchemaInvalid { .. }));
        }
    }

    #[tokio::test]
    async fn discover_follows_resource_metadata() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _prm = server
            .mock("GET", "/mcp/.well-known/oauth-protected-resource")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(prm_body(&format!("{base}/mcp"), &[format!("{base}/issuer")]))
            .create_async()
            .await;
        let _asm = server
            .mock("GET", "/issuer/.well-known/oauth-authorization-server")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(as_metadata_body(&base))
            .create_async()
            .await;

        let url = Url::parse(&format!("{base}/mcp")).unwrap();
        let endpoints = discover(&Client::new(), &url, None).await.unwrap();

        assert_eq!(endpoints.resource, format!("{base}/mcp"));
        assert_eq!(endpoints.token_endpoint, format!("{base}/token"));
        assert_eq!(
            endpoints.registration_endpoint,
            Some(format!("{base}/register"))
        );
        assert_eq!(endpoints.scopes_supported, ["mcp"]);
    }

    #[tokio::test]
    async fn discover_prefers_www_authenticate_hint() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let hinted = server
            .mock("GET", "/custom/prm.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(prm_body("urn:mcp:hinted", &[base.clone()]))
            .create_async()
            .await;
        let _asm = server
            .mock("GET", "/.well-known/oauth-authorization-server")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(as_metadata_body(&base))
            .create_async()
            .await;

        let header = format!(r#"Bearer resource_metadata="{base}/custom/prm.json""#);
        let url = Url::parse(&format!("{base}/mcp?session=1")).unwrap();
        let endpoints = discover(&Client::new(), &url, Some(&header)).await.unwrap();

        assert_eq!(endpoints.resource, "urn:mcp:hinted");
        assert_eq!(endpoints.authorization_endpoint, format!("{base}/authorize"));
        hinted.assert_async().await;
    }

    #[tokio::test]
    async fn discover_uses_origin_resource_metadata() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _prm = server
            .mock("GET", "/.well-known/oauth-protected-resource")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(prm_body(&base, &[format!("{base}/as")]))
            .create_async()
            .await;
        let _asm = server
            .mock("GET", "/as/.well-known/oauth-authorization-server")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(as_metadata_body(&base))
            .create_async()
            .await;

        let url = Url::parse(&format!("{base}/mcp/sse")).unwrap();
        let endpoints = discover(&Client::new(), &url, None).await.unwrap();
        assert_eq!(endpoints.resource, base);
    }

    #[tokio::test]
    async fn discover_falls_back_to_origin_as_metadata() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _asm = server
            .mock("GET", "/.well-known/oauth-authorization-server")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(as_metadata_body(&base))
            .create_async()
            .await;

        let url = Url::parse(&format!("{base}/mcp/sse")).unwrap();
        let endpoints = discover(&Client::new(), &url, None).await.unwrap();

        assert_eq!(endpoints.authorization_endpoint, format!("{base}/authorize"));
        assert_eq!(endpoints.resource, base);
    }

    #[tokio::test]
    async fn discover_rejects_resource_metadata_without_servers() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let _prm = server
            .mock("GET", "/.well-known/oauth-protected-resource")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(prm_body(&base, &[]))
            .create_async()
            .await;

        let url = Url::parse(&base).unwrap();
        let err = discover(&Client::new(), &url, None).await.unwrap_err();
        assert!(err.to_string().contains("no authorization_servers"));
    }

    #[tokio::test]
    async fn discover_reports_both_failures() {
        let server = mockito::Server::new_async().await;
        let url = Url::parse(&format!("{}/mcp", server.url())).unwrap();
        let err = discover(&Client::new(), &url, None).await.unwrap_err();
        assert!(err.to_string().contains("AS metadata unavailable"));
    }

    #[tokio::test]
    async fn discover_reports_unreachable_server() {
        let client = Client::builder()
            .timeout(std::time::Duration::from_millis(100))
            .build()
            .unwrap();
        let url = Url::parse("http://127.0.0.1:1").unwrap();
        assert!(discover(&client, &url, None).await.is_err());
    }
}
