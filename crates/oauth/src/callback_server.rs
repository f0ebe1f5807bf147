use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    axum::{Router, extract::Query, response::Html, routing::get},
    mcp_remote_config::CallbackSettings,
    tokio::{net::TcpListener, sync::oneshot},
    tracing::{debug, info, warn},
};

use crate::{Error, Result};

/// What the authorization server sent back through the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    pub code: String,
    pub state: String,
}

/// Local HTTP listener for the OAuth redirect.
///
/// Bound up front so the (possibly OS-assigned) port is known before the
/// redirect URI is registered and the browser is opened.
pub struct CallbackServer {
    listener: TcpListener,
    addr: SocketAddr,
    path: String,
    redirect_uri: String,
}

impl CallbackServer {
    /// Bind `host:port`; port `None` or `0` picks a free one.
    pub async fn bind(settings: &CallbackSettings) -> Result<Self> {
        let port = settings.port.unwrap_or(0);
        let host = settings.host.trim_start_matches('[').trim_end_matches(']');
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            Error::external(format!("failed to bind callback listener on {host}:{port}"), e)
        })?;
        let addr = listener.local_addr()?;
        let redirect_uri = settings.redirect_uri(addr.port());
        let path = Self::route_path(&settings.path);
        debug!(addr = %addr, redirect_uri = %redirect_uri, "callback listener bound");
        Ok(Self {
            listener,
            addr,
            path,
            redirect_uri,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    fn route_path(path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        }
    }

    /// Serve until the first callback arrives or `timeout` elapses.
    ///
    /// The callback must carry `state == expected_state`; an OAuth `error`
    /// parameter becomes [`Error::AuthorizationDenied`].
    pub async fn wait_for_code(self, expected_state: &str, timeout: Duration) -> Result<CallbackResult> {
        let (tx, rx) = oneshot::channel::<Result<CallbackResult>>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let expected_state = expected_state.to_string();

        let app = Router::new().route(
            &self.path,
            get(move |Query(params): Query<HashMap<String, String>>| {
                let tx = tx.lock().unwrap_or_else(|e| e.into_inner()).take();
                let result = check_params(&params, &expected_state);
                async move {
                    let page = Html(callback_page(&result));
                    if let Some(tx) = tx {
                        let _ = tx.send(result);
                    }
                    page
                }
            }),
        );

        info!(port = self.addr.port(), path = %self.path, "waiting for OAuth callback");
        let server = axum::serve(self.listener, app);

        tokio::select! {
            result = rx => {
                result.map_err(|_| Error::message("callback channel closed"))?
            }
            _ = server.into_future() => {
                Err(Error::message("callback server exited unexpectedly"))
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs(), "OAuth callback timed out");
                Err(Error::message(format!(
                    "OAuth callback timed out after {} seconds",
                    timeout.as_secs()
                )))
            }
        }
    }
}

fn callback_page(result: &Result<CallbackResult>) -> String {
    match result {
        Ok(_) => "<h1>Authorization successful</h1>\
                  <p>You can close this window and return to your terminal.</p>"
            .to_string(),
        Err(e) => format!(
            "<h1>Authorization failed</h1><p>{}</p>",
            escape_html(&e.to_string())
        ),
    }
}

/// Query values end up in the page; escape them.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn check_params(params: &HashMap<String, String>, expected_state: &str) -> Result<CallbackResult> {
    if let Some(error) = params.get("error") {
        return Err(Error::AuthorizationDenied {
            error: error.clone(),
            description: params.get("error_description").cloned(),
        });
    }
    let state = params
        .get("state")
        .ok_or_else(|| Error::message("missing state in OAuth callback"))?;
    if state != expected_state {
        return Err(Error::message("state mismatch in OAuth callback"));
    }
    let code = params
        .get("code")
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::message("missing code in OAuth callback"))?;
    Ok(CallbackResult {
        code: code.clone(),
        state: state.clone(),
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn bound() -> CallbackServer {
        CallbackServer::bind(&CallbackSettings::default()).await.unwrap()
    }

    #[tokio::test]
    async fn ephemeral_port_is_reflected_in_redirect_uri() {
        let server = bound().await;
        assert_ne!(server.port(), 0);
        assert_eq!(
            server.redirect_uri(),
            format!("http://127.0.0.1:{}/oauth/callback", server.port())
        );
    }

    #[tokio::test]
    async fn receives_code_and_state() {
        let server = bound().await;
        let url = format!("{}?code=abc&state=xyz", server.redirect_uri());
        let waiter = tokio::spawn(server.wait_for_code("xyz", Duration::from_secs(5)));

        let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
        assert!(body.contains("successful"));

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, CallbackResult {
            code: "abc".into(),
            state: "xyz".into(),
        });
    }

    #[tokio::test]
    async fn error_parameter_is_reported() {
        let server = bound().await;
        let url = format!(
            "{}?error=access_denied&error_description=user+said+no&state=xyz",
            server.redirect_uri()
        );
        let waiter = tokio::spawn(server.wait_for_code("xyz", Duration::from_secs(5)));
        reqwest::get(&url).await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::AuthorizationDenied { ref error, .. } if error == "access_denied"));
        assert!(err.to_string().contains("user said no"));
    }

    #[tokio::test]
    async fn error_page_escapes_query_values() {
        let server = bound().await;
        let mut url = url::Url::parse(server.redirect_uri()).unwrap();
        url.query_pairs_mut()
            .append_pair("error", "<script>alert(1)</script>")
            .append_pair("error_description", "a \"quoted\" & <b>bold</b> reason")
            .append_pair("state", "xyz");
        let waiter = tokio::spawn(server.wait_for_code("xyz", Duration::from_secs(5)));

        let body = reqwest::get(url).await.unwrap().text().await.unwrap();
        assert!(body.contains("Authorization failed"));
        assert!(!body.contains("<script>"));
        assert!(!body.contains("<b>"));
        assert!(body.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(body.contains("&quot;quoted&quot; &amp; &lt;b&gt;"));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::AuthorizationDenied { .. }));
    }

    #[tokio::test]
    async fn times_out_without_callback() {
        let server = bound().await;
        let err = server
            .wait_for_code("xyz", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn state_mismatch_is_rejected() {
        let params: HashMap<String, String> = [("code", "c"), ("state", "other")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(check_params(&params, "xyz").is_err());
    }
}
