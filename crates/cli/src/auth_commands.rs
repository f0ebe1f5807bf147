use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    anyhow::{Context, Result},
    clap::{Args, Subcommand},
    mcp_remote_config::RemoteConfig,
    mcp_remote_oauth::{
        ArtifactKind, AuthorizationPrompt, Authorized, Authorizer, ClientRegistration,
        CoordinationMode, Coordinator, CredentialProvider, CredentialStore, EnvOverrides,
        InvalidateScope, ServerIdentity, TokenSet,
    },
    secrecy::ExposeSecret,
    tracing::info,
    url::Url,
};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Authorize against a server, opening a browser if needed.
    Login {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        flow: FlowArgs,
    },
    /// Print a valid access token on stdout, authorizing first if needed.
    Token {
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        flow: FlowArgs,
    },
    /// Show stored credentials and coordination state for a server.
    Status {
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Delete stored credentials for a server.
    Logout {
        #[command(flatten)]
        server: ServerArgs,
        /// What to delete: all, client, tokens or verifier.
        #[arg(long, default_value = "all")]
        scope: InvalidateScope,
    },
}

#[derive(Args)]
pub struct ServerArgs {
    /// Remote server URL.
    url: Url,
    /// RFC 8707 resource indicator; credentials are kept separate per resource.
    #[arg(long)]
    resource: Option<String>,
}

#[derive(Args)]
pub struct FlowArgs {
    /// Port for the OAuth redirect listener (overrides config value).
    #[arg(long)]
    callback_port: Option<u16>,
    /// Seconds to wait for the browser flow (overrides config value).
    #[arg(long)]
    timeout: Option<u64>,
    /// Pre-registered client information: inline JSON or `@path` to a JSON file.
    #[arg(long)]
    client_info: Option<String>,
}

pub async fn handle_auth(action: AuthAction, config: RemoteConfig) -> Result<()> {
    match action {
        AuthAction::Login { server, flow } => login(&server, &flow, config).await,
        AuthAction::Token { server, flow } => token(&server, &flow, config).await,
        AuthAction::Status { server } => status(&server, &config),
        AuthAction::Logout { server, scope } => logout(&server, scope, &config),
    }
}

async fn login(server: &ServerArgs, flow: &FlowArgs, config: RemoteConfig) -> Result<()> {
    let authorized = authorize(server, flow, config).await?;
    eprintln!("Logged in to {} ({})", server.url, authorized.origin);
    Ok(())
}

async fn token(server: &ServerArgs, flow: &FlowArgs, config: RemoteConfig) -> Result<()> {
    let authorized = authorize(server, flow, config).await?;
    println!("{}", authorized.tokens.access_token.expose_secret());
    Ok(())
}

/// Runs the coordinated flow; Ctrl-C drops it, which releases the lock.
async fn authorize(
    server: &ServerArgs,
    flow: &FlowArgs,
    mut config: RemoteConfig,
) -> Result<Authorized> {
    if let Some(port) = flow.callback_port {
        config.callback.port = Some(port);
    }
    if let Some(timeout) = flow.timeout {
        config.auth.timeout_secs = timeout;
    }

    let mut provider = provider(server, &config);
    if let Some(ref raw) = flow.client_info {
        provider = provider.with_static_client_info(parse_client_info(raw)?);
    }
    let coordinator = Coordinator::new(provider.store().clone(), &config.auth);
    let authorizer = Authorizer::new(server.url.clone(), Arc::new(provider), coordinator, config)
        .with_prompt_handler(|prompt| match prompt {
            AuthorizationPrompt::Opened { url } => {
                eprintln!("Opened your browser to authorize. If nothing happened, visit:\n{url}");
            },
            AuthorizationPrompt::Manual { url, reason } => {
                eprintln!("Could not open a browser ({reason}). Please visit:\n{url}");
            },
        });

    tokio::select! {
        result = authorizer.ensure_tokens() => {
            let authorized = result?;
            info!(
                server = %authorizer.provider().server().short(),
                origin = %authorized.origin,
                "tokens ready"
            );
            Ok(authorized)
        },
        _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted"),
    }
}

fn status(server: &ServerArgs, config: &RemoteConfig) -> Result<()> {
    let provider = provider(server, config);
    let identity = provider.server();
    let store = provider.store();

    println!("Server:    {}", identity.server_url());
    println!("Identity:  {identity}");
    println!("Directory: {}", store.namespace(identity).display());

    for kind in ArtifactKind::ALL {
        let state = if store.exists(identity, kind) {
            "present"
        } else {
            "absent"
        };
        println!("  {:<14} {state}", kind.label());
    }

    match provider.client_registration_with_origin() {
        Some((origin, reg)) => println!("Client:    {} (from {origin})", reg.client_id),
        None => println!("Client:    not registered"),
    }
    match provider.tokens() {
        Some(tokens) => println!("Tokens:    {}", describe_expiry(&tokens)),
        None => println!("Tokens:    none"),
    }
    for diagnostic in provider.diagnostics() {
        println!("  warning: {diagnostic}");
    }
    if provider.client_info_from_env() {
        println!("Client info comes from the environment.");
    }
    if provider.tokens_from_env() {
        println!("Tokens come from the environment.");
    }

    let coordinator = Coordinator::new(store.clone(), &config.auth);
    if coordinator.mode() == CoordinationMode::Standalone {
        println!("Lock:      not coordinated on this platform");
    } else {
        match coordinator.current_owner(identity) {
            Some(record) => {
                let port = record
                    .callback_port
                    .map_or_else(String::new, |p| format!(", callback port {p}"));
                println!(
                    "Lock:      held by pid {} for {}s ({:?}{port})",
                    record.pid,
                    record.age().as_secs(),
                    record.state
                );
            },
            None => println!("Lock:      free"),
        }
    }
    Ok(())
}

fn logout(server: &ServerArgs, scope: InvalidateScope, config: &RemoteConfig) -> Result<()> {
    let provider = provider(server, config);
    provider.invalidate(scope)?;
    if !EnvOverrides::from_env().is_empty() {
        eprintln!("Note: credentials injected through the environment are still in effect.");
    }
    eprintln!("Removed {scope} credentials for {}", server.url);
    Ok(())
}

fn provider(server: &ServerArgs, config: &RemoteConfig) -> CredentialProvider {
    let store = match config.storage.dir {
        Some(ref dir) => CredentialStore::with_root(dir.clone()),
        None => CredentialStore::new(),
    };
    let identity = ServerIdentity::with_resource(server.url.as_str(), server.resource.as_deref());
    CredentialProvider::new(identity, store)
        .with_client_settings(config.client.clone())
        .with_resource(server.resource.clone())
}

/// Inline JSON, or `@path` naming a JSON file.
fn parse_client_info(raw: &str) -> Result<ClientRegistration> {
    let json = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("failed to read client info from {path}"))?,
        None => raw.to_string(),
    };
    let reg: ClientRegistration =
        serde_json::from_str(&json).context("client info is not valid JSON")?;
    reg.validate()?;
    Ok(reg)
}

fn describe_expiry(tokens: &TokenSet) -> String {
    let Some(expires_at) = tokens.expires_at() else {
        return "valid (no expiry recorded)".to_string();
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if expires_at > now {
        let remaining = expires_at - now;
        let hours = remaining / 3600;
        let mins = (remaining % 3600) / 60;
        format!("valid ({hours}h {mins}m remaining)")
    } else if tokens.refresh_token.is_some() {
        "expired (refreshable)".to_string()
    } else {
        "expired".to_string()
    }
}
