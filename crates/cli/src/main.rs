mod auth_commands;
mod config_commands;

use {
    clap::{Parser, Subcommand},
    tracing::{debug, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "mcp-remote",
    about = "OAuth credentials for remote MCP servers",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/mcp-remote/).
    #[arg(long, global = true, env = "MCP_REMOTE_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Auth(auth_commands::AuthAction),
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

/// Logs always go to stderr: stdout belongs to the stdio channel and to
/// `token` output.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    debug!(version = env!("CARGO_PKG_VERSION"), "mcp-remote starting");

    if let Some(ref dir) = cli.config_dir {
        mcp_remote_config::set_config_dir(dir.clone());
    }
    let config = mcp_remote_config::discover_and_load();

    match cli.command {
        Commands::Auth(action) => {
            for diagnostic in mcp_remote_config::validate(&config) {
                warn!(%diagnostic, "config");
            }
            auth_commands::handle_auth(action, config).await
        },
        Commands::Config { action } => config_commands::handle_config(action, &config),
    }
}
