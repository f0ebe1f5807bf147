use {anyhow::Result, clap::Subcommand};

use mcp_remote_config::{Diagnostic, RemoteConfig, Severity, validate};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check,
    /// Print the effective configuration as JSON.
    Show,
    /// Write a documented default config file to the config directory.
    Init,
}

pub fn handle_config(action: ConfigAction, config: &RemoteConfig) -> Result<()> {
    match action {
        ConfigAction::Check => check(config),
        ConfigAction::Show => show(config),
        ConfigAction::Init => {
            let path = mcp_remote_config::init_config()?;
            eprintln!("Config file: {}", path.display());
            Ok(())
        },
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(config: &RemoteConfig) -> Result<()> {
    match mcp_remote_config::config_dir() {
        Some(dir) => eprintln!("Config directory: {}\n", dir.display()),
        None => eprintln!("No config directory available; checking defaults.\n"),
    }

    let diagnostics = validate(config);
    for d in &diagnostics {
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
        };
        eprintln!("  {BOLD}{color}{}{RESET} {}: {}", d.severity, d.path, d.message);
    }

    let errors = count(&diagnostics, Severity::Error);
    let warnings = count(&diagnostics, Severity::Warning);

    if !diagnostics.is_empty() {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn show(config: &RemoteConfig) -> Result<()> {
    let rendered = serde_json::to_string_pretty(config)?;
    println!("{rendered}");
    Ok(())
}

fn count(diagnostics: &[Diagnostic], severity: Severity) -> usize {
    diagnostics.iter().filter(|d| d.severity == severity).count()
}
