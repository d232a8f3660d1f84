//! cnote - take notes on OneNote from the terminal
//!
//! This binary owns sign-in: it resolves a valid Microsoft Graph token,
//! running the browser flow or a refresh when needed.

mod auth;
mod config;
mod prompt;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::{AccountResolver, AuthError, FileTokenStore, StoredToken, SystemBrowser, TokenState};
use config::Config;
use prompt::ConsolePrompt;

#[derive(Parser)]
#[command(name = "cnote")]
#[command(about = "Take notes on your OneNote notebooks from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in to your Microsoft account
    Login {
        /// Run the browser sign-in even if a cached token exists
        #[arg(short, long)]
        force: bool,
    },

    /// Show the stored token state
    Status,

    /// Print a valid access token, signing in or refreshing as needed
    Token,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(cli).await {
        Err(e) if matches!(e.downcast_ref::<AuthError>(), Some(AuthError::SetupDeclined)) => {
            eprintln!("No account set up. Run 'cnote login' when you are ready.");
            std::process::exit(1);
        }
        other => other,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let store = FileTokenStore::new(config.token_path()?);
    let store_path = store.path().to_path_buf();
    let resolver = AccountResolver::new(
        config.oauth_params()?,
        store,
        ConsolePrompt,
        Box::new(SystemBrowser),
    )
    .with_callback_timeout(config.callback_timeout());

    let mut stderr = std::io::stderr();
    match cli.command {
        Commands::Login { force } => {
            tracing::info!("Starting authentication flow...");
            let token = if force {
                resolver.reauthorize(&mut stderr).await?
            } else {
                resolver.resolve_account(&mut stderr).await?
            };
            println!("Signed in. Access token valid until {}.", token.expires_at);
        }
        Commands::Status => {
            println!("Token file:   {}", store_path.display());
            print_status(&resolver.status()?);
        }
        Commands::Token => {
            let token = resolver.resolve_account(&mut stderr).await?;
            println!("{}", token.access_token);
        }
    }

    Ok(())
}

fn print_status(stored: &StoredToken) {
    let state = match stored.state() {
        TokenState::Valid => "valid",
        TokenState::Expired => "expired",
        TokenState::Absent => "none",
    };
    println!("Access token: {}", state);
    if let Some(token) = stored.token() {
        println!("  expires_at: {}", token.expires_at);
    }

    match stored.token() {
        Some(token) if token.has_refresh_token() => println!("Refresh tok:  present"),
        _ => println!("Refresh tok:  none"),
    }
    if let Some(token) = stored.token() {
        println!("Scopes:       {}", token.scope.join(" "));
    } else {
        println!("\nRun 'cnote login' to authenticate.");
    }
}
