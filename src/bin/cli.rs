// ABOUTME: CLI driver — one subcommand per façade operation, sharing the Engine construction path.
// ABOUTME: Exit codes: 0 ok, 1 expected failure (no tokens, refresh failed), 2 usage error.
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use clap::{Parser, Subcommand};

use claude_oauth_broker::{config::EngineConfig, logging, Engine};

#[derive(Parser)]
#[command(name = "claude-oauth", about = "Claude OAuth token broker CLI")]
struct Cli {
    #[arg(long, default_value = "default")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the PKCE authorization-code flow and print the authorize URL.
    Login,
    /// Exchange an authorization code for tokens.
    Callback {
        code: String,
        #[arg(long)]
        state: Option<String>,
    },
    /// Show the current lifecycle state for this user.
    Status,
    /// Force a token refresh outside the near-expiry threshold.
    Refresh,
    /// Revoke the stored token for this user.
    Logout,
    /// Print the current access token to stdout. Nothing sensitive goes to stderr.
    Export,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(&logging::LoggingConfig::from_env());

    let engine = match Engine::new(EngineConfig::from_env()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to initialize engine: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = run(&engine, &cli).await;
    engine.shutdown().await;
    std::process::exit(exit_code);
}

async fn run(engine: &std::sync::Arc<Engine>, cli: &Cli) -> i32 {
    match &cli.command {
        Command::Login => match engine.start_flow(Some(cli.user.clone())) {
            Ok(result) => {
                println!("{}", result.instructions);
                0
            }
            Err(e) => {
                eprintln!("failed to start oauth flow: {e}");
                e.exit_code()
            }
        },
        Command::Callback { code, state } => {
            let Some(state) = state else {
                eprintln!("--state is required (or pass \"manual_entry\" if enabled)");
                return 2;
            };
            match engine.complete_flow(&cli.user, code, state).await {
                Ok(record) => {
                    println!("authenticated; token expires at {}", record.expires_at);
                    0
                }
                Err(e) => {
                    eprintln!("callback failed: {e}");
                    e.exit_code()
                }
            }
        }
        Command::Status => match engine.get_access_token(&cli.user).await {
            Ok(Some(record)) => {
                let expires_in = record.expires_at - chrono::Utc::now().timestamp();
                let state = engine.lifecycle_state(&cli.user).await.as_str();
                println!(
                    "authenticated; state={state} expires_in={expires_in}s refresh_count={}",
                    record.refresh_count
                );
                0
            }
            Ok(None) => {
                println!("not authenticated");
                1
            }
            Err(e) => {
                eprintln!("status check failed: {e}");
                e.exit_code()
            }
        },
        Command::Refresh => match engine.refresh(&cli.user).await {
            Ok(record) => {
                println!("refreshed; expires_at={}", record.expires_at);
                0
            }
            Err(e) => {
                eprintln!("refresh failed: {e}");
                e.exit_code()
            }
        },
        Command::Logout => match engine.revoke(&cli.user) {
            Ok(()) => {
                println!("revoked");
                0
            }
            Err(e) => {
                eprintln!("revoke failed: {e}");
                e.exit_code()
            }
        },
        Command::Export => match engine.get_access_token(&cli.user).await {
            Ok(Some(record)) => {
                // All secret output goes to stdout only; stderr stays clean of tokens.
                println!("{}", serde_json::json!({
                    "accessToken": record.access_token,
                    "refreshToken": record.refresh_token,
                    "expiresAt": record.expires_at,
                }));
                0
            }
            Ok(None) => {
                eprintln!("no token on file for this user");
                1
            }
            Err(e) => {
                eprintln!("export failed: {e}");
                e.exit_code()
            }
        },
    }
}
