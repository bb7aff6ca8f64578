//! tokenrelay - keep a bearer-token session and make authenticated calls.
//!
//! The session (access + refresh token) is stored with the backend chosen in
//! the config file. `get` goes through the same refresh-on-401 path an
//! embedding application would use.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenrelay_core::api::{ApiClient, ApiRequest};
use tokenrelay_core::auth::{Session, SessionEndNotifier, SessionUser};
use tokenrelay_core::Config;

#[derive(Parser)]
#[command(name = "tokenrelay", version, about = "Bearer-token session manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a session; missing tokens are prompted for
    Login {
        #[arg(long)]
        access: Option<String>,
        #[arg(long)]
        refresh: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show whether a session is stored
    Status,
    /// GET a path relative to the configured base URL
    Get { path: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // Optional daily log file alongside stderr
    let (file_layer, guard) = match std::env::var_os("TOKENRELAY_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tokenrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn prompt_secret(value: Option<String>, prompt: &str) -> Result<String> {
    match value {
        Some(value) => Ok(value),
        None => rpassword::prompt_password(prompt).context("Failed to read token"),
    }
}

/// The session-end hook runs synchronously inside the client, so it only
/// raises a flag; `sign_out_if_ended` does the sign-out once the call returns.
fn watch_session_end(notifier: &SessionEndNotifier) -> Arc<AtomicBool> {
    let ended = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ended);
    notifier.register(move || flag.store(true, Ordering::SeqCst));
    ended
}

async fn sign_out_if_ended(session: &Session, ended: &AtomicBool) -> bool {
    if !ended.swap(false, Ordering::SeqCst) {
        return false;
    }
    session.sign_out().await;
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let mut config = Config::load()?;
    config.apply_env()?;

    let session = Session::new(config.open_store()?);
    session.restore().await;

    let result = run(cli.command, &config, &session).await;

    // Let background token writes land before exiting
    session.tokens().wait_persisted().await;
    result
}

async fn run(command: Command, config: &Config, session: &Session) -> Result<()> {
    match command {
        Command::Login {
            access,
            refresh,
            email,
            name,
        } => {
            let access = prompt_secret(access, "Access token: ")?;
            let refresh = prompt_secret(refresh, "Refresh token: ")?;
            let user = email.map(|email| {
                let name = name.unwrap_or_else(|| email.clone());
                SessionUser::new(email.clone(), email, name)
            });
            session.sign_in(access, refresh, user).await;
            eprintln!("Session stored.");
        }
        Command::Logout => {
            session.sign_out().await;
            eprintln!("Session cleared.");
        }
        Command::Status => match (session.is_authenticated(), session.user()) {
            (true, Some(user)) => println!(
                "Signed in as {} <{}> since {}",
                user.name,
                user.email,
                user.signed_in_at.format("%Y-%m-%d %H:%M UTC")
            ),
            (true, None) => println!("Signed in"),
            (false, _) => println!("Not signed in"),
        },
        Command::Get { path } => {
            let notifier = SessionEndNotifier::new();
            let ended = watch_session_end(&notifier);

            let client = ApiClient::new(config, session.tokens().clone(), notifier)?;
            info!(path = %path, "Fetching");
            let result = client.send(ApiRequest::get(client.url(&path))).await;
            if sign_out_if_ended(session, &ended).await {
                eprintln!("Session expired. Run `tokenrelay login` to sign in again.");
            }
            let response = result?.error_for_status()?;

            match serde_json::from_slice::<serde_json::Value>(response.bytes()) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", response.text()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenrelay_core::storage::{MemoryStore, ACCESS_TOKEN_KEY, USER_DATA_KEY};

    #[tokio::test]
    async fn test_session_end_signs_user_out() {
        let durable = Arc::new(MemoryStore::new());
        let session = Session::new(durable.clone());
        session
            .sign_in("A1", "R1", Some(SessionUser::new("1", "pat@example.com", "Pat")))
            .await;

        let notifier = SessionEndNotifier::new();
        let ended = watch_session_end(&notifier);
        assert!(!sign_out_if_ended(&session, &ended).await);
        assert!(session.is_authenticated());

        notifier.notify();
        assert!(sign_out_if_ended(&session, &ended).await);
        session.tokens().wait_persisted().await;
        assert!(!session.is_authenticated());
        assert_eq!(session.user(), None);
        assert_eq!(durable.snapshot(ACCESS_TOKEN_KEY), None);
        assert_eq!(durable.snapshot(USER_DATA_KEY), None);
    }
}
