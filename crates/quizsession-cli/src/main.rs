//! quizsession - a terminal front-end for the quiz service.
//!
//! Signs in, restores the stored session on start-up and runs a few read-only
//! calls through the session's token pipeline.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use quizsession_core::{
    ApiClient, Config, Identity, Role, Session, SessionEvent, SessionStatus, TerminationReason,
};
use tokio::sync::broadcast;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable overriding the configured API base URL
const API_URL_ENV: &str = "QUIZ_API_URL";

/// Log file name prefix inside the cache directory
const LOG_FILE_PREFIX: &str = "quizsession.log";

const USAGE: &str = "\
Usage: quizsession <command>

Commands:
  login [email]                  Sign in and store the session
  signup <name> <email> <role>   Create an account (role: teacher | student)
  logout                         Sign out and clear stored credentials
  whoami                         Show the signed-in user
  status                         Show the session status
  quizzes                        List quizzes for the signed-in user
  attempts                       List your quiz attempts";

/// Initialize the tracing subscriber for logging.
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug).
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
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

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config ({}), using defaults", e);
        Config::default()
    });
    if let Ok(url) = std::env::var(API_URL_ENV) {
        config.api_base_url = url;
    }

    let log_dir = config.cache_dir().ok();
    let _log_guard = init_tracing(log_dir.as_deref());
    info!(api = %config.base_url(), "quizsession starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    let session = Session::from_config(&config).context("Failed to open session")?;
    let mut events = session.events();

    let result = match command {
        "login" => login(&session, &mut config, args.get(1).cloned()).await,
        "signup" => signup(&session, &mut config, &args[1..]).await,
        "logout" => {
            session.logout().await;
            println!("Signed out.");
            Ok(())
        }
        "whoami" => whoami(&session).await,
        "status" => {
            let status = session.restore().await;
            println!("{}", describe_status(status));
            Ok(())
        }
        "quizzes" => quizzes(&session).await,
        "attempts" => attempts(&session).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command '{}'\n\n{}", other, USAGE);
            Ok(())
        }
    };

    report_termination(&mut events);
    result
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

async fn login(session: &Session, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => match config.last_email.clone() {
            Some(last) => {
                let input = prompt(&format!("Email [{}]: ", last))?;
                if input.is_empty() {
                    last
                } else {
                    input
                }
            }
            None => prompt("Email: ")?,
        },
    };
    let password = prompt_password()?;

    let user = session.login(&email, &password).await?;
    remember_email(config, email);
    println!("Signed in as {} ({}).", user.label(), user.role);
    Ok(())
}

async fn signup(session: &Session, config: &mut Config, args: &[String]) -> Result<()> {
    let [name, email, role] = args else {
        bail!("signup needs <name> <email> <role>");
    };
    let role: Role = role.parse().map_err(anyhow::Error::msg)?;
    let password = prompt_password()?;

    let user = session.signup(name, email, &password, role).await?;
    remember_email(config, email.clone());
    println!("Account created. Signed in as {} ({}).", user.label(), user.role);
    Ok(())
}

fn remember_email(config: &mut Config, email: String) {
    config.last_email = Some(email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }
}

/// Restore the stored session, failing with a hint when there is none
async fn require_user(session: &Session) -> Result<(Identity, ApiClient)> {
    match session.restore().await {
        SessionStatus::Authenticated => {}
        _ if session.has_stored_credentials() => {
            bail!("Could not verify your session with the server; try again later")
        }
        _ => bail!("Not signed in. Run 'quizsession login' first."),
    }
    let user = session
        .current_user()
        .context("Session has no signed-in user")?;
    Ok((user, session.client()))
}

async fn whoami(session: &Session) -> Result<()> {
    let (user, _) = require_user(session).await?;
    println!("{} <{}>", user.label(), user.email.as_deref().unwrap_or("-"));
    println!("id: {}  role: {}", user.id, user.role);
    Ok(())
}

async fn quizzes(session: &Session) -> Result<()> {
    let (user, client) = require_user(session).await?;
    let quizzes = if user.is_teacher() {
        client.list_quizzes().await?
    } else {
        client.available_quizzes().await?
    };

    if quizzes.is_empty() {
        println!("No quizzes.");
    }
    for quiz in quizzes {
        let difficulty = quiz
            .difficulty
            .map(|d| format!("{:?}", d))
            .unwrap_or_else(|| "-".to_string());
        println!("{:>5}  {:<8} {}", quiz.id, difficulty, quiz.title);
    }
    Ok(())
}

async fn attempts(session: &Session) -> Result<()> {
    let (_, client) = require_user(session).await?;
    let attempts = client.my_attempts().await?;

    if attempts.is_empty() {
        println!("No attempts yet.");
    }
    for attempt in attempts {
        let when = attempt
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("quiz {:>5}  score {:>3}  {}", attempt.quiz_id, attempt.score, when);
    }
    Ok(())
}

fn describe_status(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Authenticated => "Signed in",
        SessionStatus::Authenticating => "Signing in",
        SessionStatus::Renewing => "Renewing session",
        SessionStatus::Unauthenticated => "Signed out",
    }
}

/// Tell the user once if the session ended underneath the command
fn report_termination(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Terminated(reason) = event {
            match reason {
                TerminationReason::LoggedOut => {}
                TerminationReason::RenewalFailed | TerminationReason::Rejected => {
                    eprintln!("Your session has ended. Run 'quizsession login' to sign in again.");
                }
            }
            return;
        }
    }
}
