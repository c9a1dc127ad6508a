pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use commands::CallCommand;
pub use config::Config;
pub use error::{CallError, Result};
pub use session::{CallSessionManager, CallState};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use signaling::EnvTokenProvider;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Консольный клиент звонка для очков
#[derive(Parser, Debug)]
#[command(name = "arcall", version, about)]
pub struct Cli {
    /// TOML файл конфигурации
    #[arg(short, long, env = "ARCALL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Позвонить пользователю
    Call { user_id: String },
    /// Ответить в комнату звонка
    Answer { call_id: String },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    logger::init(&config.log.filter);

    let manager = CallSessionManager::from_config(&config, Arc::new(EnvTokenProvider::default()))?;

    let mut states = manager.state_stream();
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            log_state(&state);
        }
    });

    let command = match cli.mode {
        Mode::Call { user_id } => CallCommand::InitiateCall { user_id },
        Mode::Answer { call_id } => CallCommand::AnswerCall { call_id },
    };
    manager.handle(command).await;

    let mut states = manager.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        if is_finished(&states.borrow_and_update()) {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, ending call");
                manager.end_call().await;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match commands::parse_line(&line) {
                    Some(command) => manager.handle(command).await,
                    None => warn!("Unknown command: {}", line.trim()),
                },
                // stdin закрыт, звонок продолжается до Ctrl-C
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    let final_state = manager.current_state();
    manager.reset().await;
    match final_state {
        CallState::Error { message } => Err(CallError::CallFailed(message)),
        _ => Ok(()),
    }
}

fn is_finished(state: &CallState) -> bool {
    matches!(state, CallState::Ended { .. } | CallState::Error { .. })
}

fn log_state(state: &CallState) {
    match state {
        CallState::Initial => info!("Ready"),
        CallState::Connecting { target } => info!(target = target.id(), "Connecting"),
        CallState::Active(call) => info!(
            call_id = %call.call_id,
            participants = call.participants.len(),
            annotations = call.annotations.len(),
            messages = call.messages.len(),
            files = call.shared_files.len(),
            mic = call.mic_enabled,
            camera = call.camera_enabled,
            connection = ?call.connection,
            "In call"
        ),
        CallState::Ended {
            call_id,
            duration_seconds,
        } => info!(call_id = %call_id, duration_seconds, "Call ended"),
        CallState::Error { message } => warn!("Call failed: {}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_modes() {
        let cli = Cli::try_parse_from(["arcall", "--config", "glasses.toml", "call", "expert"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("glasses.toml")));
        assert_eq!(
            cli.mode,
            Mode::Call {
                user_id: "expert".into()
            }
        );

        let cli = Cli::try_parse_from(["arcall", "answer", "room42"]).unwrap();
        assert_eq!(
            cli.mode,
            Mode::Answer {
                call_id: "room42".into()
            }
        );
    }
}
