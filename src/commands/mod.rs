//! Команды UI к менеджеру звонка и их разбор из строки консоли.

use crate::session::model::Annotation;
use crate::session::CallSessionManager;
use tracing::debug;

/// Намерения пользователя
#[derive(Debug, Clone, PartialEq)]
pub enum CallCommand {
    InitiateCall { user_id: String },
    AnswerCall { call_id: String },
    EndCall,
    ToggleMicrophone(bool),
    ToggleCamera(bool),
    AddAnnotation(Annotation),
    RemoveAnnotation { id: String },
    SendMessage { text: String },
    SendFile {
        path: String,
        name: String,
        mime_type: String,
    },
    /// Перечитать состояние комнаты с сервера
    RefreshCallInfo,
    Reset,
}

impl CallSessionManager {
    pub async fn handle(&self, command: CallCommand) {
        debug!(?command, "Handling command");
        match command {
            CallCommand::InitiateCall { user_id } => self.initiate_call(&user_id).await,
            CallCommand::AnswerCall { call_id } => self.answer_call(&call_id).await,
            CallCommand::EndCall => self.end_call().await,
            CallCommand::ToggleMicrophone(enabled) => self.toggle_microphone(enabled).await,
            CallCommand::ToggleCamera(enabled) => self.toggle_camera(enabled).await,
            CallCommand::AddAnnotation(annotation) => self.add_annotation(annotation).await,
            CallCommand::RemoveAnnotation { id } => self.remove_annotation(&id).await,
            CallCommand::SendMessage { text } => self.send_message(&text).await,
            CallCommand::SendFile {
                path,
                name,
                mime_type,
            } => self.send_file(&path, &name, &mime_type).await,
            CallCommand::RefreshCallInfo => self.refresh_call_info().await,
            CallCommand::Reset => self.reset().await,
        }
    }
}

/// Разбор строки консоли.
///
/// `/end`, `/mic on|off`, `/cam on|off`, `/refresh`, `/unmark <id>`,
/// `/file <path> <mime>`; любой другой текст уходит в чат.
pub fn parse_line(line: &str) -> Option<CallCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(CallCommand::SendMessage {
            text: line.to_string(),
        });
    };

    let mut parts = rest.split_whitespace();
    let command = match (parts.next()?, parts.next()) {
        ("end", None) => CallCommand::EndCall,
        ("refresh", None) => CallCommand::RefreshCallInfo,
        ("reset", None) => CallCommand::Reset,
        ("mic", Some(flag)) => CallCommand::ToggleMicrophone(parse_flag(flag)?),
        ("cam", Some(flag)) => CallCommand::ToggleCamera(parse_flag(flag)?),
        ("unmark", Some(id)) => CallCommand::RemoveAnnotation { id: id.to_string() },
        ("file", Some(path)) => {
            let mime_type = parts.next().unwrap_or("application/octet-stream");
            let name = std::path::Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(path);
            CallCommand::SendFile {
                path: path.to_string(),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
            }
        }
        _ => return None,
    };
    Some(command)
}

fn parse_flag(flag: &str) -> Option<bool> {
    match flag {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_console_commands() {
        assert_eq!(parse_line("/end"), Some(CallCommand::EndCall));
        assert_eq!(parse_line(" /mic off "), Some(CallCommand::ToggleMicrophone(false)));
        assert_eq!(parse_line("/cam on"), Some(CallCommand::ToggleCamera(true)));
        assert_eq!(
            parse_line("/file /tmp/scheme.pdf application/pdf"),
            Some(CallCommand::SendFile {
                path: "/tmp/scheme.pdf".into(),
                name: "scheme.pdf".into(),
                mime_type: "application/pdf".into(),
            })
        );
        assert_eq!(
            parse_line("check valve 3"),
            Some(CallCommand::SendMessage {
                text: "check valve 3".into()
            })
        );
    }

    #[test]
    fn rejects_unknown_or_incomplete() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("/mic maybe"), None);
        assert_eq!(parse_line("/cam"), None);
        assert_eq!(parse_line("/dance"), None);
    }
}
