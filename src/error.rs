use thiserror::Error;

/// Ошибки ядра звонка
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallError {
    /// Транзиентная ошибка ввода-вывода или таймаут
    #[error("network error: {0}")]
    Network(String),

    /// Сервер отклонил запрос (не-2xx или OCS meta со статусом failure)
    #[error("server rejected request ({status}): {message}")]
    Server { status: u16, message: String },

    /// Ответ сервера или сообщение канала данных не удалось разобрать
    #[error("malformed payload: {0}")]
    Protocol(String),

    /// Не удалось создать или применить описание сессии
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Транспорт потерял соединение и не восстановился за grace period
    #[error("connection lost")]
    ConnectionLost,

    /// Запись в журнал звонков не удалась
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// Провайдер токенов не смог выдать токен
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Итог звонка, закончившегося состоянием ошибки
    #[error("call failed: {0}")]
    CallFailed(String),
}

impl CallError {
    /// Повторяется ли ошибка автоматически (только внутри цикла опроса)
    pub fn is_transient(&self) -> bool {
        matches!(self, CallError::Network(_))
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            CallError::Server {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            CallError::Protocol(e.to_string())
        } else {
            CallError::Network(e.to_string())
        }
    }
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::Negotiation(e.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        CallError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
