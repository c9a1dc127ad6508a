use crate::peer::types::TrackHandle;
use crate::session::model::{Annotation, ChatMessage, SharedFileRef};
use crate::signaling::types::Participant;

/// С кем устанавливается звонок
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Исходящий звонок пользователю
    User(String),
    /// Ответ в существующую комнату
    Room(String),
}

impl ConnectTarget {
    pub fn id(&self) -> &str {
        match self {
            ConnectTarget::User(id) | ConnectTarget::Room(id) => id,
        }
    }
}

/// Здоровье медиа-соединения внутри активного звонка
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionHealth {
    #[default]
    Stable,
    /// Соединение потеряно, ждём восстановления или явного завершения
    Recovering,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCall {
    pub call_id: String,
    pub participants: Vec<Participant>,
    pub local_video: Option<TrackHandle>,
    pub remote_video: Option<TrackHandle>,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub annotations: Vec<Annotation>,
    pub messages: Vec<ChatMessage>,
    pub shared_files: Vec<SharedFileRef>,
    pub connection: ConnectionHealth,
}

impl ActiveCall {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            participants: Vec::new(),
            local_video: None,
            remote_video: None,
            mic_enabled: true,
            camera_enabled: true,
            annotations: Vec::new(),
            messages: Vec::new(),
            shared_files: Vec::new(),
            connection: ConnectionHealth::Stable,
        }
    }
}

/// Состояние звонка для UI
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CallState {
    #[default]
    Initial,
    Connecting { target: ConnectTarget },
    Active(ActiveCall),
    Ended { call_id: String, duration_seconds: u64 },
    Error { message: String },
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Active(_))
    }

    pub fn as_active(&self) -> Option<&ActiveCall> {
        match self {
            CallState::Active(call) => Some(call),
            _ => None,
        }
    }

    /// Короткое имя для логов
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Initial => "initial",
            CallState::Connecting { .. } => "connecting",
            CallState::Active(_) => "active",
            CallState::Ended { .. } => "ended",
            CallState::Error { .. } => "error",
        }
    }
}
