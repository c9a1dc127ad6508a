use crate::peer::ice::PendingCandidates;
use crate::peer::transport::MediaTransport;
use crate::peer::types::PeerEvent;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use std::time::Duration;

// ========== CONSTANTS ==========

/// Метка канала данных: аннотации, чат и файлы мультиплексируются по полю `type`
pub const DATA_CHANNEL_LABEL: &str = "annotations";

/// Период ожидания перед тем как считать соединение потерянным
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Дефолтные STUN серверы
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ========== COORDINATOR STATE ==========

/// Состояние согласования одной сессии координатора
pub(crate) struct NegotiationState {
    pub transport: Option<Arc<dyn MediaTransport>>,
    /// Канал событий текущего транспорта, туда же уходит `AnswerCreated`
    pub events: Option<UnboundedSender<PeerEvent>>,
    /// Растёт на каждом initialize/release, устаревшие завершения игнорируются
    pub epoch: u64,
    /// Кандидаты, полученные до установки remote description
    pub pending: PendingCandidates,
    /// Remote description применён и буфер кандидатов сброшен
    pub remote_ready: bool,
    /// Локальный offer установлен и ждёт answer
    pub awaiting_answer: bool,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub released: bool,
}

impl NegotiationState {
    pub fn new() -> Self {
        Self {
            transport: None,
            events: None,
            epoch: 0,
            pending: PendingCandidates::default(),
            remote_ready: false,
            awaiting_answer: false,
            mic_enabled: true,
            camera_enabled: true,
            released: true,
        }
    }

    /// Сбрасывает всё, кроме самого флага `released`
    pub fn clear(&mut self) {
        self.epoch += 1;
        self.transport = None;
        self.events = None;
        self.pending.clear();
        self.remote_ready = false;
        self.awaiting_answer = false;
        self.mic_enabled = true;
        self.camera_enabled = true;
    }
}
