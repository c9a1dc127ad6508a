//! Менеджер звонка: связывает сигнализацию и peer-координатор в состояние для UI.
//!
//! Всё изменение сессии идёт под одним async mutex (`core`). Фоновые задачи
//! (опрос сервера и события транспорта) передают события в этот же контекст.
//! Каждая попытка звонка получает номер поколения; задачи и завершения со
//! старым поколением ничего не меняют.

pub mod files;
pub mod model;
pub mod sink;
pub mod state;

pub use files::{DavFileLocator, FileLocator, LocatedFile};
pub use model::{Annotation, AnnotationType, CallLogRecord, ChatMessage, Point, SharedFileRef};
pub use sink::{CallLogSink, JsonlLogSink};
pub use state::{ActiveCall, CallState, ConnectTarget, ConnectionHealth};

use crate::config::{Config, LocalIdentity};
use crate::error::{CallError, Result};
use crate::peer::data_channel::DataMessage;
use crate::peer::{
    PeerConnectionCoordinator, PeerEvent, WebRtcSettings, WebRtcTransportFactory,
};
use crate::signaling::{
    NextcloudApi, RemoteSignalingEvent, SignalingChannel, TokenProvider,
};
use crate::utils::{now_millis, wait_cancelled};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

/// Текущая попытка звонка
struct CallSession {
    call_id: String,
    peer: String,
    start: Instant,
    started_at_ms: i64,
}

#[derive(Default)]
struct SessionCore {
    session: Option<CallSession>,
}

struct Inner {
    signaling: SignalingChannel,
    peer: PeerConnectionCoordinator,
    sink: Arc<dyn CallLogSink>,
    files: Arc<dyn FileLocator>,
    identity: LocalIdentity,
    state_tx: watch::Sender<CallState>,
    core: tokio::sync::Mutex<SessionCore>,
    generation: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct CallSessionManager {
    inner: Arc<Inner>,
}

impl CallSessionManager {
    pub fn new(
        signaling: SignalingChannel,
        peer: PeerConnectionCoordinator,
        sink: Arc<dyn CallLogSink>,
        files: Arc<dyn FileLocator>,
        identity: LocalIdentity,
    ) -> Self {
        let (state_tx, _) = watch::channel(CallState::Initial);
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                signaling,
                peer,
                sink,
                files,
                identity,
                state_tx,
                core: tokio::sync::Mutex::new(SessionCore::default()),
                generation,
            }),
        }
    }

    /// Собирает продакшен-стек: Nextcloud REST, WebRTC, журнал в JSON lines
    pub fn from_config(config: &Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let api = NextcloudApi::new(
            &config.server.base_url,
            config.server.request_timeout(),
            tokens,
        )?;
        let signaling = SignalingChannel::new(Arc::new(api), &config.signaling);

        let factory = WebRtcTransportFactory::new(WebRtcSettings {
            ice_servers: config.media.ice_servers.clone(),
            grace_period: config.media.grace_period(),
        });
        let peer = PeerConnectionCoordinator::new(
            Arc::new(factory),
            config.media.data_channel_label.clone(),
        );

        let sink = JsonlLogSink::new(config.log.sink_dir.clone());
        let files = DavFileLocator::new(&config.server.base_url, config.identity.user_id.clone())?;

        Ok(Self::new(
            signaling,
            peer,
            Arc::new(sink),
            Arc::new(files),
            config.identity.clone(),
        ))
    }

    // ========== OBSERVATION ==========

    /// Последнее значение побеждает, все подписчики видят одно и то же
    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state_stream(&self) -> impl Stream<Item = CallState> + Send + 'static {
        WatchStream::new(self.subscribe())
    }

    pub fn current_state(&self) -> CallState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.inner.signaling
    }

    pub fn peer(&self) -> &PeerConnectionCoordinator {
        &self.inner.peer
    }

    // ========== CALL LIFECYCLE ==========

    /// Исходящий звонок. Только из `Initial`, результат виден в состоянии.
    pub async fn initiate_call(&self, peer_user_id: &str) {
        let Some(generation) = self
            .begin(ConnectTarget::User(peer_user_id.to_string()))
            .await
        else {
            return;
        };

        if let Err(e) = self.connect_outgoing(peer_user_id, generation).await {
            self.fail(generation, e).await;
        }
    }

    /// Ответ в существующую комнату; answer создаётся, когда придёт offer
    pub async fn answer_call(&self, call_id: &str) {
        let Some(generation) = self.begin(ConnectTarget::Room(call_id.to_string())).await else {
            return;
        };

        if let Err(e) = self.connect_incoming(call_id, generation).await {
            self.fail(generation, e).await;
        }
    }

    /// Завершает активный звонок: сервер, транспорт, журнал, `Ended`
    pub async fn end_call(&self) {
        let mut core = self.inner.core.lock().await;
        if !self.current_state().is_active() {
            debug!("end_call ignored, no active call");
            return;
        }
        self.bump_generation();
        self.finish(&mut core).await;
    }

    /// Возвращает менеджер в `Initial` из любого состояния
    pub async fn reset(&self) {
        // поколение меняется до ожидания блокировки, чтобы идущие шаги остановились
        self.bump_generation();
        let mut core = self.inner.core.lock().await;
        core.session = None;
        self.inner.signaling.release();
        self.inner.peer.release().await;
        self.set_state(CallState::Initial);
        info!("Call session reset");
    }

    /// Перечитывает участников активного звонка
    pub async fn refresh_call_info(&self) {
        let (call_id, generation) = {
            let _core = self.inner.core.lock().await;
            match self.current_state().as_active() {
                Some(active) => (active.call_id.clone(), self.generation()),
                None => return,
            }
        };

        match self.inner.signaling.fetch_call_info(&call_id).await {
            Ok(info) => {
                let _core = self.inner.core.lock().await;
                if self.is_current(generation) {
                    self.update_active(|call| {
                        call.participants = info.participants;
                        true
                    });
                }
            }
            Err(e) => warn!(call_id = %call_id, "Failed to refresh call info: {}", e),
        }
    }

    // ========== IN-CALL OPERATIONS ==========

    pub async fn toggle_microphone(&self, enabled: bool) {
        let _core = self.inner.core.lock().await;
        if !self.current_state().is_active() {
            return;
        }
        self.inner.peer.toggle_microphone(enabled);
        self.update_active(|call| {
            call.mic_enabled = enabled;
            true
        });
    }

    pub async fn toggle_camera(&self, enabled: bool) {
        let _core = self.inner.core.lock().await;
        if !self.current_state().is_active() {
            return;
        }
        self.inner.peer.toggle_camera(enabled);
        self.update_active(|call| {
            call.camera_enabled = enabled;
            true
        });
    }

    pub async fn add_annotation(&self, annotation: Annotation) {
        let _core = self.inner.core.lock().await;
        let message = DataMessage::Annotation(annotation.clone());
        if !self.update_active(|call| upsert_annotation(&mut call.annotations, annotation)) {
            return;
        }
        // отправка под той же блокировкой сохраняет порядок публикаций
        self.publish(&message).await;
    }

    pub async fn remove_annotation(&self, id: &str) {
        let _core = self.inner.core.lock().await;
        let mut removed = false;
        self.update_active(|call| {
            let before = call.annotations.len();
            call.annotations.retain(|a| a.id != id);
            removed = call.annotations.len() != before;
            removed
        });
        if removed {
            self.publish(&DataMessage::RemoveAnnotation { id: id.to_string() })
                .await;
        } else {
            debug!(annotation_id = id, "No such annotation");
        }
    }

    pub async fn send_message(&self, text: &str) {
        let _core = self.inner.core.lock().await;
        let Some(call_id) = self.active_call_id() else {
            return;
        };

        let message = ChatMessage::new(&self.inner.identity, text);
        self.update_active(|call| {
            call.messages.push(message.clone());
            true
        });
        self.publish(&DataMessage::Message(message.clone())).await;
        self.persist_message_later(call_id, message);
    }

    /// Делится файлом, который уже доступен по URL (загрузка вне менеджера)
    pub async fn send_file(&self, path: &str, name: &str, mime_type: &str) {
        let _core = self.inner.core.lock().await;
        let Some(call_id) = self.active_call_id() else {
            return;
        };

        let located = match self.inner.files.locate(path, name).await {
            Ok(located) => located,
            Err(e) => {
                warn!(file = name, "Cannot share file: {}", e);
                return;
            }
        };

        let file = SharedFileRef {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            url: located.url,
            size: located.size,
            sender_id: self.inner.identity.user_id.clone(),
            sender_name: self.inner.identity.display_name.clone(),
            timestamp: now_millis(),
        };
        self.update_active(|call| {
            call.shared_files.push(file.clone());
            true
        });
        self.publish(&DataMessage::File(file.clone())).await;
        self.persist_file_later(call_id, file);
    }

    // ========== CONNECT SEQUENCES ==========

    /// `Initial → Connecting`, возвращает поколение новой попытки
    async fn begin(&self, target: ConnectTarget) -> Option<u64> {
        let _core = self.inner.core.lock().await;
        let current = self.current_state();
        if current != CallState::Initial {
            warn!(state = current.name(), target = target.id(), "Call attempt ignored, reset first");
            return None;
        }
        let generation = self.bump_generation();
        self.set_state(CallState::Connecting { target });
        Some(generation)
    }

    async fn connect_outgoing(&self, peer_user_id: &str, generation: u64) -> Result<()> {
        let call_id = self.inner.signaling.initiate_call(peer_user_id).await?;
        if !self.is_current(generation) {
            return Ok(());
        }

        if !self.open_session(&call_id, peer_user_id, generation).await? {
            return Ok(());
        }

        let offer = self.inner.peer.create_offer().await?;
        if !self.is_current(generation) {
            return Ok(());
        }
        self.inner.signaling.send_local_description(&call_id, offer).await;
        if !self.is_current(generation) {
            return Ok(());
        }

        self.spawn_poll_pump(&call_id, generation);
        self.activate(&call_id, generation).await
    }

    async fn connect_incoming(&self, call_id: &str, generation: u64) -> Result<()> {
        if !self.open_session(call_id, call_id, generation).await? {
            return Ok(());
        }
        self.spawn_poll_pump(call_id, generation);
        self.activate(call_id, generation).await
    }

    /// Инициализирует транспорт и запоминает сессию. `false` для устаревшей попытки.
    ///
    /// `core` держится всю инициализацию: `reset()`, `fail()` и `end_call()`
    /// освобождают peer только после неё, поэтому созданный устаревшей
    /// попыткой транспорт всегда закрывается.
    async fn open_session(&self, call_id: &str, peer: &str, generation: u64) -> Result<bool> {
        let mut core = self.inner.core.lock().await;
        if !self.is_current(generation) {
            return Ok(false);
        }

        let events = self.inner.peer.initialize().await?;
        if !self.is_current(generation) {
            debug!(call_id, "Call attempt cancelled during media initialization");
            return Ok(false);
        }
        core.session = Some(CallSession {
            call_id: call_id.to_string(),
            peer: peer.to_string(),
            start: Instant::now(),
            started_at_ms: now_millis(),
        });
        self.spawn_peer_pump(call_id, events, generation);
        Ok(true)
    }

    /// `Connecting → Active` после получения участников
    async fn activate(&self, call_id: &str, generation: u64) -> Result<()> {
        let info = self.inner.signaling.fetch_call_info(call_id).await?;

        let _core = self.inner.core.lock().await;
        if !self.is_current(generation) {
            return Ok(());
        }
        if !matches!(self.current_state(), CallState::Connecting { .. }) {
            // звонок успел закончиться, пока шёл запрос
            return Ok(());
        }

        let mut call = ActiveCall::new(call_id);
        call.participants = info.participants;
        call.local_video = self.inner.peer.local_video_handle();
        call.remote_video = self.inner.peer.remote_video_handle();
        call.mic_enabled = self.inner.peer.mic_enabled();
        call.camera_enabled = self.inner.peer.camera_enabled();
        info!(call_id, participants = call.participants.len(), "Call is active");
        self.set_state(CallState::Active(call));
        Ok(())
    }

    async fn fail(&self, generation: u64, error: CallError) {
        let mut core = self.inner.core.lock().await;
        if !self.is_current(generation) {
            debug!("Stale failure ignored: {}", error);
            return;
        }
        self.bump_generation();
        error!("Call failed: {}", error);

        core.session = None;
        self.inner.signaling.stop_polling();
        self.inner.peer.release().await;
        self.set_state(CallState::Error {
            message: error.to_string(),
        });
    }

    /// Общее завершение для `end_call` и завершения удалённой стороной.
    /// Вызывается под `core` после смены поколения.
    async fn finish(&self, core: &mut SessionCore) {
        let Some(session) = core.session.take() else {
            warn!("No session record for the finished call");
            let call_id = self.active_call_id().unwrap_or_default();
            self.set_state(CallState::Ended {
                call_id,
                duration_seconds: 0,
            });
            return;
        };

        // сервер уведомляется один раз на звонок, ошибка не мешает завершению
        if let Err(e) = self.inner.signaling.end_call(&session.call_id).await {
            warn!(call_id = %session.call_id, "Failed to notify server about call end: {}", e);
        }
        self.inner.peer.release().await;

        let duration_seconds = session.start.elapsed().as_secs();
        let record = CallLogRecord {
            call_id: session.call_id.clone(),
            user_id: self.inner.identity.user_id.clone(),
            user_name: self.inner.identity.display_name.clone(),
            peer: session.peer.clone(),
            start_time: session.started_at_ms,
            duration_seconds,
            timestamp: now_millis(),
        };
        if let Err(e) = self.inner.sink.persist(&session.call_id, &record).await {
            warn!(call_id = %session.call_id, "Failed to persist call log: {}", e);
        }

        info!(call_id = %session.call_id, duration_seconds, "Call ended");
        self.set_state(CallState::Ended {
            call_id: session.call_id,
            duration_seconds,
        });
    }

    // ========== BACKGROUND PUMPS ==========

    fn spawn_peer_pump(&self, call_id: &str, mut events: UnboundedReceiver<PeerEvent>, generation: u64) {
        let this = self.clone();
        let call_id = call_id.to_string();
        let mut cancel = self.inner.generation.subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = wait_cancelled(&mut cancel, generation) => None,
                };
                let Some(event) = event else { break };
                this.on_peer_event(&call_id, generation, event).await;
            }
            debug!(call_id = %call_id, "Peer event pump stopped");
        });
    }

    fn spawn_poll_pump(&self, call_id: &str, generation: u64) {
        let this = self.clone();
        let call_id = call_id.to_string();
        let mut cancel = self.inner.generation.subscribe();
        let mut signals = Box::pin(self.inner.signaling.start_polling(&call_id));

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    signal = signals.next() => signal,
                    _ = wait_cancelled(&mut cancel, generation) => None,
                };
                let Some(signal) = signal else { break };
                this.on_signal(&call_id, generation, signal).await;
            }
            debug!(call_id = %call_id, "Signaling pump stopped");
        });
    }

    async fn on_peer_event(&self, call_id: &str, generation: u64, event: PeerEvent) {
        if !self.is_current(generation) {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.inner
                    .signaling
                    .send_local_candidate(call_id, candidate)
                    .await;
            }
            PeerEvent::AnswerCreated(answer) => {
                self.inner
                    .signaling
                    .send_local_description(call_id, answer)
                    .await;
            }
            PeerEvent::DataChannelOpen => info!(call_id, "Annotations channel open"),
            PeerEvent::DataChannelClosed => info!(call_id, "Annotations channel closed"),
            PeerEvent::DataMessage(raw) => match DataMessage::decode(&raw) {
                Ok(message) => self.apply_remote(generation, message).await,
                Err(e) => warn!(call_id, "Dropping malformed data channel message: {}", e),
            },
            PeerEvent::RemoteTrack(handle) => {
                let _core = self.inner.core.lock().await;
                if self.is_current(generation) {
                    self.update_active(|call| {
                        call.remote_video = Some(handle);
                        true
                    });
                }
            }
            PeerEvent::ConnectionProblem => warn!(call_id, "Connection problem, waiting for recovery"),
            PeerEvent::ConnectionLost => {
                warn!(call_id, "{}, call stays active", CallError::ConnectionLost);
                self.set_health(generation, ConnectionHealth::Recovering).await;
            }
            PeerEvent::ConnectionRecovered => {
                info!(call_id, "Connection recovered");
                self.set_health(generation, ConnectionHealth::Stable).await;
            }
            PeerEvent::Closed => debug!(call_id, "Transport closed"),
        }
    }

    async fn on_signal(&self, call_id: &str, generation: u64, signal: RemoteSignalingEvent) {
        if !self.is_current(generation) {
            return;
        }
        match signal {
            RemoteSignalingEvent::RemoteOffer(desc) | RemoteSignalingEvent::RemoteAnswer(desc) => {
                if let Err(e) = self.inner.peer.set_remote_description(desc).await {
                    self.fail(generation, e).await;
                }
            }
            RemoteSignalingEvent::RemoteCandidates(candidates) => {
                debug!(call_id, count = candidates.len(), "Remote candidates received");
                for candidate in candidates {
                    self.inner.peer.add_remote_candidate(candidate).await;
                }
            }
            RemoteSignalingEvent::Participants(participants) => {
                let _core = self.inner.core.lock().await;
                if self.is_current(generation) {
                    self.update_active(|call| {
                        call.participants = participants;
                        true
                    });
                }
            }
            RemoteSignalingEvent::RemoteEnded => {
                let mut core = self.inner.core.lock().await;
                if !self.is_current(generation) {
                    return;
                }
                info!(call_id, "Remote side ended the call");
                self.bump_generation();
                self.finish(&mut core).await;
            }
        }
    }

    /// Сообщение собеседника из канала данных
    async fn apply_remote(&self, generation: u64, message: DataMessage) {
        let _core = self.inner.core.lock().await;
        if !self.is_current(generation) {
            return;
        }
        let Some(call_id) = self.active_call_id() else {
            debug!("Data message outside of an active call ignored");
            return;
        };

        match message {
            DataMessage::Annotation(annotation) => {
                if !annotation.is_valid() {
                    warn!(annotation_id = %annotation.id, "Dropping invalid remote annotation");
                    return;
                }
                self.update_active(|call| upsert_annotation(&mut call.annotations, annotation));
            }
            DataMessage::RemoveAnnotation { id } => {
                self.update_active(|call| {
                    call.annotations.retain(|a| a.id != id);
                    true
                });
            }
            DataMessage::Message(message) => {
                self.update_active(|call| {
                    call.messages.push(message.clone());
                    true
                });
                self.persist_message_later(call_id, message);
            }
            DataMessage::File(file) => {
                self.update_active(|call| {
                    call.shared_files.push(file.clone());
                    true
                });
                self.persist_file_later(call_id, file);
            }
        }
    }

    async fn set_health(&self, generation: u64, health: ConnectionHealth) {
        let _core = self.inner.core.lock().await;
        if self.is_current(generation) {
            self.update_active(|call| {
                let changed = call.connection != health;
                call.connection = health;
                changed
            });
        }
    }

    // ========== HELPERS ==========

    async fn publish(&self, message: &DataMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode data channel message: {}", e);
                return;
            }
        };
        if !self.inner.peer.send_data_message(&payload).await {
            debug!("Data channel not open, message not delivered");
        }
    }

    fn persist_message_later(&self, call_id: String, message: ChatMessage) {
        let sink = self.inner.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.persist_message(&call_id, &message).await {
                warn!(call_id = %call_id, "Failed to persist message: {}", e);
            }
        });
    }

    fn persist_file_later(&self, call_id: String, file: SharedFileRef) {
        let sink = self.inner.sink.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.persist_file(&call_id, &file).await {
                warn!(call_id = %call_id, "Failed to persist shared file: {}", e);
            }
        });
    }

    fn active_call_id(&self) -> Option<String> {
        self.inner
            .state_tx
            .borrow()
            .as_active()
            .map(|call| call.call_id.clone())
    }

    /// Меняет активный звонок одним снимком. `f` возвращает, изменилось ли что-то.
    fn update_active(&self, f: impl FnOnce(&mut ActiveCall) -> bool) -> bool {
        self.inner.state_tx.send_if_modified(|state| match state {
            CallState::Active(call) => f(call),
            _ => false,
        })
    }

    fn set_state(&self, state: CallState) {
        let previous = self.inner.state_tx.send_replace(state);
        let current = self.inner.state_tx.borrow();
        if previous.name() != current.name() {
            info!(from = previous.name(), to = current.name(), "Call state changed");
        }
    }

    fn generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn bump_generation(&self) -> u64 {
        let mut current = 0;
        self.inner.generation.send_modify(|g| {
            *g += 1;
            current = *g;
        });
        current
    }
}

/// Аннотация с тем же id заменяется на месте, иначе добавляется в конец
fn upsert_annotation(annotations: &mut Vec<Annotation>, annotation: Annotation) -> bool {
    match annotations.iter_mut().find(|a| a.id == annotation.id) {
        Some(existing) => *existing = annotation,
        None => annotations.push(annotation),
    }
    true
}
