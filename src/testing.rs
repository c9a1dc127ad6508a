//! Тестовые реализации внешних возможностей: медиа-транспорт, REST сервер
//! комнат звонков и журнал звонков. Доступны в тестах и с фичей `test-util`.

use crate::error::{CallError, Result};
use crate::peer::transport::{MediaTransport, TransportFactory};
use crate::peer::types::{
    IceCandidate, PeerEvent, SessionDescription, TrackHandle, TrackKind,
};
use crate::session::model::{CallLogRecord, ChatMessage, SharedFileRef};
use crate::session::sink::CallLogSink;
use crate::signaling::api::CallRoomApi;
use crate::signaling::types::{
    CallInfo, CallResponse, EndCallResponse, OutboundSignal, Participant, RemoteSignal,
    SignalPayload,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

// ========== MEDIA ==========

/// Вызов транспорта, записанный фейком
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    StartLocalMedia,
    OpenDataChannel(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    SendData(String),
    TrackEnabled(TrackKind, bool),
    Close,
}

#[derive(Default)]
struct FakeMediaState {
    calls: Vec<TransportCall>,
    events: Option<UnboundedSender<PeerEvent>>,
    channel_closed: bool,
    fail_remote: bool,
    fail_init: bool,
    created: usize,
    closed: usize,
    offers: usize,
    media_gate: Option<Arc<Notify>>,
    remote_gate: Option<Arc<Notify>>,
}

/// Фабрика и общий журнал фейковых транспортов
#[derive(Clone, Default)]
pub struct FakeMedia {
    state: Arc<Mutex<FakeMediaState>>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    pub fn sent_data(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::SendData(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::AddCandidate(cand) => Some(cand.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::SetRemote(desc) => Some(desc.clone()),
                _ => None,
            })
            .collect()
    }

    /// Событие от имени последнего созданного транспорта
    pub fn emit(&self, event: PeerEvent) -> bool {
        match &self.state.lock().events {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn set_channel_open(&self, open: bool) {
        self.state.lock().channel_closed = !open;
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.state.lock().fail_remote = fail;
    }

    pub fn fail_initialization(&self, fail: bool) {
        self.state.lock().fail_init = fail;
    }

    /// Следующий `start_local_media` ждёт, пока тест не отпустит возвращённый `Notify`
    pub fn hold_local_media(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().media_gate = Some(gate.clone());
        gate
    }

    /// Следующий `set_remote_description` ждёт `Notify`
    pub fn hold_remote_descriptions(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().remote_gate = Some(gate.clone());
        gate
    }

    pub fn transports_created(&self) -> usize {
        self.state.lock().created
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closed
    }

    fn record(&self, call: TransportCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl TransportFactory for FakeMedia {
    async fn create(&self, events: UnboundedSender<PeerEvent>) -> Result<Arc<dyn MediaTransport>> {
        let mut st = self.state.lock();
        st.created += 1;
        st.events = Some(events);
        Ok(Arc::new(FakeTransport {
            media: self.clone(),
            id: st.created,
        }))
    }
}

struct FakeTransport {
    media: FakeMedia,
    id: usize,
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn start_local_media(&self) -> Result<()> {
        self.media.record(TransportCall::StartLocalMedia);
        let gate = self.media.state.lock().media_gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.media.state.lock().fail_init {
            return Err(CallError::Negotiation("camera unavailable".into()));
        }
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<()> {
        self.media.record(TransportCall::OpenDataChannel(label.to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.media.record(TransportCall::CreateOffer);
        let n = {
            let mut st = self.media.state.lock();
            st.offers += 1;
            st.offers
        };
        Ok(SessionDescription::offer(format!("v=0\r\no=fake {} {n}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.media.record(TransportCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0\r\no=fake-answer {}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.media.record(TransportCall::SetLocal(desc));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.media.record(TransportCall::SetRemote(desc));
        let gate = self.media.state.lock().remote_gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.media.state.lock().fail_remote {
            return Err(CallError::Negotiation("remote description rejected".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.media.record(TransportCall::AddCandidate(candidate));
        Ok(())
    }

    async fn send_data(&self, payload: &str) -> Result<bool> {
        if self.media.state.lock().channel_closed {
            return Ok(false);
        }
        self.media.record(TransportCall::SendData(payload.to_string()));
        Ok(true)
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        self.media.record(TransportCall::TrackEnabled(kind, enabled));
    }

    fn local_video(&self) -> Option<TrackHandle> {
        Some(TrackHandle {
            id: format!("local-video-{}", self.id),
            stream_id: "local".into(),
            kind: TrackKind::Video,
        })
    }

    fn remote_video(&self) -> Option<TrackHandle> {
        None
    }

    async fn close(&self) -> Result<()> {
        self.media.record(TransportCall::Close);
        self.media.state.lock().closed += 1;
        Ok(())
    }
}

// ========== CALL ROOM API ==========

struct FakeRoom {
    call_id: String,
    status: String,
    participants: Vec<Participant>,
    signals: Vec<RemoteSignal>,
    next_signal_id: u64,
    initiate_error: Option<CallError>,
    info_failures: VecDeque<CallError>,
    signal_failures: usize,
    end_error: Option<CallError>,
    initiated: Vec<String>,
    sent: Vec<(String, OutboundSignal)>,
    ended: Vec<String>,
    info_requests: usize,
    initiate_gate: Option<Arc<Notify>>,
}

/// Сервер комнат в памяти: сигналы накапливаются, фильтрация по id на клиенте
#[derive(Clone)]
pub struct FakeCallRoomApi {
    room: Arc<Mutex<FakeRoom>>,
}

impl FakeCallRoomApi {
    pub fn new(call_id: &str) -> Self {
        Self {
            room: Arc::new(Mutex::new(FakeRoom {
                call_id: call_id.to_string(),
                status: "active".into(),
                participants: Vec::new(),
                signals: Vec::new(),
                next_signal_id: 1,
                initiate_error: None,
                info_failures: VecDeque::new(),
                signal_failures: 0,
                end_error: None,
                initiated: Vec::new(),
                sent: Vec::new(),
                ended: Vec::new(),
                info_requests: 0,
                initiate_gate: None,
            })),
        }
    }

    pub fn fail_initiate(&self, error: CallError) {
        self.room.lock().initiate_error = Some(error);
    }

    /// Следующий `initiate_call` ждёт `Notify`
    pub fn hold_initiate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.room.lock().initiate_gate = Some(gate.clone());
        gate
    }

    /// Следующие `count` запросов call info вернут `error`
    pub fn fail_info_requests(&self, count: usize, error: CallError) {
        let mut room = self.room.lock();
        for _ in 0..count {
            room.info_failures.push_back(error.clone());
        }
    }

    pub fn fail_signal_sends(&self, count: usize) {
        self.room.lock().signal_failures = count;
    }

    pub fn fail_end_call(&self, error: CallError) {
        self.room.lock().end_error = Some(error);
    }

    pub fn set_participants(&self, participants: Vec<Participant>) {
        self.room.lock().participants = participants;
    }

    pub fn set_status(&self, status: &str) {
        self.room.lock().status = status.to_string();
    }

    /// Сигнал от удалённой стороны, возвращает присвоенный id
    pub fn push_remote_signal(&self, payload: SignalPayload) -> u64 {
        let mut room = self.room.lock();
        let id = room.next_signal_id;
        room.next_signal_id += 1;
        room.signals.push(RemoteSignal { id, payload });
        id
    }

    pub fn initiated(&self) -> Vec<String> {
        self.room.lock().initiated.clone()
    }

    pub fn sent_signals(&self) -> Vec<OutboundSignal> {
        self.room.lock().sent.iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn ended_calls(&self) -> Vec<String> {
        self.room.lock().ended.clone()
    }

    pub fn info_requests(&self) -> usize {
        self.room.lock().info_requests
    }
}

pub fn participant(user_id: &str, name: &str) -> Participant {
    Participant {
        user_id: user_id.to_string(),
        display_name: name.to_string(),
        status: "connected".into(),
        avatar_url: None,
    }
}

#[async_trait]
impl CallRoomApi for FakeCallRoomApi {
    async fn initiate_call(&self, user_id: &str) -> Result<CallResponse> {
        let gate = self.room.lock().initiate_gate.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut room = self.room.lock();
        room.initiated.push(user_id.to_string());
        if let Some(error) = room.initiate_error.clone() {
            return Err(error);
        }
        Ok(CallResponse {
            call_id: room.call_id.clone(),
            status: "ringing".into(),
        })
    }

    async fn get_call_info(&self, call_id: &str) -> Result<CallInfo> {
        let mut room = self.room.lock();
        room.info_requests += 1;
        if let Some(error) = room.info_failures.pop_front() {
            return Err(error);
        }
        Ok(CallInfo {
            call_id: call_id.to_string(),
            status: room.status.clone(),
            participants: room.participants.clone(),
            start_time: 0,
            duration: None,
            signaling: room.signals.clone(),
        })
    }

    async fn end_call(&self, call_id: &str) -> Result<EndCallResponse> {
        let mut room = self.room.lock();
        room.ended.push(call_id.to_string());
        if let Some(error) = room.end_error.clone() {
            return Err(error);
        }
        Ok(EndCallResponse { success: true })
    }

    async fn send_signal(&self, call_id: &str, signal: &OutboundSignal) -> Result<()> {
        let mut room = self.room.lock();
        if room.signal_failures > 0 {
            room.signal_failures -= 1;
            return Err(CallError::Network("connection reset".into()));
        }
        room.sent.push((call_id.to_string(), signal.clone()));
        Ok(())
    }
}

// ========== LOG SINK ==========

#[derive(Default)]
struct MemorySinkState {
    records: Vec<(String, CallLogRecord)>,
    messages: Vec<(String, ChatMessage)>,
    files: Vec<(String, SharedFileRef)>,
    failing: bool,
}

/// Журнал звонков в памяти
#[derive(Clone, Default)]
pub struct MemoryLogSink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    pub fn records(&self) -> Vec<(String, CallLogRecord)> {
        self.state.lock().records.clone()
    }

    pub fn messages(&self) -> Vec<(String, ChatMessage)> {
        self.state.lock().messages.clone()
    }

    pub fn files(&self) -> Vec<(String, SharedFileRef)> {
        self.state.lock().files.clone()
    }

    fn check(&self) -> Result<()> {
        if self.state.lock().failing {
            return Err(CallError::Persistence("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CallLogSink for MemoryLogSink {
    async fn persist(&self, call_id: &str, record: &CallLogRecord) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .records
            .push((call_id.to_string(), record.clone()));
        Ok(())
    }

    async fn persist_message(&self, call_id: &str, message: &ChatMessage) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .messages
            .push((call_id.to_string(), message.clone()));
        Ok(())
    }

    async fn persist_file(&self, call_id: &str, file: &SharedFileRef) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .files
            .push((call_id.to_string(), file.clone()));
        Ok(())
    }
}
