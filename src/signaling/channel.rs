//! Канал сигнализации поверх REST комнат звонков.
//!
//! Исходящие описания и кандидаты складываются в outbox и отправляются по
//! порядку. Неотправленный хвост остаётся в очереди и повторяется в начале
//! каждого цикла опроса, сервер отбрасывает дубли по id сигнала. Входящие
//! сигналы приходят внутри call info и отдаются потоком только один раз.

use crate::config::SignalingSettings;
use crate::error::Result;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::signaling::api::CallRoomApi;
use crate::signaling::types::{
    CallInfo, OutboundSignal, Participant, RemoteSignalingEvent, SignalPayload,
};
use crate::utils::wait_cancelled;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Состояние канала для текущего звонка
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingPhase {
    Idle,
    Initiating,
    Polling { call_id: String },
    Ended { call_id: String },
}

struct ChannelState {
    phase: SignalingPhase,
    outbox: VecDeque<(String, OutboundSignal)>,
    /// Звонок, к которому относятся `last_signal_id` и `participants`
    remote_call: Option<String>,
    last_signal_id: Option<u64>,
    participants: Option<Vec<Participant>>,
    /// Звонки текущей сессии, о завершении которых сервер уже знает
    ended: HashSet<String>,
    current_interval: Duration,
    released: bool,
}

struct Shared {
    api: Arc<dyn CallRoomApi>,
    poll_interval: Duration,
    backoff_interval: Duration,
    state: Mutex<ChannelState>,
    /// Поколение цикла опроса; любое изменение останавливает текущий цикл
    generation: watch::Sender<u64>,
    flush_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SignalingChannel {
    shared: Arc<Shared>,
}

impl SignalingChannel {
    pub fn new(api: Arc<dyn CallRoomApi>, settings: &SignalingSettings) -> Self {
        let (generation, _) = watch::channel(0);
        let poll_interval = settings.poll_interval();
        Self {
            shared: Arc::new(Shared {
                api,
                poll_interval,
                backoff_interval: settings.backoff_interval(),
                state: Mutex::new(ChannelState {
                    phase: SignalingPhase::Idle,
                    outbox: VecDeque::new(),
                    remote_call: None,
                    last_signal_id: None,
                    participants: None,
                    ended: HashSet::new(),
                    current_interval: poll_interval,
                    released: false,
                }),
                generation,
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Создаёт комнату звонка с пользователем `peer_user_id`
    pub async fn initiate_call(&self, peer_user_id: &str) -> Result<String> {
        {
            let mut st = self.shared.state.lock();
            st.phase = SignalingPhase::Initiating;
            st.released = false;
        }

        match self.shared.api.initiate_call(peer_user_id).await {
            Ok(resp) => {
                info!(call_id = %resp.call_id, status = %resp.status, "Call room created");
                Ok(resp.call_id)
            }
            Err(e) => {
                warn!(peer = peer_user_id, "Failed to initiate call: {}", e);
                let mut st = self.shared.state.lock();
                if st.phase == SignalingPhase::Initiating {
                    st.phase = SignalingPhase::Idle;
                }
                Err(e)
            }
        }
    }

    pub async fn fetch_call_info(&self, call_id: &str) -> Result<CallInfo> {
        self.shared.api.get_call_info(call_id).await
    }

    /// Отправляет локальное описание; при ошибке оно остаётся в outbox
    pub async fn send_local_description(&self, call_id: &str, desc: SessionDescription) {
        debug!(call_id, kind = %desc.kind, "Queueing local description");
        self.enqueue(call_id, desc.into());
        self.shared.flush_outbox().await;
    }

    pub async fn send_local_candidate(&self, call_id: &str, candidate: IceCandidate) {
        self.enqueue(call_id, SignalPayload::Candidate(candidate));
        self.shared.flush_outbox().await;
    }

    /// Запускает опрос комнаты; предыдущий цикл останавливается.
    ///
    /// Поток ленивый: первый запрос уходит при первом `next()`. Сетевые ошибки
    /// не завершают поток, только увеличивают интервал до следующего запроса.
    pub fn start_polling(&self, call_id: &str) -> impl Stream<Item = RemoteSignalingEvent> + Send + 'static {
        let generation = self.shared.bump_generation();
        {
            let mut st = self.shared.state.lock();
            st.phase = SignalingPhase::Polling {
                call_id: call_id.to_string(),
            };
            st.released = false;
            st.current_interval = self.shared.poll_interval;
            if st.remote_call.as_deref() != Some(call_id) {
                st.remote_call = Some(call_id.to_string());
                st.last_signal_id = None;
                st.participants = None;
                st.ended.clear();
            }
        }
        info!(call_id, generation, "Polling started");

        let poll = PollLoop {
            shared: self.shared.clone(),
            call_id: call_id.to_string(),
            generation,
            cancel: self.shared.generation.subscribe(),
            pending: VecDeque::new(),
            started: false,
            finished: false,
            failures: 0,
        };

        futures::stream::unfold(poll, |mut poll| async move {
            let event = poll.next_event().await?;
            Some((event, poll))
        })
    }

    pub fn stop_polling(&self) {
        self.shared.bump_generation();
        let mut st = self.shared.state.lock();
        if matches!(st.phase, SignalingPhase::Polling { .. }) {
            st.phase = SignalingPhase::Idle;
        }
        debug!("Polling stopped");
    }

    /// Сообщает серверу о завершении звонка.
    ///
    /// Опрос останавливается в любом случае. Сервер уведомляется не больше
    /// одного раза на звонок, повторный вызов возвращает `Ok(false)`.
    pub async fn end_call(&self, call_id: &str) -> Result<bool> {
        self.shared.bump_generation();
        let first = {
            let mut st = self.shared.state.lock();
            st.phase = SignalingPhase::Ended {
                call_id: call_id.to_string(),
            };
            st.outbox.retain(|(id, _)| id != call_id);
            st.ended.insert(call_id.to_string())
        };
        if !first {
            debug!(call_id, "End call already sent");
            return Ok(false);
        }

        let resp = self.shared.api.end_call(call_id).await?;
        info!(call_id, success = resp.success, "Call ended on server");
        Ok(resp.success)
    }

    /// Останавливает опрос и забывает всё накопленное; повторный вызов безопасен
    pub fn release(&self) {
        self.shared.bump_generation();
        let mut st = self.shared.state.lock();
        if st.released {
            return;
        }
        st.phase = SignalingPhase::Idle;
        st.outbox.clear();
        st.remote_call = None;
        st.last_signal_id = None;
        st.participants = None;
        st.ended.clear();
        st.current_interval = self.shared.poll_interval;
        st.released = true;
        debug!("Signaling channel released");
    }

    pub fn is_released(&self) -> bool {
        self.shared.state.lock().released
    }

    pub fn phase(&self) -> SignalingPhase {
        self.shared.state.lock().phase.clone()
    }

    /// Задержка перед следующим запросом call info
    pub fn current_poll_interval(&self) -> Duration {
        self.shared.state.lock().current_interval
    }

    pub fn outbox_len(&self) -> usize {
        self.shared.state.lock().outbox.len()
    }

    fn enqueue(&self, call_id: &str, payload: SignalPayload) {
        let mut st = self.shared.state.lock();
        st.released = false;
        st.outbox
            .push_back((call_id.to_string(), OutboundSignal::new(payload)));
    }
}

impl Shared {
    fn bump_generation(&self) -> u64 {
        let mut current = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            current = *g;
        });
        current
    }

    /// Отправляет outbox по порядку до первой ошибки
    async fn flush_outbox(&self) {
        let _guard = self.flush_lock.lock().await;
        loop {
            let Some((call_id, signal)) = self.state.lock().outbox.front().cloned() else {
                return;
            };

            match self.api.send_signal(&call_id, &signal).await {
                Ok(()) => {
                    debug!(call_id = %call_id, signal_id = %signal.id, "Signal delivered");
                    let mut st = self.state.lock();
                    if st.outbox.front().is_some_and(|(_, s)| s.id == signal.id) {
                        st.outbox.pop_front();
                    }
                }
                Err(e) => {
                    let queued = self.state.lock().outbox.len();
                    warn!(call_id = %call_id, queued, "Signal delivery failed, will retry: {}", e);
                    return;
                }
            }
        }
    }
}

struct PollLoop {
    shared: Arc<Shared>,
    call_id: String,
    generation: u64,
    cancel: watch::Receiver<u64>,
    pending: VecDeque<RemoteSignalingEvent>,
    started: bool,
    finished: bool,
    failures: u32,
}

impl PollLoop {
    fn is_current(&self) -> bool {
        *self.shared.generation.borrow() == self.generation
    }

    async fn next_event(&mut self) -> Option<RemoteSignalingEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished || !self.is_current() {
                return None;
            }

            if self.started {
                let delay = self.shared.state.lock().current_interval;
                if !self.sleep_or_cancel(delay).await {
                    return None;
                }
            }
            self.started = true;

            self.shared.flush_outbox().await;
            let result = self.shared.api.get_call_info(&self.call_id).await;
            if !self.is_current() {
                return None;
            }

            match result {
                Ok(info) => {
                    if self.failures > 0 {
                        info!(call_id = %self.call_id, "Polling recovered after {} failures", self.failures);
                    }
                    self.failures = 0;
                    self.shared.state.lock().current_interval = self.shared.poll_interval;
                    self.collect(info);
                }
                Err(e) => {
                    self.failures += 1;
                    warn!(
                        call_id = %self.call_id,
                        failures = self.failures,
                        "Call info poll failed: {}", e
                    );
                    self.shared.state.lock().current_interval = self.shared.backoff_interval;
                }
            }
        }
    }

    /// `false` если цикл отменили во время ожидания
    async fn sleep_or_cancel(&mut self, delay: Duration) -> bool {
        let generation = self.generation;
        let cancel = &mut self.cancel;
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_cancelled(cancel, generation) => false,
        }
    }

    /// Превращает новый call info в события
    fn collect(&mut self, info: CallInfo) {
        let mut st = self.shared.state.lock();

        if st.participants.as_ref() != Some(&info.participants) {
            st.participants = Some(info.participants.clone());
            self.pending
                .push_back(RemoteSignalingEvent::Participants(info.participants.clone()));
        }

        let ended = info.is_ended();
        let mut signals: Vec<_> = info
            .signaling
            .into_iter()
            .filter(|s| st.last_signal_id.map_or(true, |last| s.id > last))
            .collect();
        signals.sort_by_key(|s| s.id);

        let mut candidates = Vec::new();
        for signal in signals {
            st.last_signal_id = Some(signal.id);
            match signal.payload {
                SignalPayload::Candidate(candidate) => candidates.push(candidate),
                other => {
                    // кандидаты подряд идут одной пачкой, порядок сохраняется
                    if !candidates.is_empty() {
                        self.pending.push_back(RemoteSignalingEvent::RemoteCandidates(
                            std::mem::take(&mut candidates),
                        ));
                    }
                    match other {
                        SignalPayload::Offer { sdp } => self
                            .pending
                            .push_back(RemoteSignalingEvent::RemoteOffer(SessionDescription::offer(sdp))),
                        SignalPayload::Answer { sdp } => self
                            .pending
                            .push_back(RemoteSignalingEvent::RemoteAnswer(SessionDescription::answer(sdp))),
                        SignalPayload::Candidate(_) => {}
                    }
                }
            }
        }
        if !candidates.is_empty() {
            self.pending
                .push_back(RemoteSignalingEvent::RemoteCandidates(candidates));
        }

        if ended {
            info!(call_id = %self.call_id, "Call ended by remote side");
            st.ended.insert(self.call_id.clone());
            st.phase = SignalingPhase::Ended {
                call_id: self.call_id.clone(),
            };
            self.pending.push_back(RemoteSignalingEvent::RemoteEnded);
            self.finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::testing::{participant, FakeCallRoomApi};
    use futures::StreamExt;

    fn channel(api: &FakeCallRoomApi) -> SignalingChannel {
        SignalingChannel::new(Arc::new(api.clone()), &SignalingSettings::default())
    }

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n}"), Some("0".into()), Some(0))
    }

    #[tokio::test]
    async fn initiate_returns_server_call_id() {
        let api = FakeCallRoomApi::new("room42");
        let ch = channel(&api);
        assert_eq!(ch.initiate_call("userB").await.unwrap(), "room42");
        assert_eq!(ch.phase(), SignalingPhase::Initiating);
        assert_eq!(api.initiated(), vec!["userB".to_string()]);
    }

    #[tokio::test]
    async fn initiate_failure_is_reported_once() {
        let api = FakeCallRoomApi::new("room42");
        api.fail_initiate(CallError::Server {
            status: 404,
            message: "user not found".into(),
        });
        let ch = channel(&api);
        assert!(matches!(
            ch.initiate_call("ghost").await,
            Err(CallError::Server { status: 404, .. })
        ));
        assert_eq!(ch.phase(), SignalingPhase::Idle);
        assert_eq!(api.initiated().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_signals_stay_queued_until_next_poll() {
        let api = FakeCallRoomApi::new("room42");
        api.fail_signal_sends(2);
        let ch = channel(&api);

        ch.send_local_description("room42", SessionDescription::offer("v=0")).await;
        ch.send_local_candidate("room42", cand(1)).await;
        assert_eq!(ch.outbox_len(), 2);
        assert!(api.sent_signals().is_empty());

        api.push_remote_signal(SignalPayload::Answer { sdp: "v=0 a".into() });
        let mut stream = Box::pin(ch.start_polling("room42"));
        assert!(matches!(
            stream.next().await,
            Some(RemoteSignalingEvent::Participants(_))
        ));

        let sent = api.sent_signals();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload, SignalPayload::Offer { sdp: "v=0".into() });
        assert_eq!(sent[1].payload, SignalPayload::Candidate(cand(1)));
        assert_eq!(ch.outbox_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn yields_each_remote_signal_once_in_order() {
        let api = FakeCallRoomApi::new("room42");
        api.set_participants(vec![participant("expert", "Expert")]);
        api.push_remote_signal(SignalPayload::Answer { sdp: "v=0 a".into() });
        api.push_remote_signal(SignalPayload::Candidate(cand(1)));
        api.push_remote_signal(SignalPayload::Candidate(cand(2)));

        let ch = channel(&api);
        let mut stream = Box::pin(ch.start_polling("room42"));

        assert_eq!(
            stream.next().await,
            Some(RemoteSignalingEvent::Participants(vec![participant("expert", "Expert")]))
        );
        assert_eq!(
            stream.next().await,
            Some(RemoteSignalingEvent::RemoteAnswer(SessionDescription::answer("v=0 a")))
        );
        assert_eq!(
            stream.next().await,
            Some(RemoteSignalingEvent::RemoteCandidates(vec![cand(1), cand(2)]))
        );

        // следующий опрос отдаёт только новый сигнал
        api.push_remote_signal(SignalPayload::Candidate(cand(3)));
        assert_eq!(
            stream.next().await,
            Some(RemoteSignalingEvent::RemoteCandidates(vec![cand(3)]))
        );
        assert_eq!(api.info_requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_after_failures_and_reset_on_success() {
        let api = FakeCallRoomApi::new("room42");
        api.fail_info_requests(3, CallError::Network("timeout".into()));
        api.push_remote_signal(SignalPayload::Offer { sdp: "v=0 o".into() });

        let ch = channel(&api);
        assert_eq!(ch.current_poll_interval(), Duration::from_millis(1000));

        let started = tokio::time::Instant::now();
        let mut stream = Box::pin(ch.start_polling("room42"));
        let first = stream.next().await;

        assert!(matches!(first, Some(RemoteSignalingEvent::Participants(_))));
        assert_eq!(api.info_requests(), 4);
        // первый запрос сразу, затем три ожидания по 5000 мс
        assert_eq!(started.elapsed(), Duration::from_millis(15_000));
        assert_eq!(ch.current_poll_interval(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_escalates_while_failing() {
        let api = FakeCallRoomApi::new("room42");
        api.fail_info_requests(3, CallError::Network("timeout".into()));
        let ch = channel(&api);

        let mut stream = Box::pin(ch.start_polling("room42"));
        let next = stream.next();
        tokio::pin!(next);

        // поток не заканчивается, пока запросы падают
        let waited = tokio::time::timeout(Duration::from_millis(10_500), &mut next).await;
        assert!(waited.is_err());
        assert_eq!(api.info_requests(), 3);
        assert_eq!(ch.current_poll_interval(), Duration::from_millis(5000));

        assert!(next.await.is_some());
        assert_eq!(ch.current_poll_interval(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cancels_previous_loop() {
        let api = FakeCallRoomApi::new("room42");
        let ch = channel(&api);

        let mut old = Box::pin(ch.start_polling("room42"));
        assert!(old.next().await.is_some());

        let mut new = Box::pin(ch.start_polling("room42"));
        assert_eq!(old.next().await, None);

        // участники не менялись, но новый цикл продолжает опрос
        api.push_remote_signal(SignalPayload::Answer { sdp: "v=0".into() });
        assert_eq!(
            new.next().await,
            Some(RemoteSignalingEvent::RemoteAnswer(SessionDescription::answer("v=0")))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn remote_end_finishes_stream_and_suppresses_end_call() {
        let api = FakeCallRoomApi::new("room42");
        api.set_status("ended");
        let ch = channel(&api);

        let events: Vec<_> = ch.start_polling("room42").collect().await;
        assert_eq!(events.last(), Some(&RemoteSignalingEvent::RemoteEnded));
        assert_eq!(
            ch.phase(),
            SignalingPhase::Ended {
                call_id: "room42".into()
            }
        );

        assert!(!ch.end_call("room42").await.unwrap());
        assert!(api.ended_calls().is_empty());
    }

    #[tokio::test]
    async fn end_call_is_sent_once() {
        let api = FakeCallRoomApi::new("room42");
        let ch = channel(&api);
        let _stream = ch.start_polling("room42");

        assert!(ch.end_call("room42").await.unwrap());
        assert!(!ch.end_call("room42").await.unwrap());
        ch.release();
        ch.release();

        assert_eq!(api.ended_calls(), vec!["room42".to_string()]);
        assert!(ch.is_released());
    }

    #[tokio::test]
    async fn rejoined_room_is_ended_again_after_release() {
        let api = FakeCallRoomApi::new("room42");
        let ch = channel(&api);

        let _first = ch.start_polling("room42");
        assert!(ch.end_call("room42").await.unwrap());
        ch.release();

        let _second = ch.start_polling("room42");
        assert!(ch.end_call("room42").await.unwrap());
        assert!(!ch.end_call("room42").await.unwrap());

        assert_eq!(
            api.ended_calls(),
            vec!["room42".to_string(), "room42".to_string()]
        );
    }

    #[tokio::test]
    async fn switching_calls_forgets_previous_end() {
        let api = FakeCallRoomApi::new("room42");
        let ch = channel(&api);

        let _first = ch.start_polling("room42");
        assert!(ch.end_call("room42").await.unwrap());
        let _other = ch.start_polling("room43");
        let _back = ch.start_polling("room42");
        assert!(ch.end_call("room42").await.unwrap());

        assert_eq!(api.ended_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn release_stops_polling_and_clears_outbox() {
        let api = FakeCallRoomApi::new("room42");
        api.fail_signal_sends(10);
        let ch = channel(&api);
        ch.send_local_candidate("room42", cand(1)).await;
        assert_eq!(ch.outbox_len(), 1);

        let mut stream = Box::pin(ch.start_polling("room42"));
        assert!(stream.next().await.is_some());

        ch.release();
        assert_eq!(stream.next().await, None);
        assert_eq!(ch.outbox_len(), 0);
        assert_eq!(ch.phase(), SignalingPhase::Idle);
    }
}
