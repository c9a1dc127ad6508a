//! Координатор согласования одной peer-сессии.
//!
//! Все операции с описаниями сессии идут под `negotiation`, поэтому два
//! remote description никогда не применяются одновременно, а offer не
//! возвращается раньше, чем установлен локально. Кандидаты, пришедшие до
//! remote description, копятся в FIFO буфере и применяются в порядке прихода.

use crate::error::{CallError, Result};
use crate::peer::state::NegotiationState;
use crate::peer::transport::{MediaTransport, TransportFactory};
use crate::peer::types::{IceCandidate, PeerEvent, SdpKind, SessionDescription, TrackHandle, TrackKind};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

pub struct PeerConnectionCoordinator {
    factory: Arc<dyn TransportFactory>,
    label: String,
    state: Mutex<NegotiationState>,
    negotiation: tokio::sync::Mutex<()>,
}

impl PeerConnectionCoordinator {
    pub fn new(factory: Arc<dyn TransportFactory>, label: impl Into<String>) -> Self {
        Self {
            factory,
            label: label.into(),
            state: Mutex::new(NegotiationState::new()),
            negotiation: tokio::sync::Mutex::new(()),
        }
    }

    /// Захватывает локальные треки, создаёт транспорт и канал данных.
    ///
    /// Возвращает приёмник событий этого транспорта. Повторный вызов закрывает
    /// предыдущий транспорт. Если `release()` пришёл, пока вызов ждал
    /// очереди согласования, транспорт не создаётся.
    pub async fn initialize(&self) -> Result<UnboundedReceiver<PeerEvent>> {
        let requested = self.state.lock().epoch;
        let _guard = self.negotiation.lock().await;

        let (previous, epoch) = {
            let mut st = self.state.lock();
            if st.epoch != requested {
                return Err(CallError::Negotiation("released before initialization".into()));
            }
            let previous = st.transport.take();
            st.clear();
            (previous, st.epoch)
        };
        if let Some(previous) = previous {
            debug!("Closing previous transport before re-initialization");
            if let Err(e) = previous.close().await {
                warn!("Failed to close previous transport: {}", e);
            }
        }

        let (tx, rx) = unbounded_channel();
        let transport = self.factory.create(tx.clone()).await?;

        let prepared = async {
            transport.start_local_media().await?;
            transport.open_data_channel(&self.label).await
        }
        .await;
        if let Err(e) = prepared {
            let _ = transport.close().await;
            return Err(e);
        }

        {
            let mut st = self.state.lock();
            if st.epoch == epoch {
                st.transport = Some(transport.clone());
                st.events = Some(tx);
                st.released = false;
                info!(label = %self.label, "Peer connection initialized");
                return Ok(rx);
            }
        }

        // release() пришёл во время инициализации
        let _ = transport.close().await;
        Err(CallError::Negotiation("released during initialization".into()))
    }

    /// Создаёт offer и устанавливает его локально до возврата вызывающему
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let _guard = self.negotiation.lock().await;
        let (transport, epoch) = self.current()?;

        if self.state.lock().awaiting_answer {
            return Err(CallError::Negotiation(
                "previous offer is still awaiting an answer".into(),
            ));
        }

        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        let mut st = self.state.lock();
        if st.epoch != epoch {
            return Err(CallError::Negotiation("released during offer".into()));
        }
        st.awaiting_answer = true;
        debug!("Local offer set, awaiting answer");
        Ok(offer)
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let _guard = self.negotiation.lock().await;
        let (transport, epoch) = self.current()?;
        let answer = self.answer_with(&transport, epoch).await?;
        Ok(answer)
    }

    /// Применяет remote description.
    ///
    /// `Ok(false)` если координатор уже освобождён. После удачного применения
    /// отложенные кандидаты применяются по порядку, а на offer сразу создаётся
    /// answer и уходит событием [`PeerEvent::AnswerCreated`].
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<bool> {
        let _guard = self.negotiation.lock().await;
        let Some((transport, epoch)) = self.active() else {
            debug!(kind = %desc.kind, "Coordinator released, ignoring remote description");
            return Ok(false);
        };

        let kind = desc.kind;
        transport.set_remote_description(desc).await?;
        info!(%kind, "Remote description applied");

        {
            let mut st = self.state.lock();
            if st.epoch != epoch {
                return Ok(false);
            }
            if kind == SdpKind::Answer {
                st.awaiting_answer = false;
            }
        }

        if !self.flush_pending(&transport, epoch).await {
            return Ok(false);
        }

        if kind == SdpKind::Offer {
            let answer = self.answer_with(&transport, epoch).await?;
            let events = self.state.lock().events.clone();
            if let Some(events) = events {
                let _ = events.send(PeerEvent::AnswerCreated(answer));
            }
        }
        Ok(true)
    }

    /// Применяет кандидат сразу или откладывает до remote description
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) {
        let transport = {
            let mut st = self.state.lock();
            if st.released {
                debug!("Coordinator released, dropping remote candidate");
                return;
            }
            if !st.remote_ready {
                st.pending.push(candidate);
                return;
            }
            st.transport.clone()
        };

        if let Some(transport) = transport {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Failed to add remote candidate: {}", e);
            }
        }
    }

    pub fn toggle_microphone(&self, enabled: bool) {
        self.toggle(TrackKind::Audio, enabled);
    }

    pub fn toggle_camera(&self, enabled: bool) {
        self.toggle(TrackKind::Video, enabled);
    }

    /// `false` если канал данных не открыт или отправка не удалась
    pub async fn send_data_message(&self, payload: &str) -> bool {
        let Some(transport) = self.state.lock().transport.clone() else {
            return false;
        };
        match transport.send_data(payload).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Data channel send failed: {}", e);
                false
            }
        }
    }

    pub fn local_video_handle(&self) -> Option<TrackHandle> {
        self.state.lock().transport.as_ref().and_then(|t| t.local_video())
    }

    pub fn remote_video_handle(&self) -> Option<TrackHandle> {
        self.state.lock().transport.as_ref().and_then(|t| t.remote_video())
    }

    /// Закрывает транспорт и сбрасывает буферы, повторный вызов ничего не делает
    pub async fn release(&self) {
        let transport = {
            let mut st = self.state.lock();
            let transport = st.transport.take();
            st.clear();
            st.released = true;
            transport
        };

        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!("Failed to close transport: {}", e);
            }
            info!("Peer connection released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn is_awaiting_answer(&self) -> bool {
        self.state.lock().awaiting_answer
    }

    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn mic_enabled(&self) -> bool {
        self.state.lock().mic_enabled
    }

    pub fn camera_enabled(&self) -> bool {
        self.state.lock().camera_enabled
    }

    fn toggle(&self, kind: TrackKind, enabled: bool) {
        let transport = {
            let mut st = self.state.lock();
            match kind {
                TrackKind::Audio => st.mic_enabled = enabled,
                TrackKind::Video => st.camera_enabled = enabled,
            }
            st.transport.clone()
        };
        if let Some(transport) = transport {
            transport.set_track_enabled(kind, enabled);
        }
    }

    fn active(&self) -> Option<(Arc<dyn MediaTransport>, u64)> {
        let st = self.state.lock();
        st.transport.clone().map(|t| (t, st.epoch))
    }

    fn current(&self) -> Result<(Arc<dyn MediaTransport>, u64)> {
        self.active()
            .ok_or_else(|| CallError::Negotiation("peer connection is not initialized".into()))
    }

    async fn answer_with(
        &self,
        transport: &Arc<dyn MediaTransport>,
        epoch: u64,
    ) -> Result<SessionDescription> {
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        if self.state.lock().epoch != epoch {
            return Err(CallError::Negotiation("released during answer".into()));
        }
        debug!("Local answer set");
        Ok(answer)
    }

    /// Сбрасывает буфер кандидатов; кандидаты, пришедшие во время сброса,
    /// попадают в следующую порцию. `false` если сессию освободили.
    async fn flush_pending(&self, transport: &Arc<dyn MediaTransport>, epoch: u64) -> bool {
        loop {
            let batch = {
                let mut st = self.state.lock();
                if st.epoch != epoch {
                    return false;
                }
                let batch = st.pending.drain();
                if batch.is_empty() {
                    st.remote_ready = true;
                    return true;
                }
                batch
            };

            info!("Applying {} pending candidates", batch.len());
            for candidate in batch {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    warn!("Failed to add pending candidate: {}", e);
                }
            }
        }
    }
}
