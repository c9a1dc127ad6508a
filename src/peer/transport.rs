//! Внешняя возможность медиа-транспорта.
//!
//! Координатор не знает, как устроен транспорт: он только создаёт offer/answer,
//! применяет описания и кандидаты, шлёт сообщения в канал данных и включает
//! или выключает локальные треки. Продакшен-реализация живёт в
//! [`crate::peer::connection`], тестовая в `crate::testing`.

use crate::error::Result;
use crate::peer::types::{IceCandidate, PeerEvent, SessionDescription, TrackHandle, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Захват локального аудио/видео и добавление треков в сессию
    async fn start_local_media(&self) -> Result<()>;

    /// Открывает канал данных с указанной меткой
    async fn open_data_channel(&self, label: &str) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// `Ok(false)` если канал данных не открыт
    async fn send_data(&self, payload: &str) -> Result<bool>;

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool);

    fn local_video(&self) -> Option<TrackHandle>;

    fn remote_video(&self) -> Option<TrackHandle>;

    /// Останавливает захват, закрывает канал данных и сессию
    async fn close(&self) -> Result<()>;
}

/// Создаёт транспорт, который пишет свои события в `events`
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: UnboundedSender<PeerEvent>) -> Result<Arc<dyn MediaTransport>>;
}
