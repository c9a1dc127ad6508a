use crate::error::{CallError, Result};
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::attach_dc;
use crate::peer::ice::analyze_candidates;
use crate::peer::state::{DEFAULT_STUN_SERVERS, GRACE_PERIOD};
use crate::peer::transport::{MediaTransport, TransportFactory};
use crate::peer::types::{
    IceCandidate, PeerEvent, SessionDescription, ServerConfig, TrackHandle, TrackKind,
};
use crate::utils::{add_ice_url_scheme, random_id};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Настройки WebRTC транспорта
#[derive(Debug, Clone)]
pub struct WebRtcSettings {
    /// Пустой список означает дефолтные STUN серверы
    pub ice_servers: Vec<ServerConfig>,
    pub grace_period: Duration,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            grace_period: GRACE_PERIOD,
        }
    }
}

pub struct WebRtcTransportFactory {
    settings: WebRtcSettings,
}

impl WebRtcTransportFactory {
    pub fn new(settings: WebRtcSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, events: UnboundedSender<PeerEvent>) -> Result<Arc<dyn MediaTransport>> {
        let transport = WebRtcTransport::new(&self.settings, events).await?;
        Ok(Arc::new(transport))
    }
}

/// Локальный трек: источник захвата пишет в него сэмплы
#[derive(Clone)]
pub struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    handle: TrackHandle,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    fn new(kind: TrackKind, mime_type: &str, clock_rate: u32, channels: u16, stream_id: &str) -> Self {
        let id = match kind {
            TrackKind::Audio => "audio_track".to_string(),
            TrackKind::Video => "video_track".to_string(),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                ..Default::default()
            },
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            track,
            handle: TrackHandle {
                id,
                stream_id: stream_id.to_string(),
                kind,
            },
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn handle(&self) -> &TrackHandle {
        &self.handle
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Пишет закодированный кадр; выключенный трек кадры отбрасывает
    pub async fn write_frame(&self, data: impl Into<Bytes>, duration: Duration) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let sample = Sample {
            data: data.into(),
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| CallError::Negotiation(format!("write sample: {}", e)))
    }
}

/// Медиа-транспорт на `webrtc` crate
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: UnboundedSender<PeerEvent>,
    stream_id: String,
    /// Канал, открытый этой стороной
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    /// Канал с той же меткой, открытый собеседником
    remote_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    audio: Mutex<Option<LocalTrack>>,
    video: Mutex<Option<LocalTrack>>,
    remote_video: Arc<Mutex<Option<(TrackHandle, Arc<TrackRemote>)>>>,
    disconnect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    /// создаём Peer с обработчиками кандидатов, состояний и треков
    pub async fn new(settings: &WebRtcSettings, events: UnboundedSender<PeerEvent>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&settings.ice_servers)).await?);
        let disconnect_task = Arc::new(Mutex::new(None));
        let remote_video = Arc::new(Mutex::new(None));

        register_candidate_handler(&pc, events.clone());
        register_state_handler(&pc, events.clone(), disconnect_task.clone(), settings.grace_period);
        register_track_handler(&pc, events.clone(), remote_video.clone());

        Ok(Self {
            pc,
            events,
            stream_id: format!("arcall-{}", random_id()),
            data_channel: Mutex::new(None),
            remote_channel: Arc::new(Mutex::new(None)),
            audio: Mutex::new(None),
            video: Mutex::new(None),
            remote_video,
            disconnect_task,
            closed: AtomicBool::new(false),
        })
    }

    /// Трек для источника захвата (камера очков, микрофон)
    pub fn local_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.lock().clone(),
            TrackKind::Video => self.video.lock().clone(),
        }
    }

    pub fn remote_video_track(&self) -> Option<Arc<TrackRemote>> {
        self.remote_video.lock().as_ref().map(|(_, track)| track.clone())
    }

    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        let rtp_sender = self
            .pc
            .add_track(Arc::clone(&track.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP нужно вычитывать, иначе интерсепторы не работают
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn start_local_media(&self) -> Result<()> {
        let audio = LocalTrack::new(TrackKind::Audio, MIME_TYPE_OPUS, 48_000, 2, &self.stream_id);
        let video = LocalTrack::new(TrackKind::Video, MIME_TYPE_VP8, 90_000, 0, &self.stream_id);

        self.add_local_track(&audio).await?;
        self.add_local_track(&video).await?;
        info!(stream_id = %self.stream_id, "Local audio/video tracks added");

        *self.audio.lock() = Some(audio);
        *self.video.lock() = Some(video);
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<()> {
        // канал собеседника с той же меткой тоже принимаем: отправлять можно в любой открытый
        register_data_channel_handler(&self.pc, label, self.events.clone(), self.remote_channel.clone());

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        attach_dc(&dc, self.events.clone());
        *self.data_channel.lock() = Some(dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        SessionDescription::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        dump_candidate("REMOTE", &candidate);
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn send_data(&self, payload: &str) -> Result<bool> {
        let local = self.data_channel.lock().clone();
        let remote = self.remote_channel.lock().clone();
        let open = [local, remote]
            .into_iter()
            .flatten()
            .find(|dc| dc.ready_state() == RTCDataChannelState::Open);
        match open {
            Some(dc) => {
                dc.send_text(payload.to_string()).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(track) = self.local_track(kind) {
            track.enabled.store(enabled, Ordering::Relaxed);
            debug!(?kind, enabled, "Local track toggled");
        }
    }

    fn local_video(&self) -> Option<TrackHandle> {
        self.video.lock().as_ref().map(|t| t.handle.clone())
    }

    fn remote_video(&self) -> Option<TrackHandle> {
        self.remote_video.lock().as_ref().map(|(h, _)| h.clone())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.disconnect_task.lock().take() {
            handle.abort();
        }

        let local = self.data_channel.lock().take();
        let remote = self.remote_channel.lock().take();
        for dc in [local, remote].into_iter().flatten() {
            if let Err(e) = dc.close().await {
                warn!(label = dc.label(), "Failed to close data channel: {}", e);
            }
        }
        *self.audio.lock() = None;
        *self.video.lock() = None;
        *self.remote_video.lock() = None;

        self.pc.close().await?;
        info!("Peer connection closed");
        Ok(())
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(custom_servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if custom_servers.is_empty() {
        vec![RTCIceServer {
            urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }]
    } else {
        get_user_ice_servers(custom_servers)
    };

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn register_candidate_handler(pc: &Arc<RTCPeerConnection>, events: UnboundedSender<PeerEvent>) {
    let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));

    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let candidate = IceCandidate::from(init);
                    dump_candidate("LOCAL", &candidate);
                    gathered.lock().push(candidate.clone());
                    let _ = events.send(PeerEvent::LocalCandidate(candidate));
                }
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            },
            None => {
                // cand == None означает конец сбора
                debug!("ICE candidate gathering completed (null candidate received)");
                analyze_candidates(&gathered.lock());
            }
        }
        Box::pin(async {})
    }));
}

fn register_state_handler(
    pc: &Arc<RTCPeerConnection>,
    events: UnboundedSender<PeerEvent>,
    disconnect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    grace_period: Duration,
) {
    // слабая ссылка, чтобы обработчик не держал собственный peer
    let pc_weak: Weak<RTCPeerConnection> = Arc::downgrade(pc);

    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {:?}", st);

        match st {
            RTCPeerConnectionState::Connected => {
                // отменяем отложенную проверку, если она была
                if let Some(handle) = disconnect_task.lock().take() {
                    debug!("Aborting pending disconnect task");
                    handle.abort();
                    let _ = events.send(PeerEvent::ConnectionRecovered);
                }
            }

            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                let mut pending = disconnect_task.lock();
                if pending.as_ref().is_some_and(|h| !h.is_finished()) {
                    debug!("Disconnect task already pending, ignoring");
                } else {
                    if let Some(pc) = pc_weak.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }

                    let _ = events.send(PeerEvent::ConnectionProblem);

                    let pc_weak = pc_weak.clone();
                    let events = events.clone();
                    *pending = Some(tokio::spawn(async move {
                        info!("Grace period started, waiting {} s", grace_period.as_secs());
                        sleep(grace_period).await;

                        let state_now = pc_weak
                            .upgrade()
                            .map(|pc| pc.connection_state())
                            .unwrap_or(RTCPeerConnectionState::Closed);
                        info!("Grace over ➜ state={:?}", state_now);

                        // соединение так и не восстановилось
                        if state_now != RTCPeerConnectionState::Connected {
                            let _ = events.send(PeerEvent::ConnectionLost);
                        }
                    }));
                }
            }

            RTCPeerConnectionState::Closed => {
                if let Some(handle) = disconnect_task.lock().take() {
                    handle.abort();
                }
                let _ = events.send(PeerEvent::Closed);
            }

            _ => {}
        }
        Box::pin(async {})
    }));
}

fn register_data_channel_handler(
    pc: &Arc<RTCPeerConnection>,
    label: &str,
    events: UnboundedSender<PeerEvent>,
    remote_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
) {
    let label = label.to_string();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        if dc.label() == label {
            info!(label = dc.label(), id = dc.id(), "Remote data channel announced");
            attach_dc(&dc, events.clone());
            *remote_channel.lock() = Some(dc);
        } else {
            warn!(label = dc.label(), "Ignoring unexpected data channel");
        }
        Box::pin(async {})
    }));
}

fn register_track_handler(
    pc: &Arc<RTCPeerConnection>,
    events: UnboundedSender<PeerEvent>,
    remote_video: Arc<Mutex<Option<(TrackHandle, Arc<TrackRemote>)>>>,
) {
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            info!(kind = %track.kind(), id = %track.id(), "Remote track received");
            if track.kind() == RTPCodecType::Video {
                let handle = TrackHandle {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind: TrackKind::Video,
                };
                *remote_video.lock() = Some((handle.clone(), track));
                let _ = events.send(PeerEvent::RemoteTrack(handle));
            }
            Box::pin(async {})
        },
    ));
}
