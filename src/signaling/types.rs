use crate::peer::types::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Конверт OCS: `{"ocs": {"meta": {...}, "data": ...}}`
#[derive(Deserialize, Debug)]
pub struct OcsEnvelope<T> {
    pub ocs: Ocs<T>,
}

#[derive(Deserialize, Debug)]
pub struct Ocs<T> {
    pub meta: OcsMeta,
    pub data: Option<T>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct OcsMeta {
    pub status: String,
    pub statuscode: u16,
    #[serde(default)]
    pub message: Option<String>,
}

impl OcsMeta {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub call_id: String,
    pub status: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub status: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Состояние комнаты звонка вместе с накопленными сигналами
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub call_id: String,
    pub status: String,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub signaling: Vec<RemoteSignal>,
}

impl CallInfo {
    pub fn is_ended(&self) -> bool {
        self.status.eq_ignore_ascii_case("ended")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndCallResponse {
    pub success: bool,
}

/// Полезная нагрузка сигнала, дискриминатор в поле `type`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl From<SessionDescription> for SignalPayload {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            crate::peer::types::SdpKind::Offer => SignalPayload::Offer { sdp: desc.sdp },
            crate::peer::types::SdpKind::Answer => SignalPayload::Answer { sdp: desc.sdp },
        }
    }
}

/// Сигнал удалённой стороны; id монотонно растёт в пределах комнаты
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteSignal {
    pub id: u64,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// Исходящий сигнал. Клиентский id позволяет серверу отбрасывать повторы.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub id: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl OutboundSignal {
    pub fn new(payload: SignalPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
        }
    }
}

/// События цикла опроса
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteSignalingEvent {
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidates(Vec<IceCandidate>),
    /// Состав участников изменился
    Participants(Vec<Participant>),
    /// Сервер сообщил о завершении звонка, после него поток заканчивается
    RemoteEnded,
}
