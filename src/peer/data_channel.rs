use crate::error::Result;
use crate::peer::types::PeerEvent;
use crate::session::model::{Annotation, ChatMessage, SharedFileRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Сообщение канала данных `annotations`.
///
/// Формат на проводе: `{"type": "...", "data": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DataMessage {
    Annotation(Annotation),
    RemoveAnnotation { id: String },
    Message(ChatMessage),
    File(SharedFileRef),
}

impl DataMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// общий обработчик data-channel: все события уходят в `events`
pub fn attach_dc(dc: &Arc<RTCDataChannel>, events: UnboundedSender<PeerEvent>) {
    debug!(label = dc.label(), "attach_dc called");

    dc.on_open(Box::new({
        let events = events.clone();
        move || {
            info!("Data channel opened");
            let _ = events.send(PeerEvent::DataChannelOpen);
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let events = events.clone();
        move |msg: DataChannelMessage| {
            debug!(len = msg.data.len(), "Received message");

            if !msg.is_string {
                warn!("Ignoring binary data channel message");
            } else {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(PeerEvent::DataMessage(text));
                    }
                    Err(e) => warn!("Data channel message is not UTF-8: {}", e),
                }
            }
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new(move || {
        info!("Data channel closed");
        let _ = events.send(PeerEvent::DataChannelClosed);
        Box::pin(async {})
    }));
}
