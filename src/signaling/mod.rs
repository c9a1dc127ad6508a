pub mod api;
pub mod channel;
pub mod credentials;
pub mod types;

pub use api::{CallRoomApi, NextcloudApi};
pub use channel::{SignalingChannel, SignalingPhase};
pub use credentials::{EnvTokenProvider, StaticTokenProvider, TokenProvider};
pub use types::{
    CallInfo, CallResponse, OutboundSignal, Participant, RemoteSignal, RemoteSignalingEvent,
    SignalPayload,
};
