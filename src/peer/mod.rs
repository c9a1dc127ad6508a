pub mod connection;
pub mod coordinator;
pub mod data_channel;
pub mod ice;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{LocalTrack, WebRtcSettings, WebRtcTransport, WebRtcTransportFactory};
pub use coordinator::PeerConnectionCoordinator;
pub use data_channel::DataMessage;
pub use state::{DATA_CHANNEL_LABEL, GRACE_PERIOD};
pub use transport::{MediaTransport, TransportFactory};
pub use types::{
    IceCandidate, PeerEvent, SdpKind, SessionDescription, ServerConfig, TrackHandle, TrackKind,
};
