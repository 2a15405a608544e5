//! Client-side session layer for small mesh video calls.
//!
//! Every participant connects directly to every other participant; a
//! signaling relay only ferries join/leave notices, SDP, and ICE candidates.
//! The crate is organized around four collaborators owned by
//! [`room::RoomSession`]:
//!
//! * [`connection::ConnectionManager`] — one peer connection record per
//!   remote participant, offer/answer state machine, candidate queueing.
//! * [`media::MediaController`] — the single shared capture stream, mic and
//!   camera toggles, the zero-or-one screen track.
//! * [`bandwidth::BandwidthMonitor`] — periodic link measurement mapped to a
//!   quality tier, smoothed so one odd sample cannot flip video quality.
//! * [`signaling::WsSignaling`] — the WebSocket transport behind the
//!   [`signaling::SignalingPort`] seam.
//!
//! The engine sits behind [`connection::PeerConnector`], with
//! [`rtc::RtcConnector`] as the webrtc-rs production implementation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshcall::capture::DeviceMediaSource;
//! use meshcall::room::RoomSession;
//! use meshcall::rtc::RtcConnector;
//! use meshcall::signaling::WsSignaling;
//!
//! # async fn start() -> meshcall::Result<()> {
//! let (port, signals) = WsSignaling::connect("wss://relay.example/ws").await?;
//! let (session, mut notices) = RoomSession::new(
//!     "my-peer-id",
//!     Arc::new(port),
//!     signals,
//!     Arc::new(RtcConnector::new()?),
//!     Arc::new(DeviceMediaSource::new()),
//! );
//! // The pump must be running before join(): the call blocks until the
//! // relay answers, and the answer arrives through the pump.
//! tokio::spawn(Arc::clone(&session).run());
//! session.join("blue-falcon-42", "Ada", None).await?;
//! while let Some(notice) = notices.recv().await {
//!     println!("{notice:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod capture;
pub mod connection;
pub mod error;
pub mod media;
pub mod metrics;
pub mod room;
pub mod rtc;
pub mod signaling;

pub use bandwidth::{BandwidthMonitor, BandwidthSample, QualityTier};
pub use connection::{ConnectionManager, NegotiationState, PeerConnector, PeerEvent, PeerLink};
pub use error::{Error, JoinRefusal, Result};
pub use media::{LocalStream, LocalTrack, MediaController, MediaSource, TrackKind};
pub use metrics::ConnectionQuality;
pub use room::{generate_peer_id, Participant, RoomSession, SessionNotice};
pub use signaling::{SignalingMessage, SignalingPort, WsSignaling};
