use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a join attempt was refused by the room service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinRefusal {
    RoomFull,
    RoomLocked,
    WrongPassword,
}

impl fmt::Display for JoinRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinRefusal::RoomFull => write!(f, "room is full"),
            JoinRefusal::RoomLocked => write!(f, "room is locked"),
            JoinRefusal::WrongPassword => write!(f, "missing or incorrect password"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Capture device denied, missing, or unusable. Fatal to starting a call.
    #[error("media access failed: {0}")]
    MediaAccess(String),

    /// The user declined the screen-capture picker. The call continues.
    #[error("screen capture was declined")]
    ScreenShareDenied,

    /// The room refused the join attempt.
    #[error("could not join room: {0}")]
    RoomJoin(JoinRefusal),

    /// The signaling relay connection is gone or misbehaving.
    #[error("signaling transport: {0}")]
    SignalingTransport(String),

    /// A session description was rejected for one peer. The record for that
    /// peer is discarded; other peers are unaffected.
    #[error("negotiation with peer {peer_id} failed: {reason}")]
    Negotiation { peer_id: String, reason: String },

    /// The active bandwidth probe did not finish in time. Non-fatal; the
    /// monitor substitutes the conservative fallback sample.
    #[error("bandwidth probe timed out after {0:?}")]
    BandwidthTestTimeout(Duration),

    /// Failure inside the underlying connection engine.
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl Error {
    /// The refusal behind a join failure, if that is what this error is.
    pub fn join_refusal(&self) -> Option<JoinRefusal> {
        match self {
            Error::RoomJoin(refusal) => Some(*refusal),
            _ => None,
        }
    }

    pub(crate) fn negotiation(peer_id: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::Negotiation {
            peer_id: peer_id.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::SignalingTransport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
