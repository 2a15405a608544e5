//! Wire contract for the signaling relay.
//!
//! The relay itself (reliable pub/sub delivery) is an external collaborator;
//! this module defines the messages it carries, the [`SignalingPort`] seam the
//! session sends through, and a default WebSocket adapter.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{JoinRefusal, Result};

/// A session description as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A trickled ICE candidate as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// ICE server entry supplied by the provisioning service in the join ack,
/// passed unmodified to every peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

/// Roster entry as reported by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub peer_id: String,
    pub display_name: String,
    #[serde(default = "ParticipantInfo::default_role")]
    pub role: Role,
}

impl ParticipantInfo {
    fn default_role() -> Role {
        Role::Guest
    }
}

/// Local media flags, broadcast so remote rosters stay current. Carries no
/// SDP change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStateInfo {
    pub audio: bool,
    pub video: bool,
    pub screen_share: bool,
}

impl Default for MediaStateInfo {
    /// A participant is presumed live until a `media-state` broadcast says
    /// otherwise.
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            screen_share: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_code: String,
        display_name: String,
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Ack for `join-room`: the caller's own entry, everyone already present,
    /// and the ICE servers to use for this room.
    #[serde(rename_all = "camelCase")]
    JoinAck {
        participant: ParticipantInfo,
        participants: Vec<ParticipantInfo>,
        ice_servers: Vec<IceServer>,
    },
    JoinRejected {
        reason: JoinRefusal,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        peer_id: String,
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        from: String,
        to: String,
        room_id: String,
        data: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        from: String,
        to: String,
        room_id: String,
        data: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from: String,
        to: String,
        room_id: String,
        data: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    MediaState {
        from: String,
        #[serde(flatten)]
        state: MediaStateInfo,
    },
    Kicked {},
}

/// Outbound half of the signaling channel. Inbound messages arrive on the
/// `mpsc::Receiver` handed out by the transport at connect time, so tests can
/// drive the session with a plain channel.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    async fn send(&self, msg: SignalingMessage) -> Result<()>;
}

/// Default WebSocket transport for the signaling relay.
pub struct WsSignaling {
    out_tx: mpsc::Sender<SignalingMessage>,
}

impl WsSignaling {
    /// Connect to the relay. Returns the outbound port plus the inbound
    /// message stream.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<SignalingMessage>)> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<SignalingMessage>(100);
        let (in_tx, in_rx) = mpsc::channel::<SignalingMessage>(100);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("dropping unserializable signaling message: {e}");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    debug!("signaling writer closed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("signaling read error: {e}");
                        break;
                    }
                };
                if let Message::Text(text) = frame {
                    match serde_json::from_str::<SignalingMessage>(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("ignoring malformed signaling message: {e}"),
                    }
                }
            }
        });

        Ok((Self { out_tx }, in_rx))
    }
}

#[async_trait]
impl SignalingPort for WsSignaling {
    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.out_tx
            .send(msg)
            .await
            .map_err(|_| crate::error::Error::SignalingTransport("relay channel closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_matches_wire_contract() {
        let msg = SignalingMessage::JoinRoom {
            room_code: "abc123".into(),
            display_name: "Ada".into(),
            peer_id: "peer-1".into(),
            password: None,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "join-room");
        assert_eq!(json["roomCode"], "abc123");
        assert_eq!(json["displayName"], "Ada");
        assert_eq!(json["peerId"], "peer-1");
    }

    #[test]
    fn media_state_flattens_flags() {
        let msg = SignalingMessage::MediaState {
            from: "peer-1".into(),
            state: MediaStateInfo {
                audio: true,
                video: false,
                screen_share: true,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "media-state");
        assert_eq!(json["audio"], true);
        assert_eq!(json["video"], false);
        assert_eq!(json["screenShare"], true);
    }

    #[test]
    fn ice_candidate_round_trips_through_relay_json() {
        let raw = r#"{"type":"ice-candidate","from":"a","to":"b","roomId":"r1",
            "data":{"candidate":"candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host",
            "sdpMid":"0","sdpMlineIndex":0}}"#;
        let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
        match msg {
            SignalingMessage::IceCandidate { from, to, data, .. } => {
                assert_eq!(from, "a");
                assert_eq!(to, "b");
                assert_eq!(data.sdp_mid.as_deref(), Some("0"));
                assert_eq!(data.sdp_mline_index, Some(0));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
