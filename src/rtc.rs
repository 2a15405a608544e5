//! webrtc-rs implementations of the engine seams.
//!
//! [`RtcConnector`] opens real peer connections with the default codec and
//! interceptor set; [`RtcLink`] adapts their callback-style events onto the
//! [`PeerEvent`] channel the orchestrator consumes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

use crate::connection::{LinkState, PeerConnector, PeerEvent, PeerLink};
use crate::error::{Error, Result};
use crate::media::{LocalStream, LocalTrack, TrackKind};
use crate::metrics::LinkStats;
use crate::signaling::{IceCandidate, IceServer, SdpKind, SessionDescription};

pub struct RtcConnector {
    api: API,
}

impl RtcConnector {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Engine(e.into()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::Engine(e.into()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn open(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
        stream: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| Error::negotiation(peer_id, e.to_string()))?,
        );

        // Both local tracks go on before the first offer so the SDP carries
        // sendrecv audio and video m-lines.
        pc.add_track(stream.audio().rtp() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::negotiation(peer_id, e.to_string()))?;
        let video_sender = pc
            .add_track(stream.video().rtp() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::negotiation(peer_id, e.to_string()))?;

        {
            let events = events.clone();
            let peer_id = peer_id.to_owned();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = events
                                .send(PeerEvent::CandidateReady {
                                    peer_id,
                                    candidate: IceCandidate {
                                        candidate: json.candidate,
                                        sdp_mid: json.sdp_mid,
                                        sdp_mline_index: json.sdp_mline_index,
                                    },
                                })
                                .await;
                        }
                        Err(e) => warn!(peer_id, "candidate serialization failed: {e}"),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            let peer_id = peer_id.to_owned();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let state = match state {
                        RTCPeerConnectionState::New => LinkState::New,
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Connected,
                        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                        RTCPeerConnectionState::Failed => LinkState::Failed,
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        RTCPeerConnectionState::Unspecified => return,
                    };
                    let _ = events.send(PeerEvent::StateChanged { peer_id, state }).await;
                })
            }));
        }

        {
            let peer_id = peer_id.to_owned();
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    RTPCodecType::Unspecified => None,
                };
                Box::pin(async move {
                    if let Some(kind) = kind {
                        let _ = events.send(PeerEvent::TrackReceived { peer_id, kind }).await;
                    }
                })
            }));
        }

        Ok(Arc::new(RtcLink {
            peer_id: peer_id.to_owned(),
            pc,
            video_sender,
            max_bitrate_kbps: AtomicU32::new(0),
        }))
    }
}

pub struct RtcLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
    max_bitrate_kbps: AtomicU32,
}

impl RtcLink {
    fn err(&self, e: impl std::fmt::Display) -> Error {
        Error::negotiation(&self.peer_id, e.to_string())
    }

    /// The currently applied outgoing video cap in kbps, 0 when unset. Read
    /// by the encoder pipeline feeding the video track.
    pub fn max_bitrate_kbps(&self) -> u32 {
        self.max_bitrate_kbps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(|e| self.err(e))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| self.err(e))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| self.err("local description missing after offer"))?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: local.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(|e| self.err(e))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| self.err(e))?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| self.err("local description missing after answer"))?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: local.sdp,
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let remote = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| self.err(e))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| self.err(e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(|e| self.err(e))
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        self.video_sender
            .replace_track(Some(track.rtp() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| self.err(e))
    }

    async fn set_max_bitrate(&self, kbps: u32) -> Result<()> {
        self.max_bitrate_kbps.store(kbps, Ordering::SeqCst);
        debug!(peer_id = %self.peer_id, kbps, "outgoing video bitrate capped");
        Ok(())
    }

    async fn stats(&self) -> Option<LinkStats> {
        let report = self.pc.get_stats().await;
        let mut stats = LinkStats {
            round_trip_time_ms: None,
            packets_sent: 0,
            packets_lost: 0,
            bytes_sent: 0,
            bytes_received: 0,
            sampled_at: Instant::now(),
        };
        let mut saw_any = false;
        for entry in report.reports.values() {
            match entry {
                StatsReportType::OutboundRTP(outbound) => {
                    stats.packets_sent += outbound.packets_sent;
                    stats.bytes_sent += outbound.bytes_sent;
                    saw_any = true;
                }
                StatsReportType::InboundRTP(inbound) => {
                    stats.bytes_received += inbound.bytes_received;
                    saw_any = true;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packets_lost += remote.packets_lost;
                    if let Some(rtt) = remote.round_trip_time {
                        let rtt_ms = rtt * 1000.0;
                        stats.round_trip_time_ms = Some(
                            stats
                                .round_trip_time_ms
                                .map_or(rtt_ms, |current| current.max(rtt_ms)),
                        );
                    }
                    saw_any = true;
                }
                _ => {}
            }
        }
        saw_any.then_some(stats)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(|e| self.err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_stream() -> LocalStream {
        LocalStream::new(
            Arc::new(LocalTrack::audio("stream")),
            Arc::new(LocalTrack::video("stream")),
        )
    }

    // Offer generation needs no network, only the local engine.
    #[tokio::test]
    async fn offline_link_produces_sendrecv_offer() {
        let connector = RtcConnector::new().unwrap();
        let (events, _rx) = mpsc::channel(8);
        let link = connector
            .open("peer", &[], &local_stream(), events)
            .await
            .unwrap();

        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        link.close().await.unwrap();
    }

    #[tokio::test]
    async fn video_track_can_be_swapped_without_renegotiation() {
        let connector = RtcConnector::new().unwrap();
        let (events, _rx) = mpsc::channel(8);
        let link = connector
            .open("peer", &[], &local_stream(), events)
            .await
            .unwrap();

        let screen = Arc::new(LocalTrack::screen("stream"));
        link.replace_video_track(screen).await.unwrap();
        link.close().await.unwrap();
    }
}
