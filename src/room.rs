//! The room session: roster, join/leave lifecycle, signaling dispatch, and
//! the facade the application drives.
//!
//! Glare avoidance is positional: the joiner offers to everyone who was
//! already in the room (listed in the join ack) and answers everyone who
//! arrives later. Two participants therefore never offer to each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::bandwidth::{
    BandwidthMonitor, BandwidthSample, QualityTier, StatsProbe,
};
use crate::connection::{ConnectionManager, PeerConnector, PeerEvent};
use crate::error::{Error, JoinRefusal, Result};
use crate::media::{LocalTrack, MediaConstraints, MediaController, MediaSource, TrackKind};
use crate::metrics::ConnectionQuality;
use crate::signaling::{
    MediaStateInfo, Role, SignalingMessage, SignalingPort,
};

/// How often the periodic bandwidth loop samples the links.
pub const MEASURE_INTERVAL: Duration = Duration::from_secs(15);

/// A random URL-safe peer id for callers that do not bring their own.
pub fn generate_peer_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

/// One remote participant as the roster sees them.
#[derive(Debug, Clone)]
pub struct Participant {
    pub peer_id: String,
    pub display_name: String,
    pub role: Role,
    pub media: MediaStateInfo,
    /// Last quality summary fetched for this peer's link.
    pub quality: Option<ConnectionQuality>,
    /// Present in the room before we joined. We offer to these peers;
    /// everyone else offers to us.
    pub present_at_join: bool,
    /// Bumped each time the same peer id re-announces itself.
    pub generation: u64,
}

/// Events the session surfaces to the application.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    Joined {
        peer_id: String,
    },
    JoinFailed(JoinRefusal),
    ParticipantJoined {
        peer_id: String,
        display_name: String,
    },
    ParticipantLeft {
        peer_id: String,
    },
    ConnectionLost {
        peer_id: String,
    },
    MediaStateChanged {
        peer_id: String,
        state: MediaStateInfo,
    },
    TrackReceived {
        peer_id: String,
        kind: TrackKind,
    },
    BandwidthUpdated(BandwidthSample),
    ForcedLeave {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Joining,
    Joined,
}

struct SessionData {
    state: SessionState,
    room_code: Option<String>,
    /// Tier last applied to the links, to avoid redundant adjustments.
    applied_tier: Option<QualityTier>,
    /// Resolves the in-flight `join` call once the server answers. Dropped
    /// (waking the caller with an error) if the session leaves first.
    join_waiter: Option<oneshot::Sender<std::result::Result<(), JoinRefusal>>>,
}

pub struct RoomSession {
    local_peer_id: String,
    signaling: Arc<dyn SignalingPort>,
    connections: Arc<ConnectionManager>,
    media: Arc<MediaController>,
    monitor: Arc<BandwidthMonitor>,
    roster: Mutex<HashMap<String, Participant>>,
    data: Mutex<SessionData>,
    notices: mpsc::Sender<SessionNotice>,
    bandwidth_tx: mpsc::Sender<BandwidthSample>,
    /// Receivers parked here until [`run`](Self::run) takes them.
    pumps: Mutex<Option<Pumps>>,
}

struct Pumps {
    signals: mpsc::Receiver<SignalingMessage>,
    peer_events: mpsc::Receiver<PeerEvent>,
    bandwidth: mpsc::Receiver<BandwidthSample>,
}

impl RoomSession {
    /// Wire up a session. The signaling transport is already connected;
    /// `signals` is its inbound message stream.
    pub fn new(
        local_peer_id: impl Into<String>,
        signaling: Arc<dyn SignalingPort>,
        signals: mpsc::Receiver<SignalingMessage>,
        connector: Arc<dyn PeerConnector>,
        source: Arc<dyn MediaSource>,
    ) -> (Arc<Self>, mpsc::Receiver<SessionNotice>) {
        let media = Arc::new(MediaController::new(source));
        let (connections, peer_events) = ConnectionManager::new(connector, Arc::clone(&media));
        let monitor = Arc::new(BandwidthMonitor::new(Arc::new(StatsProbe::new(Arc::clone(
            &connections,
        )))));
        let (notices_tx, notices_rx) = mpsc::channel(64);
        let (bandwidth_tx, bandwidth_rx) = mpsc::channel(16);

        let session = Arc::new(Self {
            local_peer_id: local_peer_id.into(),
            signaling,
            connections,
            media,
            monitor,
            roster: Mutex::new(HashMap::new()),
            data: Mutex::new(SessionData {
                state: SessionState::Idle,
                room_code: None,
                applied_tier: None,
                join_waiter: None,
            }),
            notices: notices_tx,
            bandwidth_tx,
            pumps: Mutex::new(Some(Pumps {
                signals,
                peer_events,
                bandwidth: bandwidth_rx,
            })),
        });
        (session, notices_rx)
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.roster.lock().await.values().cloned().collect()
    }

    /// Join a room. Media is acquired before anything goes on the wire: a
    /// denied device means no join attempt at all. The call resolves when
    /// the server answers — `Ok` on the ack, [`Error::RoomJoin`] with the
    /// refusal on rejection. The event pump ([`run`](Self::run)) must be
    /// running, since it delivers the server's answer.
    ///
    /// Joining while already in a room leaves the old room first; the newest
    /// join always wins, and it wakes any earlier caller with an error.
    pub async fn join(
        self: &Arc<Self>,
        room_code: &str,
        display_name: &str,
        password: Option<String>,
    ) -> Result<()> {
        if self.data.lock().await.state != SessionState::Idle {
            info!(room_code, "joining a new room, leaving the current one");
            self.leave().await;
        }

        self.media
            .acquire_local_stream(&MediaConstraints::default())
            .await?;

        let (waiter_tx, waiter_rx) = oneshot::channel();
        {
            let mut data = self.data.lock().await;
            data.state = SessionState::Joining;
            data.room_code = Some(room_code.to_owned());
            data.join_waiter = Some(waiter_tx);
        }

        let sent = self
            .signaling
            .send(SignalingMessage::JoinRoom {
                room_code: room_code.to_owned(),
                display_name: display_name.to_owned(),
                peer_id: self.local_peer_id.clone(),
                password,
            })
            .await;
        if let Err(e) = sent {
            let mut data = self.data.lock().await;
            data.state = SessionState::Idle;
            data.room_code = None;
            data.join_waiter = None;
            return Err(e);
        }

        match waiter_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(refusal)) => Err(Error::RoomJoin(refusal)),
            Err(_) => Err(Error::SignalingTransport(
                "session closed before the join was answered".into(),
            )),
        }
    }

    /// Leave the current room. Idempotent. Teardown order matters: every
    /// peer connection closes before any local track stops, so no peer sees
    /// a track die while its connection is still up.
    pub async fn leave(self: &Arc<Self>) {
        {
            let mut data = self.data.lock().await;
            if data.state == SessionState::Idle {
                return;
            }
            data.state = SessionState::Idle;
            data.room_code = None;
            data.applied_tier = None;
            // Dropping the waiter fails any join still waiting on an answer.
            data.join_waiter = None;
        }
        self.monitor.stop().await;
        self.connections.close_all().await;
        self.media.release_all().await;
        self.roster.lock().await.clear();
        info!("left room");
    }

    /// Drive the session until the signaling stream closes. Call once after
    /// [`join`](Self::join).
    pub async fn run(self: Arc<Self>) {
        let Some(mut pumps) = self.pumps.lock().await.take() else {
            warn!("session already running");
            return;
        };
        loop {
            tokio::select! {
                msg = pumps.signals.recv() => {
                    let Some(msg) = msg else {
                        info!("signaling stream closed");
                        self.leave().await;
                        return;
                    };
                    self.handle_signal(msg).await;
                }
                Some(event) = pumps.peer_events.recv() => {
                    self.handle_peer_event(event).await;
                }
                Some(sample) = pumps.bandwidth.recv() => {
                    self.apply_bandwidth_sample(sample).await;
                }
            }
        }
    }

    /// Dispatch one inbound signaling message.
    pub async fn handle_signal(self: &Arc<Self>, msg: SignalingMessage) {
        match msg {
            SignalingMessage::JoinAck {
                participant,
                participants,
                ice_servers,
            } => {
                let waiter = {
                    let mut data = self.data.lock().await;
                    if data.state != SessionState::Joining {
                        warn!("ignoring stale join ack");
                        return;
                    }
                    data.state = SessionState::Joined;
                    data.join_waiter.take()
                };
                self.connections.set_ice_servers(ice_servers).await;
                info!(
                    peer_id = %participant.peer_id,
                    existing = participants.len(),
                    "joined room"
                );

                // We are the later joiner: offer to everyone already here.
                for info in participants {
                    if info.peer_id == self.local_peer_id {
                        continue;
                    }
                    self.roster.lock().await.insert(
                        info.peer_id.clone(),
                        Participant {
                            peer_id: info.peer_id.clone(),
                            display_name: info.display_name.clone(),
                            role: info.role,
                            media: MediaStateInfo::default(),
                            quality: None,
                            present_at_join: true,
                            generation: 0,
                        },
                    );
                    if let Err(e) = self.offer_to(&info.peer_id).await {
                        warn!(peer_id = %info.peer_id, "could not negotiate: {e}");
                        self.drop_peer(&info.peer_id).await;
                    }
                }

                self.monitor
                    .start(MEASURE_INTERVAL, self.bandwidth_tx.clone())
                    .await;
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
                self.notify(SessionNotice::Joined {
                    peer_id: participant.peer_id,
                })
                .await;
            }

            SignalingMessage::JoinRejected { reason } => {
                warn!(%reason, "join rejected");
                // Hand the refusal to the caller before leave() tears the
                // waiter down with the rest of the session state.
                let waiter = self.data.lock().await.join_waiter.take();
                self.leave().await;
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(reason));
                }
                self.notify(SessionNotice::JoinFailed(reason)).await;
            }

            SignalingMessage::ParticipantJoined {
                peer_id,
                display_name,
            } => {
                if peer_id == self.local_peer_id {
                    return;
                }
                // A re-announced peer id is a reconnect: the newest join
                // wins, so any stale record goes first.
                let generation = {
                    let roster = self.roster.lock().await;
                    roster.get(&peer_id).map_or(0, |p| p.generation + 1)
                };
                if self.connections.release(&peer_id).await {
                    info!(peer_id, generation, "peer re-joined, discarded stale connection");
                }
                // They joined after us, so they will send the offer; we only
                // prepare a record to answer on.
                self.roster.lock().await.insert(
                    peer_id.clone(),
                    Participant {
                        peer_id: peer_id.clone(),
                        display_name: display_name.clone(),
                        role: Role::Guest,
                        media: MediaStateInfo::default(),
                        quality: None,
                        present_at_join: false,
                        generation,
                    },
                );
                if let Err(e) = self.connections.create_connection(&peer_id).await {
                    warn!(peer_id, "could not prepare connection: {e}");
                    self.drop_peer(&peer_id).await;
                    return;
                }
                self.notify(SessionNotice::ParticipantJoined {
                    peer_id,
                    display_name,
                })
                .await;
            }

            SignalingMessage::ParticipantLeft { peer_id } => {
                self.connections.release(&peer_id).await;
                self.roster.lock().await.remove(&peer_id);
                self.notify(SessionNotice::ParticipantLeft { peer_id }).await;
            }

            SignalingMessage::Offer { from, data, .. } => {
                // Only roster members get answered; an offer from a peer the
                // server never announced (or already removed) would otherwise
                // leave an orphan record behind.
                if !self.roster.lock().await.contains_key(&from) {
                    warn!(peer_id = %from, "dropping offer from unknown peer");
                    return;
                }
                let result = async {
                    self.connections.create_connection(&from).await?;
                    self.connections.set_remote_description(&from, data).await?;
                    let answer = self.connections.create_answer(&from).await?;
                    self.signaling
                        .send(SignalingMessage::Answer {
                            from: self.local_peer_id.clone(),
                            to: from.clone(),
                            room_id: self.room_id().await,
                            data: answer,
                        })
                        .await
                }
                .await;
                if let Err(e) = result {
                    warn!(peer_id = %from, "answering failed: {e}");
                    self.drop_peer(&from).await;
                }
            }

            SignalingMessage::Answer { from, data, .. } => {
                if let Err(e) = self.connections.set_remote_description(&from, data).await {
                    warn!(peer_id = %from, "applying answer failed: {e}");
                    self.drop_peer(&from).await;
                }
            }

            SignalingMessage::IceCandidate { from, data, .. } => {
                if let Err(e) = self.connections.add_ice_candidate(&from, data).await {
                    warn!(peer_id = %from, "candidate handling failed: {e}");
                }
            }

            SignalingMessage::MediaState { from, state } => {
                if let Some(p) = self.roster.lock().await.get_mut(&from) {
                    p.media = state;
                }
                self.notify(SessionNotice::MediaStateChanged {
                    peer_id: from,
                    state,
                })
                .await;
            }

            SignalingMessage::Kicked {} => {
                info!("removed from room by the host");
                self.leave().await;
                self.notify(SessionNotice::ForcedLeave {
                    reason: "removed by host".into(),
                })
                .await;
            }

            SignalingMessage::JoinRoom { .. } => {
                debug!("ignoring client-bound join-room echo");
            }
        }
    }

    /// Dispatch one engine event.
    pub async fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::CandidateReady { peer_id, candidate } => {
                let msg = SignalingMessage::IceCandidate {
                    from: self.local_peer_id.clone(),
                    to: peer_id.clone(),
                    room_id: self.room_id().await,
                    data: candidate,
                };
                if let Err(e) = self.signaling.send(msg).await {
                    warn!(peer_id, "could not relay candidate: {e}");
                }
            }
            PeerEvent::StateChanged { peer_id, state } => {
                let removed = self.connections.on_link_state(&peer_id, state).await;
                if removed {
                    self.roster.lock().await.remove(&peer_id);
                    self.notify(SessionNotice::ConnectionLost { peer_id }).await;
                }
            }
            PeerEvent::TrackReceived { peer_id, kind } => {
                self.notify(SessionNotice::TrackReceived { peer_id, kind })
                    .await;
            }
        }
    }

    /// Flip the mic and tell the room.
    pub async fn toggle_audio(&self, enabled: bool) -> Result<MediaStateInfo> {
        let state = self.media.toggle_audio(enabled).await?;
        self.broadcast_media_state(state).await;
        Ok(state)
    }

    /// Flip the camera and tell the room.
    pub async fn toggle_video(&self, enabled: bool) -> Result<MediaStateInfo> {
        let state = self.media.toggle_video(enabled).await?;
        self.broadcast_media_state(state).await;
        Ok(state)
    }

    /// Start display capture, substituting the screen track for the camera
    /// on every connection. Denial by the user leaves the call untouched.
    pub async fn start_screen_share(&self) -> Result<Arc<LocalTrack>> {
        let track = self.connections.start_screen_share().await?;
        self.broadcast_media_state(self.media.media_state().await)
            .await;
        Ok(track)
    }

    /// Put the camera track back on every connection.
    pub async fn stop_screen_share(&self) -> Result<()> {
        self.connections.stop_screen_share().await?;
        self.broadcast_media_state(self.media.media_state().await)
            .await;
        Ok(())
    }

    /// Run one bandwidth measurement now and apply the committed tier.
    pub async fn measure_bandwidth(&self) -> Result<BandwidthSample> {
        let sample = self.monitor.measure().await?;
        self.apply_bandwidth_sample(sample).await;
        Ok(sample)
    }

    /// Cap one peer's outgoing video at a tier's bitrate.
    pub async fn adjust_video_quality(&self, peer_id: &str, tier: QualityTier) -> Result<()> {
        self.connections.adjust_video_quality(peer_id, tier).await
    }

    /// Quality summary for one peer's link, mirrored into the roster.
    pub async fn get_connection_stats(&self, peer_id: &str) -> Result<ConnectionQuality> {
        let quality = self.connections.connection_stats(peer_id).await?;
        if let Some(p) = self.roster.lock().await.get_mut(peer_id) {
            p.quality = Some(quality.clone());
        }
        Ok(quality)
    }

    /// Links follow the monitor's smoothed tier, never a single sample's
    /// own recommendation.
    async fn apply_bandwidth_sample(&self, sample: BandwidthSample) {
        let committed = self.monitor.committed_tier().await;
        let changed = {
            let mut data = self.data.lock().await;
            if data.applied_tier != Some(committed) {
                data.applied_tier = Some(committed);
                true
            } else {
                false
            }
        };
        if changed {
            info!(tier = ?committed, "applying quality tier to all links");
            self.connections.adjust_all(committed).await;
        }
        self.notify(SessionNotice::BandwidthUpdated(sample)).await;
    }

    async fn offer_to(&self, peer_id: &str) -> Result<()> {
        self.connections.create_connection(peer_id).await?;
        let offer = self.connections.create_offer(peer_id).await?;
        self.signaling
            .send(SignalingMessage::Offer {
                from: self.local_peer_id.clone(),
                to: peer_id.to_owned(),
                room_id: self.room_id().await,
                data: offer,
            })
            .await
    }

    async fn broadcast_media_state(&self, state: MediaStateInfo) {
        let msg = SignalingMessage::MediaState {
            from: self.local_peer_id.clone(),
            state,
        };
        if let Err(e) = self.signaling.send(msg).await {
            warn!("could not broadcast media state: {e}");
        }
    }

    /// A failed peer never takes the rest of the call down: remove only its
    /// record and roster entry.
    async fn drop_peer(&self, peer_id: &str) {
        self.connections.release(peer_id).await;
        self.roster.lock().await.remove(peer_id);
        self.notify(SessionNotice::ConnectionLost {
            peer_id: peer_id.to_owned(),
        })
        .await;
    }

    async fn room_id(&self) -> String {
        self.data
            .lock()
            .await
            .room_code
            .clone()
            .unwrap_or_default()
    }

    async fn notify(&self, notice: SessionNotice) {
        if self.notices.send(notice).await.is_err() {
            debug!("notice receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids_are_distinct_and_url_safe() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
