//! Peer connection records and the orchestrator that owns them.
//!
//! One [`PeerRecord`] exists per remote participant, held in an arena keyed
//! by peer id and owned exclusively by [`ConnectionManager`]. The engine is
//! behind the [`PeerConnector`]/[`PeerLink`] seam and reports back through a
//! [`PeerEvent`] channel, so the negotiation machine runs the same against
//! webrtc-rs or synthetic test links.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::media::{LocalStream, LocalTrack, MediaController, TrackKind};
use crate::metrics::{ConnectionQuality, LinkStats};
use crate::signaling::{IceCandidate, IceServer, SdpKind, SessionDescription};

/// Negotiation progress for one record:
/// `Idle -> Offering | Answering -> Connected -> {Disconnected, Failed, Closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// True for the states that trigger automatic record removal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NegotiationState::Disconnected | NegotiationState::Failed | NegotiationState::Closed
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Disconnected => "disconnected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Transport-level state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events surfaced by an engine link. Replaces browser-style callback
/// registration so the state machine is testable with synthetic events.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    CandidateReady {
        peer_id: String,
        candidate: IceCandidate,
    },
    StateChanged {
        peer_id: String,
        state: LinkState,
    },
    TrackReceived {
        peer_id: String,
        kind: TrackKind,
    },
}

/// One live engine connection toward a peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Generate an offer and apply it locally before it is transmitted.
    async fn create_offer(&self) -> Result<SessionDescription>;
    /// Generate an answer (remote offer must already be applied) and apply
    /// it locally.
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Swap the outgoing video track on the existing sender. Same
    /// connection, same SDP — no renegotiation round trip.
    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<()>;
    /// Cap the outgoing video bitrate. Capture-time constraints (resolution,
    /// frame rate) are not touched.
    async fn set_max_bitrate(&self, kbps: u32) -> Result<()>;
    async fn stats(&self) -> Option<LinkStats>;
    async fn close(&self) -> Result<()>;
}

/// Opens engine links. The local stream's tracks are attached before the
/// first offer so the SDP carries sendrecv audio and video.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(
        &self,
        peer_id: &str,
        ice_servers: &[IceServer],
        stream: &LocalStream,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}

struct PeerRecord {
    link: Arc<dyn PeerLink>,
    state: NegotiationState,
    /// Candidates that arrived before the remote description; flushed in
    /// arrival order once it is set, never dropped.
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    /// The camera track to restore when screen share stops.
    camera_track: Arc<LocalTrack>,
    sharing_screen: bool,
    /// Last bitrate cap applied to this link, in kbps.
    max_bitrate_kbps: Option<u32>,
}

/// Owns the record arena. Collaborators (the room session) request creation
/// and removal through this API and never touch the map directly.
pub struct ConnectionManager {
    connector: Arc<dyn PeerConnector>,
    media: Arc<MediaController>,
    records: Mutex<HashMap<String, PeerRecord>>,
    ice_servers: Mutex<Vec<IceServer>>,
    events_tx: mpsc::Sender<PeerEvent>,
    prev_stats: Mutex<HashMap<String, LinkStats>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        media: Arc<MediaController>,
    ) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let manager = Arc::new(Self {
            connector,
            media,
            records: Mutex::new(HashMap::new()),
            ice_servers: Mutex::new(Vec::new()),
            events_tx,
            prev_stats: Mutex::new(HashMap::new()),
        });
        (manager, events_rx)
    }

    /// ICE servers arrive with the join ack and apply to every record opened
    /// afterwards.
    pub async fn set_ice_servers(&self, servers: Vec<IceServer>) {
        *self.ice_servers.lock().await = servers;
    }

    /// Idempotent: a record already held for `peer_id` is left untouched and
    /// no second engine connection is opened.
    pub async fn create_connection(&self, peer_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(peer_id) {
            debug!(peer_id, "connection record already exists");
            return Ok(());
        }

        let stream = self
            .media
            .stream()
            .await
            .ok_or_else(|| Error::MediaAccess("no local stream acquired".into()))?;
        let ice_servers = self.ice_servers.lock().await.clone();
        let link = self
            .connector
            .open(peer_id, &ice_servers, &stream, self.events_tx.clone())
            .await?;

        info!(peer_id, "connection record created");
        records.insert(
            peer_id.to_owned(),
            PeerRecord {
                link,
                state: NegotiationState::Idle,
                pending_candidates: Vec::new(),
                remote_description_set: false,
                camera_track: Arc::clone(stream.video()),
                sharing_screen: false,
                max_bitrate_kbps: None,
            },
        );
        Ok(())
    }

    pub async fn has_connection(&self, peer_id: &str) -> bool {
        self.records.lock().await.contains_key(peer_id)
    }

    pub async fn active_peers(&self) -> Vec<String> {
        self.records.lock().await.keys().cloned().collect()
    }

    pub async fn negotiation_state(&self, peer_id: &str) -> Option<NegotiationState> {
        self.records.lock().await.get(peer_id).map(|r| r.state)
    }

    /// Create and locally apply an offer for `peer_id`.
    pub async fn create_offer(&self, peer_id: &str) -> Result<SessionDescription> {
        let link = {
            let mut records = self.records.lock().await;
            let record = Self::record_mut(&mut records, peer_id)?;
            if record.state != NegotiationState::Idle {
                return Err(Error::negotiation(
                    peer_id,
                    format!("cannot offer while {}", record.state),
                ));
            }
            record.state = NegotiationState::Offering;
            Arc::clone(&record.link)
        };
        match link.create_offer().await {
            Ok(desc) => {
                debug!(peer_id, "offer created");
                Ok(desc)
            }
            Err(e) => {
                self.discard(peer_id).await;
                Err(e)
            }
        }
    }

    /// Create and locally apply an answer. The remote offer must have been
    /// applied via [`set_remote_description`](Self::set_remote_description).
    pub async fn create_answer(&self, peer_id: &str) -> Result<SessionDescription> {
        let link = {
            let records = self.records.lock().await;
            let record = Self::record(&records, peer_id)?;
            if record.state != NegotiationState::Answering {
                return Err(Error::negotiation(
                    peer_id,
                    format!("cannot answer while {}", record.state),
                ));
            }
            Arc::clone(&record.link)
        };
        match link.create_answer().await {
            Ok(desc) => {
                debug!(peer_id, "answer created");
                Ok(desc)
            }
            Err(e) => {
                self.discard(peer_id).await;
                Err(e)
            }
        }
    }

    /// Apply the remote description, then flush every candidate queued for
    /// this peer in original arrival order.
    pub async fn set_remote_description(
        &self,
        peer_id: &str,
        desc: SessionDescription,
    ) -> Result<()> {
        let kind = desc.kind;
        let link = {
            let mut records = self.records.lock().await;
            let record = Self::record_mut(&mut records, peer_id)?;
            match kind {
                SdpKind::Offer if record.state == NegotiationState::Idle => {
                    record.state = NegotiationState::Answering;
                }
                SdpKind::Answer if record.state == NegotiationState::Offering => {}
                _ => {
                    return Err(Error::negotiation(
                        peer_id,
                        format!("unexpected {kind:?} while {}", record.state),
                    ));
                }
            }
            Arc::clone(&record.link)
        };

        if let Err(e) = link.set_remote_description(desc).await {
            self.discard(peer_id).await;
            return Err(e);
        }

        let queued = {
            let mut records = self.records.lock().await;
            match records.get_mut(peer_id) {
                Some(record) => {
                    record.remote_description_set = true;
                    std::mem::take(&mut record.pending_candidates)
                }
                None => return Ok(()),
            }
        };
        if !queued.is_empty() {
            debug!(peer_id, count = queued.len(), "flushing queued candidates");
        }
        for candidate in queued {
            if let Err(e) = link.add_ice_candidate(candidate).await {
                warn!(peer_id, "queued candidate rejected: {e}");
            }
        }
        Ok(())
    }

    /// Queue the candidate until the remote description is set, apply it
    /// directly afterwards. A candidate for an unknown peer is dropped with
    /// a warning — stale signaling for a peer that already left.
    pub async fn add_ice_candidate(&self, peer_id: &str, candidate: IceCandidate) -> Result<()> {
        let link = {
            let mut records = self.records.lock().await;
            match records.get_mut(peer_id) {
                None => {
                    warn!(peer_id, "dropping candidate for unknown peer");
                    return Ok(());
                }
                Some(record) if !record.remote_description_set => {
                    record.pending_candidates.push(candidate);
                    return Ok(());
                }
                Some(record) => Arc::clone(&record.link),
            }
        };
        if let Err(e) = link.add_ice_candidate(candidate).await {
            warn!(peer_id, "candidate rejected: {e}");
        }
        Ok(())
    }

    /// Fold an engine state report into the record. Returns `true` when the
    /// state was terminal and the record has been removed; no other record
    /// is touched either way.
    pub async fn on_link_state(&self, peer_id: &str, state: LinkState) -> bool {
        let next = match state {
            LinkState::Connected => NegotiationState::Connected,
            LinkState::Disconnected => NegotiationState::Disconnected,
            LinkState::Failed => NegotiationState::Failed,
            LinkState::Closed => NegotiationState::Closed,
            LinkState::New | LinkState::Connecting => return false,
        };
        {
            let mut records = self.records.lock().await;
            match records.get_mut(peer_id) {
                Some(record) => {
                    debug!(peer_id, from = %record.state, to = %next, "link state change");
                    record.state = next;
                }
                None => return false,
            }
        }
        if next.is_terminal() {
            self.release(peer_id).await;
            true
        } else {
            false
        }
    }

    /// Close and remove one record. Returns whether it existed.
    pub async fn release(&self, peer_id: &str) -> bool {
        let record = self.records.lock().await.remove(peer_id);
        self.prev_stats.lock().await.remove(peer_id);
        match record {
            Some(record) => {
                if let Err(e) = record.link.close().await {
                    warn!(peer_id, "error closing link: {e}");
                }
                info!(peer_id, "connection record released");
                true
            }
            None => false,
        }
    }

    /// Remove a record after a negotiation failure, without surfacing close
    /// errors to the caller.
    async fn discard(&self, peer_id: &str) {
        self.release(peer_id).await;
    }

    /// Close every record and clear the arena.
    pub async fn close_all(&self) {
        let records: Vec<(String, PeerRecord)> =
            self.records.lock().await.drain().collect();
        self.prev_stats.lock().await.clear();
        for (peer_id, record) in records {
            if let Err(e) = record.link.close().await {
                warn!(peer_id, "error closing link: {e}");
            }
        }
    }

    /// Acquire the screen track and substitute it for the outgoing camera
    /// track on every record — no new offer/answer round trip. When the
    /// captured track ends (user tears the capture down), screen share stops
    /// by itself.
    pub async fn start_screen_share(self: &Arc<Self>) -> Result<Arc<LocalTrack>> {
        let screen = self.media.acquire_screen_stream().await?;

        {
            let mut records = self.records.lock().await;
            for (peer_id, record) in records.iter_mut() {
                if let Err(e) = record.link.replace_video_track(Arc::clone(&screen)).await {
                    warn!(peer_id, "screen substitution failed: {e}");
                    continue;
                }
                record.sharing_screen = true;
            }
        }

        let manager = Arc::clone(self);
        let ended = Arc::clone(&screen);
        tokio::spawn(async move {
            ended.ended().await;
            if let Err(e) = manager.stop_screen_share().await {
                warn!("auto stop of screen share failed: {e}");
            }
        });

        info!("screen share started");
        Ok(screen)
    }

    /// Restore the original camera track on every sender that was switched
    /// to the screen track. Idempotent.
    pub async fn stop_screen_share(&self) -> Result<()> {
        if self.media.stop_screen().await.is_none() {
            return Ok(());
        }
        let mut records = self.records.lock().await;
        for (peer_id, record) in records.iter_mut() {
            if !record.sharing_screen {
                continue;
            }
            record.sharing_screen = false;
            let camera = Arc::clone(&record.camera_track);
            if let Err(e) = record.link.replace_video_track(camera).await {
                warn!(peer_id, "camera restore failed: {e}");
            }
        }
        info!("screen share stopped");
        Ok(())
    }

    /// Cap one peer's outgoing video bitrate at the tier's fixed value.
    pub async fn adjust_video_quality(
        &self,
        peer_id: &str,
        tier: crate::bandwidth::QualityTier,
    ) -> Result<()> {
        let kbps = tier.max_bitrate_kbps();
        let link = {
            let mut records = self.records.lock().await;
            let record = Self::record_mut(&mut records, peer_id)?;
            record.max_bitrate_kbps = Some(kbps);
            Arc::clone(&record.link)
        };
        link.set_max_bitrate(kbps).await
    }

    /// Apply a committed quality tier to every active record.
    pub async fn adjust_all(&self, tier: crate::bandwidth::QualityTier) {
        let kbps = tier.max_bitrate_kbps();
        let links: Vec<(String, Arc<dyn PeerLink>)> = {
            let mut records = self.records.lock().await;
            records
                .iter_mut()
                .map(|(id, r)| {
                    r.max_bitrate_kbps = Some(kbps);
                    (id.clone(), Arc::clone(&r.link))
                })
                .collect()
        };
        for (peer_id, link) in links {
            if let Err(e) = link.set_max_bitrate(kbps).await {
                warn!(peer_id, "bitrate adjustment failed: {e}");
            }
        }
    }

    /// The cap last applied to one peer's link, if any.
    pub async fn max_bitrate(&self, peer_id: &str) -> Option<u32> {
        self.records
            .lock()
            .await
            .get(peer_id)
            .and_then(|r| r.max_bitrate_kbps)
    }

    /// Quality summary for one peer, derived from link counters and the
    /// previous snapshot.
    pub async fn connection_stats(&self, peer_id: &str) -> Result<ConnectionQuality> {
        let link = {
            let records = self.records.lock().await;
            Arc::clone(&Self::record(&records, peer_id)?.link)
        };
        let stats = link
            .stats()
            .await
            .ok_or_else(|| Error::negotiation(peer_id, "no stats available"))?;
        let mut prev = self.prev_stats.lock().await;
        let quality = ConnectionQuality::from_link(&stats, prev.get(peer_id));
        prev.insert(peer_id.to_owned(), stats);
        Ok(quality)
    }

    /// Raw counters for every active link, for the bandwidth probe.
    pub async fn link_stats_snapshot(&self) -> Vec<(String, LinkStats)> {
        let links: Vec<(String, Arc<dyn PeerLink>)> = {
            let records = self.records.lock().await;
            records
                .iter()
                .map(|(id, r)| (id.clone(), Arc::clone(&r.link)))
                .collect()
        };
        let mut out = Vec::with_capacity(links.len());
        for (peer_id, link) in links {
            if let Some(stats) = link.stats().await {
                out.push((peer_id, stats));
            }
        }
        out
    }

    fn record<'a>(
        records: &'a HashMap<String, PeerRecord>,
        peer_id: &str,
    ) -> Result<&'a PeerRecord> {
        records
            .get(peer_id)
            .ok_or_else(|| Error::negotiation(peer_id, "no connection record"))
    }

    fn record_mut<'a>(
        records: &'a mut HashMap<String, PeerRecord>,
        peer_id: &str,
    ) -> Result<&'a mut PeerRecord> {
        records
            .get_mut(peer_id)
            .ok_or_else(|| Error::negotiation(peer_id, "no connection record"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeSource;

    #[async_trait]
    impl MediaSource for FakeSource {
        async fn open_capture(&self, _c: &MediaConstraints) -> Result<Arc<LocalStream>> {
            Ok(Arc::new(LocalStream::new(
                Arc::new(LocalTrack::audio("t")),
                Arc::new(LocalTrack::video("t")),
            )))
        }
        async fn open_screen(&self) -> Result<Arc<LocalTrack>> {
            Ok(Arc::new(LocalTrack::screen("t")))
        }
    }

    #[derive(Default)]
    struct FakeLink {
        added_candidates: AsyncMutex<Vec<IceCandidate>>,
        current_video: AsyncMutex<Option<Arc<LocalTrack>>>,
        max_bitrate: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0 offer".into(),
            })
        }
        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription {
                kind: SdpKind::Answer,
                sdp: "v=0 answer".into(),
            })
        }
        async fn set_remote_description(&self, _d: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.added_candidates.lock().await.push(candidate);
            Ok(())
        }
        async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<()> {
            *self.current_video.lock().await = Some(track);
            Ok(())
        }
        async fn set_max_bitrate(&self, kbps: u32) -> Result<()> {
            self.max_bitrate.store(kbps as usize, Ordering::SeqCst);
            Ok(())
        }
        async fn stats(&self) -> Option<LinkStats> {
            None
        }
        async fn close(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeConnector {
        opens: AtomicUsize,
        links: AsyncMutex<HashMap<String, Arc<FakeLink>>>,
    }

    impl FakeConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                links: AsyncMutex::new(HashMap::new()),
            })
        }

        async fn link(&self, peer_id: &str) -> Arc<FakeLink> {
            Arc::clone(&self.links.lock().await[peer_id])
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn open(
            &self,
            peer_id: &str,
            _ice: &[IceServer],
            _stream: &LocalStream,
            _events: mpsc::Sender<PeerEvent>,
        ) -> Result<Arc<dyn PeerLink>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let link = Arc::new(FakeLink::default());
            self.links
                .lock()
                .await
                .insert(peer_id.to_owned(), Arc::clone(&link));
            Ok(link)
        }
    }

    async fn manager_with(
        connector: Arc<FakeConnector>,
    ) -> (Arc<ConnectionManager>, Arc<MediaController>) {
        let media = Arc::new(MediaController::new(Arc::new(FakeSource)));
        media
            .acquire_local_stream(&MediaConstraints::default())
            .await
            .unwrap();
        let (manager, _events) = ConnectionManager::new(connector, Arc::clone(&media));
        (manager, media)
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn create_connection_is_idempotent() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(Arc::clone(&connector)).await;

        manager.create_connection("bob").await.unwrap();
        manager.create_connection("bob").await.unwrap();

        assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_peers().await, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn early_candidates_flush_in_arrival_order() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(Arc::clone(&connector)).await;
        manager.create_connection("bob").await.unwrap();
        manager.create_offer("bob").await.unwrap();

        for n in 0..3 {
            manager.add_ice_candidate("bob", candidate(n)).await.unwrap();
        }
        let link = connector.link("bob").await;
        assert!(link.added_candidates.lock().await.is_empty());

        manager
            .set_remote_description(
                "bob",
                SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "v=0".into(),
                },
            )
            .await
            .unwrap();

        let applied = link.added_candidates.lock().await;
        let order: Vec<&str> = applied.iter().map(|c| c.candidate.as_str()).collect();
        assert_eq!(order, ["candidate:0", "candidate:1", "candidate:2"]);
    }

    #[tokio::test]
    async fn late_candidates_apply_directly() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(Arc::clone(&connector)).await;
        manager.create_connection("bob").await.unwrap();
        manager.create_offer("bob").await.unwrap();
        manager
            .set_remote_description(
                "bob",
                SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "v=0".into(),
                },
            )
            .await
            .unwrap();

        manager.add_ice_candidate("bob", candidate(7)).await.unwrap();
        let link = connector.link("bob").await;
        assert_eq!(link.added_candidates.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn candidate_for_unknown_peer_is_dropped_quietly() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(connector).await;
        // No record exists; this must not error.
        manager
            .add_ice_candidate("ghost", candidate(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn incoming_offer_drives_answering_path() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(connector).await;
        manager.create_connection("alice").await.unwrap();

        manager
            .set_remote_description(
                "alice",
                SessionDescription {
                    kind: SdpKind::Offer,
                    sdp: "v=0".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            manager.negotiation_state("alice").await,
            Some(NegotiationState::Answering)
        );

        let answer = manager.create_answer("alice").await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
    }

    #[tokio::test]
    async fn unexpected_description_is_a_negotiation_error() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(connector).await;
        manager.create_connection("alice").await.unwrap();

        // An answer without a prior offer of ours is rejected.
        let err = manager
            .set_remote_description(
                "alice",
                SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "v=0".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Negotiation { .. }));
    }

    #[tokio::test]
    async fn terminal_link_state_releases_only_that_record() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(Arc::clone(&connector)).await;
        manager.create_connection("a").await.unwrap();
        manager.create_connection("b").await.unwrap();

        let removed = manager.on_link_state("a", LinkState::Failed).await;
        assert!(removed);
        assert!(!manager.has_connection("a").await);
        assert!(manager.has_connection("b").await);
        assert_eq!(connector.link("b").await.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn screen_share_swaps_and_restores_same_camera_track() {
        let connector = FakeConnector::new();
        let (manager, media) = manager_with(Arc::clone(&connector)).await;
        manager.create_connection("bob").await.unwrap();
        let camera = Arc::clone(media.stream().await.unwrap().video());

        let screen = manager.start_screen_share().await.unwrap();
        let link = connector.link("bob").await;
        {
            let current = link.current_video.lock().await;
            assert!(Arc::ptr_eq(current.as_ref().unwrap(), &screen));
        }

        manager.stop_screen_share().await.unwrap();
        let current = link.current_video.lock().await;
        assert!(Arc::ptr_eq(current.as_ref().unwrap(), &camera));
    }

    #[tokio::test]
    async fn screen_track_ending_stops_share_automatically() {
        let connector = FakeConnector::new();
        let (manager, media) = manager_with(Arc::clone(&connector)).await;
        manager.create_connection("bob").await.unwrap();
        let camera = Arc::clone(media.stream().await.unwrap().video());

        let screen = manager.start_screen_share().await.unwrap();
        screen.stop();

        // The ended hook runs on a spawned task; poll for the restore.
        let link = connector.link("bob").await;
        for _ in 0..50 {
            if let Some(current) = link.current_video.lock().await.as_ref() {
                if Arc::ptr_eq(current, &camera) {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("camera track was not restored after screen track ended");
    }

    #[tokio::test]
    async fn quality_adjustment_caps_the_link_and_is_remembered() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(Arc::clone(&connector)).await;
        manager.create_connection("bob").await.unwrap();

        manager
            .adjust_video_quality("bob", crate::bandwidth::QualityTier::Medium)
            .await
            .unwrap();
        assert_eq!(manager.max_bitrate("bob").await, Some(800));
        let link = connector.link("bob").await;
        assert_eq!(link.max_bitrate.load(Ordering::SeqCst), 800);

        manager.adjust_all(crate::bandwidth::QualityTier::Low).await;
        assert_eq!(manager.max_bitrate("bob").await, Some(300));
    }

    #[tokio::test]
    async fn close_all_clears_the_arena() {
        let connector = FakeConnector::new();
        let (manager, _media) = manager_with(Arc::clone(&connector)).await;
        manager.create_connection("a").await.unwrap();
        manager.create_connection("b").await.unwrap();

        manager.close_all().await;
        assert!(manager.active_peers().await.is_empty());
        assert_eq!(connector.link("a").await.closed.load(Ordering::SeqCst), 1);
        assert_eq!(connector.link("b").await.closed.load(Ordering::SeqCst), 1);
    }
}
