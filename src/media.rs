//! Local media ownership: the single shared capture stream, the optional
//! screen track, and the enable/disable toggles.
//!
//! Tracks are shared by `Arc` across every peer connection, so flipping an
//! enabled flag (mute, camera off) is observed by all peers at once — it is
//! the same underlying resource, not a per-peer copy.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::debug;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};
use crate::signaling::MediaStateInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One locally produced track. The `enabled` flag and the ended signal live
/// on the shared instance; the underlying RTP track is handed to every
/// connection that sends it.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended_tx: watch::Sender<bool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    fn new(id: String, kind: TrackKind, caps: RTCRtpCodecCapability, stream_id: &str) -> Self {
        let rtc = Arc::new(TrackLocalStaticSample::new(
            caps,
            id.clone(),
            stream_id.to_owned(),
        ));
        let (ended_tx, _) = watch::channel(false);
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            ended_tx,
            rtc,
        }
    }

    pub fn audio(stream_id: &str) -> Self {
        Self::new(
            "audio".to_owned(),
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            stream_id,
        )
    }

    pub fn video(stream_id: &str) -> Self {
        Self::new(
            "video".to_owned(),
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            stream_id,
        )
    }

    pub fn screen(stream_id: &str) -> Self {
        Self::new(
            "screen".to_owned(),
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            stream_id,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Permanently stop the track. Idempotent.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.ended_tx.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended_tx.borrow()
    }

    /// Resolves once the track has been stopped (screen capture torn down by
    /// the user, device unplugged, `release_all`).
    pub async fn ended(&self) {
        let mut rx = self.ended_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The underlying RTP track handed to peer connections.
    pub fn rtp(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// The one local capture stream: a mic track and a camera track, shared by
/// reference across every peer connection.
#[derive(Debug)]
pub struct LocalStream {
    audio: Arc<LocalTrack>,
    video: Arc<LocalTrack>,
}

impl LocalStream {
    pub fn new(audio: Arc<LocalTrack>, video: Arc<LocalTrack>) -> Self {
        Self { audio, video }
    }

    pub fn audio(&self) -> &Arc<LocalTrack> {
        &self.audio
    }

    pub fn video(&self) -> &Arc<LocalTrack> {
        &self.video
    }

    pub fn tracks(&self) -> [&Arc<LocalTrack>; 2] {
        [&self.audio, &self.video]
    }
}

/// Capture constraints, fixed at acquisition time. Bitrate is the only knob
/// adjusted while a track is flowing; resolution and frame rate are not
/// renegotiated.
#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// Where tracks come from: real devices in production, synthetic tracks in
/// tests. Screen acquisition fails with [`Error::ScreenShareDenied`] when
/// the user cancels the picker.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open_capture(&self, constraints: &MediaConstraints) -> Result<Arc<LocalStream>>;
    async fn open_screen(&self) -> Result<Arc<LocalTrack>>;
}

/// Owns the local capture stream and the zero-or-one screen track.
pub struct MediaController {
    source: Arc<dyn MediaSource>,
    stream: Mutex<Option<Arc<LocalStream>>>,
    screen: Mutex<Option<Arc<LocalTrack>>>,
}

impl MediaController {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            stream: Mutex::new(None),
            screen: Mutex::new(None),
        }
    }

    /// Acquire the capture stream. A second call returns the stream already
    /// held; no device is re-opened. Fails with [`Error::MediaAccess`] and
    /// leaves no state behind when the device is denied or missing.
    pub async fn acquire_local_stream(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<LocalStream>> {
        let mut slot = self.stream.lock().await;
        if let Some(stream) = slot.as_ref() {
            return Ok(Arc::clone(stream));
        }
        let stream = self.source.open_capture(constraints).await?;
        debug!("local capture stream acquired");
        *slot = Some(Arc::clone(&stream));
        Ok(stream)
    }

    pub async fn stream(&self) -> Option<Arc<LocalStream>> {
        self.stream.lock().await.clone()
    }

    /// Flip the mic on or off. No renegotiation: the flag lives on the shared
    /// track instance, so every peer observes it simultaneously.
    pub async fn toggle_audio(&self, enabled: bool) -> Result<MediaStateInfo> {
        let slot = self.stream.lock().await;
        let stream = slot
            .as_ref()
            .ok_or_else(|| Error::MediaAccess("no local stream acquired".into()))?;
        stream.audio().set_enabled(enabled);
        Ok(self.state_of(Some(stream), self.screen.lock().await.as_deref()))
    }

    /// Flip the camera on or off. Same shared-instance semantics as audio.
    pub async fn toggle_video(&self, enabled: bool) -> Result<MediaStateInfo> {
        let slot = self.stream.lock().await;
        let stream = slot
            .as_ref()
            .ok_or_else(|| Error::MediaAccess("no local stream acquired".into()))?;
        stream.video().set_enabled(enabled);
        Ok(self.state_of(Some(stream), self.screen.lock().await.as_deref()))
    }

    /// Acquire the display-capture track. At most one is active; a second
    /// call while one is live returns the existing track.
    pub async fn acquire_screen_stream(&self) -> Result<Arc<LocalTrack>> {
        let mut slot = self.screen.lock().await;
        if let Some(track) = slot.as_ref() {
            if !track.is_ended() {
                return Ok(Arc::clone(track));
            }
        }
        let track = self.source.open_screen().await?;
        debug!("screen capture acquired");
        *slot = Some(Arc::clone(&track));
        Ok(track)
    }

    pub async fn screen(&self) -> Option<Arc<LocalTrack>> {
        self.screen.lock().await.clone()
    }

    /// Stop and drop the screen track, returning it if one was active.
    pub async fn stop_screen(&self) -> Option<Arc<LocalTrack>> {
        let track = self.screen.lock().await.take();
        if let Some(track) = &track {
            track.stop();
        }
        track
    }

    /// Current flags for the `media-state` broadcast.
    pub async fn media_state(&self) -> MediaStateInfo {
        let stream = self.stream.lock().await;
        let screen = self.screen.lock().await;
        self.state_of(stream.as_ref(), screen.as_deref())
    }

    fn state_of(&self, stream: Option<&Arc<LocalStream>>, screen: Option<&LocalTrack>) -> MediaStateInfo {
        MediaStateInfo {
            audio: stream.map(|s| s.audio().is_enabled()).unwrap_or(false),
            video: stream.map(|s| s.video().is_enabled()).unwrap_or(false),
            screen_share: screen.map(|t| !t.is_ended()).unwrap_or(false),
        }
    }

    /// Stop every local track and the screen track. Safe to call repeatedly.
    /// Locks are always taken stream-then-screen across this type.
    pub async fn release_all(&self) {
        let stream = self.stream.lock().await.take();
        let screen = self.screen.lock().await.take();
        if let Some(track) = screen {
            track.stop();
        }
        if let Some(stream) = stream {
            for track in stream.tracks() {
                track.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSource;

    #[async_trait]
    impl MediaSource for FakeSource {
        async fn open_capture(&self, _c: &MediaConstraints) -> Result<Arc<LocalStream>> {
            Ok(Arc::new(LocalStream::new(
                Arc::new(LocalTrack::audio("test")),
                Arc::new(LocalTrack::video("test")),
            )))
        }

        async fn open_screen(&self) -> Result<Arc<LocalTrack>> {
            Ok(Arc::new(LocalTrack::screen("test")))
        }
    }

    struct DeniedSource;

    #[async_trait]
    impl MediaSource for DeniedSource {
        async fn open_capture(&self, _c: &MediaConstraints) -> Result<Arc<LocalStream>> {
            Err(Error::MediaAccess("permission denied".into()))
        }

        async fn open_screen(&self) -> Result<Arc<LocalTrack>> {
            Err(Error::ScreenShareDenied)
        }
    }

    fn controller() -> MediaController {
        MediaController::new(Arc::new(FakeSource))
    }

    #[tokio::test]
    async fn acquire_is_idempotent() {
        let media = controller();
        let a = media
            .acquire_local_stream(&MediaConstraints::default())
            .await
            .unwrap();
        let b = media
            .acquire_local_stream(&MediaConstraints::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn denied_device_leaves_no_state() {
        let media = MediaController::new(Arc::new(DeniedSource));
        let err = media
            .acquire_local_stream(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaAccess(_)));
        assert!(media.stream().await.is_none());
    }

    #[tokio::test]
    async fn even_toggles_restore_odd_toggles_invert() {
        let media = controller();
        let stream = media
            .acquire_local_stream(&MediaConstraints::default())
            .await
            .unwrap();
        let before = stream.audio().is_enabled();

        for flip in [false, true] {
            media.toggle_audio(flip).await.unwrap();
        }
        assert_eq!(stream.audio().is_enabled(), before);

        media.toggle_audio(!before).await.unwrap();
        assert_eq!(stream.audio().is_enabled(), !before);
    }

    #[tokio::test]
    async fn toggle_visible_through_every_shared_handle() {
        let media = controller();
        let stream = media
            .acquire_local_stream(&MediaConstraints::default())
            .await
            .unwrap();
        // A "per-peer" handle is the same Arc, so the flag mutation is shared.
        let handle_for_peer = Arc::clone(stream.video());
        media.toggle_video(false).await.unwrap();
        assert!(!handle_for_peer.is_enabled());
    }

    #[tokio::test]
    async fn release_all_is_idempotent_and_stops_tracks() {
        let media = controller();
        let stream = media
            .acquire_local_stream(&MediaConstraints::default())
            .await
            .unwrap();
        let screen = media.acquire_screen_stream().await.unwrap();

        media.release_all().await;
        media.release_all().await;

        assert!(stream.audio().is_ended());
        assert!(stream.video().is_ended());
        assert!(screen.is_ended());
        assert!(media.stream().await.is_none());
    }

    #[tokio::test]
    async fn screen_denial_is_nonfatal() {
        let media = MediaController::new(Arc::new(DeniedSource));
        assert!(matches!(
            media.acquire_screen_stream().await.unwrap_err(),
            Error::ScreenShareDenied
        ));
    }

    #[tokio::test]
    async fn ended_signal_fires() {
        let track = Arc::new(LocalTrack::screen("test"));
        let waiter = Arc::clone(&track);
        let wait = tokio::spawn(async move { waiter.ended().await });
        track.stop();
        wait.await.unwrap();
    }
}
