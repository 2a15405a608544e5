//! Device-backed media source: microphone capture through cpal.
//!
//! `cpal::Stream` is not `Send`, so the stream lives on a dedicated capture
//! thread for its whole lifetime. The audio callback converts device samples
//! to 16-bit PCM and hands them to a tokio task that writes them onto the
//! shared audio track; when the mic is toggled off the callback substitutes
//! silence so packet timing is preserved.
//!
//! Video and screen frames are produced by the embedding application, which
//! writes encoded samples onto [`LocalTrack::rtp`] directly. Headless hosts
//! have no display picker, so screen acquisition is refused here.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample as CpalSample, SampleFormat, SizedSample};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;

use crate::error::{Error, Result};
use crate::media::{LocalStream, LocalTrack, MediaConstraints, MediaSource};

pub struct DeviceMediaSource;

impl DeviceMediaSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DeviceMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn open_capture(&self, constraints: &MediaConstraints) -> Result<Arc<LocalStream>> {
        debug!(
            width = constraints.width,
            height = constraints.height,
            frame_rate = constraints.frame_rate,
            "opening device capture"
        );
        let audio = Arc::new(LocalTrack::audio("local"));
        let video = Arc::new(LocalTrack::video("local"));
        start_audio_capture(Arc::clone(&audio)).await?;
        Ok(Arc::new(LocalStream::new(audio, video)))
    }

    async fn open_screen(&self) -> Result<Arc<LocalTrack>> {
        // No display picker on a headless host.
        Err(Error::ScreenShareDenied)
    }
}

/// Spawn the capture thread and wait for it to report whether the device
/// opened. The thread keeps running until the track ends.
async fn start_audio_capture(track: Arc<LocalTrack>) -> Result<()> {
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
    let (pcm_tx, mut pcm_rx) = mpsc::channel::<Sample>(64);
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    let callback_track = Arc::clone(&track);
    std::thread::Builder::new()
        .name("audio-capture".into())
        .spawn(move || {
            let stream = match build_capture_stream(callback_track, pcm_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(Error::MediaAccess(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            // Park until the track is stopped; the stream drops with us.
            let _ = stop_rx.recv();
            info!("audio capture thread exiting");
        })
        .map_err(|e| Error::MediaAccess(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| Error::MediaAccess("audio capture thread died during setup".into()))??;

    let writer_track = Arc::clone(&track);
    tokio::spawn(async move {
        while let Some(sample) = pcm_rx.recv().await {
            if writer_track.is_ended() {
                break;
            }
            if let Err(e) = writer_track.rtp().write_sample(&sample).await {
                warn!("failed to write audio sample: {e}");
            }
        }
    });

    tokio::spawn(async move {
        track.ended().await;
        let _ = stop_tx.send(());
    });

    Ok(())
}

fn build_capture_stream(
    track: Arc<LocalTrack>,
    pcm_tx: mpsc::Sender<Sample>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaAccess("no input device available".into()))?;
    let config = device
        .default_input_config()
        .map_err(|e| Error::MediaAccess(e.to_string()))?;
    info!(
        device = device.name().unwrap_or_else(|_| "unknown".into()),
        config = ?config,
        "input device opened"
    );

    match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config.into(), track, pcm_tx),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config.into(), track, pcm_tx),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config.into(), track, pcm_tx),
        format => Err(Error::MediaAccess(format!(
            "unsupported sample format: {format:?}"
        ))),
    }
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    track: Arc<LocalTrack>,
    pcm_tx: mpsc::Sender<Sample>,
) -> Result<cpal::Stream>
where
    T: SizedSample + CpalSample<Float = f32> + Send + 'static,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let err_fn = |err| error!("input audio stream error: {err}");

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let frames = data.len() / channels.max(1);
                if frames == 0 {
                    return;
                }
                let enabled = track.is_enabled();
                let mut pcm = Vec::with_capacity(data.len() * 2);
                for sample in data {
                    let value = if enabled {
                        sample.to_float_sample()
                    } else {
                        0.0
                    };
                    let quantized = (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    pcm.extend_from_slice(&quantized.to_le_bytes());
                }
                let sample = Sample {
                    data: Bytes::from(pcm),
                    duration: Duration::from_secs_f64(frames as f64 / sample_rate as f64),
                    timestamp: SystemTime::now(),
                    ..Default::default()
                };
                // Dropped samples on a full queue are preferable to
                // blocking the audio callback.
                if pcm_tx.try_send(sample).is_err() {
                    debug!("audio sample queue full, dropping");
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::MediaAccess(e.to_string()))?;
    Ok(stream)
}
