use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

/// Samples retained for the analysis tap. Larger than any sensible analysis
/// window so the analyser always reads the most recent audio.
pub const ANALYSIS_TAP_LEN: usize = 2048;

/// Outbound frame fan-out capacity (~1 s of 20 ms frames).
const FRAME_FANOUT: usize = 50;

/// The outbound microphone track.
///
/// Cheap to clone; every clone refers to the same track. The capture backend
/// pushes processed PCM through [`LocalAudioTrack::push`], which feeds both
/// the analysis tap and every subscriber (one per attached peer link). When
/// the track is disabled it still produces frames, but silent ones, so the
/// attached connections stay up while muted.
#[derive(Clone)]
pub struct LocalAudioTrack {
    inner: Arc<TrackShared>,
}

struct TrackShared {
    enabled: AtomicBool,
    sample_rate: u32,
    frames: broadcast::Sender<Arc<[f32]>>,
    tap: Mutex<VecDeque<f32>>,
}

impl LocalAudioTrack {
    pub fn new(sample_rate: u32) -> Self {
        let (frames, _) = broadcast::channel(FRAME_FANOUT);
        Self {
            inner: Arc::new(TrackShared {
                enabled: AtomicBool::new(true),
                sample_rate,
                frames,
                tap: Mutex::new(VecDeque::with_capacity(ANALYSIS_TAP_LEN)),
            }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    /// Receive every frame pushed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<[f32]>> {
        self.inner.frames.subscribe()
    }

    /// Publish a processed capture frame.
    pub fn push(&self, samples: &[f32]) {
        let frame: Arc<[f32]> = if self.is_enabled() {
            Arc::from(samples)
        } else {
            Arc::from(vec![0.0f32; samples.len()])
        };

        {
            let mut tap = self.inner.tap.lock();
            tap.extend(frame.iter().copied());
            let excess = tap.len().saturating_sub(ANALYSIS_TAP_LEN);
            tap.drain(..excess);
        }

        // No subscribers simply means no peer is attached yet.
        let _ = self.inner.frames.send(frame);
    }

    /// Copy the most recent `out.len()` samples into `out`, zero-filling the
    /// front when the tap holds fewer.
    pub fn read_window(&self, out: &mut [f32]) {
        let tap = self.inner.tap.lock();
        let take = out.len().min(tap.len());
        let pad = out.len() - take;
        out[..pad].fill(0.0);
        for (dst, src) in out[pad..].iter_mut().zip(tap.iter().skip(tap.len() - take)) {
            *dst = *src;
        }
    }
}

/// Backend-specific capture resource. Stopping releases the device.
pub trait CaptureStream: Send {
    fn stop(&mut self);
}

/// Exclusive handle on the acquired microphone.
///
/// Owns the capture backend and the outbound track. `release()` is
/// idempotent and also runs on drop.
pub struct LocalAudio {
    track: LocalAudioTrack,
    stream: Option<Box<dyn CaptureStream>>,
    device_errors: Option<mpsc::UnboundedReceiver<String>>,
}

impl LocalAudio {
    pub fn new(
        track: LocalAudioTrack,
        stream: Box<dyn CaptureStream>,
        device_errors: Option<mpsc::UnboundedReceiver<String>>,
    ) -> Self {
        Self {
            track,
            stream: Some(stream),
            device_errors,
        }
    }

    pub fn track(&self) -> &LocalAudioTrack {
        &self.track
    }

    /// Runtime device failures (e.g. microphone unplugged). The receiver can
    /// be taken once.
    pub fn take_device_errors(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.device_errors.take()
    }

    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }

    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            self.track.set_enabled(false);
            tracing::info!("local audio released");
        }
    }
}

impl Drop for LocalAudio {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingStream(Arc<std::sync::atomic::AtomicUsize>);

    impl CaptureStream for CountingStream {
        fn stop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn disabled_track_emits_silence() {
        let track = LocalAudioTrack::new(48000);
        let mut rx = track.subscribe();
        track.set_enabled(false);
        track.push(&[0.5; 4]);
        let frame = rx.try_recv().unwrap();
        assert!(frame.iter().all(|s| *s == 0.0));

        let mut window = [1.0f32; 4];
        track.read_window(&mut window);
        assert_eq!(window, [0.0; 4]);
    }

    #[test]
    fn read_window_takes_latest_samples() {
        let track = LocalAudioTrack::new(48000);
        track.push(&[0.1, 0.2, 0.3]);
        let mut window = [9.0f32; 5];
        track.read_window(&mut window);
        assert_eq!(window, [0.0, 0.0, 0.1, 0.2, 0.3]);

        let mut short = [0.0f32; 2];
        track.read_window(&mut short);
        assert_eq!(short, [0.2, 0.3]);
    }

    #[test]
    fn tap_is_bounded() {
        let track = LocalAudioTrack::new(48000);
        for _ in 0..10 {
            track.push(&[0.25; 1000]);
        }
        assert_eq!(track.inner.tap.lock().len(), ANALYSIS_TAP_LEN);
    }

    #[test]
    fn release_is_idempotent() {
        let stops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut audio = LocalAudio::new(
            LocalAudioTrack::new(48000),
            Box::new(CountingStream(Arc::clone(&stops))),
            None,
        );
        audio.release();
        audio.release();
        assert!(audio.is_released());
        drop(audio);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
