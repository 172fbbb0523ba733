use crate::analyser::LevelAnalyser;
use crate::config::ActivityConfig;
use crate::track::LocalAudioTrack;

/// Speaking decision shared by the local loop and remote samples.
///
/// Strictly greater-than: a level equal to the threshold is silence.
pub fn is_speaking(level: f32, threshold: f32) -> bool {
    level > threshold
}

/// One tick of the local activity loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityReading {
    pub level: f32,
    pub speaking: bool,
    /// Whether this reading should be broadcast to peers.
    pub broadcast: bool,
}

/// Local voice-activity detection over the capture track's analysis tap.
///
/// Readings above the broadcast floor are flagged for broadcast so near
/// silence does not flood the relay. A flip of the speaking flag is always
/// flagged, otherwise peers would keep showing a speaker who went quiet.
pub struct ActivityMonitor {
    analyser: LevelAnalyser,
    window: Vec<f32>,
    speaking_threshold: f32,
    broadcast_floor: f32,
    last_speaking: bool,
}

impl ActivityMonitor {
    pub fn new(config: &ActivityConfig) -> Self {
        let analyser = LevelAnalyser::new(config.fft_size, config.smoothing);
        let window = vec![0.0; analyser.fft_size()];
        Self {
            analyser,
            window,
            speaking_threshold: config.speaking_threshold,
            broadcast_floor: config.broadcast_floor,
            last_speaking: false,
        }
    }

    pub fn sample(&mut self, track: &LocalAudioTrack) -> ActivityReading {
        track.read_window(&mut self.window);
        let level = self.analyser.analyse(&self.window);
        self.evaluate(level)
    }

    fn evaluate(&mut self, level: f32) -> ActivityReading {
        let speaking = is_speaking(level, self.speaking_threshold);
        let flipped = speaking != self.last_speaking;
        self.last_speaking = speaking;
        ActivityReading {
            level,
            speaking,
            broadcast: level > self.broadcast_floor || flipped,
        }
    }

    pub fn reset(&mut self) {
        self.analyser.reset();
        self.last_speaking = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaking_threshold_is_strict() {
        assert!(!is_speaking(0.1, 0.15));
        assert!(!is_speaking(0.15, 0.15));
        assert!(is_speaking(0.150_01, 0.15));
        assert!(is_speaking(0.9, 0.15));
    }

    #[test]
    fn near_silence_is_not_broadcast() {
        let mut monitor = ActivityMonitor::new(&ActivityConfig::default());
        let reading = monitor.evaluate(0.04);
        assert!(!reading.speaking);
        assert!(!reading.broadcast);

        let reading = monitor.evaluate(0.08);
        assert!(!reading.speaking);
        assert!(reading.broadcast);
    }

    #[test]
    fn falling_silent_is_broadcast_once() {
        let mut monitor = ActivityMonitor::new(&ActivityConfig::default());
        assert!(monitor.evaluate(0.6).broadcast);

        let quiet = monitor.evaluate(0.01);
        assert!(!quiet.speaking);
        assert!(quiet.broadcast);

        assert!(!monitor.evaluate(0.01).broadcast);
    }

    #[test]
    fn silent_track_reads_zero() {
        let track = LocalAudioTrack::new(48000);
        track.push(&[0.0; 512]);
        let mut monitor = ActivityMonitor::new(&ActivityConfig::default());
        let reading = monitor.sample(&track);
        assert_eq!(reading.level, 0.0);
        assert!(!reading.broadcast);
    }
}
