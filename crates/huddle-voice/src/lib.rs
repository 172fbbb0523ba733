pub mod activity;
pub mod analyser;
pub mod audio_processing;
pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod playback;
pub mod synthetic;
pub mod track;

pub use activity::{is_speaking, ActivityMonitor, ActivityReading};
pub use analyser::LevelAnalyser;
pub use config::{ActivityConfig, AudioConfig, CaptureConstraints};
pub use device::{AudioDevice, AudioOutput, CpalAudioDevice, RemoteAudioStream};
pub use error::VoiceError;
pub use synthetic::{OutputProbe, SyntheticAudioDevice, SyntheticSignal};
pub use track::{CaptureStream, LocalAudio, LocalAudioTrack};
