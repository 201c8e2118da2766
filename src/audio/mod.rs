//! # Audio Conversion
//!
//! Everything between the browser's raw samples and the backend's Opus frames.
//!
//! ## Key Components:
//! - **Codec**: per-session Opus encoder/decoder behind small traits
//! - **Framer**: turns arbitrary Float32 chunks into fixed-size PCM16 frames
//! - **Playback**: wraps decoded PCM into chunks the browser can play
//!
//! ## Audio Format (backend link):
//! - **Codec**: Opus, VOIP application
//! - **Sample Rate**: 16kHz
//! - **Channels**: Mono
//! - **Frame**: 960 samples (60 ms)

pub mod codec;
pub mod framer;
pub mod playback;

pub use codec::{CodecFactory, FrameDecoder, FrameEncoder, OpusCodecFactory, SharedCodecFactory};
pub use framer::AudioFramer;
pub use playback::PlaybackEncoder;
