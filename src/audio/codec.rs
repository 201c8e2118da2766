//! # Audio Codec Adapter
//!
//! Encode/decode boundary between browser PCM and the backend's Opus frames.
//! The proxy only ever talks to the [`FrameEncoder`] / [`FrameDecoder`] traits; a
//! [`CodecFactory`] hands every session its own instances, because Opus keeps
//! inter-frame state that must not leak between sessions.

use crate::config::AudioConfig;
use crate::error::CodecError;
use opus::{Application, Channels};
use std::sync::Arc;

/// Largest Opus packet we ever produce (RFC 6716 recommends 4000 bytes).
const MAX_PACKET_BYTES: usize = 4000;

/// Largest decoded frame: 120 ms at 48 kHz.
const MAX_DECODED_SAMPLES: usize = 5760;

/// Turns one fixed-size PCM frame into one encoded frame.
pub trait FrameEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;

    /// Samples (per channel) the encoder expects per call.
    fn frame_samples(&self) -> usize;
}

/// Turns one encoded frame back into PCM.
pub trait FrameDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError>;
}

/// Creates fresh codec instances for a session.
pub trait CodecFactory: Send + Sync {
    fn encoder(&self) -> Result<Box<dyn FrameEncoder>, CodecError>;
    fn decoder(&self) -> Result<Box<dyn FrameDecoder>, CodecError>;
}

pub type SharedCodecFactory = Arc<dyn CodecFactory>;

/// Opus codec configured from [`AudioConfig`] (16 kHz mono VOIP by default).
#[derive(Debug, Clone)]
pub struct OpusCodecFactory {
    sample_rate: u32,
    channels: u8,
    frame_samples: usize,
}

impl OpusCodecFactory {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_samples: config.frame_samples,
        }
    }

    fn opus_channels(&self) -> Result<Channels, CodecError> {
        match self.channels {
            1 => Ok(Channels::Mono),
            2 => Ok(Channels::Stereo),
            other => Err(CodecError::UnsupportedChannels(other)),
        }
    }

    fn check_sample_rate(&self) -> Result<(), CodecError> {
        match self.sample_rate {
            8000 | 12000 | 16000 | 24000 | 48000 => Ok(()),
            other => Err(CodecError::UnsupportedSampleRate(other)),
        }
    }
}

impl CodecFactory for OpusCodecFactory {
    fn encoder(&self) -> Result<Box<dyn FrameEncoder>, CodecError> {
        self.check_sample_rate()?;
        let encoder = opus::Encoder::new(self.sample_rate, self.opus_channels()?, Application::Voip)
            .map_err(|e| CodecError::Encode(format!("failed to create Opus encoder: {}", e)))?;

        Ok(Box::new(OpusFrameEncoder {
            encoder,
            frame_samples: self.frame_samples,
            channels: self.channels as usize,
            packet: vec![0u8; MAX_PACKET_BYTES],
        }))
    }

    fn decoder(&self) -> Result<Box<dyn FrameDecoder>, CodecError> {
        self.check_sample_rate()?;
        let decoder = opus::Decoder::new(self.sample_rate, self.opus_channels()?)
            .map_err(|e| CodecError::Decode(format!("failed to create Opus decoder: {}", e)))?;

        Ok(Box::new(OpusFrameDecoder {
            decoder,
            channels: self.channels as usize,
            pcm: vec![0i16; MAX_DECODED_SAMPLES * self.channels as usize],
        }))
    }
}

struct OpusFrameEncoder {
    encoder: opus::Encoder,
    frame_samples: usize,
    channels: usize,
    packet: Vec<u8>,
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let expected = self.frame_samples * self.channels;
        if pcm.len() != expected {
            return Err(CodecError::InvalidFrameSize {
                expected,
                actual: pcm.len(),
            });
        }

        let len = self
            .encoder
            .encode(pcm, &mut self.packet)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(self.packet[..len].to_vec())
    }

    fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

struct OpusFrameDecoder {
    decoder: opus::Decoder,
    channels: usize,
    pcm: Vec<i16>,
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::Decode("empty frame".to_string()));
        }

        let samples = self
            .decoder
            .decode(frame, &mut self.pcm, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(self.pcm[..samples * self.channels].to_vec())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-in codec for session tests.
    //!
    //! "Encoding" tags the frame with `b"ENC"` followed by the little-endian samples;
    //! "decoding" strips the tag. Frames without the tag fail to decode.

    use super::*;

    pub const TAG: &[u8] = b"ENC";

    pub struct TaggingCodecFactory {
        pub frame_samples: usize,
    }

    impl CodecFactory for TaggingCodecFactory {
        fn encoder(&self) -> Result<Box<dyn FrameEncoder>, CodecError> {
            Ok(Box::new(TaggingEncoder { frame_samples: self.frame_samples }))
        }

        fn decoder(&self) -> Result<Box<dyn FrameDecoder>, CodecError> {
            Ok(Box::new(TaggingDecoder))
        }
    }

    struct TaggingEncoder {
        frame_samples: usize,
    }

    impl FrameEncoder for TaggingEncoder {
        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
            if pcm.len() != self.frame_samples {
                return Err(CodecError::InvalidFrameSize {
                    expected: self.frame_samples,
                    actual: pcm.len(),
                });
            }
            let mut out = TAG.to_vec();
            out.extend(pcm.iter().flat_map(|s| s.to_le_bytes()));
            Ok(out)
        }

        fn frame_samples(&self) -> usize {
            self.frame_samples
        }
    }

    struct TaggingDecoder;

    impl FrameDecoder for TaggingDecoder {
        fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError> {
            let body = frame
                .strip_prefix(TAG)
                .ok_or_else(|| CodecError::Decode("missing tag".to_string()))?;
            if body.len() % 2 != 0 {
                return Err(CodecError::Decode("odd payload length".to_string()));
            }
            Ok(body
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> OpusCodecFactory {
        OpusCodecFactory::new(&crate::config::AppConfig::default().audio)
    }

    #[test]
    fn test_opus_frame_decodes_to_full_frame() {
        let factory = factory();
        let mut encoder = factory.encoder().unwrap();
        let mut decoder = factory.decoder().unwrap();

        let pcm: Vec<i16> = (0..960)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();
        let packet = encoder.encode(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < MAX_PACKET_BYTES);

        let decoded = decoder.decode(&packet).unwrap();
        assert_eq!(decoded.len(), 960);
    }

    #[test]
    fn test_wrong_frame_size_is_rejected() {
        let mut encoder = factory().encoder().unwrap();
        let err = encoder.encode(&[0i16; 100]).unwrap_err();
        assert_eq!(err, CodecError::InvalidFrameSize { expected: 960, actual: 100 });
    }

    #[test]
    fn test_empty_frame_is_a_decode_error() {
        let mut decoder = factory().decoder().unwrap();
        assert!(matches!(decoder.decode(&[]), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_unsupported_sample_rate() {
        let mut audio = crate::config::AppConfig::default().audio;
        audio.sample_rate = 44100;
        let factory = OpusCodecFactory::new(&audio);
        assert!(matches!(
            factory.encoder().err(),
            Some(CodecError::UnsupportedSampleRate(44100))
        ));
    }
}
