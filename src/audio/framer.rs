//! # Audio Framing
//!
//! The browser sends audio in whatever chunk size its capture node produces
//! (Float32 little-endian samples). Opus needs exactly `frame_samples` samples per
//! call, so the [`AudioFramer`] accumulates incoming samples and hands out complete
//! 16-bit frames in arrival order. Anything short of a frame stays buffered until
//! more audio arrives, the client asks for it explicitly, or the session ends.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::VecDeque;
use std::io::Cursor;

const F32_BYTES: usize = 4;

/// Splits a browser audio stream into fixed-size PCM16 frames.
#[derive(Debug)]
pub struct AudioFramer {
    frame_samples: usize,

    /// Samples waiting for a complete frame, already scaled to i16.
    pending: VecDeque<i16>,

    /// Bytes of a sample split across two browser messages.
    carry: Vec<u8>,
}

impl AudioFramer {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples,
            pending: VecDeque::with_capacity(frame_samples * 2),
            carry: Vec::with_capacity(F32_BYTES),
        }
    }

    /// Append a chunk of Float32 LE samples and return every frame it completes.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<i16>> {
        let bytes: Vec<u8> = if self.carry.is_empty() {
            data.to_vec()
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(data);
            joined
        };

        let whole = bytes.len() - bytes.len() % F32_BYTES;
        self.carry.extend_from_slice(&bytes[whole..]);

        let mut cursor = Cursor::new(&bytes[..whole]);
        while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
            self.pending.push_back(float_to_pcm(sample));
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            frames.push(self.pending.drain(..self.frame_samples).collect());
        }
        frames
    }

    /// Zero-pad the held remainder into one final frame, if there is one.
    pub fn flush(&mut self) -> Option<Vec<i16>> {
        self.carry.clear();
        if self.pending.is_empty() {
            return None;
        }
        let mut frame: Vec<i16> = self.pending.drain(..).collect();
        frame.resize(self.frame_samples, 0);
        Some(frame)
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.carry.clear();
    }

    /// Samples currently held back waiting for a full frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Scale a [-1.0, 1.0] sample to i16, clamping out-of-range input.
pub fn float_to_pcm(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

#[cfg(test)]
pub(crate) fn f32_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
