//! Packaging of decoded backend audio into browser playback chunks.

use crate::config::PlaybackFormat;
use byteorder::{LittleEndian, WriteBytesExt};

pub const WAV_HEADER_LEN: usize = 44;

/// Builds one binary playback chunk per decoded frame.
#[derive(Debug, Clone)]
pub struct PlaybackEncoder {
    format: PlaybackFormat,
    sample_rate: u32,
    channels: u16,
}

impl PlaybackEncoder {
    pub fn new(format: PlaybackFormat, sample_rate: u32, channels: u8) -> Self {
        Self {
            format,
            sample_rate,
            channels: channels as u16,
        }
    }

    pub fn chunk(&self, pcm: &[i16]) -> Vec<u8> {
        let data_len = pcm.len() * 2;
        let header_len = match self.format {
            PlaybackFormat::Wav => WAV_HEADER_LEN,
            PlaybackFormat::Pcm => 0,
        };

        let mut out = Vec::with_capacity(header_len + data_len);
        if self.format == PlaybackFormat::Wav {
            self.write_wav_header(&mut out, data_len as u32);
        }
        for &sample in pcm {
            // Writing into a Vec cannot fail.
            let _ = out.write_i16::<LittleEndian>(sample);
        }
        out
    }

    /// Canonical 44-byte PCM16 RIFF/WAVE header.
    fn write_wav_header(&self, out: &mut Vec<u8>, data_len: u32) {
        let block_align = self.channels * 2;
        let byte_rate = self.sample_rate * block_align as u32;

        out.extend_from_slice(b"RIFF");
        let _ = out.write_u32::<LittleEndian>(36 + data_len);
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        let _ = out.write_u32::<LittleEndian>(16);
        let _ = out.write_u16::<LittleEndian>(1);
        let _ = out.write_u16::<LittleEndian>(self.channels);
        let _ = out.write_u32::<LittleEndian>(self.sample_rate);
        let _ = out.write_u32::<LittleEndian>(byte_rate);
        let _ = out.write_u16::<LittleEndian>(block_align);
        let _ = out.write_u16::<LittleEndian>(16);
        out.extend_from_slice(b"data");
        let _ = out.write_u32::<LittleEndian>(data_len);
    }
}
