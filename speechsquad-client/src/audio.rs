//! Source audio clips.
//!
//! Clips keep the raw WAV bytes whole: the canonical 44-byte header rides in
//! the very first audio message of a stream, so only the fields needed for
//! configuration and pacing are parsed out of it. Only 16-bit LINEAR_PCM
//! files are accepted.

use std::sync::Arc;

use speechsquad_proto::pb::AudioEncoding;

use crate::coordinator::least_loaded_index;
use crate::dataset::ManifestEntry;
use crate::error::ClientError;

/// Canonical RIFF/WAVE header length used by the dataset files.
pub const FIXED_WAV_HEADER_LEN: usize = 44;

const WAVE_FORMAT_PCM: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

/// Parse the fixed header layout. Anything but 16-bit PCM RIFF is refused.
pub fn parse_wav_header(bytes: &[u8]) -> Result<WavHeader, ClientError> {
    if bytes.len() < FIXED_WAV_HEADER_LEN {
        return Err(ClientError::InvalidArg(
            "file is shorter than a wav header".to_string(),
        ));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(ClientError::Unsupported("not a RIFF wave file".to_string()));
    }
    let audio_format = u16::from_le_bytes([bytes[20], bytes[21]]);
    if audio_format != WAVE_FORMAT_PCM {
        return Err(ClientError::Unsupported(
            "only LINEAR_PCM wave data is supported".to_string(),
        ));
    }
    let num_channels = u16::from_le_bytes([bytes[22], bytes[23]]);
    let sample_rate = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
    let bits_per_sample = u16::from_le_bytes([bytes[34], bytes[35]]);
    if bits_per_sample != 16 {
        return Err(ClientError::Unsupported(
            "only 16-bit samples are supported".to_string(),
        ));
    }
    Ok(WavHeader {
        num_channels,
        sample_rate,
        bits_per_sample,
    })
}

/// One spoken question, immutable after load and shared by every task that
/// iterates over it.
#[derive(Debug)]
pub struct AudioClip {
    pub data: Vec<u8>,
    pub filename: String,
    pub question_id: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: AudioEncoding,
}

impl AudioClip {
    pub fn load(path: &str, question_id: &str) -> Result<Self, ClientError> {
        let data = std::fs::read(path)
            .map_err(|e| ClientError::NotFound(format!("cannot read audio file {path}: {e}")))?;
        Self::from_bytes(data, path.to_string(), question_id.to_string())
    }

    pub fn from_bytes(
        data: Vec<u8>,
        filename: String,
        question_id: String,
    ) -> Result<Self, ClientError> {
        let header = parse_wav_header(&data)
            .map_err(|e| ClientError::InvalidArg(format!("{filename}: {e}")))?;
        Ok(Self {
            data,
            filename,
            question_id,
            sample_rate: header.sample_rate,
            channels: header.num_channels,
            encoding: AudioEncoding::LinearPcm,
        })
    }

    /// Seconds of audio represented by the sample payload.
    pub fn duration_secs(&self) -> f64 {
        let payload = self.data.len().saturating_sub(FIXED_WAV_HEADER_LEN);
        payload as f64 / (2.0 * self.sample_rate as f64)
    }
}

/// Load every clip named by the manifest, keeping only the ones the greedy
/// byte-balancing partition assigns to this process.
pub fn load_clips(
    entries: &[ManifestEntry],
    proc_index: usize,
    proc_count: usize,
) -> Result<Vec<Arc<AudioClip>>, ClientError> {
    let peers = proc_count.max(1);
    let mut allocated = vec![0u64; peers];
    let mut clips = Vec::new();
    for entry in entries {
        let clip = AudioClip::load(&entry.audio_filepath, &entry.id)?;
        let index = least_loaded_index(&allocated);
        allocated[index] += clip.data.len() as u64;
        if index == proc_index {
            clips.push(Arc::new(clip));
        }
    }
    Ok(clips)
}

/// A synthetic 16 kHz mono PCM clip used by tests.
#[cfg(test)]
pub(crate) fn test_clip(question_id: &str, duration_ms: u32) -> Arc<AudioClip> {
    let sample_rate = 16000u32;
    let samples = (sample_rate * duration_ms / 1000) as usize;
    let payload = samples * 2;
    let mut data = Vec::with_capacity(FIXED_WAV_HEADER_LEN + payload);
    data.extend_from_slice(b"RIFF");
    data.extend_from_slice(&((36 + payload) as u32).to_le_bytes());
    data.extend_from_slice(b"WAVE");
    data.extend_from_slice(b"fmt ");
    data.extend_from_slice(&16u32.to_le_bytes());
    data.extend_from_slice(&1u16.to_le_bytes()); // PCM
    data.extend_from_slice(&1u16.to_le_bytes()); // mono
    data.extend_from_slice(&sample_rate.to_le_bytes());
    data.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    data.extend_from_slice(&2u16.to_le_bytes());
    data.extend_from_slice(&16u16.to_le_bytes());
    data.extend_from_slice(b"data");
    data.extend_from_slice(&(payload as u32).to_le_bytes());
    data.resize(FIXED_WAV_HEADER_LEN + payload, 0);
    Arc::new(
        AudioClip::from_bytes(data, format!("{question_id}.wav"), question_id.to_string())
            .expect("test clip header is valid"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_header() {
        let clip = test_clip("q1", 500);
        let header = parse_wav_header(&clip.data).unwrap();
        assert_eq!(header.sample_rate, 16000);
        assert_eq!(header.num_channels, 1);
        assert_eq!(header.bits_per_sample, 16);
    }

    #[test]
    fn test_reject_short_file() {
        let err = parse_wav_header(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArg(_)));
    }

    #[test]
    fn test_reject_flac_and_non_pcm() {
        let clip = test_clip("q1", 100);
        let mut flac = clip.data.clone();
        flac[0..4].copy_from_slice(b"fLaC");
        assert!(matches!(
            parse_wav_header(&flac).unwrap_err(),
            ClientError::Unsupported(_)
        ));

        let mut mulaw = clip.data.clone();
        mulaw[20..22].copy_from_slice(&0x0007u16.to_le_bytes());
        assert!(matches!(
            parse_wav_header(&mulaw).unwrap_err(),
            ClientError::Unsupported(_)
        ));
    }

    #[test]
    fn test_duration_accounts_for_header() {
        let clip = test_clip("q1", 1000);
        assert!((clip.duration_secs() - 1.0).abs() < 1e-9);
    }
}
