//! Chunk decoding via symphonia

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::{AudioBuffer, PlaybackError};

pub trait AudioDecoder: Send {
    fn decode(&self, bytes: Vec<u8>) -> Result<AudioBuffer, PlaybackError>;
}

/// Probes the container (MP3, WAV, OGG, ...) and decodes the first audio track.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl AudioDecoder for SymphoniaDecoder {
    fn decode(&self, bytes: Vec<u8>) -> Result<AudioBuffer, PlaybackError> {
        if bytes.is_empty() {
            return Err(PlaybackError::Decode("empty chunk".to_string()));
        }

        let source = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &Hint::new(),
                source,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PlaybackError::Decode("no audio track".to_string()))?;
        let track_id = track.id;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;

        let mut samples = Vec::new();
        let mut layout: Option<(u32, u16)> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(PlaybackError::Decode(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                    layout.get_or_insert((spec.rate, spec.channels.count() as u16));
                }
                // A corrupt frame is skipped, the rest of the chunk still plays
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("Skipping undecodable packet: {}", e);
                }
                Err(e) => return Err(PlaybackError::Decode(e.to_string())),
            }
        }

        let Some((sample_rate, channels)) = layout else {
            return Err(PlaybackError::Decode("no audio frames".to_string()));
        };
        if samples.is_empty() || channels == 0 {
            return Err(PlaybackError::Decode("no audio frames".to_string()));
        }

        Ok(AudioBuffer {
            samples,
            sample_rate,
            channels,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    /// In-memory mono 16-bit WAV with `frames` samples of a ramp.
    pub(crate) fn wav_bytes(frames: usize, sample_rate: u32) -> Vec<u8> {
        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..frames {
                writer.write_sample(((i % 100) as i16) * 100).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decodes_wav_chunk() {
        let buffer = SymphoniaDecoder.decode(wav_bytes(1600, 16_000)).unwrap();
        assert_eq!(buffer.sample_rate, 16_000);
        assert_eq!(buffer.channels, 1);
        assert_eq!(buffer.frames(), 1600);
        assert_eq!(buffer.duration_ms(), 100);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = SymphoniaDecoder
            .decode(b"definitely not audio".to_vec())
            .unwrap_err();
        assert!(matches!(err, PlaybackError::Decode(_)));
    }

    #[test]
    fn test_rejects_empty_chunk() {
        assert!(SymphoniaDecoder.decode(Vec::new()).is_err());
    }
}
