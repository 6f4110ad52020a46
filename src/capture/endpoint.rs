//! End-of-utterance detection with WebRTC VAD
//!
//! Mono frames from the microphone are cut into 30ms i16 frames at a rate
//! the VAD supports (device audio at other rates is resampled to 16kHz
//! first) and classified as voice or not. The utterance completes after a
//! run of non-voice frames that follows speech, or when it hits the length
//! cap. If no speech shows up before the no-speech timeout the capture is
//! abandoned.
//!
//! `Vad` wraps a raw C handle and is not `Send`; an `Endpointer` is built
//! and used on one thread.

use rubato::{FftFixedIn, Resampler as _};
use serde::{Deserialize, Serialize};
use webrtc_vad::{SampleRate, Vad, VadMode};

use super::CaptureError;

/// WebRTC VAD supports only 10/20/30ms frames
const VAD_FRAME_MS: u64 = 30;

/// Rate device audio is resampled to when the VAD can't take it directly
const FALLBACK_VAD_RATE: u32 = 16_000;

/// 10ms at 44.1kHz
const RESAMPLE_CHUNK: usize = 441;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// VAD aggressiveness, 0 (quality) to 3 (very aggressive)
    pub vad_mode: u8,
    /// Silence after speech that ends the utterance
    pub end_silence_ms: u64,
    /// Give up if nobody speaks for this long
    pub no_speech_timeout_ms: u64,
    /// Hard cap on utterance length
    pub max_utterance_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            // Aggressive mode keeps steady background noise from counting as speech
            vad_mode: 3,
            end_silence_ms: 1200,
            no_speech_timeout_ms: 8000,
            max_utterance_ms: 60_000,
        }
    }
}

impl EndpointConfig {
    fn mode(&self) -> VadMode {
        match self.vad_mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Continue,
    Complete,
    NoSpeech,
}

/// Voice/non-voice decision for one fixed-size i16 frame.
pub trait SpeechClassifier {
    fn is_speech(&mut self, frame: &[i16]) -> bool;
}

impl SpeechClassifier for Vad {
    fn is_speech(&mut self, frame: &[i16]) -> bool {
        self.is_voice_segment(frame).unwrap_or(false)
    }
}

fn vad_rate_for(device_rate: u32) -> u32 {
    match device_rate {
        8_000 | 16_000 | 32_000 | 48_000 => device_rate,
        _ => FALLBACK_VAD_RATE,
    }
}

pub struct Endpointer<C = Vad> {
    config: EndpointConfig,
    classifier: C,
    input_rate: u32,
    resampler: Option<FftFixedIn<f32>>,
    /// Device samples waiting for a full resampler chunk
    pending: Vec<f32>,
    frame: Vec<i16>,
    frame_len: usize,
    heard_speech: bool,
    elapsed_ms: f64,
    silence_ms: u64,
}

impl Endpointer<Vad> {
    pub fn new(config: EndpointConfig, sample_rate: u32) -> Result<Self, CaptureError> {
        let vad_rate = vad_rate_for(sample_rate);
        let rate = SampleRate::try_from(vad_rate as i32)
            .map_err(|_| CaptureError::Device(format!("Unsupported VAD rate {}Hz", vad_rate)))?;
        let vad = Vad::new_with_rate_and_mode(rate, config.mode());
        Self::with_classifier(config, sample_rate, vad)
    }
}

impl<C: SpeechClassifier> Endpointer<C> {
    pub fn with_classifier(
        config: EndpointConfig,
        sample_rate: u32,
        classifier: C,
    ) -> Result<Self, CaptureError> {
        if sample_rate == 0 {
            return Err(CaptureError::Device("input sample rate is 0".to_string()));
        }
        let vad_rate = vad_rate_for(sample_rate);

        let resampler = if vad_rate == sample_rate {
            None
        } else {
            log::debug!("VAD: resampling {}Hz input to {}Hz", sample_rate, vad_rate);
            let resampler = FftFixedIn::<f32>::new(
                sample_rate as usize,
                vad_rate as usize,
                RESAMPLE_CHUNK,
                1,
                1,
            )
            .map_err(|e| CaptureError::Device(format!("Failed to build resampler: {}", e)))?;
            Some(resampler)
        };

        let frame_len = (vad_rate as u64 * VAD_FRAME_MS / 1000) as usize;
        Ok(Self {
            config,
            classifier,
            input_rate: sample_rate,
            resampler,
            pending: Vec::new(),
            frame: Vec::with_capacity(frame_len),
            frame_len,
            heard_speech: false,
            elapsed_ms: 0.0,
            silence_ms: 0,
        })
    }

    pub fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    pub fn push(&mut self, input: &[f32]) -> Endpoint {
        if input.is_empty() {
            return Endpoint::Continue;
        }

        // Timing follows the device clock, not the resampled stream
        self.elapsed_ms += input.len() as f64 * 1000.0 / self.input_rate as f64;

        if let Some(resampler) = self.resampler.as_mut() {
            self.pending.extend_from_slice(input);
            let mut resampled = Vec::new();
            loop {
                let need = resampler.input_frames_next();
                if self.pending.len() < need {
                    break;
                }
                let chunk: Vec<f32> = self.pending.drain(..need).collect();
                match resampler.process(&[chunk], None) {
                    Ok(out) => {
                        if let Some(channel) = out.first() {
                            resampled.extend_from_slice(channel);
                        }
                    }
                    Err(e) => {
                        log::warn!("VAD resampling failed: {}", e);
                        break;
                    }
                }
            }
            self.classify(&resampled);
        } else {
            self.classify(input);
        }

        let elapsed = self.elapsed_ms;
        if elapsed >= self.config.max_utterance_ms as f64 {
            return if self.heard_speech {
                Endpoint::Complete
            } else {
                Endpoint::NoSpeech
            };
        }

        if self.heard_speech {
            if self.silence_ms >= self.config.end_silence_ms {
                return Endpoint::Complete;
            }
        } else if elapsed >= self.config.no_speech_timeout_ms as f64 {
            return Endpoint::NoSpeech;
        }

        Endpoint::Continue
    }

    fn classify(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.frame.push(to_i16(sample));
            if self.frame.len() < self.frame_len {
                continue;
            }
            if self.classifier.is_speech(&self.frame) {
                self.heard_speech = true;
                self.silence_ms = 0;
            } else {
                self.silence_ms += VAD_FRAME_MS;
            }
            self.frame.clear();
        }
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
