//! Microphone recorder using CPAL for capture and hound for WAV writing
//!
//! Each recording runs on its own thread, which owns the (non-`Send`) cpal
//! stream. Samples are written to a WAV file and also forwarded as mono f32
//! frames for endpointing.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, Stream, StreamConfig};
use hound::{WavSpec, WavWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::paths::generate_wav_path;
use super::CaptureError;

type SharedWriter = Arc<Mutex<Option<WavWriter<BufWriter<File>>>>>;

/// Log every this many dropped endpointer frames
const DROP_LOG_INTERVAL: u64 = 100;

/// Handle to a running recording. Dropping it without `stop` discards the
/// recording thread's result but still finalizes the file.
pub struct MicRecording {
    stop_tx: std_mpsc::Sender<()>,
    done_rx: std_mpsc::Receiver<Result<PathBuf, CaptureError>>,
    sample_rate: u32,
}

impl MicRecording {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Stop recording and finalize the WAV file. Blocks until the audio
    /// thread has released the device.
    pub fn stop(self) -> Result<PathBuf, CaptureError> {
        let _ = self.stop_tx.send(());
        self.done_rx
            .recv()
            .map_err(|_| CaptureError::Device("recording thread exited".to_string()))?
    }
}

/// Default input device capture.
pub struct MicCapture;

impl MicCapture {
    pub fn is_available() -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    /// Start recording to a new WAV file; mono frames go to `frames`.
    pub fn start(
        capture_id: u64,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<MicRecording, CaptureError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<u32, CaptureError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (done_tx, done_rx) = std_mpsc::sync_channel::<Result<PathBuf, CaptureError>>(1);

        std::thread::Builder::new()
            .name(format!("pitchiq-mic-{}", capture_id))
            .spawn(move || {
                let dropped = Arc::new(AtomicU64::new(0));
                let (stream, writer, wav_path, sample_rate) =
                    match open(capture_id, frames, dropped.clone()) {
                        Ok(parts) => parts,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(sample_rate));

                // Runs until stop() or until the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);

                let dropped = dropped.load(Ordering::Relaxed);
                if dropped > 0 {
                    log::warn!(
                        "Capture {}: endpointer fell behind, {} frames dropped",
                        capture_id,
                        dropped
                    );
                }
                let result = finalize(&writer, wav_path);
                let _ = done_tx.send(result);
            })
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| CaptureError::Device("recording thread exited".to_string()))??;

        Ok(MicRecording {
            stop_tx,
            done_rx,
            sample_rate,
        })
    }
}

fn open(
    capture_id: u64,
    frames: mpsc::Sender<Vec<f32>>,
    dropped: Arc<AtomicU64>,
) -> Result<(Stream, SharedWriter, PathBuf, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = device.default_input_config().map_err(device_error)?;
    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let wav_path = generate_wav_path(capture_id).map_err(|e| CaptureError::Device(e.to_string()))?;
    let spec = WavSpec {
        channels: config.channels,
        sample_rate: config.sample_rate.0,
        bits_per_sample: 16, // Always write as 16-bit
        sample_format: hound::SampleFormat::Int,
    };
    let writer = WavWriter::create(&wav_path, spec)
        .map_err(|e| CaptureError::Device(format!("Failed to create WAV file: {}", e)))?;
    let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, writer.clone(), frames, dropped),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, writer.clone(), frames, dropped),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, writer.clone(), frames, dropped),
        other => Err(CaptureError::Device(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }?;

    stream.play().map_err(device_error)?;
    log::info!("Recording started: {:?}", wav_path);

    Ok((stream, writer, wav_path, config.sample_rate.0))
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    writer: SharedWriter,
    frames: mpsc::Sender<Vec<f32>>,
    dropped: Arc<AtomicU64>,
) -> Result<Stream, CaptureError>
where
    T: Sample + cpal::SizedSample + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let err_fn = |err: cpal::StreamError| log::error!("Audio input stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if let Ok(mut guard) = writer.lock() {
                    if let Some(w) = guard.as_mut() {
                        for &sample in data {
                            if w.write_sample(sample_to_i16(sample)).is_err() {
                                log::error!("Failed to write sample");
                                break;
                            }
                        }
                    }
                }

                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame
                            .iter()
                            .map(|&s| s.to_float_sample().to_sample::<f32>())
                            .sum::<f32>()
                            / frame.len() as f32
                    })
                    .collect();
                forward_frame(&frames, mono, &dropped);
            },
            err_fn,
            None,
        )
        .map_err(device_error)
}

/// Hand a mono frame to the endpointer without blocking the audio callback.
/// A full channel drops the frame and bumps `dropped`.
fn forward_frame(frames: &mpsc::Sender<Vec<f32>>, mono: Vec<f32>, dropped: &AtomicU64) {
    match frames.try_send(mono) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % DROP_LOG_INTERVAL == 0 {
                log::debug!("Endpointer frame channel full, {} frames dropped", total);
            }
        }
        // Listener is gone; the recording still runs until stop()
        Err(TrySendError::Closed(_)) => {}
    }
}

fn finalize(writer: &SharedWriter, wav_path: PathBuf) -> Result<PathBuf, CaptureError> {
    let taken = writer.lock().ok().and_then(|mut guard| guard.take());
    if let Some(w) = taken {
        w.finalize()
            .map_err(|e| CaptureError::Device(format!("Failed to write audio data: {}", e)))?;
    }
    log::info!("Recording stopped, WAV finalized: {:?}", wav_path);
    Ok(wav_path)
}

fn device_error(err: impl std::fmt::Display) -> CaptureError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::Device(message)
    }
}

/// Convert any sample type to i16 for WAV writing.
fn sample_to_i16<T: Sample>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample().to_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
