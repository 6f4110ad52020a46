//! Audio output using CPAL
//!
//! The cpal `Stream` is not `Send`, so it lives on a dedicated thread for
//! the lifetime of the output. Buffers are converted to the device format
//! when pushed and appended to a shared render queue. The render callback
//! runs from the end of one buffer straight into the next within the same
//! period, reporting each finished buffer id through the finished sink, and
//! pads with silence only when the queue is empty.
//!
//! Opening the device blocks, so the call loop goes through
//! [`DeferredOutput`], which opens it on tokio's blocking pool and holds
//! pushed buffers until the device is ready.

use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler as _};

use super::{AudioBuffer, PlaybackError};

/// Receives the id of each buffer that rendered to completion.
pub type FinishedSink = Arc<dyn Fn(u64) + Send + Sync>;

/// Frames fed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// Something that renders buffers back to back.
pub trait AudioOutput: Send {
    /// Queue `buffer` to play right after everything already pushed.
    fn push(&mut self, buffer_id: u64, buffer: AudioBuffer) -> Result<(), PlaybackError>;
    /// Drop everything queued or rendering without reporting it finished.
    fn halt(&mut self);
}

struct Rendering {
    id: u64,
    samples: Vec<f32>,
    position: usize,
}

type RenderQueue = Arc<Mutex<VecDeque<Rendering>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Default output device, rendered from a dedicated audio thread.
pub struct CpalOutput {
    queue: RenderQueue,
    sample_rate: u32,
    channels: u16,
    shutdown: Option<std_mpsc::Sender<()>>,
}

impl CpalOutput {
    /// Open the default device. Blocks until the stream is playing.
    pub fn open(on_finished: FinishedSink) -> Result<Self, PlaybackError> {
        let queue: RenderQueue = Arc::default();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(u32, u16), PlaybackError>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_queue = queue.clone();
        std::thread::Builder::new()
            .name("pitchiq-playback".to_string())
            .spawn(move || {
                let stream = match build_stream(thread_queue, on_finished) {
                    Ok((stream, format)) => {
                        let _ = ready_tx.send(Ok(format));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until the output is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                log::debug!("Playback thread exiting");
            })
            .map_err(|e| PlaybackError::Output(e.to_string()))?;

        let (sample_rate, channels) = ready_rx
            .recv()
            .map_err(|_| PlaybackError::Output("playback thread exited".to_string()))??;

        log::info!(
            "Audio output ready: {} Hz, {} channels",
            sample_rate,
            channels
        );

        Ok(Self {
            queue,
            sample_rate,
            channels,
            shutdown: Some(shutdown_tx),
        })
    }
}

impl AudioOutput for CpalOutput {
    fn push(&mut self, buffer_id: u64, buffer: AudioBuffer) -> Result<(), PlaybackError> {
        let samples = match convert(&buffer, self.sample_rate, self.channels) {
            Ok(samples) => samples,
            Err(e) => {
                // An empty rendering still reports finished, so draining stays exact
                log::error!("Buffer {} could not be converted: {}", buffer_id, e);
                Vec::new()
            }
        };
        log::debug!(
            "Queued buffer {} ({} ms)",
            buffer_id,
            buffer.duration_ms()
        );
        lock(&self.queue).push_back(Rendering {
            id: buffer_id,
            samples,
            position: 0,
        });
        Ok(())
    }

    fn halt(&mut self) {
        lock(&self.queue).clear();
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.halt();
        // The audio thread drops the stream and exits on its own
        self.shutdown.take();
    }
}

enum Deferred {
    Opening(Vec<(u64, AudioBuffer)>),
    Ready(Box<dyn AudioOutput>),
    Failed,
    Closed,
}

/// An output whose device is still opening on a blocking thread.
///
/// Buffers pushed while it opens are handed over in order once it is
/// ready. If opening fails, `on_failed` is called unless the output was
/// already dropped.
pub struct DeferredOutput {
    state: Arc<Mutex<Deferred>>,
}

impl DeferredOutput {
    /// Must be called from within a tokio runtime.
    pub fn spawn<O, F>(open: O, on_failed: F) -> Self
    where
        O: FnOnce() -> Result<Box<dyn AudioOutput>, PlaybackError> + Send + 'static,
        F: FnOnce(PlaybackError) + Send + 'static,
    {
        let state = Arc::new(Mutex::new(Deferred::Opening(Vec::new())));
        let shared = state.clone();
        tokio::task::spawn_blocking(move || {
            let opened = open();
            let mut state = lock(&shared);
            match opened {
                Ok(mut output) => {
                    if let Deferred::Opening(pending) =
                        std::mem::replace(&mut *state, Deferred::Closed)
                    {
                        log::debug!("Output ready, {} buffer(s) waiting", pending.len());
                        for (id, buffer) in pending {
                            if let Err(e) = output.push(id, buffer) {
                                log::error!("Failed to queue buffer {}: {}", id, e);
                            }
                        }
                        *state = Deferred::Ready(output);
                    }
                }
                Err(e) => {
                    let dropped = matches!(*state, Deferred::Closed);
                    *state = Deferred::Failed;
                    drop(state);
                    if !dropped {
                        log::error!("Failed to open audio output: {}", e);
                        on_failed(e);
                    }
                }
            }
        });
        Self { state }
    }
}

impl AudioOutput for DeferredOutput {
    fn push(&mut self, buffer_id: u64, buffer: AudioBuffer) -> Result<(), PlaybackError> {
        match &mut *lock(&self.state) {
            Deferred::Opening(pending) => {
                pending.push((buffer_id, buffer));
                Ok(())
            }
            Deferred::Ready(output) => output.push(buffer_id, buffer),
            Deferred::Failed | Deferred::Closed => Err(PlaybackError::Output(
                "audio output is unavailable".to_string(),
            )),
        }
    }

    fn halt(&mut self) {
        match &mut *lock(&self.state) {
            Deferred::Opening(pending) => pending.clear(),
            Deferred::Ready(output) => output.halt(),
            Deferred::Failed | Deferred::Closed => {}
        }
    }
}

impl Drop for DeferredOutput {
    fn drop(&mut self) {
        // A device that finishes opening after this is closed right away
        *lock(&self.state) = Deferred::Closed;
    }
}

fn build_stream(
    queue: RenderQueue,
    on_finished: FinishedSink,
) -> Result<(Stream, (u32, u16)), PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(PlaybackError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::Output(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let format = (config.sample_rate.0, config.channels);

    let stream = match sample_format {
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, queue, on_finished),
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, queue, on_finished),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, queue, on_finished),
        other => Err(PlaybackError::Output(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| PlaybackError::Output(format!("Failed to start stream: {}", e)))?;

    Ok((stream, format))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queue: RenderQueue,
    on_finished: FinishedSink,
) -> Result<Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let err_fn = |err: cpal::StreamError| log::error!("Audio output stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                render(&queue, data, |id| on_finished(id));
            },
            err_fn,
            None,
        )
        .map_err(|e| PlaybackError::Output(e.to_string()))
}

/// Fill `data` from the render queue, moving straight on to the next buffer
/// when one runs out. `finished` gets each id that completed.
fn render<T, F>(queue: &RenderQueue, data: &mut [T], mut finished: F)
where
    T: SizedSample + FromSample<f32>,
    F: FnMut(u64),
{
    // Never block the audio thread; a contended queue renders silence
    let Ok(mut guard) = queue.try_lock() else {
        data.fill(T::EQUILIBRIUM);
        return;
    };

    let mut written = 0;
    while let Some(rendering) = guard.front_mut() {
        let remaining = &rendering.samples[rendering.position..];
        let count = remaining.len().min(data.len() - written);
        for (out, &sample) in data[written..written + count].iter_mut().zip(remaining) {
            *out = T::from_sample(sample);
        }
        rendering.position += count;
        written += count;

        if rendering.position < rendering.samples.len() {
            break;
        }
        let id = rendering.id;
        guard.pop_front();
        finished(id);
    }
    data[written..].fill(T::EQUILIBRIUM);
}

/// Resample and remix a decoded buffer into the device layout.
fn convert(buffer: &AudioBuffer, rate: u32, channels: u16) -> Result<Vec<f32>, PlaybackError> {
    let in_channels = buffer.channels.max(1) as usize;
    let out_channels = channels.max(1) as usize;
    let frames = buffer.frames();
    if frames == 0 || buffer.sample_rate == 0 || rate == 0 {
        return Ok(Vec::new());
    }

    // One plane per device channel, or a single mono plane to spread
    let planes: Vec<Vec<f32>> = if in_channels == out_channels {
        (0..in_channels)
            .map(|c| {
                buffer
                    .samples
                    .chunks_exact(in_channels)
                    .map(|frame| frame[c])
                    .collect()
            })
            .collect()
    } else {
        vec![buffer
            .samples
            .chunks_exact(in_channels)
            .map(|frame| frame.iter().sum::<f32>() / in_channels as f32)
            .collect()]
    };

    let planes = if buffer.sample_rate == rate {
        planes
    } else {
        resample(&planes, buffer.sample_rate, rate)?
    };

    let out_frames = planes.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(out_frames * out_channels);
    for n in 0..out_frames {
        for c in 0..out_channels {
            out.push(planes[c.min(planes.len() - 1)][n]);
        }
    }
    Ok(out)
}

/// FFT resampling of whole channel planes, trimmed to the input's length.
fn resample(planes: &[Vec<f32>], from_rate: u32, to_rate: u32) -> Result<Vec<Vec<f32>>, PlaybackError> {
    let resample_err = |e: String| PlaybackError::Output(format!("Resampling failed: {}", e));

    let mut resampler = FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLE_CHUNK,
        2,
        planes.len(),
    )
    .map_err(|e| resample_err(e.to_string()))?;

    let in_frames = planes.first().map_or(0, Vec::len);
    let expected = (in_frames as u64 * to_rate as u64).div_ceil(from_rate as u64) as usize;
    let delay = resampler.output_delay();

    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(delay + expected); planes.len()];
    let mut position = 0;
    // Zero padding past the end flushes the filter tail
    while out[0].len() < delay + expected {
        let need = resampler.input_frames_next();
        let chunk: Vec<Vec<f32>> = planes
            .iter()
            .map(|plane| {
                let mut chunk = vec![0.0f32; need];
                if position < plane.len() {
                    let end = (position + need).min(plane.len());
                    chunk[..end - position].copy_from_slice(&plane[position..end]);
                }
                chunk
            })
            .collect();
        position += need;

        let result = resampler
            .process(&chunk, None)
            .map_err(|e| resample_err(e.to_string()))?;
        for (plane, resampled) in out.iter_mut().zip(result) {
            plane.extend_from_slice(&resampled);
        }
    }

    for plane in out.iter_mut() {
        plane.drain(..delay);
        plane.truncate(expected);
    }
    Ok(out)
}
