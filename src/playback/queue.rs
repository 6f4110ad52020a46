//! FIFO of decoded agent audio

use std::collections::VecDeque;

use base64::{engine::general_purpose::STANDARD, Engine};

use super::{AudioDecoder, AudioOutput, PlaybackError};

/// Plays decoded chunks strictly in arrival order.
///
/// Every decoded buffer goes to the output as soon as it arrives, so the
/// output can run from one into the next without a gap. The queue tracks
/// which buffers are still in flight and reports draining once, when the
/// last of them finishes. Completion ids it is not waiting for (for example
/// after `stop`) are ignored.
pub struct PlaybackQueue {
    decoder: Box<dyn AudioDecoder>,
    output: Box<dyn AudioOutput>,
    in_flight: VecDeque<u64>,
    next_id: u64,
}

impl PlaybackQueue {
    pub fn new(decoder: Box<dyn AudioDecoder>, output: Box<dyn AudioOutput>) -> Self {
        Self {
            decoder,
            output,
            in_flight: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Decode a base64 chunk and queue it behind whatever is playing.
    ///
    /// A chunk that fails to decode is dropped; the queue and whatever is
    /// playing are unaffected.
    pub fn enqueue_chunk(&mut self, encoded: &str) -> Result<(), PlaybackError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| PlaybackError::InvalidEncoding(e.to_string()))?;
        let buffer = self.decoder.decode(bytes)?;

        let id = self.next_id;
        self.next_id += 1;
        self.output.push(id, buffer)?;
        self.in_flight.push_back(id);
        Ok(())
    }

    /// Handle a completion report from the output.
    ///
    /// Returns `true` exactly when this completion left the queue idle.
    pub fn on_buffer_finished(&mut self, buffer_id: u64) -> bool {
        let Some(index) = self.in_flight.iter().position(|&id| id == buffer_id) else {
            log::debug!("Ignoring stale completion for buffer {}", buffer_id);
            return false;
        };
        if index > 0 {
            log::warn!(
                "Buffer {} finished ahead of {} earlier buffer(s)",
                buffer_id,
                index
            );
        }
        self.in_flight.drain(..=index);
        self.in_flight.is_empty()
    }

    /// Halt and discard everything. Does not count as draining.
    pub fn stop(&mut self) {
        if !self.in_flight.is_empty() {
            log::info!(
                "Stopping playback ({} buffer(s) discarded)",
                self.in_flight.len()
            );
        }
        self.output.halt();
        self.in_flight.clear();
    }

    pub fn is_playing(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Buffers waiting behind the one rendering now.
    pub fn queued(&self) -> usize {
        self.in_flight.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{AudioBuffer, SymphoniaDecoder};
    use std::sync::{Arc, Mutex};

    /// Output that records which buffers were pushed and halted.
    #[derive(Clone, Default)]
    struct RecordingOutput {
        log: Arc<Mutex<Vec<String>>>,
        refuse: bool,
    }

    impl AudioOutput for RecordingOutput {
        fn push(&mut self, buffer_id: u64, buffer: AudioBuffer) -> Result<(), PlaybackError> {
            if self.refuse {
                return Err(PlaybackError::Output("device gone".to_string()));
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("push {} {}", buffer_id, buffer.frames()));
            Ok(())
        }

        fn halt(&mut self) {
            self.log.lock().unwrap().push("halt".to_string());
        }
    }

    fn chunk(frames: usize) -> String {
        STANDARD.encode(crate::playback::decoder::tests::wav_bytes(frames, 16_000))
    }

    fn queue() -> (PlaybackQueue, Arc<Mutex<Vec<String>>>) {
        queue_with(RecordingOutput::default())
    }

    fn queue_with(output: RecordingOutput) -> (PlaybackQueue, Arc<Mutex<Vec<String>>>) {
        let log = output.log.clone();
        (
            PlaybackQueue::new(Box::new(SymphoniaDecoder), Box::new(output)),
            log,
        )
    }

    #[test]
    fn plays_in_arrival_order_and_drains_once() {
        let (mut queue, log) = queue();
        queue.enqueue_chunk(&chunk(100)).unwrap();
        queue.enqueue_chunk(&chunk(200)).unwrap();
        queue.enqueue_chunk(&chunk(300)).unwrap();

        assert!(queue.is_playing());
        assert_eq!(queue.queued(), 2);

        assert!(!queue.on_buffer_finished(1));
        assert!(!queue.on_buffer_finished(2));
        assert!(queue.on_buffer_finished(3));
        assert!(!queue.is_playing());

        assert_eq!(
            *log.lock().unwrap(),
            vec!["push 1 100", "push 2 200", "push 3 300"]
        );

        // A repeated completion does not drain again
        assert!(!queue.on_buffer_finished(3));
    }

    #[test]
    fn every_chunk_reaches_the_output_on_arrival() {
        let (mut queue, log) = queue();
        queue.enqueue_chunk(&chunk(100)).unwrap();
        queue.enqueue_chunk(&chunk(200)).unwrap();

        // Both are with the output before the first one finishes
        assert_eq!(*log.lock().unwrap(), vec!["push 1 100", "push 2 200"]);
        assert_eq!(queue.queued(), 1);
        assert!(!queue.on_buffer_finished(1));
        assert_eq!(queue.queued(), 0);
        assert!(queue.is_playing());
    }

    #[test]
    fn refused_buffer_is_not_waited_for() {
        let (mut queue, _log) = queue_with(RecordingOutput {
            refuse: true,
            ..Default::default()
        });
        assert!(matches!(
            queue.enqueue_chunk(&chunk(100)),
            Err(PlaybackError::Output(_))
        ));
        assert!(!queue.is_playing());
    }

    #[test]
    fn bad_chunk_is_dropped_and_playback_continues() {
        let (mut queue, log) = queue();
        queue.enqueue_chunk(&chunk(100)).unwrap();

        assert!(matches!(
            queue.enqueue_chunk("!!not base64!!"),
            Err(PlaybackError::InvalidEncoding(_))
        ));
        assert!(matches!(
            queue.enqueue_chunk(&STANDARD.encode(b"garbage bytes")),
            Err(PlaybackError::Decode(_))
        ));

        queue.enqueue_chunk(&chunk(200)).unwrap();

        assert!(!queue.on_buffer_finished(1));
        assert!(queue.on_buffer_finished(2));
        assert_eq!(*log.lock().unwrap(), vec!["push 1 100", "push 2 200"]);
    }

    #[test]
    fn stop_discards_without_draining() {
        let (mut queue, log) = queue();
        queue.enqueue_chunk(&chunk(100)).unwrap();
        queue.enqueue_chunk(&chunk(100)).unwrap();

        queue.stop();
        assert!(!queue.is_playing());
        assert_eq!(queue.queued(), 0);

        // Late completion from the halted buffer
        assert!(!queue.on_buffer_finished(1));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["push 1 100", "push 2 100", "halt"]
        );
    }

    #[test]
    fn enqueue_after_drain_restarts() {
        let (mut queue, _log) = queue();
        queue.enqueue_chunk(&chunk(100)).unwrap();
        assert!(queue.on_buffer_finished(1));

        queue.enqueue_chunk(&chunk(100)).unwrap();
        assert!(queue.is_playing());
        assert!(queue.on_buffer_finished(2));
    }
}
