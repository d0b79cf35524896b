/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Buffer carousel between a producer and an audio-thread consumer.
//!
//! A fixed set of frame buffers circulates through two bounded
//! channels. The producer fills its current buffer and swaps it for a
//! drained one; the consumer copies out of its current buffer and
//! sends it back once exhausted. Neither side allocates after setup.
use core::ops::{Deref, DerefMut};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};

use super::{AudioHandleError, AudioHandleErrorKind};

pub type AudioFrameResult<T> = Result<T, AudioHandleError>;

fn terminated() -> AudioHandleError {
    (
        "the remote thread has been terminated".to_string(),
        AudioHandleErrorKind::Terminated,
    )
        .into()
}

/// One frame of interleaved samples.
#[derive(Clone, Debug)]
pub struct AudioBuffer<T>(pub Vec<T>);

impl<T> Deref for AudioBuffer<T> {
    type Target = Vec<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for AudioBuffer<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T: Default + Clone> AudioBuffer<T> {
    fn new(frame_samples: usize, channels: u8) -> Self {
        AudioBuffer(vec![T::default(); frame_samples * channels as usize])
    }
}

/// The producer half, living on the filling thread.
#[derive(Debug)]
pub struct AudioFrameProducer<T> {
    pub buffer: AudioBuffer<T>,
    rx: Receiver<AudioBuffer<T>>,
    consumer_tx: SyncSender<AudioBuffer<T>>,
}

/// The consumer half, living in the audio callback.
#[derive(Debug)]
pub struct AudioFrameConsumer<T> {
    buffer: AudioBuffer<T>,
    cursor: usize,
    producer_tx: SyncSender<AudioBuffer<T>>,
    rx: Receiver<AudioBuffer<T>>,
}

/// Creates an interconnected producer/consumer pair with `latency`
/// frame buffers in circulation.
pub fn create_carousel<T>(
    latency: usize,
    frame_samples: usize,
    channels: u8,
) -> (AudioFrameProducer<T>, AudioFrameConsumer<T>)
where
    T: 'static + Default + Clone + Send,
{
    let buffer = AudioBuffer::<T>::new(frame_samples, channels);
    let (producer_tx, producer_rx) = sync_channel::<AudioBuffer<T>>(latency);
    let (consumer_tx, consumer_rx) = sync_channel::<AudioBuffer<T>>(latency);
    if latency > 0 {
        // Put some frame buffers into circulation
        for _ in 1..latency {
            consumer_tx.send(buffer.clone()).unwrap(); // infallible
        }
        producer_tx.send(buffer.clone()).unwrap(); // infallible
    }
    let producer = AudioFrameProducer {
        buffer: buffer.clone(),
        rx: producer_rx,
        consumer_tx,
    };
    let consumer = AudioFrameConsumer {
        buffer,
        cursor: 0,
        producer_tx,
        rx: consumer_rx,
    };
    (producer, consumer)
}

impl<T> AudioFrameProducer<T> {
    /// Sends the filled frame to the consumer, blocking until a
    /// drained buffer comes back.
    pub fn send_frame(&mut self) -> AudioFrameResult<()> {
        let mut next = self.rx.recv().map_err(|_| terminated())?;
        core::mem::swap(&mut next, &mut self.buffer);
        self.consumer_tx.send(next).map_err(|_| terminated())
    }
}

impl<T: Copy> AudioFrameConsumer<T> {
    /// Fills `target` from circulating frames. Stale data is repeated
    /// when the producer falls behind; `false` is returned when the
    /// producer is gone.
    pub fn fill_buffer(&mut self, target: &mut [T], ignore_lag: bool) -> bool {
        let mut filled = 0usize;
        loop {
            let source = &self.buffer[self.cursor..];
            let copied = source.len().min(target.len() - filled);
            target[filled..filled + copied].copy_from_slice(&source[..copied]);
            filled += copied;
            self.cursor += copied;

            if filled == target.len() {
                return true;
            }

            // The current buffer is exhausted; swap in the next frame
            match self.rx.try_recv() {
                Ok(mut next) => {
                    core::mem::swap(&mut next, &mut self.buffer);
                    self.cursor = 0;
                    if self.producer_tx.send(next).is_err() {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) if ignore_lag => {
                    // Replay the stale frame rather than block
                    self.cursor = 0;
                }
                Err(_) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_circulate() {
        let (mut producer, mut consumer) = create_carousel::<i16>(2, 4, 1);
        producer.buffer.copy_from_slice(&[1, 2, 3, 4]);
        producer.send_frame().unwrap();

        // The initially circulating buffer is silent, then frame 1
        let mut out = [9i16; 8];
        assert!(consumer.fill_buffer(&mut out, false));
        assert_eq!([0, 0, 0, 0, 1, 2, 3, 4], out);

        // The drained buffer went back to the producer during the fill
        producer.buffer.copy_from_slice(&[5, 6, 7, 8]);
        producer.send_frame().unwrap();
        let mut out = [9i16; 4];
        assert!(consumer.fill_buffer(&mut out, false));
        assert_eq!([5, 6, 7, 8], out);
    }

    #[test]
    fn consumer_detects_terminated_producer() {
        let (producer, mut consumer) = create_carousel::<f32>(1, 2, 1);
        drop(producer);
        let mut out = [0.0f32; 8];
        assert!(!consumer.fill_buffer(&mut out, false));
    }
}
