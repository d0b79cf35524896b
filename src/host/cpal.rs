/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Audio device streaming through [cpal](https://crates.io/crates/cpal).
//!
//! Playback pushes a [Sound] through the [carousel][super::carousel]
//! into the device callback; recording circulates capture buffers the
//! other way. Both directions keep the callback free of allocation
//! and blocking.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, TrySendError};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, DefaultStreamConfigError, PauseStreamError, PlayStreamError};

pub use cpal::SampleFormat;

use orictape_core::dsp::interp_lin;
use orictape_core::sound::Sound;

use super::carousel::{create_carousel, AudioBuffer};
use super::{AudioHandleError, AudioHandleErrorKind};

impl From<DefaultStreamConfigError> for AudioHandleError {
    fn from(e: DefaultStreamConfigError) -> Self {
        (e.to_string(), AudioHandleErrorKind::AudioSubsystem).into()
    }
}

impl From<BuildStreamError> for AudioHandleError {
    fn from(e: BuildStreamError) -> Self {
        (e.to_string(), AudioHandleErrorKind::AudioStream).into()
    }
}

impl From<PlayStreamError> for AudioHandleError {
    fn from(e: PlayStreamError) -> Self {
        (e.to_string(), AudioHandleErrorKind::AudioStream).into()
    }
}

impl From<PauseStreamError> for AudioHandleError {
    fn from(e: PauseStreamError) -> Self {
        (e.to_string(), AudioHandleErrorKind::AudioStream).into()
    }
}

/// Frames kept in flight between the producer and the callback.
const LATENCY_FRAMES: usize = 3;
/// Frame duration in milliseconds.
const FRAME_MILLIS: usize = 20;

/// Plays a whole sound on the default output device, blocking until
/// the last frame has been handed to the device.
pub fn play_sound(sound: &Sound) -> Result<(), AudioHandleError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| {
        AudioHandleError::from((
            "no default output device".to_string(),
            AudioHandleErrorKind::AudioSubsystem,
        ))
    })?;
    let supported = device.default_output_config()?;
    let config = supported.config();
    match supported.sample_format() {
        SampleFormat::I16 => play_sound_typed::<i16>(sound, &device, &config),
        SampleFormat::U16 => play_sound_typed::<u16>(sound, &device, &config),
        SampleFormat::F32 => play_sound_typed::<f32>(sound, &device, &config),
    }
}

fn play_sound_typed<T>(
    sound: &Sound,
    device: &cpal::Device,
    config: &cpal::StreamConfig,
) -> Result<(), AudioHandleError>
where
    T: cpal::Sample + Default + Clone + Send + 'static,
{
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0 as usize;
    let frame_samples = device_rate * FRAME_MILLIS / 1000;

    let (mut producer, mut consumer) =
        create_carousel::<T>(LATENCY_FRAMES, frame_samples, channels as u8);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            consumer.fill_buffer(data, true);
        },
        move |e| error!("output stream error: {}", e),
    )?;
    stream.play()?;

    // Resampling phase step from the device rate to the sound rate
    let k_rate = sound.sample_rate() as f64 / device_rate as f64;
    let total_device_samples =
        (sound.length() as f64 / k_rate).ceil() as i64 + (LATENCY_FRAMES * frame_samples) as i64;

    let mut staging = vec![0.0f32; (frame_samples as f64 * k_rate).ceil() as usize + 4];
    let mut pos = 0i64; // in device samples
    while pos < total_device_samples {
        let src_start = (pos as f64 * k_rate).floor() as i64 - 1;
        if !sound.read(src_start, &mut staging) {
            return Err((
                "sound read failed".to_string(),
                AudioHandleErrorKind::AudioStream,
            )
                .into());
        }
        for i in 0..frame_samples {
            let x = ((pos + i as i64) as f64 * k_rate - src_start as f64) as f32;
            let y = interp_lin(&staging, x);
            let value: T = cpal::Sample::from(&y);
            for c in 0..channels {
                producer.buffer[i * channels + c] = value;
            }
        }
        producer.send_frame()?;
        pos += frame_samples as i64;
    }

    // Let the tail drain before tearing the stream down
    std::thread::sleep(Duration::from_millis(
        (LATENCY_FRAMES * FRAME_MILLIS) as u64,
    ));
    stream.pause()?;
    Ok(())
}

/// Records from the default input device until `stop` is raised or
/// `max_seconds` have been captured, and returns the take as a mono
/// [Sound] at the device rate.
pub fn record_sound(max_seconds: f64, stop: &AtomicBool) -> Result<Sound, AudioHandleError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        AudioHandleError::from((
            "no default input device".to_string(),
            AudioHandleErrorKind::AudioSubsystem,
        ))
    })?;
    let supported = device.default_input_config()?;
    let config = supported.config();
    match supported.sample_format() {
        SampleFormat::I16 => record_sound_typed::<i16>(max_seconds, stop, &device, &config),
        SampleFormat::U16 => record_sound_typed::<u16>(max_seconds, stop, &device, &config),
        SampleFormat::F32 => record_sound_typed::<f32>(max_seconds, stop, &device, &config),
    }
}

fn record_sound_typed<T>(
    max_seconds: f64,
    stop: &AtomicBool,
    device: &cpal::Device,
    config: &cpal::StreamConfig,
) -> Result<Sound, AudioHandleError>
where
    T: cpal::Sample + Default + Clone + Send + 'static,
{
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0 as usize;
    let frame_samples = device_rate * FRAME_MILLIS / 1000;

    // Capture buffers circulate the opposite way: the callback fills
    // buffers from the pool and hands them to the reader; on overrun
    // the frame is dropped rather than blocking the callback.
    let (pool_tx, pool_rx) = sync_channel::<AudioBuffer<T>>(LATENCY_FRAMES + 1);
    let (filled_tx, filled_rx) = sync_channel::<AudioBuffer<T>>(LATENCY_FRAMES + 1);
    for _ in 0..LATENCY_FRAMES {
        pool_tx
            .send(AudioBuffer(vec![T::default(); frame_samples * channels]))
            .unwrap(); // infallible
    }

    let mut current: Option<(AudioBuffer<T>, usize)> = None;
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _| {
            let mut data = data;
            while !data.is_empty() {
                let (mut buffer, mut cursor) = match current.take() {
                    Some(state) => state,
                    None => match pool_rx.try_recv() {
                        Ok(buffer) => (buffer, 0),
                        Err(_) => return, // overrun, drop the packet
                    },
                };
                let space = buffer.len() - cursor;
                let copied = space.min(data.len());
                buffer[cursor..cursor + copied].copy_from_slice(&data[..copied]);
                cursor += copied;
                data = &data[copied..];
                if cursor == buffer.len() {
                    match filled_tx.try_send(buffer) {
                        Ok(()) | Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                } else {
                    current = Some((buffer, cursor));
                }
            }
        },
        move |e| error!("input stream error: {}", e),
    )?;
    stream.play()?;

    let max_samples = (max_seconds * device_rate as f64) as usize;
    let mut samples: Vec<f32> = Vec::with_capacity(max_samples.min(1 << 24));
    while samples.len() < max_samples && !stop.load(Ordering::Relaxed) {
        match filled_rx.recv_timeout(Duration::from_millis(4 * FRAME_MILLIS as u64)) {
            Ok(buffer) => {
                for frame in buffer.chunks_exact(channels) {
                    let mut sum = 0.0f32;
                    for s in frame {
                        sum += s.to_f32();
                    }
                    samples.push(sum / channels as f32);
                }
                let _ = pool_tx.try_send(buffer);
            }
            Err(_) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
    }
    stream.pause()?;
    samples.truncate(max_samples);

    Ok(Sound::from_vec(samples, device_rate as i32))
}
