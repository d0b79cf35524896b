/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Byte decoder backends.
//!
//! Each backend turns its input into a stream of [DecodedByte]s with
//! monotonically non-decreasing time, pulled one byte at a time.
//! The waveform backends work in sliding-window mode: a window of
//! roughly ten slow-byte durations advances by half its length, and
//! the rightmost confident decisions of one window are passed to the
//! next as boundary conditions, keeping per-window decisions globally
//! consistent under noise.
mod demod;
mod dual;
mod trivial;
mod xenon;

pub use demod::DemodDecoder;
pub use dual::DualDecoder;
pub use trivial::TrivialDecoder;
pub use xenon::XenonDecoder;

use log::{error, info};

use orictape_core::frame::DecodedByte;
use orictape_core::sound::Sound;

use crate::options::DecoderOptions;

/// A source of decoded bytes.
pub trait DecoderBackend {
    /// Retrieves one byte from the tape. `None` means end of tape and
    /// is the sole termination signal.
    fn decode_byte(&mut self) -> Option<DecodedByte>;
}

/// Clamps the user specified scan window to the available samples,
/// returning `(start_pos, end_pos)` in samples at the given rate.
pub(crate) fn clip_range(options: &DecoderOptions, sample_rate: i32, full_len: i64) -> (i64, i64) {
    let mut start_pos = 0i64;
    if let Some(start) = options.start {
        start_pos = (0.5 + start * sample_rate as f64).floor() as i64;
    }
    let mut end_pos = full_len;
    if let Some(end) = options.end {
        end_pos = (0.5 + end * sample_rate as f64).floor() as i64;
    }
    if end_pos > full_len {
        end_pos = full_len;
    }
    if end_pos < start_pos + 1 {
        end_pos = start_pos + 1; // avoid an empty interval for the dump length
    }
    (start_pos, end_pos)
}

/// Debug dump waveform, written to disk when the decoder is dropped.
pub(crate) struct DumpSink {
    sound: Sound,
    path: &'static str,
}

impl DumpSink {
    pub(crate) fn new(len: i64, sample_rate: i32, path: &'static str) -> Self {
        DumpSink {
            sound: Sound::silence(len.max(1), sample_rate),
            path,
        }
    }

    pub(crate) fn write(&mut self, where_: i64, buf: &[f32]) {
        self.sound.write(where_, buf);
    }
}

impl Drop for DumpSink {
    fn drop(&mut self) {
        info!("Writing dump to {}", self.path);
        if let Err(e) = self.sound.write_to_file(self.path) {
            error!("Couldn't write {}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_range_defaults_to_whole_tape() {
        let options = DecoderOptions::default();
        assert_eq!((0, 1000), clip_range(&options, 44100, 1000));
    }

    #[test]
    fn clip_range_honours_the_window() {
        let mut options = DecoderOptions::default();
        options.start = Some(1.0);
        options.end = Some(2.0);
        assert_eq!((44100, 88200), clip_range(&options, 44100, 500000));
        // End clamped to the tape, and never before start
        options.end = Some(100.0);
        assert_eq!((44100, 90000), clip_range(&options, 44100, 90000));
        options.end = Some(0.5);
        assert_eq!((44100, 44101), clip_range(&options, 44100, 90000));
    }
}
