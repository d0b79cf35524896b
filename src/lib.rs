/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    ORICTAPE is a Rust library for recovering data from audio
    recordings of Oric home-computer cassette tapes. Given a waveform
    captured from tape it locates the embedded byte-level records,
    reconstructs the bit and byte stream under analog distortion, and
    reassembles the bytes into named files.

    ORICTAPE is free software: you can redistribute it and/or modify it
    under the terms of the GNU Lesser General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    ORICTAPE is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
    Lesser General Public License for more details.
*/
//! Decoding pipeline for Oric cassette tape recordings.
//!
//! Signal flows leaf to root as a chain of lazy pull-mode stages: a
//! [Sound] supplies samples; the conditioning filters balance and
//! demodulate them; a [binarizer](crate::binarizer) turns a region of
//! conditioned waveform into timestamped bit transitions; the
//! [byte decoders](crate::decoder) frame bits into bytes with
//! start/stop/parity validation across the two tape encodings; and the
//! [TapeDecoder] front-end merges backend streams and drives the
//! [TapeParser] that recognizes file boundaries.
//!
//! ```no_run
//! use orictape::{DecoderOptions, TapeDecoder};
//!
//! let mut options = DecoderOptions::default();
//! options.filename = Some("side-a.wav".into());
//! let mut decoder = TapeDecoder::new(options)?;
//! while let Some(file) = decoder.read_file() {
//!     println!("{}", file);
//!     std::fs::write(format!("{}.tap", file.name_str()), file.to_archive_bytes())?;
//! }
//! # Ok::<(), std::io::Error>(())
//! ```
pub mod binarizer;
pub mod decoder;
pub mod encode;
#[cfg(feature = "cpal")]
pub mod host;
mod options;
pub mod tape;

pub use orictape_core::{dsp, filter, frame, sound};
pub use orictape_formats as formats;

pub use crate::encode::TapeEncoder;
pub use crate::options::{Band, Binner, Cue, DecoderOptions, Fdec};
pub use crate::tape::TapeDecoder;
pub use orictape_core::frame::DecodedByte;
pub use orictape_core::sound::Sound;
pub use orictape_formats::tap::TapeFile;
pub use orictape_formats::TapeParser;
