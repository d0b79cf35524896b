/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Pass-through decoder for `.tap` archive input.
//!
//! The bytes are already decoded; this backend only assigns them
//! nominal timestamps so the common parsing path works unchanged.
use std::fs;
use std::io;

use orictape_core::frame::{DecodedByte, FAST_CYCLES_PER_BYTE, SLOW_CYCLES_PER_BYTE};

use crate::options::DecoderOptions;

use super::DecoderBackend;

pub struct TrivialDecoder {
    bytes: std::vec::IntoIter<u8>,
    options: DecoderOptions,
    time: f64,
}

impl TrivialDecoder {
    /// Reads the archive named by `options.filename`.
    pub fn new(options: DecoderOptions) -> io::Result<Self> {
        let path = options
            .filename
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no input file name"))?;
        let bytes = fs::read(path)?;
        Ok(Self::from_bytes(bytes, options))
    }

    /// Uses an already loaded archive byte stream.
    pub fn from_bytes(bytes: Vec<u8>, options: DecoderOptions) -> Self {
        TrivialDecoder {
            bytes: bytes.into_iter(),
            options,
            time: 0.0,
        }
    }
}

impl DecoderBackend for TrivialDecoder {
    fn decode_byte(&mut self) -> Option<DecodedByte> {
        let cycles = if self.options.slow {
            SLOW_CYCLES_PER_BYTE
        } else {
            FAST_CYCLES_PER_BYTE
        };
        let dt = cycles as f64 / self.options.f_ref as f64;

        loop {
            let byte = self.bytes.next()?;

            let time = self.time;
            self.time += dt;

            // Discard bytes outside the user specified time interval
            if let Some(start) = self.options.start {
                if time < start {
                    continue;
                }
            }
            if let Some(end) = self.options.end {
                if time >= end {
                    return None;
                }
            }

            return Some(DecodedByte {
                time,
                slow: self.options.slow,
                byte,
                parity_error: false,
                sync_error: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_bytes_through_with_nominal_timing() {
        let mut options = DecoderOptions::default();
        options.slow = true;
        let mut dec = TrivialDecoder::from_bytes(vec![0x16, 0x24, 0x42], options);

        let b0 = dec.decode_byte().unwrap();
        assert_eq!(0x16, b0.byte);
        assert!(b0.slow);
        assert!(b0.is_healthy());
        assert_eq!(0.0, b0.time);

        let b1 = dec.decode_byte().unwrap();
        assert!((b1.time - 209.0 / 4800.0).abs() < 1e-12);
        assert_eq!(0x24, b1.byte);

        assert_eq!(0x42, dec.decode_byte().unwrap().byte);
        assert!(dec.decode_byte().is_none());
    }

    #[test]
    fn honours_the_time_window() {
        let mut options = DecoderOptions::default();
        options.start = Some(0.01);
        options.end = Some(0.02);
        // fast bytes are 32/4800 s apart: 0.0, 0.00667, 0.01333, 0.02
        let mut dec = TrivialDecoder::from_bytes(vec![1, 2, 3, 4, 5], options);
        let b = dec.decode_byte().unwrap();
        assert_eq!(3, b.byte);
        assert!(dec.decode_byte().is_none());
    }
}
