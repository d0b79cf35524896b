/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Tape encoder generating waveforms from byte streams.
//!
//! Each level change is a raised cosine ramp at the 4800 Hz physical
//! switching rate, so the waveform stays band limited. A slow bit is
//! 16 physical cycles of FSK pattern; a fast bit is two or three
//! samples of one cycle (`10` for a one, `100` for a zero). Bytes get
//! the usual frame: start bit, eight data bits LSB first, odd parity,
//! three stop bits, plus an extra half cycle.
use std::io;
use std::path::Path;

use log::warn;

use orictape_core::sound::Sound;
use orictape_formats::tap::{HEADER_START_BYTE, MIN_SYNC_RUN, SYNC_BYTE};

/// Output sample rate in Hz.
pub const ENCODER_RATE: i32 = 44100;
/// Number of samples in the ramp template.
const RAMP_LEN: usize = 441;
/// Step through the template for a 4800 Hz switching rate.
const RAMP_STEP: usize = 48;

/// Encodes bytes into a tape waveform.
pub struct TapeEncoder {
    slow: bool,
    samples: Vec<f32>,
    ramp: [f32; RAMP_LEN],
    ramp_phase: usize,
    last_y: f32,
    last_bit: bool,
    put_phys_bits: u64,
}

impl TapeEncoder {
    pub fn new(slow: bool) -> Self {
        // Template ramp from 0.0 to 1.0
        let mut ramp = [0.0f32; RAMP_LEN];
        let k = core::f32::consts::PI / RAMP_LEN as f32;
        for (i, r) in ramp.iter_mut().enumerate() {
            *r = 0.5 - 0.5 * (k * i as f32).cos();
        }
        TapeEncoder {
            slow,
            samples: Vec::new(),
            ramp,
            ramp_phase: 0,
            last_y: 0.0,
            last_bit: false,
            put_phys_bits: 0,
        }
    }

    /// Switches to a level via the cosine ramp.
    fn ramp_to(&mut self, y: f32) {
        let y0 = self.last_y;
        while self.ramp_phase < RAMP_LEN {
            let yy = y0 + self.ramp[self.ramp_phase] * (y - y0);
            self.samples.push(yy);
            self.ramp_phase += RAMP_STEP;
        }
        self.ramp_phase -= RAMP_LEN;
        self.last_y = y;
    }

    fn emit_bit(&mut self, val: bool) {
        // Use 60% of the available amplitude range
        self.ramp_to(if val { 0.6 } else { -0.6 });
        self.last_bit = val;
    }

    /// Encodes one physical bit in the selected format.
    fn encode_bit(&mut self, val: bool) {
        let polarity = self.last_bit;
        if self.slow {
            for i in 0..16u32 {
                let y = if val { i & 1 == 0 } else { i & 2 == 0 };
                self.emit_bit(y ^ polarity);
            }
            self.put_phys_bits += 16;
        } else {
            self.emit_bit(!polarity);
            self.emit_bit(polarity);
            if !val {
                self.emit_bit(polarity);
                self.put_phys_bits += 3;
            } else {
                self.put_phys_bits += 2;
            }
        }
    }

    /// Encodes one byte with its 13-bit frame and half cycle tail.
    pub fn put_byte(&mut self, byte: u8) {
        self.encode_bit(false); // start bit
        let mut parity = true;
        for i in 0..8 {
            let bit = byte >> i & 1 != 0;
            self.encode_bit(bit); // data bit
            parity ^= bit;
        }
        self.encode_bit(parity); // odd parity
        self.encode_bit(true); // stop bits
        self.encode_bit(true);
        self.encode_bit(true);
        let half = !self.last_bit;
        self.emit_bit(half); // extra cycle
        self.put_phys_bits += 1;
    }

    /// Encodes a `.tap` archive byte stream, prolonging the leading
    /// sync run so a decoder has time to lock on.
    pub fn put_archive(&mut self, bytes: &[u8]) {
        let mut pos = 0usize;
        while pos < bytes.len() && bytes[pos] == SYNC_BYTE {
            pos += 1;
        }
        if pos >= MIN_SYNC_RUN && bytes.get(pos) == Some(&HEADER_START_BYTE) {
            // Sync found - prolong to roughly 2/3 second if shorter;
            // a bare minimum run is not reliably decodable
            let nn = if self.slow { 15 } else { 99 };
            let n = pos.max(nn);
            for _ in 0..n {
                self.put_byte(SYNC_BYTE);
            }
        } else {
            warn!("Tape archive not introduced by standard sync");
            for _ in 0..pos {
                self.put_byte(SYNC_BYTE);
            }
        }
        for &byte in &bytes[pos..] {
            self.put_byte(byte);
        }
    }

    /// Encodes the archive stored in a file.
    pub fn put_file<P: AsRef<Path>>(&mut self, path: P) -> io::Result<()> {
        let bytes = std::fs::read(path)?;
        self.put_archive(&bytes);
        Ok(())
    }

    /// Duration of the output so far, in seconds.
    pub fn duration(&self) -> f64 {
        if self.put_phys_bits == 0 {
            return 0.0; // no ramping out in this case
        }
        // A.k.a. 1/4800
        let cycle_time = RAMP_LEN as f64 / RAMP_STEP as f64 / ENCODER_RATE as f64;
        cycle_time * (self.put_phys_bits + 1) as f64 // one extra for the end ramp
    }

    /// Ramps back to silence and returns the waveform.
    pub fn into_sound(mut self) -> Sound {
        self.ramp_to(0.0);
        Sound::from_vec(self.samples, ENCODER_RATE)
    }

    /// Ramps back to silence and writes a 16-bit PCM WAV file.
    pub fn write_to_file<P: AsRef<Path>>(self, path: P) -> io::Result<()> {
        self.into_sound().write_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orictape_core::frame::SLOW_CYCLES_PER_BYTE;

    #[test]
    fn slow_byte_has_nominal_length() {
        let mut enc = TapeEncoder::new(true);
        enc.put_byte(0x55);
        // 13 bits of 16 cycles plus the extra half cycle
        assert_eq!(SLOW_CYCLES_PER_BYTE as u64, enc.put_phys_bits);
        let expected = (enc.duration() * ENCODER_RATE as f64).round() as usize;
        let snd = enc.into_sound();
        assert!((snd.length() as i64 - expected as i64).abs() <= RAMP_LEN as i64);
    }

    #[test]
    fn fast_byte_length_depends_on_zeros() {
        // All-ones byte: 1 start(0) + 8 data(1) + parity(1) + 3 stops + half
        let mut enc = TapeEncoder::new(false);
        enc.put_byte(0xff);
        assert_eq!(3 + 8 * 2 + 2 + 3 * 2 + 1, enc.put_phys_bits);

        // All-zeros byte: parity is odd so the parity bit is one
        let mut enc = TapeEncoder::new(false);
        enc.put_byte(0x00);
        assert_eq!(3 + 8 * 3 + 2 + 3 * 2 + 1, enc.put_phys_bits);
    }

    #[test]
    fn output_is_bounded_and_returns_to_silence() {
        let mut enc = TapeEncoder::new(true);
        for byte in [0x16, 0x16, 0x16, 0x24, 0x00] {
            enc.put_byte(byte);
        }
        let snd = enc.into_sound();
        let mut buf = vec![0.0f32; snd.length() as usize];
        assert!(snd.read(0, &mut buf));
        for &y in &buf {
            assert!(y.abs() <= 0.6001);
        }
        assert!(buf.last().unwrap().abs() < 0.01);
    }

    #[test]
    fn archive_sync_run_is_prolonged() {
        let mut enc = TapeEncoder::new(true);
        enc.put_archive(&[0x16, 0x16, 0x16, 0x24, 0, 0, 0, 0, 0, 0, 0, 0, 0, b'A', 0, 0x42]);
        // 15 sync bytes + 0x24 + 9 header + name + payload
        let bytes = 15 + 1 + 9 + 2 + 1;
        assert_eq!(bytes * SLOW_CYCLES_PER_BYTE as u64, enc.put_phys_bits);
    }
}
