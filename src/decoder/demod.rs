/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Demodulation based decoder, slow format only.
//!
//! Runs two [Demodulator]s (1200 Hz and 2400 Hz bands) and a per
//! window Viterbi over the selected envelope(s) that locates byte
//! onsets by their start/stop bit signature. The 13 bit levels are
//! then sampled from both envelopes, normalized, mixed and
//! thresholded. Faster and more accurate than the two-stage decoder,
//! but it cannot do the fast format.
use orictape_core::dsp::interp_lin;
use orictape_core::filter::Demodulator;
use orictape_core::frame::{DecodedByte, SLOW_CYCLES_PER_BYTE};
use orictape_core::sound::Sound;

use crate::options::{Band, DecoderOptions};

use super::{clip_range, DecoderBackend, DumpSink};

#[inline]
fn sq(a: f32) -> f32 {
    a * a
}

/// Viterbi byte segmentation of the demodulated signal.
///
/// Only start and stop bits are detected; data and parity bits are
/// treated as a uniform middle section.
///
/// ```text
/// +--+--------------------------+--------+
/// |0 |x  x  x  x  x  x  x  x  x |1  1  1 |
/// +--+--------------------------+--------+
/// <A>|<           D            >|<  E   >|
/// ```
///
/// A byte is 209 cycles at 4800 Hz; start and stop are 16 and 49.
/// 'A' is scored as `-y`, 'D' as `k_d*|y|`, 'E' as `y`. Scoring the
/// 'D' section keeps the optimization from squeezing in as many syncs
/// as possible; `k_d` between 0 and 1 balances that against avoiding
/// syncs altogether, and 0.6 works well.
fn demod_viterbi(
    xs: &mut Vec<i64>,
    buf: &[f32],
    given_onset: Option<usize>,
    t_clk: f64,
    dt_clk: f64,
) {
    let len = buf.len();
    let k_d = 0.6f32;
    let t_clk_min = t_clk - dt_clk;
    let t_clk_max = t_clk + dt_clk;

    // Distribute the elasticity so the section ranges add up nicely;
    // the smallest section first minimizes relative rounding error.
    let t_a_min = (0.5 + 16.0 * t_clk_min).floor() as usize;
    let t_a_max = (0.5 + 16.0 * t_clk_max).floor() as usize;
    let t_e_min = (0.5 + 49.0 * t_clk_min).floor() as usize;
    let t_e_max = (0.5 + 49.0 * t_clk_max).floor() as usize;
    let t_d_min = ((0.5 + 209.0 * t_clk_min).floor() as usize)
        .saturating_sub(t_a_min + t_e_min);
    let t_d_max = ((0.5 + 209.0 * t_clk_max).floor() as usize)
        .saturating_sub(t_a_max + t_e_max);

    let ns = t_a_max + t_d_max + t_e_max;
    if len < 2 || ns == 0 {
        return;
    }

    let s_a = 0usize;
    let s_d = t_a_max;
    let s_e = t_a_max + t_d_max;

    // Score the initial state against the first signal level
    let mut scores = vec![0.0f32; ns];
    for (s, score) in scores.iter_mut().enumerate() {
        let y = buf[0];
        *score = if s < s_d {
            -y // start section 'A'
        } else if s < s_e {
            k_d * y.abs() // data section 'D'
        } else {
            y // stop section 'E'
        };
    }

    // Force the onset if given
    if given_onset == Some(0) {
        for score in scores[1..].iter_mut() {
            *score = -1e20;
        }
    }

    let mut pred = vec![0u16; len * 3];

    // Elasticity: shortcuts from t_min-1..t_max-1 into the next section
    // .--.  .--.  .--.  .--.  .--.  .--.  .--.
    // |  +->|  +->|  +->|  +->|  +->|  +->|  ++>
    // '--'  '--'  '--'  '-+'  '-+'  '-+'  '--'|
    //                     '-----+-----+-------+
    //  0                 t_min-1          t_max-1
    for i in 1..len {
        // Find the best predecessor for each section start
        let mut pred_a = s_e + t_e_max - 1;
        let mut pred_d = s_a + t_a_max - 1;
        let mut pred_e = s_d + t_d_max - 1;

        let mut score_a = scores[pred_a];
        let mut score_d = scores[pred_d];
        let mut score_e = scores[pred_e];

        for s in s_e + t_e_min - 1..s_e + t_e_max - 1 {
            if score_a < scores[s] {
                score_a = scores[s];
                pred_a = s;
            }
        }
        for s in s_a + t_a_min - 1..s_a + t_a_max - 1 {
            if score_d < scores[s] {
                score_d = scores[s];
                pred_d = s;
            }
        }
        for s in s_d + t_d_min - 1..s_d + t_d_max - 1 {
            if score_e < scores[s] {
                score_e = scores[s];
                pred_e = s;
            }
        }

        pred[i * 3] = pred_a as u16;
        pred[i * 3 + 1] = pred_d as u16;
        pred[i * 3 + 2] = pred_e as u16;

        // Level keeping transitions roll in from states to the left
        for s in (1..ns).rev() {
            scores[s] = scores[s - 1];
        }
        scores[s_a] = score_a;
        scores[s_d] = score_d;
        scores[s_e] = score_e;

        // Score against the local signal: 'A' thrives on negative
        // signal, 'D' on magnitude (for fair competition), 'E' on
        // positive signal.
        let y = buf[i];
        for score in scores[s_a..s_d].iter_mut() {
            *score -= y;
        }
        for score in scores[s_d..s_e].iter_mut() {
            *score += k_d * y.abs();
        }
        for score in scores[s_e..ns].iter_mut() {
            *score += y;
        }

        // Force the onset if given
        if given_onset == Some(i) {
            for score in scores[1..].iter_mut() {
                *score = -1e20;
            }
        }
    }

    // Backtrace from the best end state
    let mut s = 0usize;
    let mut score = scores[0];
    for (s1, &c) in scores.iter().enumerate() {
        if score < c {
            score = c;
            s = s1;
        }
    }

    // Trace back the chain of predecessors, noting start-state onsets
    for i in (0..len - 1).rev() {
        s = if s == s_a {
            pred[(i + 1) * 3] as usize
        } else if s == s_d {
            pred[(i + 1) * 3 + 1] as usize
        } else if s == s_e {
            pred[(i + 1) * 3 + 2] as usize
        } else {
            s - 1 // state with just one predecessor
        };
        if s == s_a {
            xs.push(i as i64);
        }
    }

    // The onsets were picked backwards; reverse into expected order
    xs.reverse();
}

/// Slow format decoder over demodulated envelopes.
pub struct DemodDecoder {
    demod0: Demodulator, // low band
    demod1: Demodulator, // high band
    options: DecoderOptions,

    // Clip interval
    start_pos: i64,
    end_pos: i64,

    // Clock parameters
    t_ref: f64,   // nominal physical bit period
    t_clk: f64,   // center of the current search window
    dt_min: f64,  // minimum search window half width
    dt_max: f64,  // maximum search window half width
    dt_clk: f64,  // current search window half width

    // Window geometry
    windowlen: usize,
    hopsize: usize,
    window_offs: i64,
    fno: u64,

    buf0: Vec<f32>, // low band demodulated signal
    buf1: Vec<f32>, // high band demodulated signal
    buf: Vec<f32>,  // selected demodulated signal

    // Byte onsets determined in the current window
    onset_buf: Vec<i64>,
    boundary_byte_onset: i64, // onset for use as the next Viterbi boundary
    last_byte_onset: i64,     // location of the last emitted byte

    // Bytes decoded from the current window
    byte_buf: Vec<DecodedByte>,
    byte_index: usize,

    dump: Option<DumpSink>,
    dump_buf: Vec<f32>,
}

impl DemodDecoder {
    pub fn new(src: &Sound, options: DecoderOptions) -> Self {
        let demod0 = Demodulator::new(src, options.f_ref, false);
        let demod1 = Demodulator::new(src, options.f_ref, true);

        let ss_sample_rate = demod0.sample_rate();
        let full_len = demod0.length();
        let (start_pos, end_pos) = clip_range(&options, ss_sample_rate, full_len);

        // Clock parameters
        let t_ref = ss_sample_rate as f64 / options.f_ref as f64;
        let dt_min = 0.07 * t_ref;
        let dt_max = 0.25 * t_ref;

        // Window of ten nominal byte times, advancing by half
        let windowlen =
            ((0.5 + 10.0 * SLOW_CYCLES_PER_BYTE as f64 * t_ref).floor() as usize) & !3;
        let hopsize = windowlen / 2;
        debug_assert!(hopsize & 1 == 0);

        // Start with the waveform start in the middle hop of the window
        let window_offs =
            start_pos - start_pos.rem_euclid(hopsize as i64) - (windowlen / 2) as i64
                + (hopsize / 2) as i64;

        let dump = options.dump.then(|| {
            DumpSink::new(end_pos - start_pos, ss_sample_rate, "dump-demod.wav")
        });

        DemodDecoder {
            demod0,
            demod1,
            options,
            start_pos,
            end_pos,
            t_ref,
            t_clk: t_ref,
            dt_min,
            dt_max,
            dt_clk: dt_max,
            windowlen,
            hopsize,
            window_offs,
            fno: 0,
            buf0: vec![0.0; windowlen],
            buf1: vec![0.0; windowlen],
            buf: vec![0.0; windowlen],
            onset_buf: Vec::new(),
            boundary_byte_onset: -1,
            last_byte_onset: -1,
            byte_buf: Vec::new(),
            byte_index: 0,
            dump,
            dump_buf: vec![0.0; windowlen],
        }
    }

    /// Decodes one window; returns `false` when there is nothing left.
    fn decode_window(&mut self) -> bool {
        if self.window_offs >= self.end_pos {
            return false; // nothing to decode
        }

        let first_window = self.fno == 0;
        let last_window = self.window_offs + self.hopsize as i64 >= self.end_pos;
        let windowlen = self.windowlen;
        let hopsize = self.hopsize;

        // Keep the overlapping half of the previous window
        let mut skip = 0usize;
        if !first_window {
            skip = windowlen - hopsize;
            self.buf0.copy_within(hopsize..windowlen, 0);
            self.buf1.copy_within(hopsize..windowlen, 0);
        }

        // Read the low and high bands
        self.demod0
            .read(self.window_offs + skip as i64, &mut self.buf0[skip..windowlen]);
        self.demod1
            .read(self.window_offs + skip as i64, &mut self.buf1[skip..windowlen]);

        // Select band(s) for sync detection
        for i in 0..windowlen {
            self.buf[i] = match self.options.band {
                Band::Low => self.buf0[i],
                Band::High => self.buf1[i],
                Band::Dual => self.buf0[i] + self.buf1[i],
            };
        }

        // Constrain the Viterbi to an onset carried over from the
        // previous window
        let mut given_onset = None;
        if !first_window
            && self.boundary_byte_onset >= self.window_offs
            && self.boundary_byte_onset < self.window_offs + windowlen as i64
        {
            given_onset = Some((self.boundary_byte_onset - self.window_offs) as usize);
        }

        self.onset_buf.clear();
        demod_viterbi(
            &mut self.onset_buf,
            &self.buf[..windowlen],
            given_onset,
            self.t_clk,
            self.dt_clk,
        );

        // Portion of the window to convert now; the right quarter is
        // better handled by the next window
        let right_limit = if last_window {
            windowlen as i64
        } else {
            ((windowlen + hopsize) / 2) as i64
        };

        let t_half_byte = (0.5 + SLOW_CYCLES_PER_BYTE as f64 * self.t_ref / 2.0) as i64;
        let k_time = 1.0 / self.demod0.sample_rate() as f64;
        let mut perfect_byte_run = 0;

        debug_assert!(self.byte_buf.is_empty());
        for i in 0..self.onset_buf.len().saturating_sub(1) {
            let x0 = self.onset_buf[i];
            let x1 = self.onset_buf[i + 1];
            let onset = self.window_offs + x0;

            if x0 >= right_limit {
                continue; // deal with in the next window instead
            }
            if self.last_byte_onset >= 0 && onset - self.last_byte_onset < t_half_byte {
                continue; // too close to the last accepted byte
            }
            if onset < self.start_pos - t_half_byte || onset > self.end_pos {
                continue; // outside the user specified scan range
            }

            // Sample the 13 bit levels in both bands
            let mut levels = [[0.0f32; 13]; 2];
            for b in 0..13 {
                let x = x0 as f64 + ((16.0 / 209.0) * b as f64 + 8.0 / 209.0) * (x1 - x0) as f64;
                levels[0][b] = interp_lin(&self.buf0[..windowlen], x as f32);
                levels[1][b] = interp_lin(&self.buf1[..windowlen], x as f32);
            }

            // Normalize the levels to the 0..1 range
            let mut norm_levels = [[0.0f32; 13]; 2];
            for c in 0..2 {
                let mut ymin = levels[c][0];
                let mut ymax = levels[c][0];
                for b in 0..13 {
                    ymin = ymin.min(levels[c][b]);
                    ymax = ymax.max(levels[c][b]);
                }
                for b in 0..13 {
                    norm_levels[c][b] = if ymax > ymin {
                        (levels[c][b] - ymin) / (ymax - ymin)
                    } else {
                        0.5
                    };
                }
            }

            // Mix the two bands
            let mut mix_levels = [0.0f32; 13];
            if self.options.band == Band::Dual {
                // Measure the noise variance in each band: distance of
                // each level from its expected rail
                let mut noise = [0.0f32; 2];
                for c in 0..2 {
                    let mut e = sq(norm_levels[c][0]);
                    for b in 1..10 {
                        e += sq(norm_levels[c][b].min(1.0 - norm_levels[c][b]));
                    }
                    for b in 10..13 {
                        e += sq(1.0 - norm_levels[c][b]);
                    }
                    noise[c] = e;
                }

                // Mix to minimize the resulting noise variance
                let (v0, v1) = (noise[0], noise[1]);
                let k0 = if v0 + v1 > 0.0 { v1 / (v0 + v1) } else { 0.5 };
                for b in 0..13 {
                    mix_levels[b] = k0 * norm_levels[0][b] + (1.0 - k0) * norm_levels[1][b] - 0.5;
                }
            } else {
                // Use just the user selected band
                let csel = if self.options.band == Band::Low { 0 } else { 1 };
                mix_levels.copy_from_slice(&levels[csel]);
            }

            // Binarize
            let mut z = 0u16;
            for (b, &level) in mix_levels.iter().enumerate() {
                if level > 0.0 {
                    z |= 1 << b;
                }
            }

            let byte = DecodedByte::from_code(k_time * onset as f64, true, z);
            self.byte_buf.push(byte);
            self.last_byte_onset = onset;

            // Tune the sync search window
            if byte.is_healthy() {
                // Perfect byte: narrow the search window
                self.t_clk = (15.0 * self.t_clk + (x1 - x0) as f64 / 209.0) / 16.0;
                self.dt_clk = (15.0 * self.dt_clk + self.dt_min) / 16.0;

                perfect_byte_run += 1;
                if perfect_byte_run >= 2 {
                    // Note a boundary condition for the next window
                    self.boundary_byte_onset = onset;
                }
            } else {
                // Imperfect byte: widen the search window
                self.t_clk = (15.0 * self.t_clk + self.t_ref) / 16.0;
                self.dt_clk = (15.0 * self.dt_clk + self.dt_max) / 16.0;
                perfect_byte_run = 0;
            }
        }

        // Save the window in the debug dump
        if let Some(dump) = self.dump.as_mut() {
            let mut maxval = self.buf[0];
            for (dst, &y) in self.dump_buf.iter_mut().zip(self.buf.iter()) {
                *dst = y;
                maxval = maxval.max(y);
            }

            // Draw a spike on every start bit onset
            for &x in &self.onset_buf {
                if x >= 0 && (x as usize) < windowlen {
                    self.dump_buf[x as usize] = 1.5 * maxval;
                }
            }

            // Write out the core part only
            let core = (windowlen - hopsize) / 2;
            dump.write(
                self.window_offs + core as i64 - self.start_pos,
                &self.dump_buf[core..core + hopsize],
            );
        }

        self.window_offs += hopsize as i64;
        self.fno += 1;
        true
    }
}

impl DecoderBackend for DemodDecoder {
    fn decode_byte(&mut self) -> Option<DecodedByte> {
        while self.byte_index == self.byte_buf.len() {
            self.byte_index = 0;
            self.byte_buf.clear();
            if !self.decode_window() {
                return None;
            }
        }
        let byte = self.byte_buf[self.byte_index];
        self.byte_index += 1;
        Some(byte)
    }
}
