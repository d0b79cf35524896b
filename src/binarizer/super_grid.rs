/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Revised grid binarizer with less jitter.
//!
//! Bandpasses the input (narrow minus wide low-pass), forms a
//! magnitude signal, re-balances it with a secondary Hann filter, then
//! runs a fractional-stride Viterbi with four sub-samples per input
//! sample. Each state represents an incoming stride, so the clock can
//! drift smoothly within `[t_clk_min, t_clk_max]`. Bit values are
//! sampled from the bandpass signal at the chosen grid points.
use orictape_core::dsp::{hann_lowpass, interp_lin};
use orictape_core::filter::LowpassFilter;
use orictape_core::sound::Sound;

use super::{discard_before_rise, window_margin, Binarizer, BitEvent};

/// Sub-samples per input sample in the Viterbi propagation. Higher
/// values are slower but enable higher inertia.
const SCALE: usize = 4;

const INVALID_GRID_SCORE: f32 = -1e20;
const BOUNDARY_GRID_SCORE: f32 = 1e10;

pub struct SuperBinarizer {
    long_filter: LowpassFilter,
    short_filter: LowpassFilter,
    long_buf: Vec<f32>,
    band_buf: Vec<f32>,
    mag_buf: Vec<f32>,
    edf_buf: Vec<f32>,
}

impl SuperBinarizer {
    pub fn new(src: &Sound, t_ref: f64) -> Self {
        SuperBinarizer {
            long_filter: LowpassFilter::new(src, (12.0 * t_ref).floor() as usize | 1),
            short_filter: LowpassFilter::new(src, (2.0 * t_ref).floor() as usize | 1),
            long_buf: Vec::new(),
            band_buf: Vec::new(),
            mag_buf: Vec::new(),
            edf_buf: Vec::new(),
        }
    }
}

impl Binarizer for SuperBinarizer {
    fn sample_rate(&self) -> i32 {
        self.long_filter.sample_rate()
    }

    fn length(&self) -> i64 {
        self.long_filter.length()
    }

    fn read(
        &mut self,
        events: &mut Vec<BitEvent>,
        core_start: i64,
        core_len: usize,
        dbg_buf: &mut [f32],
        given_rise_edge: Option<i64>,
        t_clk: f64,
        dt_clk: f64,
    ) -> usize {
        let margin = window_margin(self.sample_rate());
        let bufsize = margin + core_len + margin;

        let given = given_rise_edge.map(|g| g + margin as i64);

        if self.long_buf.len() < bufsize {
            self.long_buf.resize(bufsize, 0.0);
            self.band_buf.resize(bufsize, 0.0);
            self.mag_buf.resize(bufsize, 0.0);
            self.edf_buf.resize(bufsize, 0.0);
        }

        //------------------------------------------------
        // Band pass
        //------------------------------------------------

        let offs = core_start - margin as i64;
        if !self.long_filter.read(offs, &mut self.long_buf[..bufsize])
            || !self.short_filter.read(offs, &mut self.band_buf[..bufsize])
        {
            return 0;
        }
        for i in 0..bufsize {
            self.band_buf[i] -= self.long_buf[i];
        }
        let band_buf = &self.band_buf[..bufsize];

        // Debug output
        dbg_buf[..core_len].copy_from_slice(&band_buf[margin..margin + core_len]);

        //------------------------------------------------
        // Phase detect function
        //------------------------------------------------

        // Form the magnitude signal
        for i in 0..bufsize {
            self.mag_buf[i] = band_buf[i].abs();
        }

        // A twice long filter, so period 4 gets rejected
        let mid_filterlen = (4.0 * self.sample_rate() as f64 / 4800.0).floor() as usize | 1;
        let mid_margin = mid_filterlen / 2;

        // Second high pass to re-balance the signal
        let edf_buf = &mut self.edf_buf[..bufsize];
        if bufsize > 2 * mid_margin {
            hann_lowpass(
                &mut edf_buf[mid_margin..bufsize - mid_margin],
                &self.mag_buf[..bufsize],
                mid_filterlen,
            );
        }
        for x in edf_buf[..mid_margin.min(bufsize)].iter_mut() {
            *x = 0.0;
        }
        for i in mid_margin..bufsize.saturating_sub(mid_margin) {
            edf_buf[i] = self.mag_buf[i] - edf_buf[i];
        }
        for x in edf_buf[bufsize.saturating_sub(mid_margin)..].iter_mut() {
            *x = 0.0;
        }

        //------------------------------------------------
        // Forward propagation
        //------------------------------------------------

        // Each state represents an incoming stride of t_clk_min + s/SCALE
        let di_min = SCALE as i64 * (0.5 + t_clk - dt_clk).floor() as i64;
        let di_max = SCALE as i64 * (0.5 + t_clk + dt_clk).floor() as i64;

        let ns = (di_max - di_min + 1) as usize;
        assert!(ns < 256); // so predecessors fit a u8

        let ni = SCALE * bufsize;
        let kscale = 1.0 / SCALE as f32;
        let mut grid_scores = vec![0.0f32; ni * ns];
        let mut grid_pred_ss = vec![0u8; ni * ns];
        for i in 0..ni {
            let score = if i as i64 >= di_max {
                INVALID_GRID_SCORE
            } else if given.is_some() {
                -BOUNDARY_GRID_SCORE
            } else {
                0.0
            };
            for s in 0..ns {
                grid_scores[i * ns + s] = score;
                grid_pred_ss[i * ns + s] = (ns / 2) as u8;
            }
        }

        let given_scaled = given.map(|g| g * SCALE as i64);
        for i in 0..ni {
            let edge_score = interp_lin(edf_buf, kscale * i as f32);
            let boundary_score = if given_scaled == Some(i as i64) {
                BOUNDARY_GRID_SCORE
            } else {
                0.0
            };

            for s in 0..ns {
                grid_scores[i * ns + s] += edge_score + boundary_score;
            }

            for s0 in 0..ns as i64 {
                for s1 in s0 - 1..=s0 + 1 {
                    if s1 >= 0 && s1 < ns as i64 && i as i64 + di_min + s1 < ni as i64 {
                        let i1 = (i as i64 + di_min + s1) as usize;
                        let a0 = i * ns + s0 as usize;
                        let a1 = i1 * ns + s1 as usize;
                        if grid_scores[a1] < grid_scores[a0] {
                            grid_scores[a1] = grid_scores[a0];
                            grid_pred_ss[a1] = s0 as u8;
                        }
                    }
                }
            }
        }

        //------------------------------------------------
        // Find the best end state
        //------------------------------------------------

        let mut best_i = ni - 1;
        let mut best_s = 0usize;
        let mut best_r = grid_scores[best_i * ns + best_s];
        for i in ni.saturating_sub(di_max as usize)..ni {
            for s in 0..ns {
                if best_r < grid_scores[i * ns + s] {
                    best_r = grid_scores[i * ns + s];
                    best_i = i;
                    best_s = s;
                }
            }
        }

        //------------------------------------------------
        // Backtrace and set grid points
        //------------------------------------------------

        let mut xs: Vec<i64> = Vec::new();
        let mut found_given_edge = false;
        let lower = given_scaled.unwrap_or(-1).max(0);
        let mut i = best_i as i64;
        let mut s = best_s;
        while i >= lower {
            let x = i / SCALE as i64;
            debug_assert!(x >= 0 && (x as usize) < bufsize);
            xs.push(x);
            if given_scaled == Some(i) {
                found_given_edge = true;
            }
            let sp = grid_pred_ss[i as usize * ns + s] as usize;
            i -= di_min + s as i64;
            s = sp;
        }

        // The boundary condition must always be met
        if let Some(g) = given {
            if g < bufsize as i64 {
                assert!(found_given_edge, "backtrace missed the forced rise edge");
            }
        }

        // The grid points were picked backwards; reverse them
        xs.reverse();

        //------------------------------------------------
        // Discriminate bits
        //------------------------------------------------

        // NOTE: a Viterbi constraining pulse lengths would fit here;
        // for now bits are sampled straight from the band buffer.
        let mut vals: Vec<bool> = xs
            .iter()
            .map(|&x| x >= 0 && (x as usize) < bufsize && band_buf[x as usize] > 0.0)
            .collect();

        // Discard events beyond the leftmost rise edge
        discard_before_rise(&mut xs, &mut vals, given);

        // Remove the margin offset from the output coordinates; some
        // may come out negative, to the left of the window.
        let cnt = xs.len();
        for (x, val) in xs.into_iter().zip(vals) {
            events.push(BitEvent {
                x: x - margin as i64,
                val,
            });
        }
        cnt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_spacing_tracks_the_clock() {
        let rate = 44100;
        let t_ref = rate as f64 / 4800.0;
        let t_clk = t_ref.round() as usize;

        // Alternate every clock period, like a run of fast-format '1's
        let mut samples = vec![0.0f32; 40 * t_clk];
        for (i, y) in samples.iter_mut().enumerate().skip(4 * t_clk) {
            *y = if (i / t_clk) & 1 == 0 { 0.5 } else { -0.5 };
        }
        let snd = Sound::from_vec(samples, rate);
        let mut binarizer = SuperBinarizer::new(&snd, t_ref);

        let core_len = snd.length() as usize;
        let mut events = Vec::new();
        let mut dbg = vec![0.0f32; core_len];
        let dt = 0.2 * t_ref;
        let cnt = binarizer.read(&mut events, 0, core_len, &mut dbg, None, t_ref, dt);
        assert_eq!(cnt, events.len());
        assert!(cnt > 2);

        let t_min = (0.5 + t_ref - dt).floor() as i64;
        let t_max = (0.5 + t_ref + dt).floor() as i64 + 1;
        for pair in events.windows(2) {
            let d = pair[1].x - pair[0].x;
            assert!(
                d >= t_min && d <= t_max,
                "stride {} outside [{}, {}]",
                d,
                t_min,
                t_max
            );
        }
    }
}
