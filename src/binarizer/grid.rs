/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Grid binarizer.
//!
//! Two passes: an edge detection function formed from four samples
//! spaced half a clock apart, then a dynamic program selecting a
//! maximum score sequence of grid points with inter-point distances in
//! `[t_clk_min, t_clk_max]`. Bit values are sampled from the low-passed
//! signal at the chosen grid points.
use orictape_core::dsp::{interp, interp_lin};
use orictape_core::filter::LowpassFilter;
use orictape_core::sound::Sound;

use super::{discard_before_rise, window_margin, Binarizer, BitEvent};

const INVALID_GRID_SCORE: f32 = -1e20;
const BOUNDARY_GRID_SCORE: f32 = 1e10;

pub struct GridBinarizer {
    lowpass: LowpassFilter,
    lpbuf: Vec<f32>,
    edfbuf: Vec<f32>,
    edfbuf2: Vec<f32>,
}

impl GridBinarizer {
    pub fn new(src: &Sound, t_ref: f64) -> Self {
        let lp_filterlen = (2.0 * t_ref).floor() as usize | 1;
        GridBinarizer {
            lowpass: LowpassFilter::new(src, lp_filterlen),
            lpbuf: Vec::new(),
            edfbuf: Vec::new(),
            edfbuf2: Vec::new(),
        }
    }
}

impl Binarizer for GridBinarizer {
    fn sample_rate(&self) -> i32 {
        self.lowpass.sample_rate()
    }

    fn length(&self) -> i64 {
        self.lowpass.length()
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

        if self.lpbuf.len() < bufsize {
            self.lpbuf.resize(bufsize, 0.0);
            self.edfbuf.resize(bufsize, 0.0);
            self.edfbuf2.resize(bufsize, 0.0);
        }

        if !self
            .lowpass
            .read(core_start - margin as i64, &mut self.lpbuf[..bufsize])
        {
            return 0;
        }
        let lpbuf = &self.lpbuf[..bufsize];

        // Debug output: the low-passed signal
        dbg_buf[..core_len].copy_from_slice(&lpbuf[margin..margin + core_len]);

        let given = given_rise_edge.map(|g| g + margin as i64);

        let t_clk_min = (0.5 + t_clk - dt_clk).floor() as i64;
        let t_clk_max = (0.5 + t_clk + dt_clk).floor() as i64;
        let t_clk_typ = (0.5 + t_clk).floor() as i64;
        let t_clk = t_clk as f32;

        //------------------------------------------------
        // Pass 1: edge detection function
        //------------------------------------------------

        let edfbuf = &mut self.edfbuf[..bufsize];
        for (i, edf) in edfbuf.iter_mut().enumerate() {
            // Sample 4 bits, half a clock apart
            let y0 = interp_lin(lpbuf, i as f32 - 1.5 * t_clk);
            let y1 = interp_lin(lpbuf, i as f32 - 0.5 * t_clk);
            let y2 = interp_lin(lpbuf, i as f32 + 0.5 * t_clk);
            let y3 = interp_lin(lpbuf, i as f32 + 1.5 * t_clk);

            // Wave packet correlates: every two-clock pattern with an
            // edge at the middle sample
            let c0010 = -0.25 * y0 - 0.25 * y1 + 0.75 * y2 - 0.25 * y3;
            let c0011 = -0.5 * y0 - 0.5 * y1 + 0.5 * y2 + 0.5 * y3;
            let c0100 = -0.25 * y0 + 0.75 * y1 - 0.25 * y2 - 0.25 * y3;
            let c0101 = -0.5 * y0 + 0.5 * y1 - 0.5 * y2 + 0.5 * y3;
            let c0110 = -0.5 * y0 + 0.5 * y1 + 0.5 * y2 - 0.5 * y3;

            // This variant gives less phase error and only unit length
            // periods, compared to a plain |edge| correlate.
            *edf = (c0010 * c0010 + c0011 * c0011 + c0100 * c0100 + c0101 * c0101
                + c0110 * c0110)
                .sqrt();
        }

        //------------------------------------------------
        // Enhance the edge detection function
        //------------------------------------------------

        // Subtract the two surrounding values to get a zero-average
        // signal. The peak picking maximization needs this; it cannot
        // work on regions of constant sign.
        let edfbuf2 = &mut self.edfbuf2[..bufsize];
        for (i, out) in edfbuf2.iter_mut().enumerate() {
            *out = -0.5 * interp_lin(edfbuf, i as f32 - 0.5 * t_clk) + edfbuf[i]
                - 0.5 * interp_lin(edfbuf, i as f32 + 0.5 * t_clk);
        }
        edfbuf.copy_from_slice(edfbuf2);

        // Periodic averaging with the expected clock
        for (i, out) in edfbuf2.iter_mut().enumerate() {
            *out = (0.5 * interp_lin(edfbuf, i as f32 - 3.0 * t_clk)
                + interp_lin(edfbuf, i as f32 - 2.0 * t_clk)
                + interp_lin(edfbuf, i as f32 - t_clk)
                + edfbuf[i]
                + interp_lin(edfbuf, i as f32 + t_clk)
                + interp_lin(edfbuf, i as f32 + 2.0 * t_clk)
                + 0.5 * interp_lin(edfbuf, i as f32 + 3.0 * t_clk))
                / 6.0;
        }
        edfbuf.copy_from_slice(edfbuf2);

        //------------------------------------------------
        // Pass 2: grid extraction
        //------------------------------------------------

        let mut grid_scores = vec![0.0f32; bufsize];
        let mut grid_pred = vec![0i64; bufsize];

        for i in 0..bufsize {
            grid_scores[i] = if i as i64 >= t_clk_max {
                INVALID_GRID_SCORE
            } else if given.is_some() {
                -BOUNDARY_GRID_SCORE
            } else {
                0.0
            };
            grid_pred[i] = i as i64 - t_clk_typ;
        }

        // Forward propagation
        for i in 0..bufsize {
            grid_scores[i] += edfbuf[i];
            if given == Some(i as i64) {
                grid_scores[i] += BOUNDARY_GRID_SCORE;
            }

            let mut i1 = i as i64 + t_clk_min;
            while i1 <= i as i64 + t_clk_max && (i1 as usize) < bufsize {
                let i1u = i1 as usize;
                if grid_scores[i1u] < grid_scores[i] {
                    grid_scores[i1u] = grid_scores[i];
                    grid_pred[i1u] = i as i64;
                }
                i1 += 1;
            }
        }

        // Find the best end state
        let mut best_x = bufsize - 1;
        let mut best_r = grid_scores[best_x];
        for x in bufsize.saturating_sub(t_clk_max as usize)..bufsize {
            if best_r < grid_scores[x] {
                best_r = grid_scores[x];
                best_x = x;
            }
        }

        // Backtrace and set grid points
        let mut xs: Vec<i64> = Vec::new();
        let mut found_given_edge = false;
        let lower = given.unwrap_or(-1);
        let mut x = best_x as i64;
        while x >= 0 && x >= lower {
            xs.push(x);
            if Some(x) == given {
                found_given_edge = true;
            }
            x = grid_pred[x as usize];
        }

        // The boundary condition must always be met
        if let Some(g) = given {
            if g < bufsize as i64 {
                assert!(found_given_edge, "backtrace missed the forced rise edge");
            }
        }

        // The grid points were picked backwards; reverse them
        xs.reverse();

        //--------------------------------------------------------------------
        // Pass 3: discriminate bits
        //--------------------------------------------------------------------

        // NOTE: a Viterbi constraining pulse lengths would fit here;
        // for now each bit is interpreted on its own against the
        // average of the adjacent bins.
        let mut vals: Vec<bool> = Vec::with_capacity(xs.len());
        for i in 0..xs.len() {
            let x0 = if i > 0 {
                xs[i - 1] as f32
            } else {
                xs[i] as f32 - t_clk
            };
            let x1 = xs[i] as f32;
            let x2 = if i + 1 < xs.len() {
                xs[i + 1] as f32
            } else {
                x1 + t_clk
            };
            let x3 = if i + 2 < xs.len() {
                xs[i + 2] as f32
            } else {
                x2 + t_clk
            };

            let y0 = interp(lpbuf, (x0 + x1) / 2.0);
            let y1 = interp(lpbuf, (x1 + x2) / 2.0);
            let y2 = interp(lpbuf, (x2 + x3) / 2.0);

            vals.push(2.0 * y1 > y0 + y2);
        }

        //--------------------------------------------------------------------

        // Discard events beyond the leftmost rise edge. While pulse
        // lengths are unconstrained this can be a lot of bits.
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
    fn grid_spacing_respects_clock_bounds() {
        let rate = 44100;
        let t_ref = rate as f64 / 4800.0;
        let t_clk = t_ref.round() as usize;

        // Square wave alternating every two clocks
        let mut samples = vec![0.0f32; 30 * t_clk];
        for (i, y) in samples.iter_mut().enumerate().skip(5 * t_clk) {
            *y = if (i / (2 * t_clk)) & 1 == 0 { 0.6 } else { -0.6 };
        }
        let snd = Sound::from_vec(samples, rate);
        let mut binarizer = GridBinarizer::new(&snd, t_ref);

        let core_len = snd.length() as usize;
        let mut events = Vec::new();
        let mut dbg = vec![0.0f32; core_len];
        let dt = 0.2 * t_ref;
        let cnt = binarizer.read(&mut events, 0, core_len, &mut dbg, None, t_ref, dt);
        assert_eq!(cnt, events.len());
        assert!(cnt > 2);

        let t_min = (0.5 + t_ref - dt).floor() as i64;
        let t_max = (0.5 + t_ref + dt).floor() as i64;
        for pair in events.windows(2) {
            let d = pair[1].x - pair[0].x;
            assert!(
                (t_min..=t_max).contains(&d),
                "grid spacing {} outside [{}, {}]",
                d,
                t_min,
                t_max
            );
        }
    }
}
