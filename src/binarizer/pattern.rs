/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Viterbi pattern-matching binarizer, applicable to both formats.
use core::f32::consts::PI;

use orictape_core::filter::Balancer;
use orictape_core::sound::Sound;

use super::{window_margin, Binarizer, BitEvent};

const FORCED_COST: f32 = 1e20;

/// Tracks the signal with a four phase state machine (rise, high,
/// fall, low), each phase elastic between `t_clk_min` and `t_clk_max`
/// samples. The transition window is a half cosine ramp scaled by the
/// local amplitude envelope; the cost is the absolute deviation of the
/// balanced signal from the pattern.
///
/// ```text
///  .-----------------------------------------------------------------------.
///  |   .-------.---.    .-------.---.    .-------.---.    .-------.---.    |
///  '-->| R     |   +-+->| H     |   +-+->| F     |   +-+->| L     |   +-+--'
///      '-------'---' |  '-------'---' |  '-------'---' |  '-------'---' |
///                    '----------------'                '----------------'
///           _-------     ------------     --_
///         _-                                 -_
///       --                                     ------     -------------
/// ```
///
/// Events are emitted at the trigger sub-state of each phase (the zero
/// crossings and the plateau middles), giving well defined bit
/// boundaries for splicing windows together.
pub struct PatternBinarizer {
    balancer: Balancer,

    buf: Vec<f32>,  // balanced signal
    abuf: Vec<f32>, // amplitude envelope
    loaded_start: i64,
    loaded_end: i64,
}

impl PatternBinarizer {
    pub fn new(src: &Sound, t_ref: f64) -> Self {
        // Balancing filter parameters; set these to 1 to disable filtering
        let mm_filterlen = (4.5 * t_ref).floor() as usize | 1;
        let lp_filterlen = (12.0 * t_ref).floor() as usize | 1;
        PatternBinarizer {
            balancer: Balancer::new(src, mm_filterlen, lp_filterlen),
            buf: Vec::new(),
            abuf: Vec::new(),
            loaded_start: 0,
            loaded_end: 0,
        }
    }

    /// Loads the balanced signal and amplitude envelope for the given
    /// window, moving any overlap with the previously loaded window
    /// instead of recomputing it.
    fn load(&mut self, window_offs: i64, bufsize: usize) {
        if self.buf.len() < bufsize {
            self.buf.resize(bufsize, 0.0);
            self.abuf.resize(bufsize, 0.0);
            self.loaded_start = 0;
            self.loaded_end = 0; // nothing loaded in the buffers
        }

        let mut overlap = 0usize;
        if self.loaded_start < window_offs && self.loaded_end > window_offs {
            let hop = window_offs - self.loaded_start;
            if hop > 0 && (hop as usize) < bufsize {
                overlap = (self.loaded_end - window_offs) as usize;
                if overlap > bufsize - 1 {
                    overlap = bufsize - 1;
                }
                let hop = hop as usize;
                self.buf.copy_within(hop..hop + overlap, 0);
                self.abuf.copy_within(hop..hop + overlap, 0);
            }
        }

        self.balancer.read_with_amplitude(
            window_offs + overlap as i64,
            &mut self.buf[overlap..bufsize],
            &mut self.abuf[overlap..bufsize],
        );

        self.loaded_start = window_offs;
        self.loaded_end = window_offs + bufsize as i64;
    }
}

impl Binarizer for PatternBinarizer {
    fn sample_rate(&self) -> i32 {
        self.balancer.sample_rate()
    }

    fn length(&self) -> i64 {
        self.balancer.length()
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
        let mut left_margin = window_margin(self.sample_rate());
        let right_margin = left_margin;

        // The left margin is not needed when a rise edge is given
        if given_rise_edge.is_some() {
            left_margin = 0;
        }

        let bufsize = left_margin + core_len + right_margin;
        self.load(core_start - left_margin as i64, bufsize);
        let buf = &self.buf[..bufsize];
        let abuf = &self.abuf[..bufsize];

        // Adjust the boundary edge by the margin
        let given = given_rise_edge.map(|g| g + left_margin as i64);

        let t_clk_min = (0.5 + t_clk - dt_clk).floor() as usize;
        let t_clk_max = (0.5 + t_clk + dt_clk).floor() as usize;

        // State encoding "RHFL": rise, high, fall, low
        let ns = 4 * t_clk_max;
        let s_r = 0;
        let s_h = t_clk_max;
        let s_f = 2 * t_clk_max;
        let s_l = 3 * t_clk_max;

        // We want a state where the pattern is zero so there is a well
        // defined zero crossing location, good for splicing sequences.
        // The angle is k*(i+1), so at i = t_slope/2-1 the rise pattern
        // is -cos(PI/2) = 0.
        let t_slope = t_clk_min + (t_clk_min & 1); // even
        let s_trig_r = s_r + t_slope / 2 - 1; // state rising through 0
        let s_trig_h = s_h + t_slope / 2 - 1; // state where a sustained 1 is detected
        let s_trig_f = s_f + t_slope / 2 - 1; // state falling through 0
        let s_trig_l = s_l + t_slope / 2 - 1; // state where a sustained 0 is detected

        let mut pattern = vec![0.0f32; ns];
        let k = PI / t_slope as f32;
        for i in 0..t_slope {
            pattern[i] = -(k * (i + 1) as f32).cos(); // rise
        }
        for i in t_slope..2 * t_clk_max {
            pattern[i] = 1.0; // high
        }
        for i in 0..2 * t_clk_max {
            pattern[2 * t_clk_max + i] = -pattern[i]; // fall, low
        }

        // A scrollable cost vector: shifting all states down by one is
        // a base pointer move until the margin is used up.
        let scroll_margin = ns.max(64);
        let mut storage = vec![0.0f32; ns + scroll_margin];
        let mut base = scroll_margin;

        for s in 0..ns {
            storage[base + s] = (buf[0] - pattern[s] * abuf[0]).abs();
        }

        // Force a rise edge if requested
        if given == Some(0) {
            for s in 0..ns {
                storage[base + s] = if s == s_trig_r { 0.0 } else { FORCED_COST };
            }
        }

        let mut pred = vec![0u16; bufsize * 4];

        for i in 1..bufsize {
            let costs = &storage[base..base + ns];

            // Find the best predecessor of H
            let mut p = s_r + t_clk_max - 1;
            let mut c = costs[p];
            for s in s_r + t_clk_min - 1..s_r + t_clk_max - 1 {
                if c > costs[s] {
                    c = costs[s];
                    p = s;
                }
            }
            pred[i * 4 + 1] = p as u16;
            let c_h = c;

            // Find the best predecessor of F. This might be H or H's
            // predecessor R; continue with p,c kept from above.
            for s in s_h + t_clk_min - 1..s_h + t_clk_max {
                if c > costs[s] {
                    c = costs[s];
                    p = s;
                }
            }
            pred[i * 4 + 2] = p as u16;
            let c_f = c;

            // Find the best predecessor of L
            p = s_f + t_clk_max - 1;
            c = costs[p];
            for s in s_f + t_clk_min - 1..s_f + t_clk_max - 1 {
                if c > costs[s] {
                    c = costs[s];
                    p = s;
                }
            }
            pred[i * 4 + 3] = p as u16;
            let c_l = c;

            // Find the best predecessor of R, continuing from L's scan
            for s in s_l + t_clk_min - 1..s_l + t_clk_max {
                if c > costs[s] {
                    c = costs[s];
                    p = s;
                }
            }
            pred[i * 4] = p as u16;
            let c_r = c;

            // Move costs one step down (to higher index)
            if base > 0 {
                // Fast case: move elements down by moving the base up
                base -= 1;
            } else {
                // Slow case: place the array back at the margin,
                // copying the old data to offset 1 in the new position
                storage.copy_within(0..ns - 1, scroll_margin + 1);
                base = scroll_margin;
            }

            storage[base + s_r] = c_r;
            storage[base + s_h] = c_h;
            storage[base + s_f] = c_f;
            storage[base + s_l] = c_l;

            // Score the local signal against the pattern. The first
            // 2*t_clk_max states are mirrored by the later ones.
            let amp = abuf[i];
            let sig = buf[i];
            let costs = &mut storage[base..base + ns];
            for s in 0..t_slope {
                let p = pattern[s] * amp; // rise curve
                costs[s] += (sig - p).abs();
                costs[2 * t_clk_max + s] += (sig + p).abs(); // flipped
            }
            let dh = (sig - amp).abs(); // cost of the high plateau
            let dl = (sig + amp).abs(); // cost of the low plateau
            for s in t_slope..2 * t_clk_max {
                costs[s] += dh;
                costs[2 * t_clk_max + s] += dl;
            }

            // Force a rise edge if requested
            if given == Some(i as i64) {
                for s in 0..ns {
                    costs[s] = if s == s_trig_r { 0.0 } else { FORCED_COST };
                }
            }
        }

        // Backtrace: find the best end state
        let costs = &storage[base..base + ns];
        let mut s = 0usize;
        let mut c = costs[0];
        for (s1, &c1) in costs.iter().enumerate() {
            if c > c1 {
                c = c1;
                s = s1;
            }
        }

        // Reconstruct the signal at the end position
        let x = bufsize as i64 - 1 - left_margin as i64;
        if x >= 0 && (x as usize) < core_len {
            dbg_buf[x as usize] = buf[bufsize - 1];
        }

        // Trace back the chain of predecessors, noting trigger states
        let mut xs: Vec<i64> = Vec::new();
        let mut vals: Vec<bool> = Vec::new();
        let mut last_rise: i64 = -1;
        let lower = given.unwrap_or(-1);
        let mut i = bufsize as i64 - 2;
        while i >= 0 && i >= lower {
            let iu = (i + 1) as usize;
            s = if s == s_r {
                pred[iu * 4] as usize
            } else if s == s_h {
                pred[iu * 4 + 1] as usize
            } else if s == s_f {
                pred[iu * 4 + 2] as usize
            } else if s == s_l {
                pred[iu * 4 + 3] as usize
            } else {
                s - 1 // state with just one predecessor
            };

            let xd = i - left_margin as i64;
            if xd >= 0 && (xd as usize) < core_len {
                dbg_buf[xd as usize] = pattern[s] * abuf[i as usize];
            }

            if s == s_trig_r || s == s_trig_h || s == s_trig_f || s == s_trig_l {
                if s == s_trig_r {
                    last_rise = xs.len() as i64;
                }
                vals.push(s == s_trig_r || s == s_trig_h);
                xs.push(i);
            }
            i -= 1;
        }

        // Discard events beyond the leftmost rise edge
        let evt_cnt = (last_rise + 1) as usize;
        xs.truncate(evt_cnt);
        vals.truncate(evt_cnt);

        // The events were picked walking backwards; reverse them and
        // make the coordinates relative to the core start.
        for (&x, &val) in xs.iter().rev().zip(vals.iter().rev()) {
            events.push(BitEvent {
                x: x - left_margin as i64,
                val,
            });
        }
        evt_cnt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A clean fast-format style pulse train: alternating high and low
    /// levels, two or three clocks per level.
    fn pulse_sound(rate: i32, t_clk: usize, lens: &[usize]) -> Sound {
        let mut samples = Vec::new();
        // lead-in silence
        samples.resize(40 * t_clk, 0.0f32);
        let mut level = 0.6f32;
        for &cycles in lens {
            for _ in 0..cycles * t_clk {
                samples.push(level);
            }
            level = -level;
        }
        samples.resize(samples.len() + 40 * t_clk, 0.0);
        Sound::from_vec(samples, rate)
    }

    #[test]
    fn tracks_a_clean_pulse_train() {
        let rate = 44100;
        let t_ref = rate as f64 / 4800.0;
        let t_clk = t_ref.round() as usize;
        // Levels sustained one or two clocks, as in the fast format
        let lens = [1usize, 1, 2, 1, 1, 2, 2, 1, 2, 1, 1, 1, 2, 2, 1, 1];
        let snd = pulse_sound(rate, t_clk, &lens);
        let mut binarizer = PatternBinarizer::new(&snd, t_ref);

        let core_len = snd.length() as usize;
        let mut events = Vec::new();
        let mut dbg = vec![0.0f32; core_len];
        let cnt = binarizer.read(&mut events, 0, core_len, &mut dbg, None, t_ref, 0.25 * t_ref);
        assert_eq!(cnt, events.len());
        assert!(cnt >= 4, "expected a handful of events, got {}", cnt);
        assert!(events[0].val, "first event must be a rising edge");
        for pair in events.windows(2) {
            assert!(pair[0].x < pair[1].x, "events must be ordered");
        }
    }

    #[test]
    fn forced_rise_edge_is_reproduced() {
        let rate = 44100;
        let t_ref = rate as f64 / 4800.0;
        let t_clk = t_ref.round() as usize;
        let lens = [1usize, 1, 1, 2, 1, 2, 1, 1, 2, 1, 1, 2];
        let snd = pulse_sound(rate, t_clk, &lens);
        let mut binarizer = PatternBinarizer::new(&snd, t_ref);

        let core_len = snd.length() as usize - 100;
        let mut events = Vec::new();
        let mut dbg = vec![0.0f32; core_len];
        let forced = 40 * t_clk as i64; // the true first rising edge
        let cnt = binarizer.read(
            &mut events,
            0,
            core_len,
            &mut dbg,
            Some(forced),
            t_ref,
            0.25 * t_ref,
        );
        assert!(cnt >= 1);
        assert_eq!(forced, events[0].x, "forced edge must come back out");
        assert!(events[0].val);
    }
}
