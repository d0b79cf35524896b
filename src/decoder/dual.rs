/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Two-stage decoder capable of both slow and fast formats.
//!
//! A [Binarizer] produces physical bit events, format neutral; two
//! bit-to-byte Viterbi decoders (one slow, one fast) then run over the
//! bit window in parallel and their byte streams are emitted in
//! chronological order.
use log::warn;

use orictape_core::frame::{
    is_parity_ok, is_sync_ok, DecodedByte, FAST_CYCLES_PER_BYTE, SLOW_CYCLES_PER_BYTE,
};
use orictape_core::sound::Sound;

use crate::binarizer::{Binarizer, BitEvent, GridBinarizer, PatternBinarizer, SuperBinarizer};
use crate::options::{Binner, DecoderOptions, Fdec};

use super::{clip_range, DecoderBackend, DumpSink};

/// A byte event located in the bit window.
#[derive(Clone, Copy, Debug)]
struct ByteEvent {
    /// Bit index of the start bit in the bit event buffer.
    bit_index: usize,
    /// The 13-bit code.
    z: u16,
    /// Global time in seconds, annotated after decoding.
    time: f64,
}

//----------------------------------------------------------------------------
// Slow format bit-to-byte decoder
//----------------------------------------------------------------------------

/// Slow format byte extraction from the binarized signal.
///
/// One state per frame bit position. The level at each bit is judged
/// by the number of edges among the 16 bit-events that make up one
/// slow physical bit: eleven or more reads as '1'. Byte starts must
/// land 14..=18 bit-windows after the previous one.
fn decode_slow_bytes(out: &mut Vec<ByteEvent>, bin_vals: &[bool], given_byte_x: i64) {
    const NS: usize = 13; // frame bits per byte
    const BOUNDARY_COST: i64 = 1 << 30; // cost for violating given_byte_x
    const JUMP_MIN: i64 = 14;
    const JUMP_MAX: i64 = 18;

    let bin_cnt = bin_vals.len();
    if bin_cnt <= 16 {
        return;
    }

    // Forward pass
    let mut bits = vec![false; bin_cnt];
    let mut costs = vec![0i64; bin_cnt * NS];
    let mut preds = vec![0i64; bin_cnt * NS];
    for x in 0..bin_cnt {
        // Count the 7-15 edges among the 16 bit block starting at x
        let mut edge_cnt = 0i64;
        for dx in 0..15 {
            if x + dx + 1 >= bin_cnt {
                break;
            }
            edge_cnt += (bin_vals[x + dx] != bin_vals[x + dx + 1]) as i64;
        }

        bits[x] = edge_cnt >= 11; // bits as they look

        let c0 = edge_cnt - 7; // cost when 0 expected
        let c1 = 15 - edge_cnt; // cost when 1 expected

        for s in 0..NS {
            const K: i64 = 3;
            let mut local_cost = if s == 0 {
                K * c0 // start bit
            } else if s >= 10 {
                K * c1 // stop bits
            } else if edge_cnt < 11 {
                c0
            } else {
                c1
            };

            // Cost for not starting on an edge
            if x > 0 && bin_vals[x] == bin_vals[x - 1] {
                local_cost += 1;
            }

            if (x as i64) < JUMP_MAX {
                costs[x * NS + s] = local_cost;
                preds[x * NS + s] = x as i64 - 16;

                if given_byte_x >= 0 {
                    // Deducted later if the given byte is hit
                    costs[x * NS + s] += BOUNDARY_COST;
                }
            } else {
                let sp = if s == 0 { NS - 1 } else { s - 1 };
                let mut best_xp = x as i64 - 16;
                let mut best_cp = costs[best_xp as usize * NS + sp];

                for jump in JUMP_MIN..=JUMP_MAX {
                    let jump_cost = (jump - if s == 0 { 17 } else { 16 }).abs();
                    let xp = x as i64 - jump;
                    let cp = costs[xp as usize * NS + sp] + jump_cost;
                    if cp < best_cp {
                        best_cp = cp;
                        best_xp = xp;
                    }
                }
                costs[x * NS + s] = best_cp + local_cost;
                preds[x * NS + s] = best_xp;
            }
        }

        if x as i64 == given_byte_x {
            costs[x * NS] -= BOUNDARY_COST;
        }
    }

    // Find the end state
    let mut best_x = bin_cnt - 8;
    let mut best_s = 0usize;
    let mut best_c = costs[best_x * NS + best_s];
    for x in bin_cnt - 16..bin_cnt {
        for s in 0..NS {
            let c = costs[x * NS + s];
            if best_c > c {
                best_c = c;
                best_s = s;
                best_x = x;
            }
        }
    }

    // Track backwards, assembling 13-bit codes LSB first
    let mut z = 0u16;
    let mut s = best_s;
    let mut x = best_x as i64;
    let mut have_end_bit = false;
    while x >= 0 {
        z = (z << 1 | bits[x as usize] as u16) & 0x1fff;
        if s == NS - 1 {
            have_end_bit = true;
        }
        if s == 0 && have_end_bit {
            out.push(ByteEvent {
                bit_index: x as usize,
                z,
                time: 0.0,
            });
        }

        x = preds[x as usize * NS + s];
        s = if s == 0 { NS - 1 } else { s - 1 };
    }

    // The events were picked backwards; reverse into expected order
    out.reverse();
}

//----------------------------------------------------------------------------
// Fast format bit-to-byte decoder, pattern matching version
//----------------------------------------------------------------------------

/// Fast format byte extraction, original pattern matching version.
///
/// 13 bit states plus one half-bit state, times two polarities. Each
/// bit matches one of the patterns `10` (one), `1x0` (zero) or `1100`
/// (overlong zero) against the signed bit events; perfect sync bytes
/// are pre-detected with a shift register and boosted.
fn decode_fast_bytes_orig(out: &mut Vec<ByteEvent>, bin_vals: &[bool], given_byte_x: i64) {
    const NS: usize = 28;
    const INVALID_COST: i64 = 1 << 30;
    const BOUNDARY_COST: i64 = 1 << 29;
    const PAD: usize = 4;

    let bin_cnt = bin_vals.len();
    if bin_cnt <= 3 {
        return;
    }

    // PAD extra time steps to the right reduce bounds checks
    let mut costs = vec![0i64; (bin_cnt + PAD) * NS];
    let mut pred_xs = vec![0i64; (bin_cnt + PAD) * NS];
    let mut pred_bits = vec![false; (bin_cnt + PAD) * NS];

    let boundary = if given_byte_x >= 0 { BOUNDARY_COST } else { 0 };
    for x in 0..bin_cnt + PAD {
        for s in 0..NS {
            let base = if x < 3 { 2 * x as i64 } else { INVALID_COST };
            costs[NS * x + s] = base + boundary;

            // Pretend everything is a zero bit
            let k = s % 14;
            pred_xs[NS * x + s] = if k == 0 { x as i64 - 1 } else { x as i64 - 3 };
        }
    }

    // Detect perfect sync bytes (0x16 in either polarity)
    let mut pos_syncs = vec![false; bin_cnt];
    let mut neg_syncs = vec![false; bin_cnt];
    let mut sr = 0u64;
    for x in (0..bin_cnt).rev() {
        sr = sr << 1 | bin_vals[x] as u64;
        pos_syncs[x] = sr & 0x3ffffffff == 0x2a924a549;
        neg_syncs[x] = !sr & 0x3ffffffff == 0x2a924a549;
    }

    for x in 0..bin_cnt {
        // Signed version of the signal
        let sig = |i: usize| -> i64 {
            if i >= bin_cnt {
                0
            } else if bin_vals[i] {
                1
            } else {
                -1
            }
        };
        let y0 = if bin_vals[x] { 1 } else { -1 };
        let y1 = sig(x + 1);
        let y2 = sig(x + 2);
        let y3 = sig(x + 3);

        // Matching costs
        let c1 = -2 * y0 + 2 * y1; // 10 pattern (positive polarity 1)
        let c0 = -2 * y0 + 2 * y2; // 1x0 pattern (positive polarity 0)
        let c0l = -2 * y0 - 2 * y1 + 2 * y2 + 2 * y3; // 1100 pattern (positive overlong 0)

        if given_byte_x == x as i64 {
            costs[NS * x] -= BOUNDARY_COST; // positive polarity
            costs[NS * x + 14] -= BOUNDARY_COST; // negative polarity
        }

        // Boost sync bytes
        if pos_syncs[x] {
            costs[NS * x] -= 8;
        }
        if neg_syncs[x] {
            costs[NS * x + 14] -= 8;
        }

        // Try making a 0 (1x0 pattern). Nominally 100, but accepting
        // 110 helps worn tapes.
        for k in 0..13 {
            let src = NS * x + k;
            let dst = NS * (x + 3) + k + 1;
            let sync_cost = if k >= 10 { 8 } else { 0 };
            if costs[dst] > costs[src] + c0 + sync_cost {
                costs[dst] = costs[src] + c0 + sync_cost;
                pred_xs[dst] = x as i64;
                pred_bits[dst] = false;
            }
            // Other polarity, flipped sign
            let src = src + 14;
            let dst = dst + 14;
            if costs[dst] > costs[src] - c0 + sync_cost {
                costs[dst] = costs[src] - c0 + sync_cost;
                pred_xs[dst] = x as i64;
                pred_bits[dst] = false;
            }
        }

        // Try making an overlong 0 (1100 pattern), +1 penalty for the
        // overlong shape itself
        for k in 0..13 {
            let src = NS * x + k;
            let dst = NS * (x + 4) + k + 1;
            let sync_cost = if k >= 10 { 8 + 1 } else { 1 };
            if costs[dst] > costs[src] + c0l + sync_cost {
                costs[dst] = costs[src] + c0l + sync_cost;
                pred_xs[dst] = x as i64;
                pred_bits[dst] = false;
            }
            let src = src + 14;
            let dst = dst + 14;
            if costs[dst] > costs[src] - c0l + sync_cost {
                costs[dst] = costs[src] - c0l + sync_cost;
                pred_xs[dst] = x as i64;
                pred_bits[dst] = false;
            }
        }

        // Try making a 1 (10 pattern)
        for k in 0..13 {
            let src = NS * x + k;
            let dst = NS * (x + 2) + k + 1;
            let sync_cost = if k == 0 { 8 } else { 0 };
            if costs[dst] > costs[src] + c1 + sync_cost {
                costs[dst] = costs[src] + c1 + sync_cost;
                pred_xs[dst] = x as i64;
                pred_bits[dst] = true;
            }
            let src = src + 14;
            let dst = dst + 14;
            if costs[dst] > costs[src] - c1 + sync_cost {
                costs[dst] = costs[src] - c1 + sync_cost;
                pred_xs[dst] = x as i64;
                pred_bits[dst] = true;
            }
        }

        // Make the half bit
        costs[NS * (x + 1)] = costs[NS * x + 27] - 2 * y0;
        costs[NS * (x + 1) + 14] = costs[NS * x + 13] + 2 * y0;
        pred_xs[NS * (x + 1)] = x as i64;
        pred_xs[NS * (x + 1) + 14] = x as i64;
    }

    // Find the end state
    let mut best_x = bin_cnt - 2;
    let mut best_s = 0usize;
    let mut best_c = costs[best_x * NS + best_s];
    for x in bin_cnt - 3..bin_cnt {
        for s in 0..NS {
            let c = costs[x * NS + s];
            if best_c > c {
                best_c = c;
                best_s = s;
                best_x = x;
            }
        }
    }

    // Track backwards
    let mut z = 0u16;
    let mut s = best_s;
    let mut x = best_x as i64;
    let mut have_end_bit = false;
    let mut cur_bit = false;
    while x >= 0 {
        z = (z << 1 | cur_bit as u16) & 0x1fff;
        if s == 13 || s == 27 {
            have_end_bit = true;
        }
        if (s == 0 || s == 14) && have_end_bit {
            out.push(ByteEvent {
                bit_index: x as usize,
                z,
                time: 0.0,
            });
        }

        cur_bit = pred_bits[x as usize * NS + s];
        x = pred_xs[x as usize * NS + s];
        s = if s == 0 { NS - 1 } else { s - 1 };
    }

    out.reverse();
}

//----------------------------------------------------------------------------
// Fast format bit-to-byte decoder, pulse length version
//----------------------------------------------------------------------------

/// Fast format byte extraction over the pulse length sequence.
///
/// A byte is 27 pulses; candidate byte starts are scored by
/// correlating the pulse lengths with a zero-sum weight pattern, with
/// a reward for sync+parity clean codes, and chained with a step of
/// 23..=31 pulses.
fn decode_fast_bytes_plen(out: &mut Vec<ByteEvent>, bin_vals: &[bool], given_byte_x: i64) {
    const INVALID_COST: i64 = 1 << 30;
    const BOUNDARY_COST: i64 = 1 << 29;
    const PAD: usize = 40;

    // Correlation weights; constructed as follows:
    // a. correlate for sync bits:          [ 1 1] 9*[ 0,0] 7*[-1]
    // b. mul by 4, add 1 to the first 20:  [ 5 5] 9*[ 1,1] 7*[-4] (sum 0)
    // c. pattern for polarity / phase:     [-1 1] 9*[-1,1] 7*[ 0]
    // d. (b+c)/2:                          [ 2 3] 9*[ 0,1] 7*[-2]
    // e. rotate so two stop bits sit to the left, which keeps a $c0
    //    byte from being found inside a $00 byte.
    const W: [i64; 27] = [
        -2, -2, -2, -2, 2, 3, // 2 stop and 1 start bit
        0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, // 9 data / parity bits
        -2, -2, -2, // 1.5 stop bits
    ];

    let bin_cnt = bin_vals.len();

    // Convert to pulse length notation
    let mut pulse_lens: Vec<u8> = Vec::new();
    let mut pulse_xs: Vec<usize> = Vec::new();
    let mut last_edge_x: i64 = -1;
    for x in 1..bin_cnt {
        if bin_vals[x] != bin_vals[x - 1] {
            if last_edge_x != -1 {
                pulse_lens.push((x as i64 - last_edge_x) as u8);
                pulse_xs.push(last_edge_x as usize);
            }
            last_edge_x = x as i64;
        }
    }
    let pulse_cnt = pulse_lens.len();
    if pulse_cnt < 55 {
        return; // need two full bytes to chain
    }

    // Initialize the cost landscape
    let mut costs = vec![0i64; pulse_cnt + PAD];
    let mut preds = vec![0i64; pulse_cnt + PAD];
    let mut zs = vec![0u16; pulse_cnt];
    for i in 0..pulse_cnt + PAD {
        costs[i] = if i >= 27 {
            INVALID_COST
        } else if given_byte_x >= 0 {
            BOUNDARY_COST
        } else {
            0
        };
        preds[i] = i as i64 - 27;
    }

    // Forward cost propagation
    for i in 0..pulse_cnt - 27 {
        // Build the 13-bit LSB first representation
        let two_pulses = |k: usize| -> u32 {
            pulse_lens[i + 2 * k] as u32 + pulse_lens[i + 2 * k + 1] as u32
        };
        let mut z: u16;
        if i < 2 {
            z = 0;
            for k in 0..13 {
                if two_pulses(k) < 3 {
                    z |= 1 << k;
                }
            }
        } else {
            // Fast case: shift in just one new bit
            z = zs[i - 2] >> 1;
            if two_pulses(12) < 3 {
                z |= 1 << 12;
            }
        }
        zs[i] = z;

        // Correlate with the zero-sum weight pattern
        let mut corr = 0i64;
        for j in -4i64..23 {
            let jj = i as i64 + j;
            if jj >= 0 && (jj as usize) < pulse_cnt {
                corr += pulse_lens[jj as usize] as i64 * W[(4 + j) as usize];
            }
        }

        // Local cost
        let mut c = -corr;
        if is_sync_ok(z) && is_parity_ok(z) {
            c -= 8;
        }

        if pulse_xs[i] as i64 == given_byte_x {
            c -= BOUNDARY_COST; // award for hitting the boundary constraint
        }

        costs[i] += c;

        // Propagate costs, step range 23..=31
        for di in 23..=31usize {
            let i1 = i + di;
            let tc = if di == 27 { 0 } else { 2 * (di as i64 - 27).abs() + 4 };
            if costs[i1] > costs[i] + tc {
                costs[i1] = costs[i] + tc;
                preds[i1] = i as i64;
            }
        }
    }

    // Find the end state among the last 27 start candidates
    let mut best_i = pulse_cnt - 27 - 1;
    let mut best_c = costs[best_i];
    for i in (pulse_cnt - 27).saturating_sub(27)..pulse_cnt - 27 {
        if best_c > costs[i] {
            best_c = costs[i];
            best_i = i;
        }
    }

    // Track backwards
    let mut i = best_i as i64;
    while i >= 0 {
        out.push(ByteEvent {
            bit_index: pulse_xs[i as usize],
            z: zs[i as usize],
            time: 0.0,
        });
        i = preds[i as usize];
    }

    out.reverse();
}

//----------------------------------------------------------------------------
// Fast format bit-to-byte decoder, barrel version
//----------------------------------------------------------------------------

/// Fast format byte extraction with a 108-state barrel shifter.
///
/// 27 pulse positions times four states (short/long head, short/long
/// tail), with intrinsic costs favouring a short start-bit tail and
/// long stop-bit tails; the whole state bank rotates by two per bit
/// event.
fn decode_fast_bytes_barrel(out: &mut Vec<ByteEvent>, bin_vals: &[bool], given_byte_x: i64) {
    const NS: usize = 108; // 27 instances of the 4-state H[H]L[L]

    let bin_cnt = bin_vals.len();
    if bin_cnt == 0 {
        return;
    }

    // Tabulate the intrinsic state costs
    let mut state_costs = [0i64; NS];

    // Penalize long lead pulses, including half bit 13
    for s in 0..54 {
        state_costs[s] = if s & 3 == 1 { 2 } else { 0 };
    }

    // Penalize a long sync tail pulse, reward a short start tail pulse
    state_costs[3] = -2; // start bit
    state_costs[4 * 10 + 3] = 2; // stop bit
    state_costs[4 * 11 + 3] = 2; // stop bit
    state_costs[4 * 12 + 3] = 2; // stop bit

    // The second polarity has the same costs as the first
    for s in 0..54 {
        state_costs[54 + s] = state_costs[s];
    }

    let mut preds = vec![0u8; bin_cnt * NS];
    let mut costs = [0i64; NS];
    costs.copy_from_slice(&state_costs);

    // Forward pass
    for x in 0..bin_cnt {
        // Costs of the two wrap-around predecessors
        let mut cp0 = costs[NS - 2];
        let mut cp1 = costs[NS - 1];

        let mut s = 0usize;
        while s < NS {
            let sp0 = if s == 0 { NS - 2 } else { s - 2 };
            let old_c0 = costs[s];
            let old_c1 = costs[s + 1];

            costs[s] = cp0.min(cp1);
            costs[s + 1] = old_c0;

            preds[x * NS + s] = if cp0 <= cp1 { sp0 as u8 } else { sp0 as u8 + 1 };
            preds[x * NS + s + 1] = s as u8;

            if s == 54 - 4 || s == 108 - 4 {
                // Loop from 54-2 back to 54-4, motivated by an extra
                // stop bit seen in name zero terminators in the wild
                if costs[s] > costs[s + 2] + 1 {
                    costs[s] = costs[s + 2] + 1;
                    preds[x * NS + s] = (s + 2) as u8;
                }
            }

            cp0 = old_c0;
            cp1 = old_c1;
            s += 2;
        }

        // Handle the boundary condition
        if given_byte_x == x as i64 {
            for (s, cost) in costs.iter_mut().enumerate() {
                *cost = if s == 0 || s == 54 { 0 } else { 1 << 20 };
            }
        }

        // Add the state costs and the signal cost
        let ch: i64 = if bin_vals[x] { -2 } else { 2 }; // cost of the high state
        let cl = -ch;
        let mut s = 0usize;
        while s < NS {
            costs[s] += state_costs[s] + ch;
            costs[s + 1] += state_costs[s + 1] + ch;
            costs[s + 2] += state_costs[s + 2] + cl;
            costs[s + 3] += state_costs[s + 3] + cl;
            s += 4;
        }
    }

    // Find the best end state
    let mut s = 0usize;
    for s1 in 0..NS {
        if costs[s1] < costs[s] {
            s = s1;
        }
    }

    // Track backwards
    let mut x = bin_cnt as i64 - 1;
    let mut z = 0u16;
    let mut prev_byte_x: i64 = -1;
    while x >= 0 {
        let k = if s < 54 { s } else { s - 54 };

        // Clear the LSB of z upon a long tail pulse
        if k & 3 == 3 {
            z &= !1;
        }

        if k == 0 {
            if prev_byte_x != -1 {
                // The whole byte is visible
                out.push(ByteEvent {
                    bit_index: x as usize,
                    z,
                    time: 0.0,
                });
            }
            prev_byte_x = x;
        }

        // Shift at the start of the head pulse, assuming LSB 1
        if k & 3 == 0 {
            z = (z << 1) & 0x1fff | 1;
        }

        s = preds[x as usize * NS + s] as usize;
        x -= 1;
    }

    out.reverse();
}

fn decode_fast_bytes(fdec: Fdec, out: &mut Vec<ByteEvent>, bin_vals: &[bool], given_byte_x: i64) {
    match fdec {
        Fdec::Orig => decode_fast_bytes_orig(out, bin_vals, given_byte_x),
        Fdec::Plen => decode_fast_bytes_plen(out, bin_vals, given_byte_x),
        Fdec::Barrel => decode_fast_bytes_barrel(out, bin_vals, given_byte_x),
    }
}

//----------------------------------------------------------------------------
// DualDecoder
//----------------------------------------------------------------------------

/// Per-mode byte decoding state; index 0 is fast, 1 is slow.
#[derive(Default)]
struct ByteStream {
    enabled: bool,
    events: Vec<ByteEvent>,
    /// Bit index of a healthy byte start, carried to the next window.
    boundary_x: i64,
    /// Global sample coordinate of the last emitted byte.
    last_x: i64,
    /// Range of events to emit.
    emit_start: usize,
    emit_end: usize,
}

impl ByteStream {
    fn new(enabled: bool) -> Self {
        ByteStream {
            enabled,
            boundary_x: -1,
            last_x: -1,
            ..ByteStream::default()
        }
    }
}

/// Two-stage decoder: binarizer plus parallel slow/fast byte Viterbis.
pub struct DualDecoder {
    binarizer: Box<dyn Binarizer>,
    options: DecoderOptions,
    sample_rate: i32,

    // Clip interval
    start_pos: i64,
    end_pos: i64,

    // Clock parameters
    t_ref: f64,
    t_clk: f64,
    dt_min: f64,
    dt_max: f64,
    dt_clk: f64,

    // Window geometry
    windowlen: usize,
    hopsize: usize,
    window_offs: i64,

    // Bit events, in window coordinates
    bit_events: Vec<BitEvent>,

    streams: [ByteStream; 2], // [0]=fast [1]=slow

    dump: Option<DumpSink>,
    dump_buf: Vec<f32>,
}

impl DualDecoder {
    pub fn new(src: &Sound, options: DecoderOptions, enable_fast: bool, enable_slow: bool) -> Self {
        let sample_rate = src.sample_rate();
        let full_len = src.length();
        let (start_pos, end_pos) = clip_range(&options, sample_rate, full_len);

        let t_ref = sample_rate as f64 / options.f_ref as f64;

        // The search half width can be at most 20%, since at 2*1.2=2.4
        // a 3-period starts to look like a 2-period.
        let dt_max = 0.20 * t_ref;
        let dt_min = 0.07 * t_ref;

        let binarizer: Box<dyn Binarizer> = match options.binner {
            Binner::Grid => Box::new(GridBinarizer::new(src, t_ref)),
            Binner::Super => Box::new(SuperBinarizer::new(src, t_ref)),
            Binner::Pattern => Box::new(PatternBinarizer::new(src, t_ref)),
        };

        let windowlen =
            ((0.5 + 10.0 * SLOW_CYCLES_PER_BYTE as f64 * t_ref).floor() as usize) & !3;
        let hopsize = windowlen / 2;
        debug_assert!(hopsize & 1 == 0);

        // Start with the waveform start in the middle hop of the window
        let window_offs =
            start_pos - start_pos.rem_euclid(hopsize as i64) - (windowlen / 2) as i64
                + (hopsize / 2) as i64;

        let dump = options
            .dump
            .then(|| DumpSink::new(end_pos - start_pos, sample_rate, "dump-dual.wav"));

        DualDecoder {
            binarizer,
            options,
            sample_rate,
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
            bit_events: Vec::new(),
            streams: [ByteStream::new(enable_fast), ByteStream::new(enable_slow)],
            dump,
            dump_buf: vec![0.0; windowlen],
        }
    }

    /// Decodes bytes from the current bit window.
    fn decode_byte_window(&mut self, last_window: bool) {
        // Detected new clock parameters
        let mut detected_t_clk = self.t_ref;
        let mut detected_dt_clk = self.dt_max;

        let bin_vals: Vec<bool> = self.bit_events.iter().map(|e| e.val).collect();

        for slow in 0..2 {
            if !self.streams[slow].enabled {
                continue; // only run the asked for mode
            }

            // Portion of the window to interpret now
            let right_limit = if last_window {
                self.windowlen as i64
            } else {
                ((self.windowlen + self.hopsize) / 2) as i64
            };

            let k_time = 1.0 / self.sample_rate as f64;

            // Decode from bits to bytes
            let boundary_x = self.streams[slow].boundary_x;
            let mut events = core::mem::take(&mut self.streams[slow].events);
            events.clear();
            if slow == 1 {
                decode_slow_bytes(&mut events, &bin_vals, boundary_x);
            } else {
                decode_fast_bytes(self.options.fdec, &mut events, &bin_vals, boundary_x);
            }

            let nominal_bins_per_byte = if slow == 1 {
                SLOW_CYCLES_PER_BYTE
            } else {
                FAST_CYCLES_PER_BYTE
            };
            let t_half_byte = (0.5 + nominal_bins_per_byte as f64 * self.t_ref / 2.0) as i64;
            let mut healthy_byte_cnt = 0i64;
            let mut healthy_bit_cnt = 0i64;
            let mut healthy_samples = 0.0f64;

            let stream = &mut self.streams[slow];
            stream.emit_start = 0;
            stream.emit_end = 0;

            for i in 0..events.len() {
                let bix = events[i].bit_index;
                debug_assert!(bix < self.bit_events.len());
                let x = self.window_offs + self.bit_events[bix].x; // global sample offset

                // Annotate the global time
                events[i].time = k_time * x as f64;

                if self.bit_events[bix].x >= right_limit {
                    continue; // deal with in the next window instead
                }
                if stream.last_x >= 0 && x - stream.last_x < t_half_byte {
                    continue; // too close to the last accepted byte
                }
                if x < self.start_pos - t_half_byte || x > self.end_pos {
                    continue; // outside the user specified scan range
                }

                let z = events[i].z;

                // Extend the range of events to emit bytes for
                if stream.emit_end == 0 {
                    stream.emit_start = i;
                }
                stream.emit_end = i + 1;

                stream.last_x = x;
                if is_parity_ok(z) && is_sync_ok(z) && i + 1 < events.len() {
                    stream.boundary_x = bix as i64;

                    let bix1 = events[i + 1].bit_index;
                    healthy_byte_cnt += 1;
                    if slow == 1 {
                        healthy_bit_cnt += SLOW_CYCLES_PER_BYTE as i64;
                    } else {
                        healthy_bit_cnt += 27;
                        for b in 0..13 {
                            healthy_bit_cnt += (z >> b & 1 == 0) as i64;
                        }
                    }
                    healthy_samples +=
                        (self.bit_events[bix1].x - self.bit_events[bix].x) as f64;
                }
            }

            let emit_cnt = stream.emit_end - stream.emit_start;
            let health = if emit_cnt == 0 {
                0.0
            } else {
                healthy_byte_cnt as f64 / emit_cnt as f64
            };

            if health > 0.95 {
                detected_t_clk = healthy_samples / healthy_bit_cnt as f64;
                detected_dt_clk = self.dt_min;
            }

            self.streams[slow].events = events;
        }

        // Update the clock parameters with exponential decay; the
        // coefficients approximate the per-byte 15/16 decay of the
        // demodulation decoder over five bytes.
        self.t_clk = 0.75 * self.t_clk + 0.25 * detected_t_clk;
        self.dt_clk = 0.75 * self.dt_clk + 0.25 * detected_dt_clk;
    }

    /// Decodes one window; returns `false` when there is nothing left.
    fn decode_window(&mut self) -> bool {
        if self.window_offs >= self.end_pos {
            return false; // nothing to decode
        }

        let last_window = self.window_offs + self.hopsize as i64 >= self.end_pos;
        let windowlen = self.windowlen;
        let hopsize = self.hopsize;

        // Boundary condition, and binarizer skipping, from old events
        let mut given_rise_edge: Option<i64> = None;
        if let Some(last) = self.bit_events.last() {
            // Skip the portion already binarized
            debug_assert!(last.x >= 0);
            given_rise_edge = Some(last.x);

            // The binarizer will output the boundary rise edge again
            self.bit_events.pop();
        }

        // By default the core starts a quarter into the legacy window;
        // with a reasonable boundary condition, start right there.
        let mut core_start = self.window_offs + ((windowlen - hopsize) / 2) as i64;
        if let Some(edge) = given_rise_edge {
            if edge < (windowlen / 2) as i64 {
                core_start = self.window_offs + edge;
            }
        }

        let core_end = self.window_offs + ((windowlen + hopsize) / 2) as i64;
        let core_len = (core_end - core_start) as usize;
        let old_cnt = self.bit_events.len();

        let core_offs = core_start - self.window_offs;
        let given = given_rise_edge.map(|edge| edge - core_offs);

        // Run the binarizer; the first event is a rise edge
        let mut events = core::mem::take(&mut self.bit_events);
        let dbg = &mut self.dump_buf[core_offs as usize..core_offs as usize + core_len];
        self.binarizer.read(
            &mut events,
            core_start,
            core_len,
            dbg,
            given,
            self.t_clk,
            self.dt_clk,
        );
        for event in events[old_cnt..].iter_mut() {
            event.x += core_offs; // back to window coordinates
        }
        self.bit_events = events;

        self.decode_byte_window(last_window);

        // Save the window in the debug dump
        if self.dump.is_some() {
            // Draw spikes on the bit onsets
            for event in &self.bit_events {
                if event.x >= 0 && event.x < windowlen as i64 {
                    self.dump_buf[event.x as usize] = if event.val { 0.8 } else { -0.8 };
                }
            }

            // With just one of slow and fast enabled, draw larger
            // spikes on the byte onsets
            if self.streams[0].enabled != self.streams[1].enabled {
                let dix = self.streams[1].enabled as usize;
                let stream = &self.streams[dix];
                for event in &stream.events[stream.emit_start..stream.emit_end] {
                    let bix = event.bit_index;
                    if bix < self.bit_events.len() {
                        let x = self.bit_events[bix].x;
                        if x >= 0 && x < windowlen as i64 {
                            self.dump_buf[x as usize] =
                                if self.bit_events[bix].val { 1.0 } else { -1.0 };
                        }
                    }
                }
            }

            if let Some(dump) = self.dump.as_mut() {
                // Write out the range that was binarized
                dump.write(
                    core_start - self.start_pos,
                    &self.dump_buf[core_offs as usize..core_offs as usize + core_len],
                );
            }
        }

        let right_limit = if last_window {
            windowlen as i64
        } else {
            ((windowlen + hopsize) / 2) as i64
        };
        while self
            .bit_events
            .last()
            .map_or(false, |event| event.x > right_limit)
        {
            self.bit_events.pop();
        }

        // Discard events that will be left of the next window
        let mut delete_left = 0usize;
        while delete_left < self.bit_events.len() && self.bit_events[delete_left].x < 0 {
            delete_left += 1;
        }

        // Discard bit events right of the window core; the next window
        // analyzes them more reliably. The last kept event must be a
        // rise edge.
        let mut delete_right = 0usize;
        for i in (delete_left..self.bit_events.len()).rev() {
            if i > 0 && !self.bit_events[i - 1].val && self.bit_events[i].val {
                // rise edge at i
                if self.bit_events[i].x >= right_limit {
                    delete_right = self.bit_events.len() - 1 - i;
                }
            }
        }

        let keep_cnt = self.bit_events.len() - delete_left - delete_right;
        if keep_cnt == 0 {
            warn!("no bit events survived the window at {}", self.window_offs);
        }

        // Shift the kept events into the next window's frame of reference
        self.bit_events.truncate(self.bit_events.len() - delete_right);
        self.bit_events.drain(..delete_left);
        for event in self.bit_events.iter_mut() {
            event.x -= hopsize as i64;
        }

        // Update the byte-level boundary conditions likewise
        for stream in self.streams.iter_mut() {
            stream.boundary_x -= delete_left as i64; // ignored when negative
        }

        self.window_offs += hopsize as i64;
        true
    }
}

impl DecoderBackend for DualDecoder {
    fn decode_byte(&mut self) -> Option<DecodedByte> {
        // Refill while both emit ranges are empty
        while self.streams[0].emit_start == self.streams[0].emit_end
            && self.streams[1].emit_start == self.streams[1].emit_end
        {
            if !self.decode_window() {
                return None;
            }
        }

        let have_fast = self.streams[0].emit_start != self.streams[0].emit_end;
        let have_slow = self.streams[1].emit_start != self.streams[1].emit_end;

        let mut slow = have_slow as usize;
        if have_fast && have_slow {
            // Output chronologically when both types are pending
            let t0 = self.streams[0].events[self.streams[0].emit_start].time;
            let t1 = self.streams[1].events[self.streams[1].emit_start].time;
            slow = (t1 < t0) as usize;
        }

        let stream = &mut self.streams[slow];
        let event = stream.events[stream.emit_start];
        stream.emit_start += 1;
        Some(DecodedByte::from_code(event.time, slow == 1, event.z))
    }
}
