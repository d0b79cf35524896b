/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Fast format decoder tuned for badly worn tapes.
//!
//! Works on pulse indicator functions rather than on a binarized
//! signal, which survives both tape stretch (clock variation) and the
//! loss of high frequencies:
//!
//! 1. Low-pass the input with a two-reference-period Hann kernel.
//! 2. Compute a wide pulse indicator function (WPIF), the correlation
//!    with a `(-1 1 1 -1)` wave packet, and a narrow one (NPIF),
//!    `-x(i-T) + 2x(i) - x(i+T)`.
//! 3. Label start bit candidates on a +-100 scale combining a height
//!    based and a width based classifier.
//! 4. Read one byte per start candidate with either the wide-peak
//!    reader or the underside/area reader.
//! 5. Select a byte track with a take/skip Viterbi that rewards
//!    chained bytes and fills gaps with `0x1FFF` padding bytes.
//!
//! Scanned sync pattern, both polarities:
//!
//! ```text
//! ssssh S+ d0..d7 p sssh S- d0..d7 p sssh S+
//! \------/         \------/         \------/
//! ```
use orictape_core::dsp::{interp, interp_lin};
use orictape_core::filter::LowpassFilter;
use orictape_core::frame::{is_parity_ok, is_sync_ok, DecodedByte, FAST_CYCLES_PER_BYTE};
use orictape_core::sound::Sound;

use crate::options::{Cue, DecoderOptions};

use super::{clip_range, DecoderBackend, DumpSink};

/// Max value and resolution of the start detect labeling.
const DETECT_MAX: i32 = 100;

#[inline]
fn sign(x: f32) -> i32 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Fuzzy logic grey zone: maps `false_bar` to 0 and `true_bar` to 1
/// linearly, clipped to the 0..1 range.
fn greyzone(false_bar: f32, true_bar: f32, val: f32) -> f32 {
    ((val - false_bar) / (true_bar - false_bar)).clamp(0.0, 1.0)
}

/// Location of the center of gravity of the peak at `x`, relative to
/// `x`, using only the top 10% of the peak.
fn center_of_gravity(wpif: &[f32], x: usize) -> f32 {
    let pol = sign(wpif[x]);
    if pol == 0 {
        return 0.0;
    }
    let polf = pol as f32;
    let thresh = 0.9 * wpif[x].abs();

    let mut x0 = x;
    let mut x1 = x;
    while x0 > 0 && polf * wpif[x0 - 1] > thresh {
        x0 -= 1;
    }
    while x1 + 1 < wpif.len() && polf * wpif[x1 + 1] > thresh {
        x1 += 1;
    }

    let mut sum = 0.0f32;
    let mut wsum = 0.0f32;
    for (i, &y) in wpif.iter().enumerate().take(x1 + 1).skip(x0) {
        let w = polf * y - thresh;
        sum += w * (i as f32 - x as f32);
        wsum += w;
    }
    sum / wsum
}

/// Quadratic peak location refinement relative to `x`.
fn interpolate_peak(vals: &[f32], x: usize) -> f32 {
    if x == 0 || x + 1 >= vals.len() {
        return 0.0; // need a 3-sample window
    }
    let y0 = vals[x - 1] as f64;
    let y1 = vals[x] as f64;
    let y2 = vals[x + 1] as f64;
    let d1 = 0.5 * (y2 - y0);
    let d2 = -y0 + 2.0 * y1 - y2;

    // First derivative over second
    let dx = if d2 == 0.0 { 0.0 } else { (d1 / d2) as f32 };
    dx.clamp(-0.5, 0.5)
}

/// Picks both positive and negative peaks, producing a sequence of
/// alternating polarity events starting with a negative one.
fn pick_all_peaks(peak_xs: &mut Vec<f32>, npif: &[f32]) {
    let len = npif.len();
    let mut needed_pol = -1;
    for i in 0..len {
        let pol = sign(npif[i]);
        if pol == needed_pol && i > 0 && i < len - 1 {
            let polf = pol as f32;
            let ym = polf * npif[i - 1];
            let y = polf * npif[i];
            let yp = polf * npif[i + 1];
            if y > ym && y >= yp {
                // peak
                needed_pol = -pol;
                let cog = center_of_gravity(npif, i);
                peak_xs.push(i as f32 + cog);
            }
        }
    }
}

/// Start bit detection.
///
/// Labels start bit candidates on a +-DETECT_MAX scale using both
/// indicator functions, so that both stretch (pulse width as the
/// feature) and dropout of narrow peaks (pulse height as the feature)
/// are survivable. Also selects which byte reader each candidate
/// should use.
#[allow(clippy::too_many_arguments)]
fn detect_start(
    start_detect: &mut [i8],
    use_area: &mut [bool],
    wpif: &[f32],
    npif: &[f32],
    cue: Cue,
    t_min: f32,
    t_max: f32,
    given_byte_x: i64,
    given_byte_use_area: bool,
    thresh: f32,
) {
    let len = npif.len();

    // Average magnitude, the base threshold for qualifying a peak
    let mut avg_mag = 0.0f32;
    for &y in npif {
        avg_mag += y.abs();
    }
    avg_mag /= len as f32;

    let mut peak_xs: Vec<f32> = Vec::new();
    pick_all_peaks(&mut peak_xs, npif);
    let peak_ys: Vec<f32> = peak_xs.iter().map(|&x| interp(npif, x)).collect();
    let peak_cnt = peak_xs.len();

    for x in start_detect.iter_mut() {
        *x = 0;
    }
    for x in use_area.iter_mut() {
        *x = false;
    }

    // Distance windows for the height based classifier
    let dwin_size = (8.0 * t_max).ceil() as usize;
    let mut dwin_14 = vec![0.0f32; dwin_size];
    let mut dwin_17 = vec![0.0f32; dwin_size];
    let mut dwin_38 = vec![0.0f32; dwin_size];
    for d in 0..dwin_size {
        let df = d as f32;
        dwin_14[d] = greyzone(t_min, t_max, df).min(greyzone(4.0 * t_max, 4.0 * t_min, df));
        dwin_17[d] = greyzone(t_min, t_max, df).min(greyzone(7.0 * t_max, 7.0 * t_min, df));
        dwin_38[d] =
            greyzone(3.0 * t_min, 3.0 * t_max, df).min(greyzone(8.0 * t_max, 8.0 * t_min, df));
    }

    // Classify the peaks
    for j in 0..peak_cnt {
        // Location of the start bit NPIF peak
        let i_npif = (0.5 + peak_xs[j]).floor() as usize;
        if i_npif >= len {
            continue;
        }

        // Reject if either indicator has the wrong sign
        let pol = if j & 1 == 1 { 1 } else { -1 };
        if sign(npif[i_npif]) != pol || sign(wpif[i_npif]) != pol {
            continue;
        }
        let polf = pol as f32;

        // Check the peak height against the average magnitude
        let m = polf * peak_ys[j];
        let mut common = greyzone(0.2 * avg_mag, 0.8 * avg_mag, m);

        //--------------------------------------------------------------
        // Height based classifier
        //--------------------------------------------------------------

        // Home in on the WPIF peak, which may differ from the NPIF peak
        let mut i_wpif = i_npif;
        while i_wpif > 0 && polf * wpif[i_wpif - 1] > polf * wpif[i_wpif] {
            i_wpif -= 1;
        }
        while i_wpif + 1 < len && polf * wpif[i_wpif + 1] > polf * wpif[i_wpif] {
            i_wpif += 1;
        }

        // WPIF peak strength against the threshold, +-30% grey zone
        let h = wpif[i_wpif] * polf;
        let mut hbc = greyzone(0.7 * thresh, 1.3 * thresh, h);

        // Stop bits should be largely quiet, but the half-height
        // opposite-sign sidelobe expected at -1.5 must be tolerated.
        // Reject if a same-polarity peak is found 1..7 clocks before;
        // mark weak if not silent 3..8 clocks before.
        for d in 1..dwin_size.min(i_wpif + 1) {
            let yd = polf * wpif[i_wpif - d];
            if dwin_17[d] >= 0.5 {
                hbc = hbc.min(greyzone(0.8 * h, 0.6 * h, yd));
            }
            if dwin_38[d] >= 0.5 {
                hbc = hbc.min(greyzone(1.2 * h, 0.3 * h, yd.abs()));
            }
        }

        // Sidelobe suppression: reject if a stronger peak follows
        // 1..4 clocks after, indicating we sit on a sidelobe
        for d in 1..dwin_size {
            if i_wpif + d >= len {
                break;
            }
            let md = wpif[i_wpif + d].abs();
            if dwin_14[d] >= 0.5 {
                hbc = hbc.min(greyzone(1.4 * h, 1.2 * h, md));
            }
        }

        //--------------------------------------------------------------
        // Width based classifier: detect the 1110 sequence,
        // three short pulses and one long
        //--------------------------------------------------------------

        let mut wbc = 0.0f32;

        // The first byte can be preceded by silence; look at the next
        // sync in that case
        let j1 = if j >= 7 { j } else { j + 13 };

        if j1 >= 7 && j1 + 13 + 2 < peak_cnt {
            wbc = 1.0;

            // Width based detection needs clear peaks
            let h1 = polf * peak_ys[j1 - 2];
            let h2 = polf * peak_ys[j1 - 4];
            let h3 = polf * peak_ys[j1 - 6];
            wbc = wbc.min(greyzone(0.3 * m, 0.8 * m, h1));
            wbc = wbc.min(greyzone(0.3 * m, 0.8 * m, h2));
            wbc = wbc.min(greyzone(0.3 * m, 0.8 * m, h3));

            // The sequence must plausibly be 9 cycles long
            let w = peak_xs[j1 + 1] - peak_xs[j1 - 7];
            wbc = wbc.min(greyzone((9.0 - 2.0) * t_min, (9.0 - 1.0) * t_min, w));
            wbc = wbc.min(greyzone((9.0 + 2.0) * t_max, (9.0 + 1.0) * t_max, w));

            // Compare adjacent pulse lengths
            let wm3 = peak_xs[j1 - 5] - peak_xs[j1 - 7];
            let wm2 = peak_xs[j1 - 3] - peak_xs[j1 - 5];
            let wm1 = peak_xs[j1 - 1] - peak_xs[j1 - 3];
            let w0 = peak_xs[j1 + 1] - peak_xs[j1 - 1]; // stop bit candidate
            let r0 = 5.0 * (w0 - wm1) / (w0 + wm1);
            let r1 = 5.0 * (wm1 - wm2) / (wm1 + wm2);
            let r2 = 5.0 * (wm2 - wm3) / (wm2 + wm3);

            // Length differences must be low, low, positive
            wbc = wbc.min(greyzone(0.2, 0.3, r0));
            wbc = wbc.min(greyzone(0.5, 0.4, r1.abs()));
            wbc = wbc.min(greyzone(0.5, 0.4, r2.abs()));

            // Sidelobe suppression via widths between positive peaks;
            // the 0.1 margin is empirically tuned
            let wm05 = peak_xs[j1] - peak_xs[j1 - 2];
            let wp05 = peak_xs[j1 + 2] - peak_xs[j1];
            let rp05 = 5.0 * (wp05 - wm05) / (wp05 + wm05);
            wbc = wbc.min(greyzone(rp05 - 1.1, rp05 - 0.1, r0));
        }

        //--------------------------------------------------------------
        // Reader auto-selection: check when the area reader is likely
        // to do better, judged on the stability of the next ~11 bits
        //--------------------------------------------------------------

        let mut area_cue_quality = 0.0f32;
        let bcnt = 11usize;
        if j >= 7 && j + 2 * bcnt - 1 < peak_cnt {
            // Heights must not drop too much
            let h0 = polf * peak_ys[j];
            let mut hmin = h0;
            let mut hmax = h0;
            for b in 1..bcnt {
                let h = polf * peak_ys[j + 2 * b];
                hmin = hmin.min(h);
                hmax = hmax.max(h);
            }
            area_cue_quality = greyzone(0.2, 0.5, hmin / hmax);

            // The sequence must plausibly be bcnt bits long
            let w = peak_xs[j + 2 * bcnt - 1] - peak_xs[j - 1];
            area_cue_quality = area_cue_quality.min(greyzone(
                (2 * bcnt - 2) as f32 * t_min,
                (2 * bcnt - 1) as f32 * t_min,
                w,
            ));
            area_cue_quality = area_cue_quality.min(greyzone(
                (3 * bcnt + 2) as f32 * t_max,
                (3 * bcnt + 1) as f32 * t_max,
                w,
            ));
        }

        //--------------------------------------------------------------
        // Conclusion
        //--------------------------------------------------------------

        // Either the height or the width classifier must accept
        common = common.min(hbc.max(wbc));

        let i = i_wpif;
        if i < len {
            start_detect[i] = (pol
                * if common <= 0.0 {
                    0
                } else if common >= 1.0 {
                    DETECT_MAX
                } else {
                    1 + ((DETECT_MAX - 1) as f32 * common).floor() as i32
                }) as i8;

            use_area[i] = match cue {
                Cue::Area => true,
                Cue::Wide => false,
                Cue::Auto => area_cue_quality > 0.5,
            };
        }
    }

    if given_byte_x >= 0 && (given_byte_x as usize) < len {
        let g = given_byte_x as usize;
        if start_detect[g] == 0 {
            start_detect[g] = (DETECT_MAX * sign(npif[g])) as i8;
            use_area[g] = given_byte_use_area;
        }
    }
}

//----------------------------------------------------------------------------
// Quantization: interpret peak intervals as bit intervals
//----------------------------------------------------------------------------

/// Converts zero-symbol peak locations into a 13-bit code by trying
/// clock candidates and keeping the one minimizing the least squares
/// fit residual plus a sync error penalty. Returns
/// `(z, t_clk, t_byte)`.
fn quantize(peak_xs: &[f32], t_min: f32, t_max: f32) -> (u16, f32, f32) {
    const MAX_PEAKS: usize = 12;
    let peak_cnt = peak_xs.len().min(MAX_PEAKS);
    let peak_xs = &peak_xs[..peak_cnt];

    let t_exp = (t_min + t_max) / 2.0;

    // Simple exits for zero or one peak
    if peak_cnt < 2 {
        if peak_cnt == 0 {
            return (0x1ffe, t_exp, 28.0 * t_exp);
        }
        let b = (0.5 + 0.5 * (peak_xs[0] / t_exp - 1.0)).floor() as i32;
        let z = 0x1ffe & !(1u16 << b.clamp(0, 12));
        return (z, t_exp, 28.0 * t_exp);
    }

    //------------------------------------------------------------------------
    // List clock candidates
    //------------------------------------------------------------------------

    const MAX_CLKS: usize = 20;
    let mut clks: Vec<f32> = Vec::with_capacity(MAX_CLKS);
    clks.push(t_min);
    clks.push(t_exp);
    clks.push(t_max);

    for k in 0..peak_cnt {
        // Interval from the previous peak
        let dx = if k == 0 {
            peak_xs[0]
        } else {
            peak_xs[k] - peak_xs[k - 1]
        };
        let db_min = (0.5 * (dx / t_max - 1.0)).ceil() as i32;
        let db_max = (0.5 * (dx / t_min - 1.0)).floor() as i32;
        let mut db = db_min;
        while db <= db_max && clks.len() < MAX_CLKS {
            clks.push(dx / (2.0 * db as f32 + 1.0));
            db += 1;
        }
    }

    clks.sort_unstable_by(f32::total_cmp);

    //------------------------------------------------------------------------
    // Evaluate the candidate quantizations
    //------------------------------------------------------------------------

    let k_regul = 1.0f32; // regularization strength, counted in cycles
    let mut t_best = t_exp;
    let mut e_best = f32::MAX;
    let mut z_best = 0xffffu16;
    let mut z_last = 0xffffu16;
    let mut first = true;
    for &clk in &clks {
        // Label the peaks according to this clock candidate
        let mut cs = [0i32; MAX_PEAKS];
        let mut sync_error = false;
        let mut fit_cnt = 0usize;
        let mut z = 0x1ffeu16;
        let mut b = 0i32;
        for k in 0..peak_cnt {
            let dx = if k == 0 {
                peak_xs[0]
            } else {
                peak_xs[k] - peak_xs[k - 1]
            };
            let db = (0.5 * dx / clk).floor() as i32;
            b += db; // bit no (0 = start bit)
            cs[k] = 2 * b + k as i32 + 1; // clock cycle
            if (0..13).contains(&b) {
                z &= !(1u16 << b);
            }
            if b == 10 || b == 11 {
                sync_error = true;
            }
            if b <= 12 || fit_cnt < 2 {
                fit_cnt += 1;
            }
            // else ignored for fitting purposes
        }

        if z == z_last {
            continue; // no need to re-evaluate
        }
        z_last = z;

        // Fit the clock period to the peak intervals:
        // minimize sum of (dx - t_clk*dc)^2, regularized toward t_exp
        let mut sum_dcdx = k_regul * k_regul * t_exp;
        let mut sum_dcdc = k_regul * k_regul;
        for k in 0..fit_cnt {
            let dc = if k == 0 { cs[0] } else { cs[k] - cs[k - 1] } as f32;
            let dx = if k == 0 {
                peak_xs[0]
            } else {
                peak_xs[k] - peak_xs[k - 1]
            };
            sum_dcdx += dc * dx;
            sum_dcdc += dc * dc;
        }
        let t_fit = (sum_dcdx / sum_dcdc).clamp(t_min, t_max);

        let dt_clk = (t_fit - t_exp) * k_regul;
        let mut e_fit = dt_clk * dt_clk;
        for k in 0..fit_cnt {
            let dc = if k == 0 { cs[0] } else { cs[k] - cs[k - 1] } as f32;
            let dx = if k == 0 {
                peak_xs[0]
            } else {
                peak_xs[k] - peak_xs[k - 1]
            };
            let r = dx - dc * t_fit;
            e_fit += r * r;
        }

        // Penalize a sync error as if a peak moved two cycles
        if sync_error {
            e_fit += 4.0 * t_fit * t_fit;
        }

        if first || e_fit < e_best {
            e_best = e_fit;
            t_best = t_fit;
            z_best = z;
            first = false;
        }
    }

    // Nominal byte length depends on how many data/parity zeros it has
    let mut dp_zero_cnt = 0;
    for b in 1..=9 {
        if z_best & (1 << b) == 0 {
            dp_zero_cnt += 1;
        }
    }

    (z_best, t_best, (28 + dp_zero_cnt) as f32 * t_best)
}

//----------------------------------------------------------------------------
// Byte reader using wide peak locations
//----------------------------------------------------------------------------

/// Reads one byte from the given start bit using WPIF peaks. Handles
/// tapes where high frequencies have faded. Returns
/// `(z, dx, t_clk)` with `dx` the byte length in samples.
fn read_byte_wide_peak(
    wpif: &[f32],
    start_x: usize,
    t_min: f32,
    t_max: f32,
    global_thresh: f32,
) -> (u16, i64, f32) {
    let len = wpif.len();
    debug_assert!(start_x < len);
    let y0 = wpif[start_x];
    let pol = if y0 > 0.0 { 1.0f32 } else { -1.0 };

    // Local threshold at 70% of the start bit height, since ripple can
    // approach half of it; diluted slightly with the global threshold.
    let mut local_thresh = 0.8 * 0.7 * y0.abs() + 0.2 * global_thresh;
    let mut t_clk = (t_min + t_max) / 2.0;

    //-----------------------------------------------------------------------
    // Peak picking
    //-----------------------------------------------------------------------

    const MAX_PEAKS: usize = 13;
    let mut peak_xs: Vec<f32> = Vec::with_capacity(MAX_PEAKS);

    let start_cog = center_of_gravity(wpif, start_x);

    let mut x = 0.0f32; // current coordinate, relative to the start bit
    while x < 38.0 * t_max && peak_xs.len() < MAX_PEAKS {
        // Look for a peak 3 clocks ahead
        let i_min = start_x as i64 + (start_cog + x + 2.0 * t_clk).floor() as i64;
        let i_max = start_x as i64 + (start_cog + x + 4.0 * t_clk).ceil() as i64;
        let mut i_peak = i_max;
        let mut y_peak = 0.0f32;
        let mut i1 = i_min;
        while i1 <= i_max && i1 < len as i64 {
            if i1 >= 0 {
                let y = pol * wpif[i1 as usize];
                if y_peak < y {
                    y_peak = y;
                    i_peak = i1;
                }
            }
            i1 += 1;
        }

        if y_peak > local_thresh && i_peak != i_max {
            // '0' symbol; a peak on the end sample is deferred to the
            // next window
            let mut px = (i_peak - start_x as i64) as f32;
            if i_peak >= 0 && (i_peak as usize) < len {
                px += center_of_gravity(wpif, i_peak as usize) - start_cog;
            }
            peak_xs.push(px);
            x = px;

            // Update the local threshold from 70% of the approved peak,
            // keeping the 20% global ingredient, averaged with the old
            local_thresh = 0.5 * (0.8 * 0.7 * y_peak + 0.2 * global_thresh) + 0.5 * local_thresh;
        } else {
            // '1' symbol
            x += 2.0 * t_clk;
        }
    }

    //-----------------------------------------------------------------------
    // Quantization
    //-----------------------------------------------------------------------

    let (z, t_fit, t_byte) = quantize(&peak_xs, t_min, t_max);
    t_clk = t_fit;

    let dx = (0.5 + start_cog + t_byte).floor() as i64;
    (z, dx, t_clk)
}

//----------------------------------------------------------------------------
// Byte reader using underside narrow pulses and area measurement
//----------------------------------------------------------------------------

/// Reads one byte from the given start bit by walking NPIF underside
/// dips and measuring the area of each pulse. Handles stretched tapes.
/// Returns `(z, dx, t_clk)`.
fn read_byte_underside(
    lfsig: &[f32],
    npif: &[f32],
    start_x: usize,
    t_min: f32,
    t_max: f32,
) -> (u16, i64, f32) {
    let len = npif.len();
    debug_assert!(start_x < len);

    let t_exp = (t_min + t_max) / 2.0;

    // Default outputs on peak picking failure
    let failed = (0u16, (32.0 * t_exp).floor() as i64, t_exp);

    //----------------------------------------------------------------
    // Pick dips
    //----------------------------------------------------------------

    let pol = sign(npif[start_x]);
    let polf = pol as f32;

    // Extra bits to scan to the left of the start bit
    const NB_LEFT: usize = 3;
    const DIP_MAX: usize = NB_LEFT + 14;
    let mut dip_xs = [0.0f32; DIP_MAX];
    let mut dip_cnt = 0usize;

    // Search back to the trench before the start bit
    let mut i = start_x;
    while i > 0 && (sign(npif[i]) == pol || polf * npif[i - 1] <= polf * npif[i]) {
        i -= 1;
    }

    // Then search further past NB_LEFT more bits
    for _ in 0..NB_LEFT {
        while i > 0 && (sign(npif[i]) == -pol || polf * npif[i - 1] >= polf * npif[i]) {
            i -= 1;
        }
        while i > 0 && (sign(npif[i]) == pol || polf * npif[i - 1] <= polf * npif[i]) {
            i -= 1;
        }
    }

    if i == 0 {
        return failed; // edge of the buffer reached
    }

    while dip_cnt < DIP_MAX && i + 1 < len {
        let ym = -polf * npif[i - 1];
        let y = -polf * npif[i];
        let yp = -polf * npif[i + 1];

        if y > ym && y >= yp && y > 0.0 {
            // peak on the underside
            let dx = interpolate_peak(npif, i);
            dip_xs[dip_cnt] = i as f32 - start_x as f32 + dx;
            dip_cnt += 1;

            // Hysteresis: skip to the next sign flip
            while i + 1 < len && -polf * npif[i + 1] > 0.0 {
                i += 1;
            }
        }
        i += 1;
    }

    if dip_cnt < DIP_MAX {
        return failed; // too few dips, edge of the buffer reached
    }

    //----------------------------------------------------------------
    // Pulse width measurement
    //----------------------------------------------------------------

    let mut ws = [0.0f32; 13];
    for k in 0..13 {
        ws[k] = dip_xs[NB_LEFT + k + 1] - dip_xs[NB_LEFT + k];
    }

    // Pulse area measurement
    let mut areas = [0.0f32; NB_LEFT + 13];
    for (k, area) in areas.iter_mut().enumerate() {
        let x0 = start_x as i64 + (0.5 + dip_xs[k]).floor() as i64;
        let x1 = start_x as i64 + (0.5 + dip_xs[k + 1]).floor() as i64;
        if x0 < 0 || x1 < x0 || x1 as usize >= len {
            return failed;
        }
        let (x0, x1) = (x0 as usize, x1 as usize);

        let bottom = 0.5 * (lfsig[x0] + lfsig[x1]);
        let mut sum = 0.0f32;
        for &y in &lfsig[x0 + 1..x1] {
            sum += y - bottom;
        }
        *area = polf * sum;
    }

    // Fit a line through the low-area peaks
    let mut a_low_line = [0.0f32; NB_LEFT + 13];
    let a_left = (areas[0] + areas[1] + areas[2]) / 3.0;
    let a_right = (areas[NB_LEFT + 10] + areas[NB_LEFT + 11] + areas[NB_LEFT + 12]) / 3.0;
    for (k, a) in a_low_line.iter_mut().enumerate() {
        *a = a_left + (a_right - a_left) * (k as f32 - 1.0) / 13.0;
    }

    // Estimate the typical high-low area difference from the start bit
    // and, if they look reasonable, the two largest data/parity areas.
    // Zeros come in pairs because of the parity.
    let mut das = [0.0f32; 9];
    for k in 0..9 {
        das[k] = areas[NB_LEFT + 1 + k] - a_low_line[NB_LEFT + 1 + k];
    }
    das.sort_unstable_by(f32::total_cmp);
    let mut typ_da = areas[NB_LEFT] - a_low_line[NB_LEFT];
    if das[7] + das[8] > typ_da {
        typ_da = (das[7] + das[8] + typ_da) / 3.0;
    }

    //----------------------------------------------------------------
    // Change measure
    //----------------------------------------------------------------

    let mut chgs = [0.0f32; 12];
    let kc = 0.5f32; // counterweight for the change measure

    for k in 0..12 {
        let a0 = areas[NB_LEFT + k];
        let a1 = areas[NB_LEFT + k + 1];
        // The clamp keeps byte tracking stable when a file's last
        // byte area collapses
        chgs[k] = (3.0 * (a1 - a0) / (a1 + a0)).clamp(-1.0, 1.0);
    }

    //----------------------------------------------------------------
    // Viterbi over the 13 bits, two states (high/low)
    //----------------------------------------------------------------

    const NB: usize = 13;
    const BAD_SCORE: f32 = -1e10;
    let mut scores = [0.0f32; NB * 2];
    let mut pred = [0u8; NB * 2];

    // The start bit is always 0
    scores[0] = 0.0;
    scores[1] = BAD_SCORE;

    for b in 1..NB {
        let a_thresh = a_low_line[NB_LEFT + b] + 0.5 * typ_da;
        let long_bonus = (areas[NB_LEFT + b] - a_thresh) / (a_thresh / 1.5);

        // Rise/fall rewarded when the change measure exceeds kc
        let rise_reward = -chgs[b - 1] - kc;
        let fall_reward = chgs[b - 1] - kc;

        let score_00 = scores[(b - 1) * 2] + long_bonus;
        let score_11 = scores[(b - 1) * 2 + 1] - long_bonus;
        let score_01 = scores[(b - 1) * 2] - long_bonus + rise_reward;
        let score_10 = scores[(b - 1) * 2 + 1] + long_bonus + fall_reward;

        scores[b * 2] = score_00.max(score_10);
        scores[b * 2 + 1] = score_01.max(score_11);
        pred[b * 2] = (score_00 <= score_10) as u8;
        pred[b * 2 + 1] = (score_01 <= score_11) as u8;
    }

    // Backtrace
    let mut z = 0u16;
    let mut b = NB - 1;
    let mut s = (scores[b * 2] <= scores[b * 2 + 1]) as usize;
    while b > 0 {
        z |= (s as u16) << b;
        s = pred[b * 2 + s] as usize;
        b -= 1;
    }

    // Add up the clock cycles
    let mut dc = 0i32;
    let mut w = 0.0f32;
    for (b, &wb) in ws.iter().enumerate() {
        w += wb;
        dc += 3 - (z >> b & 1) as i32;
    }

    let t_clk = (w / dc as f32).clamp(t_min, t_max);
    let w = w + t_clk; // count the extra half bit

    (z, (0.5 + w).floor() as i64, t_clk)
}

//----------------------------------------------------------------------------
// Window level byte decoding
//----------------------------------------------------------------------------

struct WindowResult {
    byte_xs: Vec<i64>,
    byte_zs: Vec<u16>,
    /// Re-estimated clock, when enough healthy bytes chained.
    t_est: f32,
}

/// Scans one window for start bits, reads a byte at each candidate and
/// selects the byte track.
#[allow(clippy::too_many_arguments)]
fn xenon_decode_bytes(
    start_detect: &mut [i8],
    use_area: &mut [bool],
    lfsig: &[f32],
    wpif: &[f32],
    npif: &[f32],
    cue: Cue,
    t_min: f32,
    t_max: f32,
    given_byte_x: i64,
    given_byte_use_area: bool,
) -> WindowResult {
    let len = npif.len();
    let t_clk = (t_min + t_max) / 2.0;

    let mut result = WindowResult {
        byte_xs: Vec::new(),
        byte_zs: Vec::new(),
        t_est: t_clk,
    };

    // Threshold to qualify a WPIF peak
    let mut thresh = 0.0f32;
    for &y in wpif {
        thresh += y.abs();
    }
    thresh /= len as f32;

    //---------------------------------------------------------------------
    // Label start bit candidates
    //---------------------------------------------------------------------

    detect_start(
        start_detect,
        use_area,
        wpif,
        npif,
        cue,
        t_min,
        t_max,
        given_byte_x,
        given_byte_use_area,
        thresh,
    );

    //---------------------------------------------------------------------
    // Read bytes from the start bit candidates
    //---------------------------------------------------------------------

    let mut rd_xs: Vec<usize> = Vec::new();
    let mut rd_dxs: Vec<i64> = Vec::new();
    let mut rd_tcs: Vec<f32> = Vec::new();
    let mut rd_zs: Vec<u16> = Vec::new();

    for i in 0..len {
        if start_detect[i] == 0 {
            continue;
        }

        let (z, dx, tc) = if use_area[i] {
            // Handles tapes with stretch
            read_byte_underside(lfsig, npif, i, t_min, t_max)
        } else {
            // Handles tapes with loss of high frequencies
            read_byte_wide_peak(wpif, i, t_min, t_max, thresh)
        };

        if i as i64 + dx > len as i64 - 1 {
            break; // skip a byte reaching outside the window
        }

        rd_xs.push(i);
        rd_dxs.push(dx);
        rd_tcs.push(tc);
        rd_zs.push(z);
    }

    //---------------------------------------------------------------------
    // Byte track selection
    //---------------------------------------------------------------------

    // Unlike classic activity selection, bytes directly after another
    // byte must be favoured: a two-state model where chained bytes are
    // rewarded.
    const NS: usize = 2; // 0 = skip, 1 = take
    let mut scores = vec![0i64; len * NS];
    let mut pred_ss = vec![0u8; len * NS];
    let mut pred_xs = vec![-1i64; len * NS];
    let mut pred_zs = vec![0u16; len * NS];
    let mut pred_tcs = vec![t_clk; len * NS];

    let mut rd_ix = 0usize; // scan position in the read bytes

    // Forward pass
    for i in 0..len {
        // Skipping propagates to both states to the right
        for s1 in 0..NS {
            if i + 1 < len && scores[(i + 1) * 2 + s1] < scores[i * 2] {
                scores[(i + 1) * 2 + s1] = scores[i * 2];
                pred_ss[(i + 1) * 2 + s1] = pred_ss[i * 2];
                pred_xs[(i + 1) * 2 + s1] = pred_xs[i * 2];
                pred_zs[(i + 1) * 2 + s1] = pred_zs[i * 2];
                pred_tcs[(i + 1) * 2 + s1] = pred_tcs[i * 2];
            }
        }

        // Award the given byte position
        let given_bonus: i64 = if given_byte_x == i as i64 { 100000 } else { 0 };

        // Award based on the clarity of the start bit
        let start_score = start_detect[i].unsigned_abs() as i64;

        if rd_ix < rd_xs.len() && rd_xs[rd_ix] == i {
            // A byte could be read here
            let dx = rd_dxs[rd_ix];
            let z = rd_zs[rd_ix];
            let tc = rd_tcs[rd_ix];
            let vanity_bonus = (is_sync_ok(z) && is_parity_ok(z)) as i64;

            // Local score for taking the byte
            scores[i * 2 + 1] += start_score + 50 * vanity_bonus + 50 * given_bonus;

            // Jump to where the next byte should be; up to 50 bonus for
            // chaining to another take, 15 for a polarity flip
            let d_max = (0.5 + 4.0 * tc).floor() as i64; // search range each side
            for d in -d_max..=d_max {
                let chain_score = 50 - 50 * d.abs() / (d_max + 1);

                let i1 = i as i64 + dx + d;
                if i1 > i as i64 && i1 < len as i64 {
                    let i1 = i1 as usize;
                    let polarity_bonus =
                        (sign(start_detect[i1] as f32) == -sign(start_detect[i] as f32)) as i64;
                    for s1 in 0..NS {
                        let score = scores[i * 2 + 1]
                            + chain_score * (s1 == 1) as i64
                            + 15 * polarity_bonus;

                        if scores[i1 * 2 + s1] < score {
                            scores[i1 * 2 + s1] = score;
                            pred_ss[i1 * 2 + s1] = 1;
                            pred_xs[i1 * 2 + s1] = i as i64;
                            pred_zs[i1 * 2 + s1] = z;
                            pred_tcs[i1 * 2 + s1] = tc;
                        }
                    }
                }
            }
            rd_ix += 1;
        } else {
            scores[i * 2 + 1] = -100000; // nothing to take here
        }
    }

    // Backtrace with gap filling: find the best end state
    let mut s = 0usize;
    for s1 in 0..NS {
        if scores[(len - 1) * NS + s] < scores[(len - 1) * NS + s1] {
            s = s1;
        }
    }

    let a = (len - 1) * NS + s;
    s = pred_ss[a] as usize;
    let mut x = pred_xs[a];
    let mut z = pred_zs[a];
    let mut tc = pred_tcs[a];
    let mut good_byte_cnt = 0i32;
    let mut sum_tc = 0.0f32;
    while x >= 0 {
        // Pad insertion: a missed byte must not displace the whole
        // file, so gaps of two or more byte lengths get equidistant
        // padding bytes.
        if let Some(&last_x) = result.byte_xs.last() {
            let dx = last_x - x;
            let mut n = (0.5 + dx as f64 / (32.0 * t_clk as f64)).floor() as i64;
            while n >= 2 {
                let x_pad = x + (dx * (n - 1) + n / 2) / n;
                result.byte_xs.push(x_pad);
                result.byte_zs.push(0x1fff); // $ff with a sync error
                n -= 1;
            }
        }

        result.byte_xs.push(x);
        result.byte_zs.push(z);
        if is_sync_ok(z) && is_parity_ok(z) {
            good_byte_cnt += 1;
            sum_tc += tc;
        }

        let a = x as usize * NS + s;
        s = pred_ss[a] as usize;
        x = pred_xs[a];
        z = pred_zs[a];
        tc = pred_tcs[a];
    }

    if good_byte_cnt >= 5 {
        result.t_est = (sum_tc / good_byte_cnt as f32).clamp(t_min, t_max);
    }

    // The bytes were picked backwards; reverse into expected order
    result.byte_xs.reverse();
    result.byte_zs.reverse();
    result
}

//----------------------------------------------------------------------------
// XenonDecoder
//----------------------------------------------------------------------------

/// Fast format decoder working on pulse indicator functions.
pub struct XenonDecoder {
    lp_filter: LowpassFilter,
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
    window_margin: usize,
    window_offs: i64,

    lp_buf: Vec<f32>,
    wpif_buf: Vec<f32>,
    npif_buf: Vec<f32>,
    start_detect_buf: Vec<i8>,
    use_area_buf: Vec<bool>,

    // Byte events of the current window
    byte_xs: Vec<i64>,
    byte_zs: Vec<u16>,
    byte_times: Vec<f64>,
    byte_boundary_x: i64, // event for use as the next window's boundary
    byte_boundary_use_area: bool,
    byte_last_x: i64, // location of the last emitted byte
    byte_emit_start: usize,
    byte_emit_end: usize,

    dump: Option<DumpSink>,
    dump_buf: Vec<f32>,
}

impl XenonDecoder {
    pub fn new(src: &Sound, options: DecoderOptions) -> Self {
        // Filter length of two reference clock cycles
        let lp_filterlen =
            (2.0 * src.sample_rate() as f64 / options.f_ref as f64).floor() as usize | 1;
        let lp_filter = LowpassFilter::new(src, lp_filterlen);

        let sample_rate = src.sample_rate();
        let full_len = src.length();
        let (start_pos, end_pos) = clip_range(&options, sample_rate, full_len);

        let t_ref = sample_rate as f64 / options.f_ref as f64;

        // The search half width can be at most 20%, since at 2*1.2=2.4
        // a 3-period starts to look like a 2-period.
        let dt_max = 0.20 * t_ref;
        let dt_min = 0.07 * t_ref;

        // Core window / hop size about 0.218 s, margin about 0.0625 s
        let hopsize = (0.5 + 5.0 * 209.0 * t_ref).floor() as usize;
        let window_margin = (0.5 + 300.0 * t_ref).floor() as usize;
        let windowlen = hopsize + 2 * window_margin;

        // Start with the waveform start at the core of the window
        let window_offs = start_pos - start_pos.rem_euclid(hopsize as i64) - window_margin as i64;

        let dump = options
            .dump
            .then(|| DumpSink::new(end_pos - start_pos, sample_rate, "dump-xenon.wav"));

        XenonDecoder {
            lp_filter,
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
            window_margin,
            window_offs,
            lp_buf: vec![0.0; windowlen],
            wpif_buf: vec![0.0; windowlen],
            npif_buf: vec![0.0; windowlen],
            start_detect_buf: vec![0; windowlen],
            use_area_buf: vec![false; windowlen],
            byte_xs: Vec::new(),
            byte_zs: Vec::new(),
            byte_times: Vec::new(),
            byte_boundary_x: -1,
            byte_boundary_use_area: false,
            byte_last_x: -1,
            byte_emit_start: 0,
            byte_emit_end: 0,
            dump,
            dump_buf: vec![0.0; windowlen],
        }
    }

    /// Decodes one window; returns `false` when there is nothing left.
    fn decode_window(&mut self) -> bool {
        if self.window_offs >= self.end_pos {
            return false; // nothing to decode
        }

        let last_window = self.window_offs + self.hopsize as i64 >= self.end_pos;
        let windowlen = self.windowlen;

        //--------------------------------------------------------------------
        // Low pass and pulse indicator functions
        //--------------------------------------------------------------------

        self.lp_filter
            .read(self.window_offs, &mut self.lp_buf[..windowlen]);

        let t_clk = self.t_clk as f32;
        for i in 0..windowlen {
            let x0 = interp_lin(&self.lp_buf, i as f32 - 1.5 * t_clk);
            let x1 = interp_lin(&self.lp_buf, i as f32 - 0.5 * t_clk);
            let x2 = interp_lin(&self.lp_buf, i as f32 + 0.5 * t_clk);
            let x3 = interp_lin(&self.lp_buf, i as f32 + 1.5 * t_clk);
            self.wpif_buf[i] = -x0 + x1 + x2 - x3;
        }
        for i in 0..windowlen {
            let x0 = interp_lin(&self.lp_buf, i as f32 - t_clk);
            let x1 = self.lp_buf[i];
            let x2 = interp_lin(&self.lp_buf, i as f32 + t_clk);
            self.npif_buf[i] = -x0 + 2.0 * x1 - x2;
        }

        //--------------------------------------------------------------------
        // Byte decoding
        //--------------------------------------------------------------------

        let given_byte_x = if self.byte_boundary_x >= 0 {
            self.byte_boundary_x - self.window_offs
        } else {
            -1
        };

        let result = xenon_decode_bytes(
            &mut self.start_detect_buf[..windowlen],
            &mut self.use_area_buf[..windowlen],
            &self.lp_buf[..windowlen],
            &self.wpif_buf[..windowlen],
            &self.npif_buf[..windowlen],
            self.options.cue,
            (self.t_clk - self.dt_clk) as f32,
            (self.t_clk + self.dt_clk) as f32,
            given_byte_x,
            self.byte_boundary_use_area,
        );
        self.byte_xs = result.byte_xs;
        self.byte_zs = result.byte_zs;
        let t_est = result.t_est as f64;

        // Add a dummy byte if nothing was decoded
        if self.byte_xs.is_empty() {
            self.byte_xs.push(windowlen as i64 / 2);
            self.byte_zs.push(0x1fff); // $ff with a sync error
        }

        //--------------------------------------------------------------------
        // Byte post processing
        //--------------------------------------------------------------------

        // Portion of the window to interpret now
        let right_limit = if last_window {
            windowlen as i64
        } else {
            (self.window_margin + self.hopsize) as i64
        };

        let k_time = 1.0 / self.sample_rate as f64;
        let t_half_byte = (0.5 + FAST_CYCLES_PER_BYTE as f64 * self.t_ref / 2.0) as i64;

        let mut healthy_byte_cnt = 0i64;

        self.byte_emit_start = 0;
        self.byte_emit_end = 0;
        self.byte_times.clear();
        self.byte_times.resize(self.byte_xs.len(), 0.0);

        for i in 0..self.byte_xs.len() {
            let x = self.window_offs + self.byte_xs[i]; // global sample offset

            // Annotate the global time
            self.byte_times[i] = k_time * x as f64;

            if self.byte_xs[i] >= right_limit {
                continue; // deal with in the next window instead
            }
            if self.byte_last_x >= 0 && x - self.byte_last_x < t_half_byte {
                continue; // too close to the last accepted byte
            }
            if x < self.start_pos - t_half_byte || x > self.end_pos {
                continue; // outside the user specified scan range
            }

            // Extend the range of events to emit bytes for
            if self.byte_emit_end == 0 {
                self.byte_emit_start = i;
            }
            self.byte_emit_end = i + 1;

            self.byte_last_x = x;

            let z = self.byte_zs[i];
            if is_parity_ok(z) && is_sync_ok(z) {
                self.byte_boundary_x = x;
                let wx = (x - self.window_offs) as usize;
                if wx < windowlen {
                    self.byte_boundary_use_area = self.use_area_buf[wx];
                }
                healthy_byte_cnt += 1;
            }
        }

        // Detected new clock parameters
        let mut detected_t_clk = self.t_ref;
        let mut detected_dt_clk = self.dt_max;
        let emit_cnt = self.byte_emit_end - self.byte_emit_start;
        if emit_cnt >= 4
            && t_est >= self.t_ref - self.dt_max
            && t_est <= self.t_ref + self.dt_max
        {
            let health = healthy_byte_cnt as f64 / emit_cnt as f64;
            if health > 0.95 {
                detected_t_clk = t_est;
                detected_dt_clk = self.dt_min;
            }
        }

        // Update the clock parameters with exponential decay; the
        // coefficients approximate the per-byte 15/16 decay of the
        // demodulation decoder over five bytes.
        self.t_clk = 0.75 * self.t_clk + 0.25 * detected_t_clk;
        self.dt_clk = 0.75 * self.dt_clk + 0.25 * detected_dt_clk;

        //--------------------------------------------------------------------
        // Epilogue
        //--------------------------------------------------------------------

        if let Some(dump) = self.dump.as_mut() {
            // Dump the narrow indicator with the start bit labeling
            for i in 0..windowlen {
                self.dump_buf[i] = 0.5 * self.start_detect_buf[i] as f32 / DETECT_MAX as f32
                    + 0.5 * self.npif_buf[i];
            }
            dump.write(
                self.window_offs + self.window_margin as i64 - self.start_pos,
                &self.dump_buf[self.window_margin..self.window_margin + self.hopsize],
            );
        }

        self.window_offs += self.hopsize as i64;
        true
    }
}

impl DecoderBackend for XenonDecoder {
    fn decode_byte(&mut self) -> Option<DecodedByte> {
        while self.byte_emit_start == self.byte_emit_end {
            if !self.decode_window() {
                return None;
            }
        }

        let i = self.byte_emit_start;
        let z = self.byte_zs[i];
        let byte = DecodedByte::from_code(self.byte_times[i], false, z);
        self.byte_emit_start += 1;
        Some(byte)
    }
}
