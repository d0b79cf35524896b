/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Leaf DSP primitives used throughout the decoding pipeline.
//!
//! All window filters require the exact length relation
//! `dst.len() == src.len() - filterlen + 1` with an odd `filterlen`,
//! so the caller controls the margins explicitly. Interpolators treat
//! out-of-range samples as zero.
use core::f32::consts::PI;

#[inline(always)]
fn at(vals: &[f32], i: i64) -> f32 {
    if i >= 0 && (i as usize) < vals.len() {
        vals[i as usize]
    } else {
        0.0
    }
}

/// Catmull-Rom style four point cubic interpolation with zero padding.
pub fn interp(vals: &[f32], x: f32) -> f32 {
    let x0 = x.floor() as i64;
    let frac = x - x0 as f32;
    let y0 = at(vals, x0 - 1);
    let y1 = at(vals, x0);
    let y2 = at(vals, x0 + 1);
    let y3 = at(vals, x0 + 2);
    y1 + frac
        * (y2 - y0
            + frac * (2.0 * y0 - 5.0 * y1 + 4.0 * y2 - y3 + frac * (-y0 + 3.0 * y1 - 3.0 * y2 + y3)))
        / 2.0
}

/// Two point linear interpolation with zero padding.
#[inline]
pub fn interp_lin(vals: &[f32], x: f32) -> f32 {
    let x0 = x.floor() as i64;
    let frac = x - x0 as f32;
    let y0 = at(vals, x0);
    let y1 = at(vals, x0 + 1);
    y0 + frac * (y1 - y0)
}

// Block-wise running extremum.
//
// i  i  i  i  i  i  i  i  i  i  i   input
// l  l  s  l  l  s  l  l  s
//    l  s     l  s     l  s
// .  .  s  .  .  s  .  .  s
//       s  r     s  r     s  r
//       s  r  r  s  r  r  s  r  r
//    o  o  o  o  o  o  o  o  o      output
//
// Each block combines a left sweep 'l' and a right sweep 'r' around the
// starting element 's', giving amortized one combine per output sample.
fn running_extremum(dst: &mut [f32], src: &[f32], filterlen: usize, pick: fn(f32, f32) -> f32) {
    assert!(filterlen > 0);
    assert_eq!(dst.len(), src.len() - filterlen + 1);

    // Avoid special cases by aligning to a multiple of the filter length
    let mut off = 0;
    let mut n = dst.len();
    while n % filterlen != 0 {
        let mut acc = src[off];
        for j in 1..filterlen {
            acc = pick(acc, src[off + j]);
        }
        dst[off] = acc;
        off += 1;
        n -= 1;
    }

    let mut i = off;
    while i < off + n {
        // Starting element
        let mut acc = src[i + filterlen - 1];
        dst[i + filterlen - 1] = acc;

        // Left sweep
        for j in (0..filterlen - 1).rev() {
            acc = pick(acc, src[i + j]);
            dst[i + j] = acc;
        }

        // Right sweep, starting element again
        acc = src[i + filterlen - 1];
        for j in 1..filterlen {
            acc = pick(acc, src[i + filterlen - 1 + j]);
            dst[i + j] = pick(acc, dst[i + j]);
        }

        i += filterlen;
    }
}

/// Running minimum over a window of `filterlen` samples.
pub fn running_min(dst: &mut [f32], src: &[f32], filterlen: usize) {
    running_extremum(dst, src, filterlen, f32::min);
}

/// Running maximum over a window of `filterlen` samples.
pub fn running_max(dst: &mut [f32], src: &[f32], filterlen: usize) {
    running_extremum(dst, src, filterlen, f32::max);
}

/// Low-pass filter with a raised cosine kernel normalized to unit sum.
///
/// The kernel is never convolved directly; the window sum and its
/// first cosine and sine moments are updated incrementally, giving a
/// constant cost per output sample regardless of `filterlen`. This is
/// the workhorse of the conditioning stages and dominates the runtime
/// on long recordings.
pub fn hann_lowpass(dst: &mut [f32], src: &[f32], filterlen: usize) {
    assert!(filterlen & 1 == 1); // so there is a 1 in the middle
    assert_eq!(dst.len(), src.len() - filterlen + 1);

    let mut ckern = vec![0.0f32; filterlen];
    let mut skern = vec![0.0f32; filterlen];
    let k = 2.0 * PI / filterlen as f32;
    let mut csum = 0.0f32;
    for i in 0..filterlen {
        let phi = k * (i as f32 - (filterlen / 2) as f32); // 0 degrees in the middle element
        ckern[i] = phi.cos();
        skern[i] = phi.sin();
        csum += ckern[i];
    }

    // Constant for normalizing the Hann kernel sum to 1
    let kh = 1.0 / (filterlen as f32 + csum);

    // Initial window position
    let (mut r, mut c, mut s) = (0.0f32, 0.0f32, 0.0f32);
    for i in 0..filterlen {
        let x = src[i];
        r += x;
        c += x * ckern[i];
        s += x * skern[i];
    }
    dst[0] = kh * (r + c);

    // Incremental update for remaining positions
    for i in 1..dst.len() {
        let dx = src[i + filterlen - 1] - src[i - 1];
        let j = (i - 1) % filterlen;
        r += dx;
        c += dx * ckern[j];
        s += dx * skern[j];

        let j = (i + filterlen / 2) % filterlen;
        dst[i] = kh * (ckern[j] * c + skern[j] * s + r);
    }
}

/// sinc(x) = sin(pi x)/(pi x)
fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        return 1.0;
    }
    let t = core::f64::consts::PI * x;
    t.sin() / t
}

/// Hann windowed sinc decimator used by integer-factor downsampling.
#[derive(Debug)]
pub struct Downsampler {
    down_factor: usize,
    coeffs: Vec<f32>,
}

impl Downsampler {
    pub fn new(down_factor: usize) -> Self {
        assert!(down_factor >= 1);
        let coeff_cnt = if down_factor == 1 { 1 } else { 8 * down_factor };
        let mut coeffs = vec![0.0f32; coeff_cnt];
        for (i, w) in coeffs.iter_mut().enumerate() {
            *w = (sinc(i as f64 / down_factor as f64)
                * (1.0 + (core::f64::consts::PI * i as f64 / coeff_cnt as f64).cos()))
                as f32;
        }

        // Normalize sum to 1, counting nonzero indices twice
        let mut s = coeffs[0];
        for w in &coeffs[1..] {
            s += 2.0 * w;
        }
        for w in coeffs.iter_mut() {
            *w /= s;
        }

        Downsampler { down_factor, coeffs }
    }

    /// No. of extra samples needed before and after the sample points in `src`.
    pub fn extra_samples_needed(&self) -> usize {
        self.coeffs.len() - 1
    }

    pub fn downsample(&self, dst: &mut [f32], src: &[f32], srcoffs: usize) {
        let mut j = srcoffs as i64;
        for out in dst.iter_mut() {
            let mut s = self.coeffs[0] * at(src, j);
            for (k, w) in self.coeffs.iter().enumerate().skip(1) {
                s += w * (at(src, j + k as i64) + at(src, j - k as i64));
            }
            *out = s;
            j += self.down_factor as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn naive_extremum(src: &[f32], filterlen: usize, pick: fn(f32, f32) -> f32) -> Vec<f32> {
        (0..src.len() - filterlen + 1)
            .map(|i| src[i..i + filterlen].iter().copied().fold(src[i], pick))
            .collect()
    }

    #[test]
    fn running_min_max_match_naive() {
        let mut rng = StdRng::seed_from_u64(0x0123);
        for filterlen in [1usize, 3, 5, 9, 13] {
            let src: Vec<f32> = (0..97).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            let mut dst = vec![0.0f32; src.len() - filterlen + 1];
            running_min(&mut dst, &src, filterlen);
            assert_eq!(naive_extremum(&src, filterlen, f32::min), dst);
            running_max(&mut dst, &src, filterlen);
            assert_eq!(naive_extremum(&src, filterlen, f32::max), dst);
        }
    }

    #[test]
    fn hann_lowpass_preserves_constants() {
        let src = vec![0.25f32; 64];
        let filterlen = 21;
        let mut dst = vec![0.0f32; src.len() - filterlen + 1];
        hann_lowpass(&mut dst, &src, filterlen);
        for y in dst {
            assert!((y - 0.25).abs() < 1e-5);
        }
    }

    #[test]
    fn hann_lowpass_matches_direct_convolution() {
        let mut rng = StdRng::seed_from_u64(0xbeef);
        let src: Vec<f32> = (0..120).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let filterlen = 15;
        let mut dst = vec![0.0f32; src.len() - filterlen + 1];
        hann_lowpass(&mut dst, &src, filterlen);

        // Direct convolution with the raised cosine kernel
        let k = 2.0 * PI / filterlen as f32;
        let kern: Vec<f32> = (0..filterlen)
            .map(|i| 1.0 + (k * (i as f32 - (filterlen / 2) as f32)).cos())
            .collect();
        let ksum: f32 = kern.iter().sum();
        for (j, y) in dst.iter().enumerate() {
            let direct: f32 = (0..filterlen).map(|i| src[j + i] * kern[i]).sum::<f32>() / ksum;
            assert!((y - direct).abs() < 1e-4, "at {}: {} vs {}", j, y, direct);
        }
    }

    #[test]
    fn interp_is_exact_at_integers() {
        let vals = [0.5f32, -1.0, 0.25, 0.75, -0.5];
        for (i, v) in vals.iter().enumerate() {
            assert!((interp(&vals, i as f32) - v).abs() < 1e-6);
            assert!((interp_lin(&vals, i as f32) - v).abs() < 1e-6);
        }
    }

    #[test]
    fn interp_reproduces_lines() {
        let vals: Vec<f32> = (0..10).map(|i| 0.1 * i as f32 - 0.3).collect();
        for x in [2.25f32, 3.5, 4.75, 6.1] {
            let expected = 0.1 * x - 0.3;
            assert!((interp(&vals, x) - expected).abs() < 1e-5);
            assert!((interp_lin(&vals, x) - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn interpolators_zero_pad() {
        let vals = [1.0f32; 4];
        assert_eq!(0.0, interp(&vals, -3.0));
        assert_eq!(0.0, interp(&vals, 7.0));
        assert_eq!(0.0, interp_lin(&vals, -2.0));
    }

    #[test]
    fn downsampler_preserves_constants() {
        let ds = Downsampler::new(4);
        let extra = ds.extra_samples_needed();
        let src = vec![0.5f32; 4 * 16 + 2 * extra];
        let mut dst = vec![0.0f32; 16];
        ds.downsample(&mut dst, &src, extra);
        for y in &dst[1..15] {
            assert!((y - 0.5).abs() < 1e-3);
        }
    }
}
