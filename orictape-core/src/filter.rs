/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Signal conditioning stages.
//!
//! Each stage owns its source [Sound] and exposes a pull interface
//! mirroring it: `sample_rate`, `length` and a block `read`. Scratch
//! buffers grow on demand and are reused across reads, so a sliding
//! window caller amortizes all allocation.
use crate::dsp::{hann_lowpass, interp, running_max, running_min};
use crate::sound::Sound;

//----------------------------------------------------------------------------
// LowpassFilter
//----------------------------------------------------------------------------

/// Plain Hann low-pass stage.
pub struct LowpassFilter {
    src: Sound,
    lp_filterlen: usize,
    ibuf: Vec<f32>,
}

impl LowpassFilter {
    pub fn new(src: &Sound, lp_filterlen: usize) -> Self {
        assert!(lp_filterlen & 1 == 1);
        LowpassFilter {
            src: src.clone(),
            lp_filterlen,
            ibuf: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> i32 {
        self.src.sample_rate()
    }

    pub fn length(&self) -> i64 {
        self.src.length()
    }

    pub fn read(&mut self, where_: i64, buf: &mut [f32]) -> bool {
        let lp_margin = self.lp_filterlen >> 1;
        let ibuf_len = buf.len() + 2 * lp_margin;
        if self.ibuf.len() < ibuf_len {
            self.ibuf.resize(ibuf_len, 0.0);
        }

        let ok = self
            .src
            .read(where_ - lp_margin as i64, &mut self.ibuf[..ibuf_len]);
        hann_lowpass(buf, &self.ibuf[..ibuf_len], self.lp_filterlen);
        ok
    }
}

//----------------------------------------------------------------------------
// Balancer
//----------------------------------------------------------------------------

/// Nonlinear high-pass removing the offset from a signal.
///
/// ```text
///           .-----------------------------.
///           |  .---.                      |
/// Input     +->|min|--.                 + v
/// Signal  --+  '---'  |  .---.  .----. -.---.
///           |          =>|avg|->| LP |->| + |-->  Balanced output
///           |  .---.  |  '---'  '----'  '---'
///           '->|max|--'
///              '---'
/// ```
///
/// The output sample at `i` is the input at `i` minus the low-passed
/// midline of the local running min/max envelope. The optional
/// amplitude output is the low-passed half difference (max - min)/2,
/// which is never negative.
pub struct Balancer {
    src: Sound,
    mm_filterlen: usize, // length of min/max filters
    lp_filterlen: usize, // length of threshold hann filter
    ibuf: Vec<f32>,
    m0buf: Vec<f32>,
    m1buf: Vec<f32>,
}

impl Balancer {
    pub fn new(src: &Sound, mm_filterlen: usize, lp_filterlen: usize) -> Self {
        assert!(mm_filterlen & 1 == 1);
        assert!(lp_filterlen & 1 == 1);
        Balancer {
            src: src.clone(),
            mm_filterlen,
            lp_filterlen,
            ibuf: Vec::new(),
            m0buf: Vec::new(),
            m1buf: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> i32 {
        self.src.sample_rate()
    }

    pub fn length(&self) -> i64 {
        self.src.length()
    }

    pub fn read(&mut self, where_: i64, buf: &mut [f32]) -> bool {
        self.read_inner(where_, buf, None)
    }

    /// Version producing the amplitude envelope as well.
    pub fn read_with_amplitude(&mut self, where_: i64, buf: &mut [f32], abuf: &mut [f32]) -> bool {
        self.read_inner(where_, buf, Some(abuf))
    }

    fn read_inner(&mut self, where_: i64, buf: &mut [f32], abuf: Option<&mut [f32]>) -> bool {
        let len = buf.len();
        let mm_margin = self.mm_filterlen >> 1;
        let lp_margin = self.lp_filterlen >> 1;
        let mbuf_len = len + 2 * lp_margin;
        let ibuf_len = len + 2 * lp_margin + 2 * mm_margin;

        if self.ibuf.len() < ibuf_len {
            self.ibuf.resize(ibuf_len, 0.0);
            self.m0buf.resize(mbuf_len, 0.0);
            self.m1buf.resize(mbuf_len, 0.0);
        }

        let ok = self.src.read(
            where_ - mm_margin as i64 - lp_margin as i64,
            &mut self.ibuf[..ibuf_len],
        );

        running_min(&mut self.m0buf[..mbuf_len], &self.ibuf[..ibuf_len], self.mm_filterlen);
        running_max(&mut self.m1buf[..mbuf_len], &self.ibuf[..ibuf_len], self.mm_filterlen);

        // Average min and max to get a threshold level,
        // keep the half difference for the amplitude output
        for i in 0..mbuf_len {
            let m0 = self.m0buf[i];
            let m1 = self.m1buf[i];
            self.m0buf[i] = 0.5 * (m0 + m1);
            self.m1buf[i] = 0.5 * (m1 - m0);
        }

        // Low-pass filter the threshold level into the output buffer,
        // then subtract it from the delayed input
        hann_lowpass(buf, &self.m0buf[..mbuf_len], self.lp_filterlen);
        for (i, out) in buf.iter_mut().enumerate() {
            *out = self.ibuf[mm_margin + lp_margin + i] - *out;
        }

        if let Some(abuf) = abuf {
            hann_lowpass(abuf, &self.m1buf[..mbuf_len], self.lp_filterlen);
        }

        ok
    }
}

//----------------------------------------------------------------------------
// Demodulator
//----------------------------------------------------------------------------

/// Envelope demodulator for tapes where the oscillations themselves are
/// too faded to track reliably.
///
/// ```text
///    .----.  .----.                    .-----------------------------.
/// .->|*cos|->| LP |--.                 |  .---.                      |
/// |  '----'  '----'  |  .---.  .----.  +->|min|--.                 - v
///-+                   =>|abs|->|down|--+  '---'  |  .---.  .----. +.---.
/// |  .----.  .----.  |  '---'  '----'  |          =>|avg|->| LP |->| + |-->
/// '->|*sin|->| LP |--'                 |  .---.  |  '---'  '----'  '---'
///    '----'  '----'                    '->|max|--'
///                                         '---'
///|<---------- Demodulation --------->|<----------- Balancing ---------->|
/// ```
///
/// The carrier is 1200 Hz for the low band (the slow-format '0'
/// pattern) or 2400 Hz for the high band (the '1' pattern); the
/// magnitude is downsampled to `f_ref/2`. The balancing threshold
/// blends 65% running min with 35% running max, which keeps decoding
/// correct through dips below half magnitude. The low band output is
/// negated so that '1' always points positive in both bands.
pub struct Demodulator {
    src: Sound,
    ss_rate: i32, // subsampled output rate, nominally 2400 Hz
    ss_len: i64,
    use_high_band: bool,
    t_carrier: usize,
    t_lowpass: usize,

    // Demodulation kernels and buffers (read_demod_fullres)
    ckern: Vec<f32>,
    skern: Vec<f32>,
    cbuf: Vec<f32>,
    sbuf: Vec<f32>,
    obuf0: Vec<f32>,
    obuf1: Vec<f32>,

    // Downsampling buffer (read_demod)
    dsin_buf: Vec<f32>,

    // Balancing buffers (read)
    mm_filterlen: usize,
    th_filterlen: usize,
    mm_ibuf: Vec<f32>,
    mm_m0buf: Vec<f32>,
    mm_m1buf: Vec<f32>,
}

impl Demodulator {
    /// `f_ref_hz` is the reference physical symbol rate, nominally 4800 Hz.
    pub fn new(src: &Sound, f_ref_hz: i32, use_high_band: bool) -> Self {
        let carrier_hz = f_ref_hz / if use_high_band { 2 } else { 4 };
        let ss_rate = f_ref_hz / 2;
        let src_rate = src.sample_rate();

        // Length of the entire tape in subsampled resolution
        let ss_len = (0.5 + src.length() as f64 * ss_rate as f64 / src_rate as f64).floor() as i64;

        // Carrier period in input samples
        let t_carrier = ((src_rate + carrier_hz / 2) / carrier_hz) as usize;

        // Size of the lowpass kernel, 4 low carrier periods
        let t_lowpass = (16 * src_rate / f_ref_hz | 1) as usize;

        let k = 2.0 * core::f64::consts::PI / t_carrier as f64;
        let mut ckern = vec![0.0f32; t_carrier];
        let mut skern = vec![0.0f32; t_carrier];
        for i in 0..t_carrier {
            let phi = k * i as f64;
            ckern[i] = phi.cos() as f32;
            skern[i] = phi.sin() as f32;
        }

        // Size of minmax, 256 reference periods at the low sample rate.
        // C.f. one byte is 209/4 = 52.25 carrier periods.
        let mm_filterlen = (256 * ss_rate / f_ref_hz | 1) as usize;
        let th_filterlen = (3 * mm_filterlen) | 1;

        Demodulator {
            src: src.clone(),
            ss_rate,
            ss_len,
            use_high_band,
            t_carrier,
            t_lowpass,
            ckern,
            skern,
            cbuf: Vec::new(),
            sbuf: Vec::new(),
            obuf0: Vec::new(),
            obuf1: Vec::new(),
            dsin_buf: Vec::new(),
            mm_filterlen,
            th_filterlen,
            mm_ibuf: Vec::new(),
            mm_m0buf: Vec::new(),
            mm_m1buf: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> i32 {
        self.ss_rate
    }

    pub fn length(&self) -> i64 {
        self.ss_len
    }

    /// Stage 1: demodulated magnitude at full input resolution.
    fn read_demod_fullres(&mut self, where_: i64, buf: &mut [f32]) -> bool {
        let len = buf.len();
        let filter_margin = self.t_lowpass / 2;
        let ibuf_len = len + 2 * filter_margin;

        if self.cbuf.len() < ibuf_len {
            self.cbuf.resize(ibuf_len, 0.0);
            self.sbuf.resize(ibuf_len, 0.0);
        }
        if self.obuf0.len() < len {
            self.obuf0.resize(len, 0.0);
            self.obuf1.resize(len, 0.0);
        }

        if !self
            .src
            .read(where_ - filter_margin as i64, &mut self.cbuf[..ibuf_len])
        {
            return false;
        }

        // Produce cosine and sine multiplied versions
        for i in 0..ibuf_len {
            let j = i % self.t_carrier;
            self.sbuf[i] = self.cbuf[i] * self.skern[j];
            self.cbuf[i] *= self.ckern[j];
        }

        hann_lowpass(&mut self.obuf0[..len], &self.cbuf[..ibuf_len], self.t_lowpass);
        hann_lowpass(&mut self.obuf1[..len], &self.sbuf[..ibuf_len], self.t_lowpass);

        for (i, out) in buf.iter_mut().enumerate() {
            let c = self.obuf0[i];
            let s = self.obuf1[i];
            *out = (c * c + s * s).sqrt();
        }
        true
    }

    /// Stage 2: demodulated magnitude, downsampled to the output rate.
    fn read_demod(&mut self, where_: i64, buf: &mut [f32]) -> bool {
        let src_rate = self.src.sample_rate();
        let k_subsamp = src_rate as f64 / self.ss_rate as f64;

        let interp_filter_margin = 3i64;
        let t0 = (k_subsamp * where_ as f64).floor() as i64 - interp_filter_margin;
        let t1 = (k_subsamp * (where_ + buf.len() as i64 - 1) as f64).ceil() as i64
            + interp_filter_margin;
        let dsin_len = (t1 + 1 - t0) as usize;

        if self.dsin_buf.len() < dsin_len {
            self.dsin_buf.resize(dsin_len, 0.0);
        }
        let mut dsin_buf = core::mem::take(&mut self.dsin_buf);
        let ok = self.read_demod_fullres(t0, &mut dsin_buf[..dsin_len]);

        for (i, out) in buf.iter_mut().enumerate() {
            let x = k_subsamp * (where_ + i as i64) as f64 - t0 as f64;
            *out = interp(&dsin_buf[..dsin_len], x as f32);
        }
        self.dsin_buf = dsin_buf;
        ok
    }

    /// Stage 3: balanced demodulated signal with '1' pointing positive.
    pub fn read(&mut self, where_: i64, buf: &mut [f32]) -> bool {
        let len = buf.len();
        let mm_margin = self.mm_filterlen / 2;
        let th_margin = self.th_filterlen / 2;
        let mbuf_len = len + 2 * th_margin;
        let ibuf_len = len + 2 * th_margin + 2 * mm_margin;

        if self.mm_ibuf.len() < ibuf_len {
            self.mm_ibuf.resize(ibuf_len, 0.0);
            self.mm_m0buf.resize(mbuf_len, 0.0);
            self.mm_m1buf.resize(mbuf_len, 0.0);
        }

        let mut mm_ibuf = core::mem::take(&mut self.mm_ibuf);
        let ok = self.read_demod(
            where_ - mm_margin as i64 - th_margin as i64,
            &mut mm_ibuf[..ibuf_len],
        );

        running_min(&mut self.mm_m0buf[..mbuf_len], &mm_ibuf[..ibuf_len], self.mm_filterlen);
        running_max(&mut self.mm_m1buf[..mbuf_len], &mm_ibuf[..ibuf_len], self.mm_filterlen);

        // Threshold level: blend 65% min and 35% max. Compared to 50-50
        // averaging this handles dips in signal strength better; decoding
        // stays correct even when the magnitude falls below 50%.
        for i in 0..mbuf_len {
            self.mm_m0buf[i] = 0.65 * self.mm_m0buf[i] + 0.35 * self.mm_m1buf[i];
        }

        hann_lowpass(buf, &self.mm_m0buf[..mbuf_len], self.th_filterlen);

        if self.use_high_band {
            // The modulation signal indicates a '1': subtract the threshold.
            for (i, out) in buf.iter_mut().enumerate() {
                *out = mm_ibuf[mm_margin + th_margin + i] - *out;
            }
        } else {
            // The modulation signal indicates a '0': subtract and negate,
            // so '1' becomes the positive direction.
            for (i, out) in buf.iter_mut().enumerate() {
                *out -= mm_ibuf[mm_margin + th_margin + i];
            }
        }
        self.mm_ibuf = mm_ibuf;
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_sound(freq: f64, seconds: f64, rate: i32) -> Sound {
        let n = (seconds * rate as f64) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                (2.0 * core::f64::consts::PI * freq * i as f64 / rate as f64).sin() as f32 * 0.6
            })
            .collect();
        Sound::from_vec(samples, rate)
    }

    #[test]
    fn balancer_removes_dc_offset() {
        let rate = 44100;
        let mut snd = sine_sound(2400.0, 0.2, rate);
        for y in snd.get_buffer() {
            *y += 0.3; // constant offset
        }
        let t_ref = rate as f64 / 4800.0;
        let mm = (4.5 * t_ref).floor() as usize | 1;
        let lp = (12.0 * t_ref).floor() as usize | 1;
        let mut balancer = Balancer::new(&snd, mm, lp);

        let mut buf = vec![0.0f32; 2048];
        assert!(balancer.read(1024, &mut buf));
        let mean: f32 = buf.iter().sum::<f32>() / buf.len() as f32;
        assert!(mean.abs() < 0.02, "residual offset {}", mean);
    }

    #[test]
    fn balancer_amplitude_is_nonnegative() {
        let rate = 44100;
        let snd = sine_sound(1200.0, 0.2, rate);
        let t_ref = rate as f64 / 4800.0;
        let mm = (4.5 * t_ref).floor() as usize | 1;
        let lp = (12.0 * t_ref).floor() as usize | 1;
        let mut balancer = Balancer::new(&snd, mm, lp);

        let mut buf = vec![0.0f32; 1024];
        let mut abuf = vec![0.0f32; 1024];
        assert!(balancer.read_with_amplitude(512, &mut buf, &mut abuf));
        for a in abuf {
            assert!(a >= 0.0);
        }
    }

    #[test]
    fn demodulator_points_ones_positive() {
        let rate = 44100;
        // Alternating 1200 Hz ('0') and 2400 Hz ('1') segments, as on a
        // slow FSK tape. After balancing, both bands must go positive
        // during the 2400 Hz segments and negative during 1200 Hz.
        let seg = 0.15f64; // seconds per segment
        let seg_n = (seg * rate as f64) as usize;
        let mut samples = Vec::with_capacity(8 * seg_n);
        for pair in 0..4 {
            let _ = pair;
            for freq in [1200.0f64, 2400.0] {
                for i in 0..seg_n {
                    let phi = 2.0 * core::f64::consts::PI * freq * i as f64 / rate as f64;
                    samples.push(phi.sin() as f32 * 0.6);
                }
            }
        }
        let snd = Sound::from_vec(samples, rate);
        let mut low = Demodulator::new(&snd, 4800, false);
        let mut high = Demodulator::new(&snd, 4800, true);
        assert_eq!(2400, low.sample_rate());

        let ss_seg = (seg * 2400.0) as i64; // segment length in output samples
        for (band, demod) in [("low", &mut low), ("high", &mut high)] {
            for segment in 2..6i64 {
                // 120 samples around the segment center
                let center = segment * ss_seg + ss_seg / 2;
                let mut buf = vec![0.0f32; 120];
                assert!(demod.read(center - 60, &mut buf));
                let mean: f32 = buf.iter().sum::<f32>() / buf.len() as f32;
                let is_one = segment & 1 == 1; // odd segments carry 2400 Hz
                assert!(
                    if is_one { mean > 0.0 } else { mean < 0.0 },
                    "{} band, segment {}: mean {}",
                    band,
                    segment,
                    mean
                );
            }
        }
    }

    #[test]
    fn lowpass_filter_smooths() {
        let rate = 44100;
        let mut samples = vec![0.0f32; 4096];
        for (i, y) in samples.iter_mut().enumerate() {
            *y = if i & 1 == 0 { 1.0 } else { -1.0 }; // Nyquist buzz
        }
        let snd = Sound::from_vec(samples, rate);
        let mut lp = LowpassFilter::new(&snd, 19);
        let mut buf = vec![0.0f32; 1024];
        assert!(lp.read(1024, &mut buf));
        for y in buf {
            assert!(y.abs() < 0.1);
        }
    }
}
