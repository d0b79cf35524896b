/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! The shared waveform model.
//!
//! A [Sound] is a cheap handle over a reference counted backend holding
//! mono samples at a fixed rate. Only `[0, length)` carries data; reads
//! outside that range return zeros and never fail. Derived views (clip,
//! downsample, mix) compose source handles and pull samples lazily, so
//! upper pipeline stages never copy the waveform.
//!
//! Requesting a writable buffer with [Sound::get_buffer] is
//! copy-on-write: unless the handle is the unique owner of an in-memory
//! backing, a private copy is materialized first.
use std::path::Path;
use std::sync::Arc;
use std::io;

use crate::dsp::Downsampler;

mod file;
pub use file::FileBackend;

/// A backend supplying mono samples to a [Sound] handle.
///
/// Reads are callable from any thread. `read` fills `buf` with samples
/// `where_ .. where_ + buf.len()`, zero padding outside `[0, length)`,
/// and returns `false` only on an I/O error.
pub trait SoundBackend: Send + Sync {
    /// Sample rate in Hz.
    fn sample_rate(&self) -> i32;
    /// Length in samples.
    fn length(&self) -> i64;
    /// Floating point read entry point.
    fn read(&self, where_: i64, buf: &mut [f32]) -> bool;

    /// Truncation to 16-bit samples, used by the audio host.
    fn read_i16(&self, where_: i64, buf: &mut [i16]) -> bool {
        let mut fbuf = vec![0.0f32; buf.len()];
        if !self.read(where_, &mut fbuf) {
            return false;
        }
        for (dst, &y) in buf.iter_mut().zip(fbuf.iter()) {
            *dst = f32_to_i16(y);
        }
        true
    }

    /// Returns the writable sample storage of an in-memory backend.
    fn mem_buffer_mut(&mut self) -> Option<&mut [f32]> {
        None
    }
}

/// Multiply by 32768 and clip to the 16-bit range.
#[inline]
pub fn f32_to_i16(y: f32) -> i16 {
    let val = 32768.0 * y;
    if val > 32767.0 {
        32767
    } else if val < -32768.0 {
        -32768
    } else {
        val as i16
    }
}

/// Scale for converting 16-bit samples to the [-1, 1] range.
pub const I16_SCALE: f32 = 1.0 / 32768.0;

/// Zero pads `buf` outside `[0, length)` and returns the interior range
/// as `(offset_into_buf, where_, len)`, or `None` when nothing is left.
pub(crate) fn pad_outside(where_: i64, buf: &mut [f32], length: i64) -> Option<(usize, i64, usize)> {
    let mut where_ = where_;
    let mut lo = 0usize;
    let mut hi = buf.len();
    while where_ < 0 && lo < hi {
        buf[lo] = 0.0;
        lo += 1;
        where_ += 1;
    }
    while hi > lo && where_ + (hi - lo) as i64 > length {
        hi -= 1;
        buf[hi] = 0.0;
    }
    if lo == hi {
        None
    } else {
        Some((lo, where_, hi - lo))
    }
}

//----------------------------------------------------------------------------
// In-memory backend
//----------------------------------------------------------------------------

/// Sample data held in primary memory.
pub struct MemBackend {
    buf: Vec<f32>,
    sample_rate: i32,
}

impl MemBackend {
    pub fn new(buf: Vec<f32>, sample_rate: i32) -> Self {
        assert!(sample_rate > 0);
        MemBackend { buf, sample_rate }
    }

    pub fn zeroed(len: i64, sample_rate: i32) -> Self {
        assert!(len >= 0);
        MemBackend::new(vec![0.0; len as usize], sample_rate)
    }
}

impl SoundBackend for MemBackend {
    fn sample_rate(&self) -> i32 {
        self.sample_rate
    }

    fn length(&self) -> i64 {
        self.buf.len() as i64
    }

    fn read(&self, where_: i64, buf: &mut [f32]) -> bool {
        for (i, dst) in buf.iter_mut().enumerate() {
            let j = where_ + i as i64;
            *dst = if j >= 0 && j < self.buf.len() as i64 {
                self.buf[j as usize]
            } else {
                0.0
            };
        }
        true
    }

    fn mem_buffer_mut(&mut self) -> Option<&mut [f32]> {
        Some(&mut self.buf)
    }
}

//----------------------------------------------------------------------------
// Derived backends
//----------------------------------------------------------------------------

/// Cut-out view of another sound.
struct ClipBackend {
    src: Sound,
    offset: i64,
    length: i64,
}

impl SoundBackend for ClipBackend {
    fn sample_rate(&self) -> i32 {
        self.src.sample_rate()
    }

    fn length(&self) -> i64 {
        self.length
    }

    fn read(&self, where_: i64, buf: &mut [f32]) -> bool {
        match pad_outside(where_, buf, self.length) {
            None => true,
            Some((lo, at, len)) => self.src.read(self.offset + at, &mut buf[lo..lo + len]),
        }
    }
}

/// Integer-factor downsampled view of another sound.
struct DownsampleBackend {
    src: Sound,
    downsampler: Downsampler,
    down_factor: usize,
    sample_rate: i32,
    length: i64,
}

impl SoundBackend for DownsampleBackend {
    fn sample_rate(&self) -> i32 {
        self.sample_rate
    }

    fn length(&self) -> i64 {
        self.length
    }

    fn read(&self, where_: i64, buf: &mut [f32]) -> bool {
        let extra = self.downsampler.extra_samples_needed();
        let highlen = self.down_factor * buf.len() + 2 * extra;
        let mut highbuf = vec![0.0f32; highlen];
        if !self
            .src
            .read(self.down_factor as i64 * where_ - extra as i64, &mut highbuf)
        {
            return false;
        }
        self.downsampler.downsample(buf, &highbuf, extra);
        true
    }
}

/// Linear blend of two equally long sounds.
struct MixBackend {
    src0: Sound,
    src1: Sound,
    k: f32,
}

impl SoundBackend for MixBackend {
    fn sample_rate(&self) -> i32 {
        self.src0.sample_rate()
    }

    fn length(&self) -> i64 {
        self.src0.length()
    }

    fn read(&self, where_: i64, buf: &mut [f32]) -> bool {
        if !self.src0.read(where_, buf) {
            return false;
        }
        let mut tmp = vec![0.0f32; buf.len()];
        if !self.src1.read(where_, &mut tmp) {
            return false;
        }
        for (dst, y) in buf.iter_mut().zip(tmp) {
            *dst += self.k * (y - *dst);
        }
        true
    }
}

//----------------------------------------------------------------------------
// Sound handle
//----------------------------------------------------------------------------

/// A shared, lazily evaluated mono waveform.
#[derive(Clone)]
pub struct Sound {
    backend: Arc<dyn SoundBackend>,
}

impl Sound {
    /// Wraps an arbitrary backend.
    pub fn from_backend(backend: Arc<dyn SoundBackend>) -> Self {
        Sound { backend }
    }

    /// Copies the given samples into an in-memory sound.
    pub fn from_samples(buf: &[f32], sample_rate: i32) -> Self {
        Sound {
            backend: Arc::new(MemBackend::new(buf.to_vec(), sample_rate)),
        }
    }

    /// Takes ownership of a sample vector.
    pub fn from_vec(buf: Vec<f32>, sample_rate: i32) -> Self {
        Sound {
            backend: Arc::new(MemBackend::new(buf, sample_rate)),
        }
    }

    /// An all-zero sound of the given length.
    pub fn silence(len: i64, sample_rate: i32) -> Self {
        Sound {
            backend: Arc::new(MemBackend::zeroed(len, sample_rate)),
        }
    }

    /// Opens an audio file as a lazily read sound.
    ///
    /// Only the header is read during this call; sample reads are
    /// deferred and cached in one-second blocks. Stereo and multi
    /// channel files are averaged to mono.
    pub fn read_from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let backend = FileBackend::open(path.as_ref())?;
        Ok(Sound {
            backend: Arc::new(backend),
        })
    }

    /// Length in samples.
    pub fn length(&self) -> i64 {
        self.backend.length()
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> i32 {
        self.backend.sample_rate()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.length() as f64 / self.sample_rate() as f64
    }

    /// Reads a sample range, zero padded outside `[0, length)`.
    ///
    /// Returns `false` only on an I/O error.
    pub fn read(&self, where_: i64, buf: &mut [f32]) -> bool {
        self.backend.read(where_, buf)
    }

    /// 16-bit variant of [Sound::read].
    pub fn read_i16(&self, where_: i64, buf: &mut [i16]) -> bool {
        self.backend.read_i16(where_, buf)
    }

    /// Returns a writable buffer with the whole waveform in memory.
    ///
    /// Converts the handle to an exclusively owned in-memory backing
    /// first, cloning the sample data unless this handle already is the
    /// unique owner of one.
    pub fn get_buffer(&mut self) -> &mut [f32] {
        let need_copy = match Arc::get_mut(&mut self.backend) {
            Some(backend) => backend.mem_buffer_mut().is_none(),
            None => true,
        };
        if need_copy {
            let len = self.length();
            let sample_rate = self.sample_rate();
            let mut buf = vec![0.0f32; len as usize];
            self.read(0, &mut buf);
            self.backend = Arc::new(MemBackend::new(buf, sample_rate));
        }
        Arc::get_mut(&mut self.backend)
            .expect("freshly materialized backend is unique")
            .mem_buffer_mut()
            .expect("in-memory backend")
    }

    /// Modifies a section of the sound.
    ///
    /// Writes outside `[0, length)` are ignored.
    pub fn write(&mut self, where_: i64, buf: &[f32]) {
        let len = self.length();
        let dst = self.get_buffer();
        for (i, &y) in buf.iter().enumerate() {
            let j = where_ + i as i64;
            if j >= 0 && j < len {
                dst[j as usize] = y;
            }
        }
    }

    /// Writes the sound to a 16-bit PCM WAV file.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate() as u32,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).map_err(hound_err)?;
        let len = self.length();
        let mut buf = vec![0.0f32; 65536];
        let mut offs = 0i64;
        while offs < len {
            let chunk = buf.len().min((len - offs) as usize);
            if !self.read(offs, &mut buf[..chunk]) {
                return Err(io::Error::new(io::ErrorKind::Other, "sound read failed"));
            }
            for &y in &buf[..chunk] {
                writer.write_sample(f32_to_i16(y)).map_err(hound_err)?;
            }
            offs += chunk as i64;
        }
        writer.finalize().map_err(hound_err)
    }

    /// Cuts out a part of the sound.
    pub fn clip(&mut self, skip_seconds: f64, max_seconds: f64) {
        assert!(skip_seconds >= 0.0);
        if skip_seconds > 0.0 || self.duration() > max_seconds {
            let sample_rate = self.sample_rate();
            let offset = (0.5 + skip_seconds * sample_rate as f64).floor() as i64;
            let maxlen = (0.5 + max_seconds * sample_rate as f64).floor() as i64;
            let mut length = self.length() - offset;
            if maxlen >= 0 && length > maxlen {
                length = maxlen;
            }
            if length < 0 {
                length = 0;
            }
            self.backend = Arc::new(ClipBackend {
                src: self.clone(),
                offset,
                length,
            });
        }
    }

    /// Downsamples by an integer factor.
    pub fn downsample(&mut self, down_factor: usize) {
        assert!(down_factor >= 1);
        if down_factor > 1 {
            self.backend = Arc::new(DownsampleBackend {
                src: self.clone(),
                downsampler: Downsampler::new(down_factor),
                down_factor,
                sample_rate: self.sample_rate() / down_factor as i32,
                length: self.length() / down_factor as i64,
            });
        }
    }

    /// Mixes with another sound; 0 keeps self, 1 takes only `other`.
    pub fn mix(&mut self, other: &Sound, proportion: f64) {
        assert!((0.0..=1.0).contains(&proportion));
        assert_eq!(self.sample_rate(), other.sample_rate());
        assert_eq!(self.length(), other.length());
        self.backend = Arc::new(MixBackend {
            src0: self.clone(),
            src1: other.clone(),
            k: proportion as f32,
        });
    }
}

pub(crate) fn hound_err(e: hound::Error) -> io::Error {
    match e {
        hound::Error::IoError(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_zero_padded() {
        let snd = Sound::from_samples(&[0.5, -0.5, 1.0], 44100);
        let mut buf = [9.0f32; 7];
        assert!(snd.read(-2, &mut buf));
        assert_eq!([0.0, 0.0, 0.5, -0.5, 1.0, 0.0, 0.0], buf);
    }

    #[test]
    fn get_buffer_clones_shared_backing() {
        let original = Sound::from_samples(&[0.25f32; 8], 44100);
        let mut copy = original.clone();
        copy.get_buffer()[3] = -1.0;

        let mut buf = [0.0f32; 8];
        assert!(original.read(0, &mut buf));
        assert_eq!(0.25, buf[3], "mutation must not affect the original");
        assert!(copy.read(0, &mut buf));
        assert_eq!(-1.0, buf[3]);
    }

    #[test]
    fn get_buffer_in_place_when_unique() {
        let mut snd = Sound::from_samples(&[0.0f32; 4], 8000);
        snd.get_buffer()[0] = 0.5;
        snd.get_buffer()[1] = 0.25;
        let mut buf = [0.0f32; 4];
        assert!(snd.read(0, &mut buf));
        assert_eq!([0.5, 0.25, 0.0, 0.0], buf);
    }

    #[test]
    fn clip_selects_a_range() {
        let samples: Vec<f32> = (0..44100).map(|i| i as f32 / 44100.0).collect();
        let mut snd = Sound::from_vec(samples, 44100);
        snd.clip(0.5, 0.25);
        assert_eq!(11025, snd.length());
        let mut buf = [0.0f32; 1];
        assert!(snd.read(0, &mut buf));
        assert!((buf[0] - 0.5).abs() < 1e-4);
        // Past the clipped end reads as zero
        assert!(snd.read(11025, &mut buf));
        assert_eq!(0.0, buf[0]);
    }

    #[test]
    fn mix_blends_proportionally() {
        let a = Sound::from_samples(&[1.0f32; 4], 8000);
        let b = Sound::from_samples(&[0.0f32; 4], 8000);
        let mut m = a.clone();
        m.mix(&b, 0.25);
        let mut buf = [0.0f32; 4];
        assert!(m.read(0, &mut buf));
        for y in buf {
            assert!((y - 0.75).abs() < 1e-6);
        }
    }

    #[test]
    fn downsample_scales_geometry() {
        let mut snd = Sound::silence(44100, 44100);
        snd.downsample(4);
        assert_eq!(11025, snd.sample_rate());
        assert_eq!(11025, snd.length());
    }

    #[test]
    fn i16_conversion_saturates() {
        assert_eq!(32767, f32_to_i16(2.0));
        assert_eq!(-32768, f32_to_i16(-2.0));
        assert_eq!(0, f32_to_i16(0.0));
        assert_eq!(16384, f32_to_i16(0.5));
    }
}
