/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! File backed waveform source.
//!
//! Reads WAV files through `hound`, averages multi-channel material to
//! mono and caches one-second blocks of 16-bit samples. The cache is
//! shared between threads: a block hit is a lock-free atomic check,
//! a miss takes the reader mutex, re-checks, then seeks and fills.
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use log::debug;

use super::{SoundBackend, I16_SCALE};

type WavReader = hound::WavReader<BufReader<File>>;

enum SampleKind {
    /// Integer samples, shifted left by `i8` bits to reach 16-bit scale
    /// (negative shifts right, for 24/32-bit material).
    Int(i8),
    Float,
}

struct Reader {
    wav: WavReader,
    kind: SampleKind,
}

impl Reader {
    /// Reads `frames` whole frames, averaging channels to mono.
    fn read_mono(&mut self, dst: &mut [i16], channels: usize) -> bool {
        match self.kind {
            SampleKind::Int(shift) => {
                let mut samples = self.wav.samples::<i32>();
                for dst in dst.iter_mut() {
                    let mut sum = 0i64;
                    for _ in 0..channels {
                        match samples.next() {
                            Some(Ok(s)) => {
                                let s16 = if shift >= 0 {
                                    (s << shift) as i64
                                } else {
                                    (s >> -shift) as i64
                                };
                                sum += s16;
                            }
                            _ => return false,
                        }
                    }
                    *dst = (sum / channels as i64) as i16;
                }
                true
            }
            SampleKind::Float => {
                let mut samples = self.wav.samples::<f32>();
                for dst in dst.iter_mut() {
                    let mut sum = 0.0f64;
                    for _ in 0..channels {
                        match samples.next() {
                            Some(Ok(s)) => sum += s as f64,
                            _ => return false,
                        }
                    }
                    *dst = super::f32_to_i16((sum / channels as f64) as f32);
                }
                true
            }
        }
    }
}

/// WAV file backend with a one-second block cache.
pub struct FileBackend {
    sample_rate: i32,
    length: i64,
    channels: usize,
    block_size: usize,
    blocks: Box<[OnceLock<Box<[i16]>>]>,
    reader: Mutex<Reader>,
}

impl FileBackend {
    pub fn open(path: &Path) -> io::Result<Self> {
        let wav = hound::WavReader::open(path).map_err(super::hound_err)?;
        let spec = wav.spec();
        let channels = spec.channels as usize;
        let sample_rate = spec.sample_rate as i32;
        let length = wav.duration() as i64; // frames per channel

        let kind = match spec.sample_format {
            hound::SampleFormat::Float => SampleKind::Float,
            hound::SampleFormat::Int => SampleKind::Int(16 - spec.bits_per_sample as i8),
        };

        // One-second blocks
        let mut block_size = sample_rate as usize;
        if length > 0 && block_size as i64 > length {
            block_size = length as usize;
        }
        let block_cnt = if length > 0 {
            ((length + block_size as i64 - 1) / block_size as i64) as usize
        } else {
            0
        };
        let blocks = (0..block_cnt).map(|_| OnceLock::new()).collect();

        debug!(
            "opened {}: {} Hz, {} channel(s), {} frames",
            path.display(),
            sample_rate,
            channels,
            length
        );

        Ok(FileBackend {
            sample_rate,
            length,
            channels,
            block_size,
            blocks,
            reader: Mutex::new(Reader { wav, kind }),
        })
    }

    /// Retrieves a pointer to a cached block, filling it on first use.
    /// Callable from any thread.
    fn block(&self, block_no: usize) -> Option<&[i16]> {
        assert!(block_no < self.blocks.len());

        // Quick check before locking the mutex
        if let Some(block) = self.blocks[block_no].get() {
            return Some(block);
        }

        let mut reader = self.reader.lock().expect("file backend reader");

        // Check again in case somebody fetched it while we took the mutex
        if let Some(block) = self.blocks[block_no].get() {
            return Some(block);
        }

        let block_start = block_no as i64 * self.block_size as i64;
        let mut size = self.block_size;
        if block_start + size as i64 > self.length {
            size = (self.length - block_start) as usize; // last block is smaller
        }

        if reader.wav.seek(block_start as u32).is_err() {
            return None;
        }
        let mut block = vec![0i16; size];
        if !reader.read_mono(&mut block, self.channels) {
            return None;
        }
        let _ = self.blocks[block_no].set(block.into_boxed_slice());
        self.blocks[block_no].get().map(|b| &**b)
    }

    /// Reads an interior range through the block cache.
    fn read_cached(&self, where_: i64, buf: &mut [i16]) -> bool {
        let mut offs = 0usize;
        while offs < buf.len() {
            let at = where_ + offs as i64;
            debug_assert!(at >= 0 && at < self.length);
            let block_no = (at / self.block_size as i64) as usize;
            let block_start = block_no as i64 * self.block_size as i64;
            let block_end = block_start + self.block_size as i64;

            let mut do_cnt = (block_end - at) as usize;
            if do_cnt > buf.len() - offs {
                do_cnt = buf.len() - offs;
            }

            let block = match self.block(block_no) {
                Some(block) => block,
                None => return false,
            };
            let skip = (at - block_start) as usize;
            buf[offs..offs + do_cnt].copy_from_slice(&block[skip..skip + do_cnt]);

            offs += do_cnt;
        }
        true
    }
}

impl SoundBackend for FileBackend {
    fn sample_rate(&self) -> i32 {
        self.sample_rate
    }

    fn length(&self) -> i64 {
        self.length
    }

    fn read(&self, where_: i64, buf: &mut [f32]) -> bool {
        // Convert in chunks so the staging buffer stays small
        const CHUNK: usize = 2048;
        let mut sbuf = [0i16; CHUNK];
        let mut ok = true;
        let mut dx = 0usize;
        while dx < buf.len() {
            let chunk = CHUNK.min(buf.len() - dx);
            if !self.read_i16(where_ + dx as i64, &mut sbuf[..chunk]) {
                ok = false;
            }
            for (dst, &s) in buf[dx..dx + chunk].iter_mut().zip(sbuf.iter()) {
                *dst = I16_SCALE * s as f32;
            }
            dx += chunk;
        }
        ok
    }

    fn read_i16(&self, where_: i64, buf: &mut [i16]) -> bool {
        // Zero pad outside [0, length)
        let mut where_ = where_;
        let mut lo = 0usize;
        let mut hi = buf.len();
        while where_ < 0 && lo < hi {
            buf[lo] = 0;
            lo += 1;
            where_ += 1;
        }
        while hi > lo && where_ + (hi - lo) as i64 > self.length {
            hi -= 1;
            buf[hi] = 0;
        }
        if lo == hi {
            return true;
        }
        self.read_cached(where_, &mut buf[lo..hi])
    }
}
