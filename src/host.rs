/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Live audio playback and capture.
//!
//! Requires the "cpal" feature to be enabled.
//!
//! The device callback and the filling thread exchange whole sample
//! frames through the [carousel]: a pair of bounded channels
//! circulating preallocated buffers, so the audio callback never
//! allocates, blocks on a lock or touches I/O.
use core::fmt;
use std::error;

pub mod carousel;
pub mod cpal;

/// The error kind returned by the audio host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioHandleErrorKind {
    /// The audio subsystem or device is unavailable.
    AudioSubsystem,
    /// A stream could not be built or driven.
    AudioStream,
    /// The remote end of the carousel is gone.
    Terminated,
}

/// An error from the audio host.
#[derive(Debug)]
pub struct AudioHandleError {
    desc: String,
    kind: AudioHandleErrorKind,
}

impl AudioHandleError {
    pub fn kind(&self) -> AudioHandleErrorKind {
        self.kind
    }
}

impl fmt::Display for AudioHandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.desc)
    }
}

impl error::Error for AudioHandleError {}

impl From<(String, AudioHandleErrorKind)> for AudioHandleError {
    fn from((desc, kind): (String, AudioHandleErrorKind)) -> Self {
        AudioHandleError { desc, kind }
    }
}
