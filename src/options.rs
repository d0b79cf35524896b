/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Decoder configuration.
use std::path::PathBuf;

/// Bit extractor used by the dual decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Binner {
    /// Viterbi pattern matching binarizer.
    #[default]
    Pattern,
    /// Edge-detection grid binarizer.
    Grid,
    /// Bandpass fractional-stride grid binarizer.
    Super,
}

/// Band selection for the demodulation based decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Band {
    /// 1200 Hz band only.
    Low,
    /// 2400 Hz band only.
    High,
    /// Mix both bands, weighted by per-byte noise estimates.
    #[default]
    Dual,
}

/// Byte reading method for the fast-format start-bit decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Cue {
    /// Underside dip area reader; better on stretched tapes.
    Area,
    /// Wide peak reader; better when high frequencies have faded.
    Wide,
    /// Pick per byte based on a stability heuristic.
    #[default]
    Auto,
}

/// Bit-to-byte decoder used for the fast format by the dual decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Fdec {
    /// 28-state pattern matching Viterbi.
    #[default]
    Orig,
    /// Pulse-length correlation decoder.
    Plen,
    /// 108-state barrel shifter Viterbi.
    Barrel,
}

/// Settings shared by all decoder backends.
///
/// Passed by value to every decoder constructor.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecoderOptions {
    /// Input file name.
    pub filename: Option<PathBuf>,
    /// Start time of the scan window in seconds.
    pub start: Option<f64>,
    /// End time of the scan window in seconds.
    pub end: Option<f64>,
    /// Verbose log mode.
    pub verbose: bool,
    /// Decode only the fast format when set.
    pub fast: bool,
    /// Decode only the slow format when set.
    pub slow: bool,
    /// Use the dual-mode (fast+slow) two-stage decoder when set.
    pub dual: bool,
    /// Write `dump-demod.wav` / `dump-dual.wav` / `dump-xenon.wav`.
    pub dump: bool,
    /// Bit extractor for the dual decoder.
    pub binner: Binner,
    /// Band to use in the demodulation based decoder.
    pub band: Band,
    /// Method to recognize bits in the fast-format decoder.
    pub cue: Cue,
    /// Bit-to-byte decoder to use for the fast format.
    pub fdec: Fdec,
    /// Nominal physical bit frequency in Hz.
    pub f_ref: i32,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        DecoderOptions {
            filename: None,
            start: None,
            end: None,
            verbose: false,
            fast: false,
            slow: false,
            dual: false,
            dump: false,
            binner: Binner::default(),
            band: Band::default(),
            cue: Cue::default(),
            fdec: Fdec::default(),
            f_ref: 4800,
        }
    }
}
