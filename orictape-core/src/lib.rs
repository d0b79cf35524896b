/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    ORICTAPE is free software: you can redistribute it and/or modify it
    under the terms of the GNU Lesser General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    ORICTAPE is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
    Lesser General Public License for more details.
*/
//! The core components of ORICTAPE: the shared waveform model, DSP
//! primitives and the signal conditioning stages used by the tape
//! decoders, plus the 13-bit byte frame layer common to both tape
//! encodings.
pub mod dsp;
pub mod filter;
pub mod frame;
pub mod sound;

pub use crate::frame::DecodedByte;
pub use crate::sound::Sound;
