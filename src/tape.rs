/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Common front-end to the decoder backends.
//!
//! Selects the backend(s) from the options, merges two parallel byte
//! streams chronologically and routes everything through the
//! [TapeParser]. When the input file is not a recognized waveform it
//! falls back to reading it as a `.tap` archive.
use std::io;

use log::info;

use orictape_core::frame::DecodedByte;
use orictape_core::sound::Sound;
use orictape_formats::tap::{format_time, TapeFile, TapeParser, SYNC_BYTE};

use crate::decoder::{DecoderBackend, DemodDecoder, DualDecoder, TrivialDecoder, XenonDecoder};
use crate::options::DecoderOptions;

/// One backend with its one-byte peek buffer.
struct Peeked {
    backend: Box<dyn DecoderBackend>,
    byte: Option<DecodedByte>,
}

impl Peeked {
    fn new(mut backend: Box<dyn DecoderBackend>) -> Self {
        let byte = backend.decode_byte();
        Peeked { backend, byte }
    }

    /// Takes the pending byte and refills the peek buffer.
    fn advance(&mut self) -> Option<DecodedByte> {
        let byte = self.byte.take()?;
        self.byte = self.backend.decode_byte();
        Some(byte)
    }
}

/// Decoder front-end turning a recording into bytes and files.
pub struct TapeDecoder {
    options: DecoderOptions,
    backends: Vec<Peeked>,
    select_fast: bool,
    select_slow: bool,
    parser: TapeParser,
}

impl TapeDecoder {
    /// Opens the input named in the options. A file that does not
    /// parse as a waveform is read as a `.tap` archive.
    pub fn new(options: DecoderOptions) -> io::Result<Self> {
        let path = options
            .filename
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no input file name"))?;
        match Sound::read_from_file(&path) {
            Ok(sound) => Ok(Self::from_sound(sound, options)),
            Err(_) => {
                // Read as a TAP archive
                let trivial = TrivialDecoder::new(options.clone())?;
                Ok(Self::from_backends(vec![Box::new(trivial)], options))
            }
        }
    }

    /// Reads an in-memory `.tap` archive byte stream.
    pub fn from_archive_bytes(bytes: Vec<u8>, options: DecoderOptions) -> Self {
        let trivial = TrivialDecoder::from_bytes(bytes, options.clone());
        Self::from_backends(vec![Box::new(trivial)], options)
    }

    /// Decodes an already opened waveform.
    pub fn from_sound(sound: Sound, options: DecoderOptions) -> Self {
        let mut backends: Vec<Box<dyn DecoderBackend>> = Vec::new();
        if options.dual {
            // Dual format two-stage decoder. With one format clearly
            // requested enable just it, otherwise both for autodetect.
            let decode_fast = options.fast || !options.slow;
            let decode_slow = options.slow || !options.fast;
            backends.push(Box::new(DualDecoder::new(
                &sound,
                options.clone(),
                decode_fast,
                decode_slow,
            )));
        } else {
            // Fast format: the pulse indicator decoder
            if !options.slow {
                backends.push(Box::new(XenonDecoder::new(&sound, options.clone())));
            }
            // Slow format: the demodulation based decoder - faster and
            // more accurate than the two-stage one, but slow-only
            if !options.fast {
                backends.push(Box::new(DemodDecoder::new(&sound, options.clone())));
            }
        }
        Self::from_backends(backends, options)
    }

    fn from_backends(backends: Vec<Box<dyn DecoderBackend>>, options: DecoderOptions) -> Self {
        // Select slow or fast when clearly specified; otherwise leave
        // both unselected for autodetection.
        let select_fast = options.fast && !options.slow;
        let select_slow = options.slow && !options.fast;
        let parser = TapeParser::new(options.verbose);
        TapeDecoder {
            options,
            backends: backends.into_iter().map(Peeked::new).collect(),
            select_fast,
            select_slow,
            parser,
        }
    }

    /// Retrieves one byte, weaving together the backend streams in
    /// chronological order. Returns `None` at the end of the tape.
    pub fn read_byte(&mut self) -> Option<DecodedByte> {
        loop {
            // Pick the backend with the earliest pending byte
            let mut pick: Option<usize> = None;
            for (i, peeked) in self.backends.iter().enumerate() {
                if let Some(byte) = peeked.byte {
                    let earlier = match pick {
                        Some(p) => byte.time < self.backends[p].byte.unwrap().time,
                        None => true,
                    };
                    if earlier {
                        pick = Some(i);
                    }
                }
            }
            let byte = self.backends[pick?].advance()?;

            let idle = self.parser.is_idle();

            // Detect sync and switch modes while nothing is in flight
            if byte.byte == SYNC_BYTE && byte.is_healthy() && idle {
                let switching = if byte.slow {
                    !self.select_slow
                } else {
                    !self.select_fast
                };
                if switching && self.options.verbose {
                    info!(
                        "{}  Detected {} format",
                        format_time(byte.time),
                        if byte.slow { "slow" } else { "fast" }
                    );
                }
                self.select_fast = !byte.slow;
                self.select_slow = byte.slow;
            }

            let selected = if byte.slow {
                self.select_slow
            } else {
                self.select_fast
            };

            if selected {
                self.parser.put_byte(&byte);

                // Do not return errored bytes unless inside a file;
                // this keeps noise from looking like data
                if byte.is_healthy() || !idle {
                    return Some(byte);
                }
            }
        }
    }

    /// Decodes until the next complete file, or to the end of tape.
    pub fn read_file(&mut self) -> Option<TapeFile> {
        loop {
            if let Some(file) = self.parser.take_file() {
                return Some(file);
            }
            if self.read_byte().is_none() {
                self.parser.flush(); // might still produce a file
                return self.parser.take_file();
            }
        }
    }

    /// Access to the parser, e.g. for timing queries.
    pub fn parser(&self) -> &TapeParser {
        &self.parser
    }
}
