/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
/*! **TAP** archive format utilities.

# TAP format

A `.tap` archive is the raw byte stream of one or more tape files, with
the analog layer stripped. Each file is introduced by a run of sync
bytes and a header-start marker:

```text
0x16 0x16 0x16 [...optional extra 0x16...] 0x24
<9-byte header>
<NUL terminated name, up to 16 data bytes + NUL>
<payload, `len` bytes>
```

The 9-byte header:

| offset | meaning                                              |
|--------|------------------------------------------------------|
|   0    | data-type LSB (ignored for BASIC/DATA)               |
|   1    | data-type MSB (ignored for BASIC/DATA)               |
|   2    | file type: `0x00` BASIC, `0x80` DATA, `0x40` ARRAY   |
|   3    | autorun: nonzero enables autorun                     |
|  4-5   | end address (inclusive), big endian                  |
|  6-7   | start address, big endian                            |
|   8    | unused                                               |

The payload length is not stored; it derives from the addresses as
`((end - start) mod 65536) + 1`. Multiple archives may be concatenated
in one file, and [TapArchiveIter] walks all of them.

The `ARRAY` type is a BASIC v1.1 extension and is not handled here.
*/
use core::fmt;
use std::borrow::Cow;
use std::collections::VecDeque;

use nom::bytes::complete::{tag, take, take_while, take_while_m_n};
use nom::error::{Error, ErrorKind};
use nom::IResult;

mod parse;
pub use parse::{format_time, TapeParser};

/// The sync run marker.
pub const SYNC_BYTE: u8 = 0x16;
/// The header start marker terminating a sync run.
pub const HEADER_START_BYTE: u8 = 0x24;
/// Minimum number of sync bytes that makes a valid sync run.
pub const MIN_SYNC_RUN: usize = 3;
/// Header byte 2 value for BASIC files.
pub const FILE_TYPE_BASIC: u8 = 0x00;
/// Header byte 2 value for DATA files.
pub const FILE_TYPE_DATA: u8 = 0x80;
/// Maximum file name length excluding the NUL terminator.
pub const NAME_MAX: usize = 16;
/// Byte used to pad truncated payloads.
pub const TRUNCATION_PAD: u8 = 0xcd;

/// A file extracted from tape or from a `.tap` archive.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TapeFile {
    /// The raw 9 header bytes as they appeared on tape.
    pub header: [u8; 9],

    // Parameters decoded from the header
    pub start_addr: u16,
    pub end_addr: u16,
    /// Payload length in bytes, 1..=65536, derived from the addresses.
    pub len: i32,
    /// Set when header byte 2 is `0x00`.
    pub basic: bool,
    /// Set when header byte 3 is nonzero.
    pub autorun: bool,
    /// Set when the file was read in the slow format. Not stored in
    /// the header.
    pub slow: bool,

    /// NUL terminated name, one guard byte against a corrupt string.
    pub name: [u8; NAME_MAX + 1],

    pub payload: Vec<u8>,

    pub sync_errors: i32,
    pub parity_errors: i32,
    /// Onset of the first byte, seconds.
    pub start_time: f64,
    /// Time just past the end byte, seconds.
    pub end_time: f64,
}

/// Payload length derived from the header addresses.
#[inline]
pub fn derive_len(start_addr: u16, end_addr: u16) -> i32 {
    (end_addr.wrapping_sub(start_addr)) as i32 + 1
}

impl TapeFile {
    /// Decodes the address and type fields from the raw `header` bytes
    /// and the terminated `name`, filling the derived fields.
    pub fn apply_header(&mut self) {
        let endaddr = u16::from_be_bytes([self.header[4], self.header[5]]);
        let startaddr = u16::from_be_bytes([self.header[6], self.header[7]]);
        self.start_addr = startaddr;
        self.end_addr = endaddr;
        self.len = derive_len(startaddr, endaddr);
        self.autorun = self.header[3] != 0;
        self.basic = self.header[2] == FILE_TYPE_BASIC;
    }

    /// The file name as a string, up to the NUL terminator.
    pub fn name_str(&self) -> Cow<'_, str> {
        let end = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_MAX);
        String::from_utf8_lossy(&self.name[..end])
    }

    /// Serializes the file back into `.tap` archive bytes.
    pub fn to_archive_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_SYNC_RUN + 1 + 9 + NAME_MAX + 1 + self.payload.len());
        out.extend_from_slice(&[SYNC_BYTE; MIN_SYNC_RUN]);
        out.push(HEADER_START_BYTE);

        let mut header = self.header;
        header[2] = if self.basic { FILE_TYPE_BASIC } else { FILE_TYPE_DATA };
        header[4..6].copy_from_slice(&self.end_addr.to_be_bytes());
        header[6..8].copy_from_slice(&self.start_addr.to_be_bytes());
        out.extend_from_slice(&header);

        let end = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_MAX);
        out.extend_from_slice(&self.name[..end]);
        out.push(0);

        out.extend_from_slice(&self.payload);
        out
    }
}

impl fmt::Display for TapeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: \"{}\" {:04x}-{:04x}",
            if self.basic { "Basic" } else { "Data" },
            self.name_str(),
            self.start_addr,
            self.end_addr
        )?;
        if self.autorun {
            write!(f, " AUTO")?;
        }
        if self.sync_errors != 0 || self.parity_errors != 0 {
            write!(f, " ({} sync, {} parity errors)", self.sync_errors, self.parity_errors)?;
        }
        Ok(())
    }
}

//----------------------------------------------------------------------------
// Archive parsing
//----------------------------------------------------------------------------

/// Recognizes a sync run followed by the header start marker,
/// returning the length of the run.
fn sync_run(input: &[u8]) -> IResult<&[u8], usize> {
    let (i, run) = take_while(|b| b == SYNC_BYTE)(input)?;
    if run.len() < MIN_SYNC_RUN {
        return Err(nom::Err::Error(Error::new(input, ErrorKind::TakeWhileMN)));
    }
    let (i, _) = tag(&[HEADER_START_BYTE][..])(i)?;
    Ok((i, run.len()))
}

/// Parses one archived file: sync run, header, name and payload.
pub fn archive_file(input: &[u8]) -> IResult<&[u8], TapeFile> {
    let (i, _run) = sync_run(input)?;
    let (i, header) = take(9usize)(i)?;
    let (i, name) = take_while_m_n(0, NAME_MAX, |b| b != 0)(i)?;
    let (i, _) = tag(&[0u8][..])(i)?;

    let mut file = TapeFile::default();
    file.header.copy_from_slice(header);
    file.apply_header();
    file.name[..name.len()].copy_from_slice(name);

    let (i, payload) = take(file.len as usize)(i)?;
    file.payload = payload.to_vec();
    Ok((i, file))
}

/// Iterates the files of a `.tap` archive, skipping any bytes that do
/// not parse as a file.
#[derive(Clone, Debug)]
pub struct TapArchiveIter<'a> {
    data: &'a [u8],
}

impl<'a> From<&'a [u8]> for TapArchiveIter<'a> {
    fn from(data: &'a [u8]) -> Self {
        TapArchiveIter { data }
    }
}

impl<'a> Iterator for TapArchiveIter<'a> {
    type Item = TapeFile;

    fn next(&mut self) -> Option<TapeFile> {
        while !self.data.is_empty() {
            match archive_file(self.data) {
                Ok((rest, file)) => {
                    self.data = rest;
                    return Some(file);
                }
                Err(_) => {
                    self.data = &self.data[1..];
                }
            }
        }
        None
    }
}

/// A queue of finished files, drained by the decoding front-end.
pub(crate) type FileQueue = VecDeque<TapeFile>;

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::SmallVec;

    fn sample_archive() -> Vec<u8> {
        let mut bytes: SmallVec<[u8; 64]> = SmallVec::new();
        bytes.extend_from_slice(&[0x16, 0x16, 0x16, 0x16, 0x24]);
        // BASIC, autorun off, end 0x0002, start 0x0000 -> len 3
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(b"HELLO\0");
        bytes.extend_from_slice(&[0x11, 0x22, 0x33]);
        bytes.to_vec()
    }

    #[test]
    fn archive_file_parses() {
        let bytes = sample_archive();
        let (rest, file) = archive_file(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!("HELLO", file.name_str());
        assert_eq!(0, file.start_addr);
        assert_eq!(2, file.end_addr);
        assert_eq!(3, file.len);
        assert!(file.basic);
        assert!(!file.autorun);
        assert_eq!(vec![0x11, 0x22, 0x33], file.payload);
        assert_eq!("Basic: \"HELLO\" 0000-0002", format!("{}", file));
    }

    #[test]
    fn derive_len_wraps() {
        assert_eq!(1, derive_len(0, 0));
        assert_eq!(65536, derive_len(0x0001, 0x0000));
        assert_eq!(10, derive_len(0x0500, 0x0509));
    }

    #[test]
    fn short_sync_run_is_rejected() {
        let mut bytes = sample_archive();
        bytes.drain(0..2); // only two 0x16 left
        assert!(archive_file(&bytes).is_err());
    }

    #[test]
    fn iter_walks_concatenated_archives_and_skips_junk() {
        let mut bytes = vec![0xde, 0xad]; // leading junk
        bytes.extend_from_slice(&sample_archive());
        bytes.extend_from_slice(&sample_archive());
        let files: Vec<_> = TapArchiveIter::from(&bytes[..]).collect();
        assert_eq!(2, files.len());
        assert_eq!("HELLO", files[0].name_str());
        assert_eq!("HELLO", files[1].name_str());
    }

    #[test]
    fn archive_round_trip() {
        let bytes = sample_archive();
        let (_, file) = archive_file(&bytes).unwrap();
        let out = file.to_archive_bytes();
        let (_, again) = archive_file(&out).unwrap();
        assert_eq!(file.name_str(), again.name_str());
        assert_eq!(file.payload, again.payload);
        assert_eq!(file.start_addr, again.start_addr);
        assert_eq!(file.end_addr, again.end_addr);
        assert_eq!(file.basic, again.basic);
    }
}
