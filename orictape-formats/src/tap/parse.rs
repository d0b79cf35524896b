/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Parser assembling a decoded byte stream into [TapeFile]s.
//!
//! The parser scouts for the file structure in one state machine
//! (sync run, header, name) while an independent payload reader runs
//! concurrently once a name terminates, so the next file's sync run can
//! overlap a still-filling payload. Finished files are queued and
//! drained with [TapeParser::take_file].
use arrayvec::ArrayVec;
use log::{debug, info, warn};

use orictape_core::frame::{DecodedByte, FAST_CYCLES_PER_BYTE, SLOW_CYCLES_PER_BYTE};

use super::{
    FileQueue, TapeFile, FILE_TYPE_BASIC, FILE_TYPE_DATA, HEADER_START_BYTE, MIN_SYNC_RUN,
    SYNC_BYTE, TRUNCATION_PAD,
};

/// Formats a time coordinate as `MM:SS.CC`.
pub fn format_time(time: f64) -> String {
    // The first byte might protrude a bit to the left of zero;
    // suppress negative numbers that would print strangely.
    let mut cent = (100.0 * time).floor() as i64;
    if cent < 0 {
        cent = 0;
    }
    let mut secs = cent / 100;
    cent %= 100;
    let mins = secs / 60;
    secs %= 60;
    format!("{:02}:{:02}.{:02}", mins, secs, cent)
}

/// Section the scouting state machine is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    /// Waiting for a sync run.
    Sync,
    /// Collecting the 9 header bytes.
    Header,
    /// Collecting the NUL terminated name.
    Name,
}

/// Decodes a byte stream into files.
pub struct TapeParser {
    // Scouting state machine
    section: Section,
    section_offs: usize,
    slow: bool,
    consecutive_non_sync: u32,
    consecutive_bad_bytes: u32,
    scout: TapeFile,

    // Concurrent payload reader
    payload_active: bool,
    payload_offs: usize,
    payload_file: TapeFile,

    verbose: bool,

    // Hex dump trace
    printbuf: ArrayVec<DecodedByte, 16>,
    printbuf_payload: bool,
    printbuf_section: Section,
    printbuf_addr: u16,

    last_time: f64,
    files: FileQueue,
}

impl TapeParser {
    pub fn new(verbose: bool) -> Self {
        TapeParser {
            section: Section::Sync,
            section_offs: 0,
            slow: false,
            // assume we saw some bad bytes
            consecutive_non_sync: 100,
            consecutive_bad_bytes: 100,
            scout: TapeFile::default(),
            payload_active: false,
            payload_offs: 0,
            payload_file: TapeFile::default(),
            verbose,
            printbuf: ArrayVec::new(),
            printbuf_payload: false,
            printbuf_section: Section::Sync,
            printbuf_addr: 0,
            last_time: 0.0,
            files: FileQueue::new(),
        }
    }

    fn reset(&mut self) {
        self.section = Section::Sync;
        self.section_offs = 0;
        self.slow = false;
        self.consecutive_non_sync = 100;
        self.consecutive_bad_bytes = 100;
        self.payload_active = false;
        self.payload_offs = 0;
        self.scout = TapeFile::default();
        self.payload_file = TapeFile::default();
    }

    /// Returns `true` when the parser is in the initial state, looking
    /// for sync with no payload in flight.
    pub fn is_idle(&self) -> bool {
        self.section == Section::Sync && !self.payload_active
    }

    /// Time coordinate of the last processed byte.
    pub fn last_time(&self) -> f64 {
        self.last_time
    }

    /// Pops the next finished file, if any.
    pub fn take_file(&mut self) -> Option<TapeFile> {
        self.files.pop_front()
    }

    /// Flushes the hex dump trace line. The format mimics `hexdump -C`
    /// with a section or payload address column.
    fn print_flush(&mut self) {
        if self.printbuf.is_empty() {
            return;
        }
        let abuf = if self.printbuf_payload {
            format!("{:04x} ", self.printbuf_addr)
        } else {
            match self.printbuf_section {
                Section::Header => "Hdr  ".to_string(),
                Section::Name => "Name ".to_string(),
                Section::Sync => "Sync ".to_string(),
            }
        };

        let mut hbuf = String::with_capacity(3 * 16);
        for i in 0..16 {
            if let Some(b) = self.printbuf.get(i) {
                let c = if b.sync_error {
                    '!'
                } else if b.parity_error {
                    '?'
                } else {
                    ' '
                };
                hbuf.push_str(&format!("{:02x}{}", b.byte, c));
            } else {
                hbuf.push_str("   ");
            }
        }

        let tbuf: String = (0..16)
            .map(|i| match self.printbuf.get(i) {
                Some(b) if b.byte.is_ascii_graphic() || b.byte == b' ' => b.byte as char,
                Some(_) => '.',
                None => ' ',
            })
            .collect();

        debug!(
            "{}  {} {} |{}|",
            format_time(self.printbuf[0].time),
            abuf,
            hbuf,
            tbuf
        );
        self.printbuf.clear();
    }

    /// Records a byte for the hex dump trace.
    fn print_byte(&mut self, b: &DecodedByte) {
        // Flush when the section type changes
        if !self.printbuf.is_empty()
            && (self.printbuf_payload != self.payload_active
                || self.printbuf_section != self.section)
        {
            self.print_flush();
        }

        self.printbuf_payload = self.payload_active;
        self.printbuf_section = self.section;
        if self.printbuf.is_empty() {
            self.printbuf_addr = self
                .payload_file
                .start_addr
                .wrapping_add(self.payload_offs as u16);
        }

        self.printbuf.push(*b);
        if self.printbuf.is_full()
            || (self.printbuf_payload
                && (self.printbuf_addr & 15) as usize + self.printbuf.len() == 16)
        {
            self.print_flush();
        }
    }

    /// Main entry point: processes one decoded byte.
    pub fn put_byte(&mut self, b: &DecodedByte) {
        if self.slow != b.slow {
            if !self.is_idle() {
                self.flush(); // truncate the ongoing file
            }
            self.slow = b.slow;
        }

        if self.verbose {
            self.print_byte(b);
        } else {
            self.print_flush();
        }

        // Extend the file end time past this byte, with half a byte of margin
        let t_byte = if b.slow {
            SLOW_CYCLES_PER_BYTE as f64 / 4800.0
        } else {
            FAST_CYCLES_PER_BYTE as f64 / 4800.0
        };
        self.scout.end_time = b.time + 1.5 * t_byte;
        self.payload_file.end_time = self.scout.end_time;

        if self.payload_active {
            self.payload_file.payload.push(b.byte);
            self.payload_offs += 1;

            // Count errors in mutually exclusive categories (max 1 per byte)
            self.payload_file.sync_errors += b.sync_error as i32;
            self.payload_file.parity_errors += (b.parity_error && !b.sync_error) as i32;

            if self.payload_offs == self.payload_file.len as usize {
                self.print_flush();
                info!(
                    "{}  File finished, {} sync errors, {} parity errors",
                    format_time(self.payload_file.end_time),
                    self.payload_file.sync_errors,
                    self.payload_file.parity_errors
                );
                self.files.push_back(core::mem::take(&mut self.payload_file));
                self.payload_active = false;
            }
        }

        if b.byte != SYNC_BYTE {
            self.consecutive_non_sync += 1;
        } else {
            self.consecutive_non_sync = 0;
        }
        if b.sync_error || b.parity_error {
            self.consecutive_bad_bytes += 1;
        } else {
            self.consecutive_bad_bytes = 0;
        }

        match self.section {
            Section::Sync => self.scan_sync(b),
            Section::Header => self.scan_header(b),
            Section::Name => self.scan_name(b),
        }

        self.last_time = b.time;
    }

    // The Oric, when writing, emits 16,16,16,24 but accepts 16,16,16,A,24
    // where A is any random sequence when reading. We try to balance
    // missed against phantom files by accepting any A free of 8 non-sync
    // bytes in a row with sync/parity errors in all of the last 4. When
    // an old file is still in progress we are stricter.
    fn scan_sync(&mut self, b: &DecodedByte) {
        if self.section_offs == 0 {
            self.scout.start_time = b.time;
        }
        if b.byte == SYNC_BYTE {
            self.section_offs += 1;
        } else if b.byte == HEADER_START_BYTE && self.section_offs >= MIN_SYNC_RUN {
            self.print_flush();
            info!(
                "{}  Found sync, {} leading bytes",
                format_time(b.time),
                self.section_offs
            );
            self.section = Section::Header;
            self.section_offs = 0;
            self.scout.sync_errors = 0;
            self.scout.parity_errors = 0;
        } else if self.section_offs >= MIN_SYNC_RUN
            && !self.payload_active
            && (self.consecutive_non_sync < 8 || self.consecutive_bad_bytes < 4)
        {
            // Within tolerance - accept some funny bytes before giving up
            self.section_offs += 1;
        } else {
            // Reset the sync search
            self.section_offs = 0;
        }
    }

    fn scan_header(&mut self, b: &DecodedByte) {
        self.scout.header[self.section_offs] = b.byte;
        self.section_offs += 1;

        // Count errors in mutually exclusive categories (max 1 per byte)
        self.scout.sync_errors += b.sync_error as i32;
        self.scout.parity_errors += (b.parity_error && !b.sync_error) as i32;

        if self.section_offs == self.scout.header.len() {
            let filetype = self.scout.header[2];
            if filetype == FILE_TYPE_BASIC || filetype == FILE_TYPE_DATA {
                self.section = Section::Name;
                self.section_offs = 0;
            } else {
                self.print_flush();
                if self.scout.sync_errors != 0 || self.scout.parity_errors != 0 {
                    // Suspect decoding quality rather than an exotic file type
                    warn!(
                        "Corrupted header, ignoring file at {}",
                        format_time(self.scout.start_time)
                    );
                } else {
                    warn!(
                        "Unsupported header, ignoring file at {}",
                        format_time(self.scout.start_time)
                    );
                }
                self.section = Section::Sync;
                self.section_offs = 0;
            }
        }
    }

    fn scan_name(&mut self, b: &DecodedByte) {
        self.scout.name[self.section_offs] = b.byte;
        self.section_offs += 1;

        // Count errors in mutually exclusive categories (max 1 per byte)
        self.scout.sync_errors += b.sync_error as i32;
        self.scout.parity_errors += (b.parity_error && !b.sync_error) as i32;

        if b.byte == 0 {
            self.scout.apply_header();
            self.scout.slow = b.slow;

            // Interrupt the previous file, if any; the new file takes priority
            self.flush_payload();

            self.print_flush();
            info!("{}  Found {}", format_time(b.time), self.scout.name_str());

            // Spawn two parallel activities: parse the payload, and
            // scan for sync again.
            self.payload_active = true;
            self.payload_offs = 0;
            self.payload_file = self.scout.clone();
            self.payload_file
                .payload
                .reserve(self.payload_file.len as usize);
            self.section = Section::Sync;
            self.section_offs = 0;
        } else if self.section_offs == self.scout.name.len() {
            self.print_flush();
            if self.scout.sync_errors != 0 || self.scout.parity_errors != 0 {
                warn!(
                    "Corrupted file name, ignoring file at {}",
                    format_time(self.scout.start_time)
                );
            } else {
                warn!(
                    "Too long file name, ignoring file at {}",
                    format_time(self.scout.start_time)
                );
            }
            self.section = Section::Sync;
            self.section_offs = 0;
        }
    }

    /// Truncates and outputs the file in payload processing, if any.
    fn flush_payload(&mut self) {
        if self.payload_active {
            let missing_bytes = self.payload_file.len as usize - self.payload_offs;
            warn!("File truncated with {} missing bytes", missing_bytes);

            // Pad the file to its expected length
            for _ in 0..missing_bytes {
                self.payload_file.payload.push(TRUNCATION_PAD);
                self.payload_file.sync_errors += 1;
                self.payload_file.parity_errors += 1;
            }
            self.payload_offs = self.payload_file.len as usize;
            info!(
                "{}  File truncated, {} sync errors, {} parity errors",
                format_time(self.payload_file.end_time),
                self.payload_file.sync_errors,
                self.payload_file.parity_errors
            );
            self.files.push_back(core::mem::take(&mut self.payload_file));
            self.payload_active = false;
        }
    }

    /// Finishes parsing; call at the end of the tape.
    pub fn flush(&mut self) {
        self.print_flush();
        self.flush_payload();
        let files = core::mem::take(&mut self.files);
        self.reset();
        self.files = files;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte(b: u8) -> DecodedByte {
        DecodedByte {
            time: 0.0,
            slow: true,
            byte: b,
            parity_error: false,
            sync_error: false,
        }
    }

    fn feed(parser: &mut TapeParser, bytes: &[u8]) {
        let mut t = parser.last_time();
        for &b in bytes {
            t += 209.0 / 4800.0;
            let mut d = byte(b);
            d.time = t;
            parser.put_byte(&d);
        }
    }

    /// 16 16 16 16 24, header, "A\0", payload [0x42]
    fn minimal_file_bytes() -> Vec<u8> {
        let mut v = vec![0x16, 0x16, 0x16, 0x16, 0x24];
        v.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0]);
        v.extend_from_slice(b"A\0");
        v.push(0x42);
        v
    }

    #[test]
    fn parses_a_minimal_file() {
        let mut parser = TapeParser::new(false);
        assert!(parser.is_idle());
        feed(&mut parser, &minimal_file_bytes());

        let file = parser.take_file().expect("one file");
        assert_eq!("A", file.name_str());
        assert_eq!(0, file.start_addr);
        assert_eq!(0, file.end_addr);
        assert_eq!(1, file.len);
        assert_eq!(vec![0x42], file.payload);
        assert!(file.basic);
        assert!(!file.autorun);
        assert!(file.slow);
        assert_eq!(0, file.sync_errors);
        assert_eq!(0, file.parity_errors);
        assert!(parser.is_idle());
        assert!(parser.take_file().is_none());
    }

    #[test]
    fn sync_needs_three_leaders() {
        let mut parser = TapeParser::new(false);
        let mut bytes = minimal_file_bytes();
        bytes.drain(0..2); // leaves 16 16 24 ...
        feed(&mut parser, &bytes);
        assert!(parser.take_file().is_none());
    }

    #[test]
    fn sync_tolerates_funny_bytes() {
        let mut parser = TapeParser::new(false);
        // three clean leaders, then noise, then the marker
        feed(&mut parser, &[0x16, 0x16, 0x16, 0x33, 0x44, 0x24]);
        assert!(!parser.is_idle(), "should be collecting the header");
    }

    #[test]
    fn sync_gives_up_after_noise_run() {
        let mut parser = TapeParser::new(false);
        let mut bytes = vec![0x16, 0x16, 0x16];
        bytes.extend_from_slice(&[0x33; 8]); // 8 consecutive non-sync
        // Errors on all recent bytes exceed the tolerance
        let mut t = 0.0;
        for (i, &b) in bytes.iter().enumerate() {
            t += 1.0 / 30.0;
            let mut d = byte(b);
            d.time = t;
            d.parity_error = i >= 3;
            parser.put_byte(&d);
        }
        let mut d = byte(0x24);
        d.time = t + 1.0 / 30.0;
        d.parity_error = true;
        parser.put_byte(&d);
        assert!(parser.is_idle(), "sync search should have reset");
    }

    #[test]
    fn unsupported_header_type_is_skipped() {
        let mut parser = TapeParser::new(false);
        let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
        bytes.extend_from_slice(&[0, 0, 0x40, 0, 0, 0, 0, 0, 0]); // ARRAY type
        feed(&mut parser, &bytes);
        assert!(parser.is_idle());
        assert!(parser.take_file().is_none());
    }

    #[test]
    fn truncated_file_is_padded_on_flush() {
        let mut parser = TapeParser::new(false);
        let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
        // end 0x0009, start 0x0000 -> len 10
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0x09, 0, 0, 0]);
        bytes.extend_from_slice(b"TRUNC\0");
        bytes.extend_from_slice(&[1, 2, 3, 4, 5]); // 5 of 10 payload bytes
        feed(&mut parser, &bytes);
        assert!(parser.take_file().is_none(), "file is still in flight");

        parser.flush();
        let file = parser.take_file().expect("truncated file");
        assert_eq!(10, file.len);
        assert_eq!(10, file.payload.len());
        assert_eq!(&[1, 2, 3, 4, 5], &file.payload[..5]);
        assert!(file.payload[5..].iter().all(|&b| b == TRUNCATION_PAD));
        assert!(file.sync_errors >= 5);
        assert!(file.parity_errors >= 5);
    }

    #[test]
    fn new_file_truncates_the_previous_payload() {
        let mut parser = TapeParser::new(false);
        let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0x09, 0, 0, 0]); // len 10
        bytes.extend_from_slice(b"ONE\0");
        bytes.extend_from_slice(&[1, 2, 3]); // partial payload
        // A second file interrupts while the first payload is open
        bytes.extend_from_slice(&minimal_file_bytes());
        feed(&mut parser, &bytes);

        let first = parser.take_file().expect("truncated first file");
        assert_eq!("ONE", first.name_str());
        assert_eq!(10, first.payload.len());
        assert!(first.sync_errors > 0);

        let second = parser.take_file().expect("second file");
        assert_eq!("A", second.name_str());
        assert_eq!(0, second.sync_errors);
    }

    #[test]
    fn mode_switch_flushes_open_file() {
        let mut parser = TapeParser::new(false);
        let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0x04, 0, 0, 0]); // len 5
        bytes.extend_from_slice(b"SLOW\0");
        bytes.extend_from_slice(&[9, 9]);
        feed(&mut parser, &bytes);
        assert!(!parser.is_idle());

        // A fast byte arrives mid-payload
        let mut d = byte(0x16);
        d.slow = false;
        d.time = parser.last_time() + 0.1;
        parser.put_byte(&d);

        let file = parser.take_file().expect("flushed file");
        assert_eq!("SLOW", file.name_str());
        assert_eq!(5, file.payload.len());
        assert!(file.sync_errors >= 3);
    }

    #[test]
    fn time_formatting() {
        assert_eq!("00:00.00", format_time(-0.5));
        assert_eq!("00:01.50", format_time(1.5));
        assert_eq!("02:05.25", format_time(125.25));
    }
}
