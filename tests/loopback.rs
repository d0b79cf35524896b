/*
    Copyright (C) 2023-2024  the ORICTAPE developers

    This file is part of ORICTAPE, a Rust library for recovering data
    from Oric home-computer cassette tapes.

    For the full copyright notice, see the lib.rs file.
*/
//! Encode/decode loopback tests across both tape formats and all
//! decoder backends, driven entirely in memory.
use orictape::frame::DecodedByte;
use orictape::{DecoderOptions, Sound, TapeDecoder, TapeEncoder};

const TESTVECTOR: [u8; 8] = [0x16, 0x16, 0x16, 0x24, 0x00, 0x55, 0xaa, 0xff];

fn encode_bytes(bytes: &[u8], slow: bool) -> Sound {
    let mut enc = TapeEncoder::new(slow);
    for &b in bytes {
        enc.put_byte(b);
    }
    enc.into_sound()
}

fn decode_all(sound: Sound, options: DecoderOptions) -> Vec<DecodedByte> {
    let mut dec = TapeDecoder::from_sound(sound, options);
    let mut bytes = Vec::new();
    while let Some(b) = dec.read_byte() {
        bytes.push(b);
    }
    bytes
}

fn loopback(slow: bool, dual: bool) {
    let sound = encode_bytes(&TESTVECTOR, slow);

    let mut options = DecoderOptions::default();
    options.dual = dual;
    options.fast = !slow;
    options.slow = slow;
    let bytes = decode_all(sound, options);

    assert!(
        bytes.len() >= TESTVECTOR.len(),
        "decoded too few bytes ({} of {})",
        bytes.len(),
        TESTVECTOR.len()
    );
    // Trailing silence may contribute a few stray error bytes once a
    // header is in flight, but not many
    assert!(
        bytes.len() <= TESTVECTOR.len() + 50,
        "decoded too many bytes ({})",
        bytes.len()
    );

    for (i, b) in bytes.iter().take(TESTVECTOR.len()).enumerate() {
        assert_eq!(
            TESTVECTOR[i], b.byte,
            "byte {} differs: {:02x} vs {:02x}",
            i, b.byte, TESTVECTOR[i]
        );
        assert!(!b.sync_error, "sync error in byte {}", i);
        assert!(!b.parity_error, "parity error in byte {}", i);
        assert_eq!(slow, b.slow, "wrong format flag in byte {}", i);
    }

    // Time must never step backwards
    for pair in bytes.windows(2) {
        assert!(pair[0].time <= pair[1].time);
    }
}

#[test]
fn fast_loopback() {
    loopback(false, false);
}

#[test]
fn slow_loopback() {
    loopback(true, false);
}

#[test]
fn fast_dual_loopback() {
    loopback(false, true);
}

#[test]
fn slow_dual_loopback() {
    loopback(true, true);
}

#[test]
fn empty_tape_produces_nothing() {
    let sound = Sound::silence(10 * 44100, 44100);
    let options = DecoderOptions::default();
    let mut dec = TapeDecoder::from_sound(sound.clone(), options.clone());
    assert!(dec.read_byte().is_none());

    let mut dec = TapeDecoder::from_sound(sound, options);
    assert!(dec.read_file().is_none());
}

/// Archive of one minimal file: BASIC "A", one payload byte 0x42.
fn minimal_archive() -> Vec<u8> {
    let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
    bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0]);
    bytes.extend_from_slice(b"A\0");
    bytes.push(0x42);
    bytes
}

#[test]
fn slow_file_structure() {
    let mut enc = TapeEncoder::new(true);
    enc.put_archive(&minimal_archive());
    let sound = enc.into_sound();

    let mut options = DecoderOptions::default();
    options.slow = true;
    let mut dec = TapeDecoder::from_sound(sound, options);

    let file = dec.read_file().expect("one file on the tape");
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
    assert!(file.end_time > file.start_time);

    assert!(dec.read_file().is_none(), "only one file on the tape");
}

#[test]
fn fast_file_structure() {
    let mut enc = TapeEncoder::new(false);
    enc.put_archive(&minimal_archive());
    let sound = enc.into_sound();

    let mut options = DecoderOptions::default();
    options.fast = true;
    let mut dec = TapeDecoder::from_sound(sound, options);

    let file = dec.read_file().expect("one file on the tape");
    assert_eq!("A", file.name_str());
    assert_eq!(1, file.len);
    assert_eq!(vec![0x42], file.payload);
    assert!(!file.slow);
    assert_eq!(0, file.sync_errors);
    assert_eq!(0, file.parity_errors);
}

#[test]
fn truncated_file_is_padded() {
    // Header claims len 10 but only 5 payload bytes are on the tape
    let mut bytes = vec![0x16, 0x16, 0x16, 0x24];
    bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0x09, 0, 0, 0]);
    bytes.extend_from_slice(b"TRUNC\0");
    bytes.extend_from_slice(&[1, 2, 3, 4, 5]);

    let mut enc = TapeEncoder::new(true);
    enc.put_archive(&bytes);
    let sound = enc.into_sound();

    let mut options = DecoderOptions::default();
    options.slow = true;
    let mut dec = TapeDecoder::from_sound(sound, options);

    let file = dec.read_file().expect("the truncated file");
    assert_eq!("TRUNC", file.name_str());
    assert_eq!(10, file.len);
    assert_eq!(10, file.payload.len());
    assert_eq!(&[1, 2, 3, 4, 5], &file.payload[..5]);
    assert!(file.payload[5..].iter().all(|&b| b == 0xcd));
    assert!(file.sync_errors >= 5);
    assert!(file.parity_errors >= 5);
}

#[test]
fn decode_is_stable_under_leading_silence() {
    let mut enc = TapeEncoder::new(true);
    enc.put_archive(&minimal_archive());
    let sound = enc.into_sound();

    let mut reference = vec![0.0f32; sound.length() as usize];
    assert!(sound.read(0, &mut reference));

    let mut options = DecoderOptions::default();
    options.slow = true;

    let baseline: Vec<u8> = decode_all(sound, options.clone())
        .iter()
        .map(|b| b.byte)
        .collect();
    assert!(!baseline.is_empty());

    // Shift the recording by an amount that is not a multiple of the
    // window hop; the decoded byte stream must not change
    for silence_seconds in [0.173f64, 0.611] {
        let pad = (silence_seconds * 44100.0) as usize;
        let mut shifted = vec![0.0f32; pad + reference.len()];
        shifted[pad..].copy_from_slice(&reference);
        let shifted = Sound::from_vec(shifted, 44100);

        let bytes: Vec<u8> = decode_all(shifted, options.clone())
            .iter()
            .map(|b| b.byte)
            .collect();
        assert_eq!(
            baseline, bytes,
            "byte stream changed under {}s of leading silence",
            silence_seconds
        );
    }
}

#[test]
fn fast_gap_is_padded_with_error_bytes() {
    // A fast file with a three-byte-time hole in the payload: the
    // decoder must pad the gap instead of displacing the rest.
    let payload: Vec<u8> = (0x40..0x54).collect(); // 20 bytes
    let mut head = vec![0x16; 99];
    head.push(0x24);
    head.extend_from_slice(&[0, 0, 0, 0, 0, 0x13, 0, 0, 0]); // len 20
    head.extend_from_slice(b"GAP\0");
    head.extend_from_slice(&payload[..10]);

    let mut enc = TapeEncoder::new(false);
    for &b in &head {
        enc.put_byte(b);
    }
    let first = enc.into_sound();

    let mut enc = TapeEncoder::new(false);
    for &b in &payload[10..] {
        enc.put_byte(b);
    }
    let second = enc.into_sound();

    let t_ref = 44100.0 / 4800.0;
    let gap = (3.0 * 32.0 * t_ref) as usize; // three nominal byte times

    let mut samples = vec![0.0f32; first.length() as usize];
    assert!(first.read(0, &mut samples));
    samples.resize(samples.len() + gap, 0.0);
    let mut tail = vec![0.0f32; second.length() as usize];
    assert!(second.read(0, &mut tail));
    samples.extend_from_slice(&tail);

    let mut options = DecoderOptions::default();
    options.fast = true;
    let mut dec = TapeDecoder::from_sound(Sound::from_vec(samples, 44100), options);

    let file = dec.read_file().expect("the gapped file");
    assert_eq!("GAP", file.name_str());
    assert_eq!(20, file.len);
    assert_eq!(20, file.payload.len());
    assert_eq!(&payload[..10], &file.payload[..10], "head of payload intact");
    assert!(
        file.sync_errors >= 1,
        "the gap must surface as sync errors, got {}",
        file.sync_errors
    );
}

#[test]
fn archive_passthrough_matches_waveform_decode() {
    let mut options = DecoderOptions::default();
    options.slow = true;
    let mut dec = TapeDecoder::from_archive_bytes(minimal_archive(), options);

    let file = dec.read_file().expect("file from the archive");
    assert_eq!("A", file.name_str());
    assert_eq!(1, file.len);
    assert_eq!(vec![0x42], file.payload);
    assert!(file.basic);
    assert_eq!(0, file.sync_errors + file.parity_errors);
}
