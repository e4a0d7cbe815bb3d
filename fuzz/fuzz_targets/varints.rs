#![no_main]

use libfuzzer_sys::fuzz_target;
use wavepeek_fst::varint::{decode_svarint, decode_varint, encode_svarint, encode_varint};

fuzz_target!(|value: u64| {
    let mut output = [0; 10];
    let length = encode_varint(&mut output, value);
    assert_eq!(decode_varint(&output[..length]), Some(value));

    let length = encode_svarint(&mut output, value as i64);
    assert_eq!(decode_svarint(&output[..length]), Some(value as i64));
});
