//! Decoding of single values from frames and wave data. Values are produced
//! as ASCII: one character per bit (`0`, `1`, `x`, `z`, ...) for bit
//! vectors and a decimal rendering for reals.

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::{
    fst::{ReadArray, RealEndianness, VarLength},
    varint::VarintReader,
};

/// 1-bit states that aren't 0 or 1, indexed by bits 1-3 of the varint.
const NON_BINARY_STATES: &[u8; 8] = b"xzhuwl-?";

/// Number of bytes a var occupies in a frame.
pub fn frame_size(length: VarLength) -> usize {
    match length {
        VarLength::Bits(bits) => bits as usize,
        VarLength::Real => 8,
    }
}

/// Append the frame value `raw` (exactly `frame_size(length)` bytes) to `out`.
pub fn push_frame_value(
    raw: &[u8],
    length: VarLength,
    endianness: RealEndianness,
    out: &mut Vec<u8>,
) -> Result<()> {
    match length {
        VarLength::Bits(_) => out.extend_from_slice(raw),
        VarLength::Real => {
            let bytes: [u8; 8] = raw.try_into().context("Real frame value must be 8 bytes")?;
            push_real(bytes, endianness, out)?;
        }
    }
    Ok(())
}

/// Read one entry from a var's wave data, append its value to `out` and
/// return the time index delta from the previous entry.
pub fn read_wave_value(
    reader: &mut impl BufRead,
    length: VarLength,
    endianness: RealEndianness,
    out: &mut Vec<u8>,
) -> Result<u64> {
    Ok(match length {
        VarLength::Bits(0) => bail!("Zero width vars have no wave data"),
        VarLength::Bits(1) => {
            // The value and time index delta share a single varint.
            let varint = reader.read_varint()?;
            if varint & 0b1 == 0 {
                out.push(b'0' + ((varint >> 1) & 1) as u8);
                varint >> 2
            } else {
                out.push(NON_BINARY_STATES[((varint >> 1) & 0b111) as usize]);
                varint >> 4
            }
        }
        VarLength::Bits(bits) => {
            let time_index_delta_and_is_ascii = reader.read_varint()?;
            if time_index_delta_and_is_ascii & 1 == 0 {
                push_packed_bits(reader, bits, out)?;
            } else {
                let ascii = reader.read_tinyvec::<64>(bits as usize)?;
                out.extend_from_slice(&ascii);
            }
            time_index_delta_and_is_ascii >> 1
        }
        VarLength::Real => {
            let time_index_delta_and_flag = reader.read_varint()?;
            if time_index_delta_and_flag & 1 != 0 {
                bail!("Real values stored as text are not supported");
            }
            let bytes = reader.read_array::<8>()?;
            push_real(bytes, endianness, out)?;
            time_index_delta_and_flag >> 1
        }
    })
}

/// Binary values are packed MSB first, padded to a whole number of bytes.
fn push_packed_bits(reader: &mut impl BufRead, bits: u32, out: &mut Vec<u8>) -> Result<()> {
    let bits = bits as usize;
    let packed = reader.read_tinyvec::<16>((bits + 7) / 8)?;
    out.reserve(bits);
    for i in 0..bits {
        let bit = (packed[i / 8] >> (7 - i % 8)) & 1;
        out.push(b'0' + bit);
    }
    Ok(())
}

fn push_real(bytes: [u8; 8], endianness: RealEndianness, out: &mut Vec<u8>) -> Result<()> {
    let value = match endianness {
        RealEndianness::Little => LittleEndian::read_f64(&bytes),
        RealEndianness::Big => BigEndian::read_f64(&bytes),
    };
    write!(out, "{value}")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn decode(data: &[u8], length: VarLength) -> Vec<(u64, String)> {
        let mut cursor = Cursor::new(data);
        let mut result = Vec::new();
        while (cursor.position() as usize) < data.len() {
            let mut out = Vec::new();
            let delta =
                read_wave_value(&mut cursor, length, RealEndianness::Little, &mut out).unwrap();
            result.push((delta, String::from_utf8(out).unwrap()));
        }
        result
    }

    #[test]
    fn test_single_bit_states() {
        // 1 at delta 0, 0 at delta 3, z at delta 2, '-' at delta 1.
        let data = [0b10, 3 << 2, (2 << 4) | (1 << 1) | 1, (1 << 4) | (6 << 1) | 1];
        assert_eq!(
            decode(&data, VarLength::Bits(1)),
            [
                (0, "1".to_string()),
                (3, "0".to_string()),
                (2, "z".to_string()),
                (1, "-".to_string()),
            ]
        );
    }

    #[test]
    fn test_packed_and_ascii_vectors() {
        // 10 bits packed MSB first: 1011001110 -> 0b10110011, 0b10_000000.
        let data = [5 << 1, 0b1011_0011, 0b1000_0000, (1 << 1) | 1, b'x', b'1', b'0', b'z'];
        let entries = decode(&data[..3], VarLength::Bits(10));
        assert_eq!(entries, [(5, "1011001110".to_string())]);

        let entries = decode(&data[3..], VarLength::Bits(4));
        assert_eq!(entries, [(1, "x10z".to_string())]);
    }

    #[test]
    fn test_reals() {
        let mut data = vec![2 << 1];
        data.extend_from_slice(&1.5f64.to_le_bytes());
        assert_eq!(decode(&data, VarLength::Real), [(2, "1.5".to_string())]);

        let mut out = Vec::new();
        push_frame_value(&(-0.25f64).to_be_bytes(), VarLength::Real, RealEndianness::Big, &mut out)
            .unwrap();
        assert_eq!(out, b"-0.25");
    }

    #[test]
    fn test_truncated_entry() {
        let mut cursor = Cursor::new(&[0u8, 0xFF][..]);
        let mut out = Vec::new();
        assert!(read_wave_value(&mut cursor, VarLength::Bits(16), RealEndianness::Little, &mut out)
            .is_err());
    }
}
