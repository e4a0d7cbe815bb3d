//! LEB128-style varints as used throughout FST. Unsigned varints are plain
//! little-endian base-128; signed varints are sign-extended from bit 6 of
//! the last byte.

use std::{io, slice};

/// Maximum encoded size of a 64-bit varint (7 bits per byte).
pub const MAX_VARINT_BYTES: usize = 10;

/// Decode an unsigned varint. Returns None if it overflows a u64 or the
/// input ends before the final byte.
pub fn decode_varint(input: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for byte in input {
        if shift >= 64 {
            return None;
        }
        // The unused high bits of the 10th byte are ignored.
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

/// Decode a signed varint. Returns None if it overflows an i64 or the
/// input ends before the final byte.
pub fn decode_svarint(input: &[u8]) -> Option<i64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for byte in input {
        if shift >= 64 {
            return None;
        }
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            if byte & 0x40 != 0 && shift + 7 < 64 {
                value |= u64::MAX << (shift + 7);
            }
            return Some(value as i64);
        }
        shift += 7;
    }
    None
}

/// Encode an unsigned varint and return the number of bytes written. The
/// output must have room for `MAX_VARINT_BYTES`.
pub fn encode_varint(output: &mut [u8], mut value: u64) -> usize {
    for i in 0..MAX_VARINT_BYTES {
        let mut bits = value as u8 & 0x7F;
        value >>= 7;
        let more = value != 0;
        if more {
            bits |= 0x80;
        }
        output[i] = bits;
        if !more {
            return i + 1;
        }
    }
    MAX_VARINT_BYTES
}

/// Encode a signed varint and return the number of bytes written. The
/// output must have room for `MAX_VARINT_BYTES`.
pub fn encode_svarint(output: &mut [u8], mut value: i64) -> usize {
    for i in 0..MAX_VARINT_BYTES {
        let mut bits = value as u8 & 0x7F;
        value >>= 7;
        // Stop once only sign bits remain and bit 6 of this byte already
        // carries the sign.
        let more = (value != 0 && value != -1) || ((value as u8) & 0x40) != (bits & 0x40);
        if more {
            bits |= 0x80;
        }
        output[i] = bits;
        if !more {
            return i + 1;
        }
    }
    MAX_VARINT_BYTES
}

pub trait VarintReader {
    fn read_varint(&mut self) -> io::Result<u64>;
    fn read_svarint(&mut self) -> io::Result<i64>;
}

impl<R> VarintReader for R
where
    R: io::Read,
{
    fn read_varint(&mut self) -> io::Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let mut byte = 0;
            self.read_exact(slice::from_mut(&mut byte))?;

            if shift >= 64 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"));
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_svarint(&mut self) -> io::Result<i64> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let mut byte = 0;
            self.read_exact(slice::from_mut(&mut byte))?;

            if shift >= 64 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "svarint overflow"));
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                if byte & 0x40 != 0 && shift + 7 < 64 {
                    value |= u64::MAX << (shift + 7);
                }
                return Ok(value as i64);
            }
            shift += 7;
        }
    }
}

/// Encoded length of an unsigned varint in bytes.
pub fn varint_length(mut value: u64) -> u8 {
    for x in 1..MAX_VARINT_BYTES as u8 {
        value >>= 7;
        if value == 0 {
            return x;
        }
    }
    MAX_VARINT_BYTES as u8
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_boundary_values() {
        let values = [0, 1, 0x7F, 0x80, 0x3FFF, 0x4000, u32::MAX as u64, u64::MAX];
        for value in values {
            let mut output = [0; MAX_VARINT_BYTES];
            let length = encode_varint(&mut output, value);
            assert_eq!(length, varint_length(value) as usize, "{value:#x}");
            assert_eq!(decode_varint(&output[..length]), Some(value));
            assert_eq!(Cursor::new(&output[..length]).read_varint().unwrap(), value);
        }

        let values = [0, 1, -1, 63, 64, -64, -65, i64::MIN, i64::MAX];
        for value in values {
            let mut output = [0; MAX_VARINT_BYTES];
            let length = encode_svarint(&mut output, value);
            assert_eq!(decode_svarint(&output[..length]), Some(value), "{value}");
            assert_eq!(Cursor::new(&output[..length]).read_svarint().unwrap(), value);
        }
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(decode_varint(&[0x80, 0x80]), None);
        assert_eq!(decode_svarint(&[]), None);
        let err = Cursor::new([0xFFu8]).read_varint().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_overflow() {
        let bytes = [0xFF; 11];
        assert_eq!(decode_varint(&bytes), None);
        let err = Cursor::new(bytes).read_varint().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    /// Worked examples from the FST block layout notes.
    #[test]
    fn test_manual_examples() {
        let mut output: Vec<u8> = vec![0; 10];
        assert_eq!(encode_varint(&mut output, 3141), 2);
        assert_eq!(output, [0xC5, 0x18, 0, 0, 0, 0, 0, 0, 0, 0]);

        let mut output: Vec<u8> = vec![0; 10];
        assert_eq!(encode_svarint(&mut output, -15429), 3);
        assert_eq!(output, [0xBB, 0x87, 0x7F, 0, 0, 0, 0, 0, 0, 0]);
    }
}
