//! Conversions between floating point numbers and the bit patterns of the
//! IEEE 754 single and half precision formats and bfloat16.

use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatKind {
    #[default]
    Float32,
    Float16,
    /// The upper half of a float32.
    BFloat16,
}

impl FloatKind {
    pub fn bits(self) -> usize {
        match self {
            Self::Float32 => 32,
            Self::Float16 | Self::BFloat16 => 16,
        }
    }
}

impl FromStr for FloatKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float32" => Ok(Self::Float32),
            "float16" => Ok(Self::Float16),
            "bfloat16" => Ok(Self::BFloat16),
            _ => Err(Error::Validation(format!(
                "Invalid float_type '{s}'. Must be one of: float32, float16, bfloat16"
            ))),
        }
    }
}

impl fmt::Display for FloatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
        })
    }
}

/// Decode a hex bit pattern (`0x` / `x` prefix optional) as `kind`.
pub fn hex_to_float(hex: &str, kind: FloatKind) -> Result<f64> {
    let digits = strip_prefix(hex.trim(), &["0x", "0X", "x", "X"]);
    let bits = parse_digits(hex, digits, 16, kind)?;
    Ok(decode(bits, kind))
}

/// Decode a binary bit pattern (`0b` / `b` prefix optional) as `kind`.
pub fn bin_to_float(bin: &str, kind: FloatKind) -> Result<f64> {
    let digits = strip_prefix(bin.trim(), &["0b", "0B", "b", "B"]);
    let bits = parse_digits(bin, digits, 2, kind)?;
    Ok(decode(bits, kind))
}

/// Encode `value` as `kind` and render the bit pattern as `0x` followed by
/// zero padded uppercase hex.
pub fn float_to_hex(value: f64, kind: FloatKind) -> Result<String> {
    let bits = encode(value, kind)?;
    Ok(format!("0x{bits:0width$X}", width = kind.bits() / 4))
}

/// Encode `value` as `kind` and render the bit pattern as `b` followed by
/// zero padded binary.
pub fn float_to_bin(value: f64, kind: FloatKind) -> Result<String> {
    let bits = encode(value, kind)?;
    Ok(format!("b{bits:0width$b}", width = kind.bits()))
}

fn strip_prefix<'a>(s: &'a str, prefixes: &[&str]) -> &'a str {
    prefixes
        .iter()
        .find_map(|prefix| s.strip_prefix(*prefix))
        .unwrap_or(s)
}

fn parse_digits(input: &str, digits: &str, radix: u32, kind: FloatKind) -> Result<u32> {
    let max_digits = if radix == 16 {
        kind.bits() / 4
    } else {
        kind.bits()
    };
    let name = if radix == 16 { "hex" } else { "binary" };

    if digits.is_empty() {
        return Err(Error::Validation(format!("Empty {name} value '{input}'")));
    }
    if digits.len() > max_digits {
        return Err(Error::Validation(format!(
            "{name} value '{input}' has more than {max_digits} digits, too long for {kind}"
        )));
    }
    // `from_str_radix` would also accept a leading `+`.
    if !digits.chars().all(|c| c.is_digit(radix)) {
        return Err(Error::Validation(format!(
            "Invalid {name} digits in '{input}'"
        )));
    }
    u32::from_str_radix(digits, radix)
        .map_err(|e| Error::Validation(format!("Invalid {name} value '{input}': {e}")))
}

fn decode(bits: u32, kind: FloatKind) -> f64 {
    match kind {
        FloatKind::Float32 => f32::from_bits(bits) as f64,
        FloatKind::Float16 => f16_to_f64(bits as u16),
        FloatKind::BFloat16 => f32::from_bits(bits << 16) as f64,
    }
}

fn encode(value: f64, kind: FloatKind) -> Result<u32> {
    match kind {
        FloatKind::Float32 => f64_to_f32_bits(value),
        FloatKind::Float16 => f64_to_f16(value).map(u32::from),
        // Truncated rather than rounded.
        FloatKind::BFloat16 => f64_to_f32_bits(value).map(|bits| bits >> 16),
    }
}

fn f64_to_f32_bits(value: f64) -> Result<u32> {
    if value.is_nan() {
        let sign = if value.is_sign_negative() { 0x8000_0000 } else { 0 };
        return Ok(sign | 0x7FC0_0000);
    }
    let single = value as f32;
    if value.is_finite() && single.is_infinite() {
        return Err(Error::Overflow(format!(
            "{value} is out of range for float32 (largest finite value is {:e})",
            f32::MAX
        )));
    }
    Ok(single.to_bits())
}

/// Round `value` to the nearest half precision number, ties to even.
fn f64_to_f16(value: f64) -> Result<u16> {
    let bits = value.to_bits();
    let sign = ((bits >> 48) & 0x8000) as u16;

    if value.is_nan() {
        return Ok(sign | 0x7E00);
    }
    if value.is_infinite() {
        return Ok(sign | 0x7C00);
    }

    let biased_exponent = ((bits >> 52) & 0x7FF) as i64;
    if biased_exponent == 0 {
        // Zero, or an f64 subnormal which is far below the half range.
        return Ok(sign);
    }
    let exponent = biased_exponent - 1023;
    let significand = (bits & ((1 << 52) - 1)) | (1 << 52);

    // Half subnormals share the exponent of the smallest normal.
    let half_exponent = exponent.max(-14);
    let shift = 42 + (half_exponent - exponent);
    if shift >= 64 {
        return Ok(sign);
    }

    let mut quotient = significand >> shift;
    let remainder = significand & ((1 << shift) - 1);
    let halfway = 1u64 << (shift - 1);
    if remainder > halfway || (remainder == halfway && quotient & 1 == 1) {
        quotient += 1;
    }

    // `quotient` includes the implicit bit, so a carry out of the mantissa
    // bumps the exponent field.
    let magnitude = (((half_exponent + 14) as u64) << 10) + quotient;
    if magnitude >= 0x7C00 {
        return Err(Error::Overflow(format!(
            "{value} is out of range for float16 (largest finite value is 65504)"
        )));
    }
    Ok(sign | magnitude as u16)
}

fn f16_to_f64(bits: u16) -> f64 {
    let exponent = ((bits >> 10) & 0x1F) as i32;
    let mantissa = (bits & 0x3FF) as f64;
    let magnitude = match exponent {
        0 => mantissa * 2f64.powi(-24),
        0x1F if mantissa == 0.0 => f64::INFINITY,
        0x1F => f64::NAN,
        _ => (1024.0 + mantissa) * 2f64.powi(exponent - 25),
    };
    if bits & 0x8000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}
