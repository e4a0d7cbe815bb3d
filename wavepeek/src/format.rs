//! Rendering of raw bit-string values as binary, hexadecimal or decimal text.

use std::{fmt, str::FromStr};

use num::{BigUint, Num};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueFormat {
    #[default]
    Bin,
    Hex,
    Dec,
}

impl FromStr for ValueFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bin" => Ok(Self::Bin),
            "hex" => Ok(Self::Hex),
            "dec" => Ok(Self::Dec),
            _ => Err(Error::Validation(format!(
                "Invalid format '{s}'. Must be 'bin', 'hex', or 'dec'."
            ))),
        }
    }
}

impl fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bin => "bin",
            Self::Hex => "hex",
            Self::Dec => "dec",
        })
    }
}

fn contains_unknown(raw: &str) -> bool {
    raw.bytes().any(|b| matches!(b, b'x' | b'X' | b'z' | b'Z'))
}

/// Render `raw` in `format`. Values that can't be shown as a number fall back
/// to the binary rendering and come with a warning.
pub fn format_value(raw: &str, format: ValueFormat) -> (String, Option<String>) {
    let binary = format!("b{raw}");
    if format == ValueFormat::Bin {
        return (binary, None);
    }

    if contains_unknown(raw) {
        let warning = format!("Value '{raw}' contains x/z states, falling back to binary format");
        return (binary, Some(warning));
    }

    // `from_str_radix` accepts `_` separators, which aren't valid here.
    let is_numeral = !raw.is_empty() && raw.bytes().all(|b| b == b'0' || b == b'1');
    let value = match is_numeral.then(|| BigUint::from_str_radix(raw, 2)) {
        Some(Ok(value)) => value,
        _ => {
            let warning =
                format!("Value '{raw}' could not be parsed as binary, falling back to binary format");
            return (binary, Some(warning));
        }
    };

    let rendered = match format {
        ValueFormat::Hex => format!("0x{}", value.to_str_radix(16).to_uppercase()),
        _ => value.to_str_radix(10),
    };
    (rendered, None)
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn formatted(raw: &str, format: ValueFormat) -> String {
        let (rendered, warning) = format_value(raw, format);
        assert_eq!(warning, None, "{raw} as {format}");
        rendered
    }

    #[test]
    fn test_numeric_formats() {
        assert_eq!(formatted("1010", ValueFormat::Hex), "0xA");
        assert_eq!(formatted("1010", ValueFormat::Dec), "10");
        assert_eq!(formatted("11111111", ValueFormat::Hex), "0xFF");
        assert_eq!(formatted("11111111", ValueFormat::Dec), "255");
        assert_eq!(formatted("0", ValueFormat::Hex), "0x0");
        assert_eq!(formatted("0000", ValueFormat::Dec), "0");
        assert_eq!(formatted("0", ValueFormat::Bin), "b0");
        assert_eq!(formatted("1x0z", ValueFormat::Bin), "b1x0z");
    }

    #[test]
    fn test_wide_values() {
        let raw = "1".repeat(100);
        assert_eq!(
            formatted(&raw, ValueFormat::Hex),
            format!("0xF{}", "F".repeat(24))
        );
        assert_eq!(
            formatted(&raw, ValueFormat::Dec),
            "1267650600228229401496703205375"
        );
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(
            format_value("1x0z", ValueFormat::Hex),
            (
                "b1x0z".to_string(),
                Some("Value '1x0z' contains x/z states, falling back to binary format".to_string())
            )
        );
        assert_eq!(
            format_value("Z", ValueFormat::Dec).1.unwrap(),
            "Value 'Z' contains x/z states, falling back to binary format"
        );
        assert_eq!(
            format_value("1.5", ValueFormat::Dec),
            (
                "b1.5".to_string(),
                Some(
                    "Value '1.5' could not be parsed as binary, falling back to binary format"
                        .to_string()
                )
            )
        );
        assert!(format_value("", ValueFormat::Hex).1.is_some());
        assert!(format_value("1_0", ValueFormat::Hex).1.is_some());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("HEX".parse::<ValueFormat>().unwrap(), ValueFormat::Hex);
        assert_eq!("Dec".parse::<ValueFormat>().unwrap(), ValueFormat::Dec);
        assert!(matches!(
            "oct".parse::<ValueFormat>(),
            Err(Error::Validation(_))
        ));
    }

    proptest! {
        #[test]
        fn hex_and_dec_agree(raw in "[01]{1,200}") {
            let (hex, _) = format_value(&raw, ValueFormat::Hex);
            let (dec, _) = format_value(&raw, ValueFormat::Dec);
            let from_hex = BigUint::from_str_radix(&hex[2..], 16).unwrap();
            let from_dec = BigUint::from_str_radix(&dec, 10).unwrap();
            prop_assert_eq!(from_hex, from_dec);
        }

        #[test]
        fn unknown_states_fall_back(raw in "[01]{0,8}[xXzZ][01xz]{0,8}") {
            let (rendered, warning) = format_value(&raw, ValueFormat::Hex);
            prop_assert_eq!(rendered, format!("b{raw}"));
            prop_assert!(warning.is_some());
        }
    }
}
