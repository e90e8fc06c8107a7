//! Hex helpers for frame logging and the `rawhex` register format

use std::fmt::Write;

/// Encode bytes to uppercase hex string
/// Example: [0x12, 0x34, 0xAB] -> "1234AB"
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Space separated uppercase hex, for frame dumps
/// Example: [0x01, 0x03, 0x00] -> "01 03 00"
pub fn encode_spaced(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Why a hex string could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    OddLength(usize),
    InvalidChar { index: usize, ch: char },
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::OddLength(len) => write!(f, "hex string has odd length {}", len),
            HexError::InvalidChar { index, ch } => {
                write!(f, "invalid hex character '{}' at {}", ch, index)
            },
        }
    }
}

impl std::error::Error for HexError {}

fn nibble(index: usize, ch: char) -> Result<u8, HexError> {
    ch.to_digit(16)
        .map(|d| d as u8)
        .ok_or(HexError::InvalidChar { index, ch })
}

/// Decode a hex string (either case, no separators)
/// Example: "0a0B" -> [0x0A, 0x0B]
pub fn decode(text: &str) -> Result<Vec<u8>, HexError> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() % 2 != 0 {
        return Err(HexError::OddLength(chars.len()));
    }
    chars
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| Ok(nibble(i * 2, pair[0])? << 4 | nibble(i * 2 + 1, pair[1])?))
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_encode_upper_basic() {
        assert_eq!(encode_upper(&[0x12, 0x34, 0xAB]), "1234AB");
    }

    #[test]
    fn test_encode_upper_empty() {
        assert_eq!(encode_upper(&[]), "");
    }

    #[test]
    fn test_encode_upper_single_byte() {
        assert_eq!(encode_upper(&[0xFF]), "FF");
        assert_eq!(encode_upper(&[0x0F]), "0F");
    }

    #[test]
    fn test_encode_spaced() {
        assert_eq!(encode_spaced(&[0x01, 0x03, 0x00]), "01 03 00");
        assert_eq!(encode_spaced(&[0xAB]), "AB");
        assert_eq!(encode_spaced(&[]), "");
    }

    #[test]
    fn test_decode_mixed_case() {
        assert_eq!(decode("0a0B").unwrap(), vec![0x0A, 0x0B]);
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode("ABC"), Err(HexError::OddLength(3)));
        assert_eq!(
            decode("0G"),
            Err(HexError::InvalidChar { index: 1, ch: 'G' })
        );
    }

    #[test]
    fn test_decode_inverts_encode() {
        let data = [0x00, 0x7F, 0x80, 0xFF];
        assert_eq!(decode(&encode_upper(&data)).unwrap(), data);
    }
}
