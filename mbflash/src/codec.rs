//! One-byte-per-character conversion between text and raw buffers.
//!
//! Both the firmware builder and the serial bridge treat text as a sequence
//! of code points in `0..=255`, each mapping to exactly one byte (Latin-1).
//! Characters above that range are rejected by [`to_bytes`] rather than
//! wrapped modulo 256.

use crate::error::{Error, Result};

/// Replacement byte used by [`to_bytes_lossy`].
pub const REPLACEMENT_BYTE: u8 = b'?';

/// Convert text to bytes, one byte per character.
///
/// Fails with [`Error::CodePointOutOfRange`] on the first character whose
/// code point exceeds 255.
pub fn to_bytes(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .enumerate()
        .map(|(index, ch)| {
            u8::try_from(u32::from(ch)).map_err(|_| Error::CodePointOutOfRange { ch, index })
        })
        .collect()
}

/// Convert text to bytes, replacing out-of-range characters with `?`.
pub fn to_bytes_lossy(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| u8::try_from(u32::from(ch)).unwrap_or(REPLACEMENT_BYTE))
        .collect()
}

/// Convert bytes to text, one character per byte.
pub fn to_text(bytes: &[u8]) -> String {
    bytes.iter().copied().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_bytes_ascii() {
        assert_eq!(to_bytes("help()\r").unwrap(), b"help()\r".to_vec());
    }

    #[test]
    fn test_to_bytes_latin1_is_single_byte() {
        // U+00E9 is two bytes in UTF-8 but one byte here
        assert_eq!(to_bytes("caf\u{e9}").unwrap(), vec![b'c', b'a', b'f', 0xE9]);
    }

    #[test]
    fn test_to_bytes_rejects_wide_char() {
        let err = to_bytes("ab\u{263A}c").unwrap_err();
        match err {
            Error::CodePointOutOfRange { ch, index } => {
                assert_eq!(ch, '\u{263A}');
                assert_eq!(index, 2);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_to_bytes_lossy_replaces_wide_char() {
        assert_eq!(to_bytes_lossy("a\u{263A}b"), b"a?b".to_vec());
    }

    #[test]
    fn test_to_text_preserves_order() {
        assert_eq!(to_text(&[0x3E, 0x3E, 0x3E, 0x20]), ">>> ");
        assert_eq!(to_text(&[0xFF]), "\u{ff}");
    }

    #[test]
    fn test_round_trip_full_byte_range() {
        let text: String = (0u8..=255).map(char::from).collect();
        let bytes = to_bytes(&text).unwrap();
        assert_eq!(bytes.len(), 256);
        assert_eq!(to_text(&bytes), text);
    }

    #[test]
    fn test_empty() {
        assert!(to_bytes("").unwrap().is_empty());
        assert_eq!(to_text(&[]), "");
    }
}
