//! Text encodings used for words and headers.
//!
//! Decoding reports *where* it failed and whether the input simply ended in the
//! middle of a character (`truncated`). The delimiter scanner relies on that
//! distinction to tell a false-positive delimiter match from real corruption.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Longest encoded character among the supported encodings, in bytes.
pub const MAX_CHAR_BYTES: usize = 4;

/// Supported text encodings. All of them are BOM-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
    Latin1,
    Ascii,
}

/// A decoding failure over `bytes[start..end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError {
    /// Offset of the first byte of the offending character.
    pub start: usize,
    /// Offset one past the offending bytes.
    pub end: usize,
    /// True if the input ends inside a character that began at `start`.
    pub truncated: bool,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.truncated {
            write!(f, "truncated character at byte {}", self.start)
        } else {
            write!(f, "invalid bytes in range {}..{}", self.start, self.end)
        }
    }
}

impl TextEncoding {
    /// Canonical name of the encoding.
    pub fn name(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Utf16Le => "utf-16-le",
            TextEncoding::Utf16Be => "utf-16-be",
            TextEncoding::Utf32Le => "utf-32-le",
            TextEncoding::Utf32Be => "utf-32-be",
            TextEncoding::Latin1 => "latin-1",
            TextEncoding::Ascii => "ascii",
        }
    }

    /// Encode text. Fails if a character can't be represented.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(text.len());
        self.encode_into(text, &mut out)?;
        Ok(out)
    }

    /// Append the encoding of `text` to `out`.
    pub fn encode_into(&self, text: &str, out: &mut Vec<u8>) -> Result<()> {
        match self {
            TextEncoding::Utf8 => out.extend_from_slice(text.as_bytes()),
            TextEncoding::Utf16Le => text
                .encode_utf16()
                .for_each(|unit| out.extend_from_slice(&unit.to_le_bytes())),
            TextEncoding::Utf16Be => text
                .encode_utf16()
                .for_each(|unit| out.extend_from_slice(&unit.to_be_bytes())),
            TextEncoding::Utf32Le => text
                .chars()
                .for_each(|c| out.extend_from_slice(&(c as u32).to_le_bytes())),
            TextEncoding::Utf32Be => text
                .chars()
                .for_each(|c| out.extend_from_slice(&(c as u32).to_be_bytes())),
            TextEncoding::Latin1 | TextEncoding::Ascii => {
                let limit = if *self == TextEncoding::Ascii { 0x7f } else { 0xff };
                for c in text.chars() {
                    if c as u32 > limit {
                        return Err(Error::Argument(format!(
                            "character {:?} can't be encoded with {}",
                            c,
                            self.name()
                        )));
                    }
                    out.push(c as u8);
                }
            }
        }
        Ok(())
    }

    /// Decode bytes into a string.
    pub fn decode(&self, bytes: &[u8]) -> std::result::Result<String, DecodeError> {
        match self {
            TextEncoding::Utf8 => match std::str::from_utf8(bytes) {
                Ok(text) => Ok(text.to_string()),
                Err(err) => {
                    let start = err.valid_up_to();
                    Err(match err.error_len() {
                        None => DecodeError {
                            start,
                            end: bytes.len(),
                            truncated: true,
                        },
                        Some(len) => DecodeError {
                            start,
                            end: start + len,
                            truncated: false,
                        },
                    })
                }
            },
            TextEncoding::Utf16Le => decode_utf16(bytes, u16::from_le_bytes),
            TextEncoding::Utf16Be => decode_utf16(bytes, u16::from_be_bytes),
            TextEncoding::Utf32Le => decode_utf32(bytes, u32::from_le_bytes),
            TextEncoding::Utf32Be => decode_utf32(bytes, u32::from_be_bytes),
            TextEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
            TextEncoding::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(pos) => Err(DecodeError {
                    start: pos,
                    end: pos + 1,
                    truncated: false,
                }),
                None => Ok(bytes.iter().map(|&b| b as char).collect()),
            },
        }
    }
}

fn decode_utf16(
    bytes: &[u8],
    unit: fn([u8; 2]) -> u16,
) -> std::result::Result<String, DecodeError> {
    let mut text = String::with_capacity(bytes.len() / 2);
    let mut pos = 0;
    while pos < bytes.len() {
        if pos + 2 > bytes.len() {
            return Err(DecodeError {
                start: pos,
                end: bytes.len(),
                truncated: true,
            });
        }
        let first = unit([bytes[pos], bytes[pos + 1]]);
        match first {
            0xD800..=0xDBFF => {
                // High surrogate: needs a low surrogate right after
                if pos + 4 > bytes.len() {
                    return Err(DecodeError {
                        start: pos,
                        end: bytes.len(),
                        truncated: true,
                    });
                }
                let second = unit([bytes[pos + 2], bytes[pos + 3]]);
                if !(0xDC00..=0xDFFF).contains(&second) {
                    return Err(DecodeError {
                        start: pos,
                        end: pos + 2,
                        truncated: false,
                    });
                }
                let code = 0x10000 + (((first as u32) - 0xD800) << 10) + ((second as u32) - 0xDC00);
                // Always a valid scalar value by construction
                text.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                pos += 4;
            }
            0xDC00..=0xDFFF => {
                return Err(DecodeError {
                    start: pos,
                    end: pos + 2,
                    truncated: false,
                });
            }
            _ => {
                text.push(char::from_u32(first as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
                pos += 2;
            }
        }
    }
    Ok(text)
}

fn decode_utf32(
    bytes: &[u8],
    unit: fn([u8; 4]) -> u32,
) -> std::result::Result<String, DecodeError> {
    let mut text = String::with_capacity(bytes.len() / 4);
    for (i, chunk) in bytes.chunks(4).enumerate() {
        let start = i * 4;
        if chunk.len() < 4 {
            return Err(DecodeError {
                start,
                end: bytes.len(),
                truncated: true,
            });
        }
        let code = unit([chunk[0], chunk[1], chunk[2], chunk[3]]);
        match char::from_u32(code) {
            Some(c) => text.push(c),
            None => {
                return Err(DecodeError {
                    start,
                    end: start + 4,
                    truncated: false,
                })
            }
        }
    }
    Ok(text)
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextEncoding {
    type Err = Error;

    /// Accepts the usual aliases (`utf8`, `UTF-8`, `utf_16`, `latin1`, ...).
    /// UTF-16/32 without an explicit byte order map to the little-endian variant.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect();
        match normalized.as_str() {
            "utf8" | "u8" => Ok(TextEncoding::Utf8),
            "utf16" | "u16" | "utf16le" => Ok(TextEncoding::Utf16Le),
            "utf16be" => Ok(TextEncoding::Utf16Be),
            "utf32" | "u32" | "utf32le" => Ok(TextEncoding::Utf32Le),
            "utf32be" => Ok(TextEncoding::Utf32Be),
            "latin1" | "latin" | "iso88591" | "l1" => Ok(TextEncoding::Latin1),
            "ascii" | "usascii" => Ok(TextEncoding::Ascii),
            _ => Err(Error::Argument(format!("unsupported text encoding: {:?}", s))),
        }
    }
}
