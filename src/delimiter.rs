//! Delimiter search over encoded bytes.
//!
//! A byte-level search for an encoded delimiter can match across a character
//! boundary in multi-byte encodings: in UTF-16-LE, a space is `20 00`, which
//! also appears between `U+2011` (`11 20`) and `U+1100` (`00 11`). A match is
//! accepted only if the bytes before it decode; a match that splits a character
//! in half is skipped and the search resumes after that character.

use crate::encoding::{TextEncoding, MAX_CHAR_BYTES};
use crate::error::{Error, Result};
use crate::storage::ByteWindow;

enum Scan {
    Found { text: String, end: usize },
    NotFound,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Core search. `limit` bounds where the delimiter may end.
fn scan(
    delimiter: &[u8],
    bytes: &[u8],
    start: usize,
    encoding: TextEncoding,
    limit: usize,
) -> Result<Scan> {
    let limit = limit.min(bytes.len());
    let mut find_start = start;
    loop {
        if find_start >= limit {
            return Ok(Scan::NotFound);
        }
        let Some(offset) = find(&bytes[find_start..limit], delimiter) else {
            return Ok(Scan::NotFound);
        };
        let matched = find_start + offset;
        match encoding.decode(&bytes[start..matched]) {
            Ok(text) => {
                return Ok(Scan::Found {
                    text,
                    end: matched + delimiter.len(),
                })
            }
            Err(err) if err.truncated => {
                // The match splits a character: find where that character ends
                let char_start = start + err.start;
                let char_len = (1..=MAX_CHAR_BYTES)
                    .filter(|k| char_start + k <= bytes.len())
                    .find(|k| encoding.decode(&bytes[char_start..char_start + k]).is_ok());
                match char_len {
                    Some(len) => find_start = char_start + len,
                    // More data may complete the character
                    None if char_start + MAX_CHAR_BYTES > bytes.len() => return Ok(Scan::NotFound),
                    None => {
                        return Err(Error::BadFile(format!(
                            "undecodable {} bytes at position {}",
                            encoding, char_start
                        )))
                    }
                }
            }
            Err(err) => {
                return Err(Error::BadFile(format!(
                    "invalid {} text at position {}: {}",
                    encoding,
                    start + err.start,
                    err
                )))
            }
        }
    }
}

fn not_found(delimiter: &str, start: u64, max_bytes: Option<usize>) -> Error {
    let bound = match max_bytes {
        Some(max) => format!("within {} bytes", max),
        None => "before the end of data".to_string(),
    };
    Error::BadFile(format!(
        "delimiter {:?} not found {} starting from position {}",
        delimiter, bound, start
    ))
}

/// Search `bytes[start..]` for `delimiter` (encoded with `encoding`), decode
/// what precedes it and return it with the position just past the delimiter.
///
/// With `max_bytes`, the text before the delimiter may be at most that long.
/// If `start` is at the end of the data, returns `("", start)`.
pub fn take_until_delimiter(
    delimiter: &str,
    bytes: &[u8],
    start: usize,
    encoding: TextEncoding,
    max_bytes: Option<usize>,
) -> Result<(String, usize)> {
    if start >= bytes.len() {
        return Ok((String::new(), start));
    }
    let encoded = encoding.encode(delimiter)?;
    let limit = match max_bytes {
        Some(max) => start.saturating_add(max).saturating_add(encoded.len()),
        None => bytes.len(),
    };
    match scan(&encoded, bytes, start, encoding, limit)? {
        Scan::Found { text, end } => Ok((text, end)),
        Scan::NotFound => Err(not_found(delimiter, start as u64, max_bytes)),
    }
}

/// Streaming counterpart of [`take_until_delimiter`]: reads from the window's
/// cursor up to and including the delimiter, and advances past it.
///
/// Returns `None` if the window is already at the end. If the data ends without
/// a delimiter, the remaining bytes are returned as the last record when
/// `accept_unterminated` is set, otherwise that's a `BadFile` error.
pub fn read_until_delimiter(
    window: &mut dyn ByteWindow,
    delimiter: &str,
    encoding: TextEncoding,
    max_bytes: Option<usize>,
    accept_unterminated: bool,
) -> Result<Option<String>> {
    let encoded = encoding.encode(delimiter)?;
    if window.at_end()? {
        return Ok(None);
    }
    loop {
        let available = window.available();
        let limit = match max_bytes {
            Some(max) => max + encoded.len(),
            None => usize::MAX,
        };
        match scan(&encoded, available, 0, encoding, limit)? {
            Scan::Found { text, end } => {
                window.consume(end);
                return Ok(Some(text));
            }
            Scan::NotFound => {
                let bounded = available.len() >= limit;
                if !bounded && window.fill_more()? {
                    continue;
                }
                let available = window.available();
                if accept_unterminated && !bounded {
                    let text = encoding.decode(available).map_err(|err| {
                        Error::BadFile(format!(
                            "invalid {} text at position {}: {}",
                            encoding,
                            window.position() + err.start as u64,
                            err
                        ))
                    })?;
                    let len = available.len();
                    window.consume(len);
                    return Ok(Some(text));
                }
                return Err(not_found(delimiter, window.position(), max_bytes));
            }
        }
    }
}
