//! Error types for the embfile library.

use std::path::PathBuf;
use thiserror::Error;

/// Maximum number of missing words listed in a [`Error::KeyNotFound`] message.
pub const MISSING_WORDS_SHOWN: usize = 20;

/// Top-level error type for embfile operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A resource was used in a state that doesn't allow the operation
    /// (e.g. a closed reader, or a vector requested before any word was read).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The file content is malformed or corrupted.
    #[error("bad embedding file: {0}")]
    BadFile(String),

    /// One or more required words are not in the file.
    #[error("{count} words are missing: {}", list_sample(.sample, .count))]
    KeyNotFound {
        /// Total number of missing words.
        count: usize,
        /// The first few missing words.
        sample: Vec<String>,
    },

    /// Invalid combination of arguments.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The output file already exists and overwriting was not requested.
    #[error("file already exists: {}", .0.display())]
    FileAlreadyExists(PathBuf),

    /// The input file doesn't exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Index outside of `[-len, len)`.
    #[error("index {index} out of range for a vocabulary of {len} words")]
    IndexOutOfRange { index: i64, len: usize },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata (de)serialization errors.
    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::KeyNotFound`] from the complete set of missing words.
    pub fn missing<'a, I>(words: I) -> Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut count = 0;
        let mut sample = Vec::new();
        for word in words {
            if sample.len() < MISSING_WORDS_SHOWN {
                sample.push(word.clone());
            }
            count += 1;
        }
        Error::KeyNotFound { count, sample }
    }

    pub(crate) fn closed(what: &str) -> Self {
        Error::IllegalState(format!("attempted to use a closed {}", what))
    }
}

fn list_sample(sample: &[String], count: &usize) -> String {
    let mut listed = sample.join(", ");
    if *count > sample.len() {
        listed.push_str("...");
    }
    listed
}

/// Result type for embfile operations.
pub type Result<T> = std::result::Result<T, Error>;
