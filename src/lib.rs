//! embfile - A Rust library for reading, writing and converting word embedding files.
//!
//! Supported formats:
//! - **Text**: one `<word> <numbers...>` line per pair, with an optional `<count> <size>` header
//! - **Binary**: the word2vec binary format
//! - **VVM**: a tar archive with a vocabulary, raw vectors and JSON metadata, with random access
//!
//! Any file can be compressed (gzip, bzip2, xz, zip). Files are opened through a
//! [`FormatRegistry`] that resolves the format from the file extension. Once open,
//! a file yields its pairs sequentially through a [`Reader`], loads a subset of
//! words through a [`VectorsLoader`], or builds an embedding matrix for a
//! vocabulary with [`build_matrix`].
//!
//! ```no_run
//! use embfile::EmbFileExt;
//!
//! # fn main() -> embfile::Result<()> {
//! let mut file = embfile::open("glove.6B.50d.txt.gz")?;
//! let found = file.find(["the", "cat", "qwertyuiop"])?;
//! println!("{:?}", found.missing_words);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod compression;
pub mod delimiter;
pub mod encoding;
pub mod error;
pub mod file;
pub mod formats;
pub mod initializers;
pub mod loader;
mod progress;
pub mod reader;
pub mod registry;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use builder::{build_matrix, BuildMatrixOptions, BuildMatrixOutput, RowAssignment};
pub use compression::{extract, extract_if_missing, Compression};
pub use encoding::TextEncoding;
pub use error::{Error, Result};
pub use file::{CreateOptions, EmbFile, EmbFileExt, FindOutput, OpenOptions};
pub use formats::{BinaryEmbFile, TextEmbFile, VvmEmbFile, VvmMeta};
pub use initializers::{Initializer, NormalInitializer, NormalSampler};
pub use loader::{RandomAccessLoader, SequentialLoader, VectorsLoader, WordLookup};
pub use reader::{Reader, RecordSource};
pub use registry::{create_from_file, open, open_with, FormatRegistry, FormatSpec};
pub use types::{ByteOrder, DType, ElementKind, Vector, WordVector};
