//! Concrete file formats.
//!
//! - [`text`]: one `<word> <numbers...>` line per pair, optional header
//! - [`binary`]: the word2vec binary format
//! - [`vvm`]: a tar archive with an in-memory vocabulary and random access to vectors

pub mod binary;
pub mod text;
pub mod vvm;

pub use binary::BinaryEmbFile;
pub use text::TextEmbFile;
pub use vvm::{VvmEmbFile, VvmMeta};
