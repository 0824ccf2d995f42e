//! Binary format of the word2vec tool.
//!
//! A text header `<vocab_size> <vector_size>\n` followed, for each pair, by the
//! encoded word, a space and the raw vector elements.

use crate::delimiter::read_until_delimiter;
use crate::encoding::TextEncoding;
use crate::error::{Error, Result};
use crate::file::{
    check_output_path, declared_vocab_size, member_name, stage_records, warn_if_wrong_vocab_size,
    write_atomically, CreateOptions, EmbFile, FileCore, OpenOptions,
};
use crate::loader::VectorsLoader;
use crate::reader::{Reader, RecordSource};
use crate::storage::{open_window, ByteWindow};
use crate::types::{DType, Vector, WordVector};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::Path;
use tracing::debug;

/// Format identifier.
pub const FORMAT_ID: &str = "bin";
/// Extension given to new binary files.
pub const DEFAULT_EXTENSION: &str = ".bin";

const MAX_HEADER_BYTES: usize = 128;
const MAX_WORD_BYTES: usize = 1024;
const FORBIDDEN_IN_WORDS: &[char] = &[' ', '\n'];

struct BinarySource {
    window: Box<dyn ByteWindow>,
    encoding: TextEncoding,
    dtype: DType,
    vector_size: usize,
    newline: Vec<u8>,
}

impl BinarySource {
    /// Open a source positioned on the first record, with the header sizes.
    fn open(path: &Path, encoding: TextEncoding, dtype: DType) -> Result<(Self, usize, usize)> {
        let mut source = Self {
            window: open_window(path)?,
            encoding,
            dtype,
            vector_size: 0,
            newline: encoding.encode("\n")?,
        };
        let (vocab_size, vector_size) = source.read_header()?;
        source.vector_size = vector_size;
        Ok((source, vocab_size, vector_size))
    }

    fn read_header(&mut self) -> Result<(usize, usize)> {
        let line = read_until_delimiter(
            self.window.as_mut(),
            "\n",
            self.encoding,
            Some(MAX_HEADER_BYTES),
            false,
        )?
        .ok_or_else(|| Error::BadFile("empty file: missing header".to_string()))?;

        let sizes: Vec<usize> = line
            .split_whitespace()
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::BadFile(format!("invalid header line: {:?}", line)))?;
        match sizes.as_slice() {
            [vocab_size, vector_size] => Ok((*vocab_size, *vector_size)),
            _ => Err(Error::BadFile(format!(
                "the header must contain exactly two numbers: {:?}",
                line
            ))),
        }
    }

    fn vector_bytes(&self) -> usize {
        self.dtype.vector_bytes(self.vector_size)
    }

    fn skip_newlines(&mut self) -> Result<()> {
        let len = self.newline.len();
        while self.window.ensure(len)? && self.window.available()[..len] == self.newline[..] {
            self.window.consume(len);
        }
        Ok(())
    }
}

impl RecordSource for BinarySource {
    fn read_word(&mut self) -> Result<Option<String>> {
        self.skip_newlines()?;
        read_until_delimiter(
            self.window.as_mut(),
            " ",
            self.encoding,
            Some(MAX_WORD_BYTES),
            false,
        )
    }

    fn read_vector(&mut self) -> Result<Vector> {
        let len = self.vector_bytes();
        if !self.window.ensure(len)? {
            return Err(Error::BadFile(format!(
                "truncated vector at byte {}: expected {} bytes",
                self.window.position(),
                len
            )));
        }
        let vector = self.dtype.decode(&self.window.available()[..len]);
        self.window.consume(len);
        Ok(vector)
    }

    fn skip_vector(&mut self) -> Result<()> {
        let len = self.vector_bytes();
        if !self.window.skip(len)? {
            return Err(Error::BadFile(format!(
                "truncated vector: expected {} bytes",
                len
            )));
        }
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.window.rewind()?;
        self.read_header()?;
        Ok(())
    }
}

/// A word2vec binary file. Uncompressed files are memory-mapped; compressed
/// ones are decoded while reading, independently by each reader.
pub struct BinaryEmbFile {
    core: FileCore,
    encoding: TextEncoding,
    dtype: DType,
    vocab_size: usize,
    vector_size: usize,
}

impl BinaryEmbFile {
    /// Open a file and read its header.
    ///
    /// `options.dtype` is the element type stored in the file (default `<f4`);
    /// returned vectors are rounded to `options.out_dtype`, which defaults to it.
    pub fn open(path: &Path, options: &OpenOptions) -> Result<Self> {
        let encoding = options.encoding.unwrap_or_default();
        let dtype = options.dtype.unwrap_or_default();
        let (_, vocab_size, vector_size) = BinarySource::open(path, encoding, dtype)?;
        debug!(
            "Opened binary file {} (vocab_size: {}, vector_size: {}, dtype: {})",
            path.display(),
            vocab_size,
            vector_size,
            dtype
        );
        Ok(Self {
            core: FileCore::new(path, options.out_dtype.unwrap_or(dtype), options.verbose),
            encoding,
            dtype,
            vocab_size,
            vector_size,
        })
    }

    /// Text encoding of words.
    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Element type stored in the file.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn source(&self) -> Result<Box<dyn RecordSource>> {
        let (source, _, _) = BinarySource::open(&self.core.path, self.encoding, self.dtype)?;
        Ok(Box::new(source))
    }
}

impl EmbFile for BinaryEmbFile {
    fn path(&self) -> &Path {
        &self.core.path
    }

    fn vocab_size(&self) -> Option<usize> {
        Some(self.vocab_size)
    }

    fn vector_size(&self) -> usize {
        self.vector_size
    }

    fn out_dtype(&self) -> DType {
        self.core.out_dtype
    }

    fn format_id(&self) -> &'static str {
        FORMAT_ID
    }

    fn verbose(&self) -> bool {
        self.core.verbose
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn reader(&mut self) -> Result<Reader> {
        self.core.check_open()?;
        let source = self.source()?;
        Ok(self.core.track_reader(source))
    }

    fn loader(
        &mut self,
        words: HashSet<String>,
        missing_ok: bool,
    ) -> Result<Box<dyn VectorsLoader>> {
        self.core.check_open()?;
        let source = self.source()?;
        Ok(self
            .core
            .sequential_loader(source, words, missing_ok, Some(self.vocab_size)))
    }

    fn close(&mut self) {
        self.core.close();
    }
}

impl fmt::Display for BinaryEmbFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core
            .describe(f, "BinaryEmbFile", Some(self.vocab_size), self.vector_size)
    }
}

/// Write pairs in the binary format, with elements of `options.dtype`
/// (default `<f4`). Words must not contain spaces or newlines.
pub fn create(
    path: &Path,
    pairs: &mut dyn Iterator<Item = Result<WordVector>>,
    options: &CreateOptions,
) -> Result<()> {
    check_output_path(path, options.overwrite)?;
    let declared = declared_vocab_size(options, pairs);
    let encoding = options.encoding;
    let dtype = options.dtype.unwrap_or_default();

    let mut body = stage_records(
        pairs,
        FORBIDDEN_IN_WORDS,
        options.verbose,
        declared,
        |pair, out| {
            encoding.encode_into(&pair.word, out)?;
            encoding.encode_into(" ", out)?;
            dtype.encode_into(&pair.vector, out);
            Ok(())
        },
    )?;
    warn_if_wrong_vocab_size(declared, body.count);

    write_atomically(path, options.compression, &member_name(path), |out| {
        let header = format!("{} {}\n", body.count, body.vector_size);
        out.write_all(&encoding.encode(&header)?)?;
        io::copy(&mut body.file, out)?;
        Ok(())
    })?;
    debug!(
        "Created binary file {} with {} words ({})",
        path.display(),
        body.count,
        dtype
    );
    Ok(())
}
