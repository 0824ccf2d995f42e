//! Text format (GloVe, fastText): one pair per line, `word v1 v2 ... vn`.
//!
//! The file may start with a `<vocab_size> <vector_size>` header, detected
//! automatically. Without it, `vector_size` is taken from the first line.

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
pub const FORMAT_ID: &str = "txt";
/// Extension given to new text files.
pub const DEFAULT_EXTENSION: &str = ".txt";

const BOM: char = '\u{feff}';
const FORBIDDEN_IN_WORDS: &[char] = &[' ', '\n'];

/// `(vocab_size, vector_size)` if the line is a header.
fn parse_header(line: &str) -> Option<(usize, usize)> {
    let fields: Vec<&str> = line.split(' ').collect();
    match fields.as_slice() {
        [vocab, vector] => Some((vocab.parse().ok()?, vector.parse().ok()?)),
        _ => None,
    }
}

/// Reads lines through a byte window, so any encoding and compression works.
struct TextSource {
    window: Box<dyn ByteWindow>,
    encoding: TextEncoding,
    has_header: bool,
    vector_size: usize,
    at_start: bool,
    /// Current line and the offset of its vector part.
    line: Option<(String, usize)>,
}

impl TextSource {
    fn new(window: Box<dyn ByteWindow>, encoding: TextEncoding) -> Self {
        Self {
            window,
            encoding,
            has_header: false,
            vector_size: 0,
            at_start: true,
            line: None,
        }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let Some(mut line) =
            read_until_delimiter(self.window.as_mut(), "\n", self.encoding, None, true)?
        else {
            return Ok(None);
        };
        if self.at_start {
            self.at_start = false;
            if line.starts_with(BOM) {
                line.remove(0);
            }
        }
        if line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }
}

impl RecordSource for TextSource {
    fn read_word(&mut self) -> Result<Option<String>> {
        let Some(line) = self.read_line()? else {
            self.line = None;
            return Ok(None);
        };
        let Some(word_end) = line.find(' ') else {
            return Err(Error::BadFile(format!(
                "did not find any space in the entire line: {:?}",
                line
            )));
        };
        let word = line[..word_end].to_string();
        self.line = Some((line, word_end + 1));
        Ok(Some(word))
    }

    fn read_vector(&mut self) -> Result<Vector> {
        let Some((line, start)) = self.line.as_ref() else {
            return Err(Error::IllegalState("no current line".to_string()));
        };
        let vector = line[*start..]
            .split_whitespace()
            .map(|field| field.parse::<f32>())
            .collect::<std::result::Result<Vector, _>>()
            .map_err(|e| Error::BadFile(format!("{} in line: {:?}", e, line)))?;
        if vector.len() != self.vector_size {
            return Err(Error::BadFile(format!(
                "vector_size is {} but the following line contains {} elements after the \
                 word: {:?}; the file may be corrupted",
                self.vector_size,
                vector.len(),
                line
            )));
        }
        Ok(vector)
    }

    fn skip_vector(&mut self) -> Result<()> {
        self.line = None;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.window.rewind()?;
        self.at_start = true;
        self.line = None;
        if self.has_header {
            self.read_line()?;
        }
        Ok(())
    }
}

/// A text embedding file, possibly compressed. Compressed files are decoded
/// while reading, independently by each reader.
pub struct TextEmbFile {
    core: FileCore,
    encoding: TextEncoding,
    has_header: bool,
    vocab_size: Option<usize>,
    vector_size: usize,
}

impl TextEmbFile {
    /// Open a file and read its header (or its first line).
    ///
    /// A `vocab_size` in the options is used only if the file has no header.
    pub fn open(path: &Path, options: &OpenOptions) -> Result<Self> {
        let encoding = options.encoding.unwrap_or_default();
        let mut source = TextSource::new(open_window(path)?, encoding);
        let first_line = source
            .read_line()?
            .ok_or_else(|| Error::BadFile(format!("empty file: {}", path.display())))?;

        let (has_header, vocab_size, vector_size) = match parse_header(&first_line) {
            Some((vocab_size, vector_size)) => (true, Some(vocab_size), vector_size),
            None => {
                let fields = first_line.split_whitespace().count();
                (false, options.vocab_size, fields.saturating_sub(1))
            }
        };
        debug!(
            "Opened text file {} (header: {}, vocab_size: {:?}, vector_size: {})",
            path.display(),
            has_header,
            vocab_size,
            vector_size
        );

        Ok(Self {
            core: FileCore::new(
                path,
                options.out_dtype.unwrap_or(DType::F32),
                options.verbose,
            ),
            encoding,
            has_header,
            vocab_size,
            vector_size,
        })
    }

    /// Text encoding of the file.
    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    fn source(&self) -> Result<Box<dyn RecordSource>> {
        let mut source = TextSource::new(open_window(&self.core.path)?, self.encoding);
        source.has_header = self.has_header;
        source.vector_size = self.vector_size;
        source.rewind()?;
        Ok(Box::new(source))
    }
}

impl EmbFile for TextEmbFile {
    fn path(&self) -> &Path {
        &self.core.path
    }

    fn vocab_size(&self) -> Option<usize> {
        self.vocab_size
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
            .sequential_loader(source, words, missing_ok, self.vocab_size))
    }

    fn close(&mut self) {
        self.core.close();
    }
}

impl fmt::Display for TextEmbFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core
            .describe(f, "TextEmbFile", self.vocab_size, self.vector_size)
    }
}

/// Write pairs as a text file with a header.
///
/// Words must not contain spaces or newlines. Numbers are written with
/// `options.precision` decimals.
pub fn create(
    path: &Path,
    pairs: &mut dyn Iterator<Item = Result<WordVector>>,
    options: &CreateOptions,
) -> Result<()> {
    check_output_path(path, options.overwrite)?;
    let declared = declared_vocab_size(options, pairs);
    let encoding = options.encoding;
    let precision = options.precision;

    let mut body = stage_records(
        pairs,
        FORBIDDEN_IN_WORDS,
        options.verbose,
        declared,
        |pair, out| {
            let mut line = pair.word.clone();
            for value in &pair.vector {
                line.push(' ');
                line.push_str(&format!("{:.*}", precision, value));
            }
            line.push('\n');
            encoding.encode_into(&line, out)
        },
    )?;
    warn_if_wrong_vocab_size(declared, body.count);

    write_atomically(path, options.compression, &member_name(path), |out| {
        let header = format!("{} {}\n", body.count, body.vector_size);
        out.write_all(&encoding.encode(&header)?)?;
        io::copy(&mut body.file, out)?;
        Ok(())
    })?;
    debug!("Created text file {} with {} words", path.display(), body.count);
    Ok(())
}
