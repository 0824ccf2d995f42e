//! Embedding file handles.
//!
//! [`EmbFile`] is what every format implements: sizes, a fresh [`Reader`] and a
//! [`VectorsLoader`]. Everything else (iterating, loading subsets, filtering,
//! saving the vocabulary) is provided on top of it by [`EmbFileExt`].

use crate::compression::{Compression, CompressedWriter};
use crate::encoding::TextEncoding;
use crate::error::{Error, Result};
use crate::loader::{SequentialLoader, VectorsLoader};
use crate::progress;
use crate::reader::{Children, Reader, RecordSource};
use crate::types::{DType, Vector, WordVector};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Options for opening a file. Fields left unset fall back to what the file
/// declares or to the format's default.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Text encoding of words (default: utf-8, or what a VVM file declares).
    pub encoding: Option<TextEncoding>,
    /// Element type stored in binary files (default: `<f4`).
    pub dtype: Option<DType>,
    /// Element type returned vectors are rounded to (default: the stored one).
    pub out_dtype: Option<DType>,
    /// Number of words, for text files without a header.
    pub vocab_size: Option<usize>,
    /// Show progress bars in long operations.
    pub verbose: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_out_dtype(mut self, out_dtype: DType) -> Self {
        self.out_dtype = Some(out_dtype);
        self
    }

    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = Some(vocab_size);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Default number of decimals written by the text format.
pub const DEFAULT_PRECISION: usize = 5;

/// Options for creating a file.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Expected number of pairs. A mismatch with the actual count is logged.
    pub vocab_size: Option<usize>,
    /// Compress the output.
    pub compression: Option<Compression>,
    /// Replace an existing output file.
    pub overwrite: bool,
    /// Show progress bars.
    pub verbose: bool,
    /// Encoding of words (and headers).
    pub encoding: TextEncoding,
    /// Element type of stored vectors (binary and VVM; default `<f4`).
    pub dtype: Option<DType>,
    /// Decimals written per number (text).
    pub precision: usize,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            vocab_size: None,
            compression: None,
            overwrite: false,
            verbose: false,
            encoding: TextEncoding::Utf8,
            dtype: None,
            precision: DEFAULT_PRECISION,
        }
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = Some(vocab_size);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }
}

/// An open embedding file.
pub trait EmbFile: Send {
    /// Path of the file, as given (possibly compressed).
    fn path(&self) -> &Path;

    /// Number of words, if known.
    fn vocab_size(&self) -> Option<usize>;

    /// Length of every vector.
    fn vector_size(&self) -> usize;

    /// Element type vectors are rounded to.
    fn out_dtype(&self) -> DType;

    /// Identifier of the format in a [`FormatRegistry`](crate::FormatRegistry).
    fn format_id(&self) -> &'static str;

    /// Default verbosity of long operations.
    fn verbose(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// A new reader positioned before the first record. The file closes it
    /// when the file itself is closed.
    fn reader(&mut self) -> Result<Reader>;

    /// A loader yielding the vectors of `words` found in the file.
    fn loader(&mut self, words: HashSet<String>, missing_ok: bool)
        -> Result<Box<dyn VectorsLoader>>;

    /// Close the file and every reader and loader it created. Idempotent.
    fn close(&mut self);
}

/// State shared by every file handle: the open/closed flag and the children to
/// close along with the file.
pub(crate) struct FileCore {
    pub(crate) path: PathBuf,
    pub(crate) out_dtype: DType,
    pub(crate) verbose: bool,
    closed: bool,
    children: Children,
}

impl FileCore {
    pub(crate) fn new(path: &Path, out_dtype: DType, verbose: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            out_dtype,
            verbose,
            closed: false,
            children: Children::default(),
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::closed("file"));
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Wrap a source into a reader the file will close.
    pub(crate) fn track_reader(&mut self, source: Box<dyn RecordSource>) -> Reader {
        let reader = Reader::new(source, self.out_dtype);
        self.children.register(reader.resource());
        reader
    }

    pub(crate) fn track(&mut self, resource: std::sync::Arc<dyn crate::reader::Release>) {
        self.children.register(resource);
    }

    /// A scan-based loader over a new tracked reader.
    pub(crate) fn sequential_loader(
        &mut self,
        source: Box<dyn RecordSource>,
        words: HashSet<String>,
        missing_ok: bool,
        vocab_size: Option<usize>,
    ) -> Box<dyn VectorsLoader> {
        let reader = self.track_reader(source);
        Box::new(SequentialLoader::new(
            reader,
            words,
            missing_ok,
            self.verbose,
            vocab_size,
        ))
    }

    pub(crate) fn close(&mut self) {
        self.children.release_all();
        self.closed = true;
    }

    pub(crate) fn describe(
        &self,
        f: &mut fmt::Formatter<'_>,
        kind: &str,
        vocab_size: Option<usize>,
        vector_size: usize,
    ) -> fmt::Result {
        let vocab = vocab_size.map_or_else(|| "unknown".to_string(), |n| n.to_string());
        write!(
            f,
            "{} (\n  path = {},\n  vocab_size = {},\n  vector_size = {}\n)",
            kind,
            self.path.display(),
            vocab,
            vector_size
        )
    }
}

/// Iterator over the records of a file, built on a dedicated [`Reader`].
pub struct Records<T> {
    reader: Reader,
    extract: fn(&mut Reader, String) -> Result<T>,
    done: bool,
}

/// Iterator over the words of a file.
pub type Words = Records<String>;
/// Iterator over the vectors of a file.
pub type Vectors = Records<Vector>;
/// Iterator over the (word, vector) pairs of a file.
pub type WordVectors = Records<WordVector>;

impl<T> Records<T> {
    fn new(reader: Reader, extract: fn(&mut Reader, String) -> Result<T>) -> Self {
        Self {
            reader,
            extract,
            done: false,
        }
    }
}

impl<T> Iterator for Records<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = match self.reader.next_word() {
            Ok(Some(word)) => (self.extract)(&mut self.reader, word),
            Ok(None) => {
                self.done = true;
                self.reader.close();
                return None;
            }
            Err(e) => Err(e),
        };
        if item.is_err() {
            self.done = true;
            self.reader.close();
        }
        Some(item)
    }
}

/// Pairs whose word satisfies a predicate. Vectors of other words are skipped
/// without being decoded.
pub struct Filter<P> {
    reader: Reader,
    predicate: P,
    done: bool,
}

impl<P: FnMut(&str) -> bool> Iterator for Filter<P> {
    type Item = Result<WordVector>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let word = match self.reader.next_word() {
                Ok(Some(word)) => word,
                Ok(None) => {
                    self.done = true;
                    self.reader.close();
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    self.reader.close();
                    return Some(Err(e));
                }
            };
            if (self.predicate)(word.as_str()) {
                let pair = self
                    .reader
                    .current_vector()
                    .map(|v| WordVector::new(word, v.to_vec()));
                if pair.is_err() {
                    self.done = true;
                    self.reader.close();
                }
                return Some(pair);
            }
        }
    }
}

/// Result of [`EmbFileExt::find`].
#[derive(Debug, Clone, Default)]
pub struct FindOutput {
    /// Vectors of the words found.
    pub word2vec: HashMap<String, Vector>,
    /// Words not in the file.
    pub missing_words: HashSet<String>,
}

/// Operations available on every [`EmbFile`], including `dyn EmbFile`.
pub trait EmbFileExt: EmbFile {
    /// Stream all the words.
    fn words(&mut self) -> Result<Words> {
        Ok(Records::new(self.reader()?, |_, word| Ok(word)))
    }

    /// Stream all the vectors.
    fn vectors(&mut self) -> Result<Vectors> {
        Ok(Records::new(self.reader()?, |reader, _| {
            Ok(reader.current_vector()?.to_vec())
        }))
    }

    /// Stream all the (word, vector) pairs.
    fn word_vectors(&mut self) -> Result<WordVectors> {
        Ok(Records::new(self.reader()?, |reader, word| {
            let vector = reader.current_vector()?.to_vec();
            Ok(WordVector::new(word, vector))
        }))
    }

    /// The whole file content as a list.
    fn to_list(&mut self) -> Result<Vec<WordVector>> {
        let bar = progress::bar(
            self.verbose(),
            self.vocab_size().map(|n| n as u64),
            "Loading to list",
        );
        let list = self
            .word_vectors()?
            .inspect(|_| bar.inc(1))
            .collect::<Result<Vec<_>>>();
        bar.finish_and_clear();
        list
    }

    /// The whole file content as a word to vector map.
    fn to_map(&mut self) -> Result<HashMap<String, Vector>> {
        let bar = progress::bar(
            self.verbose(),
            self.vocab_size().map(|n| n as u64),
            "Loading to map",
        );
        let map = self
            .word_vectors()?
            .inspect(|_| bar.inc(1))
            .map(|pair| pair.map(|wv| (wv.word, wv.vector)))
            .collect::<Result<HashMap<_, _>>>();
        bar.finish_and_clear();
        map
    }

    /// Vectors of the given words. [`Error::KeyNotFound`] if any is missing.
    fn load<I, S>(&mut self, words: I) -> Result<HashMap<String, Vector>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: HashSet<String> = words.into_iter().map(Into::into).collect();
        let mut loader = self.loader(words, false)?;
        let loaded = loader
            .by_ref()
            .map(|pair| pair.map(|wv| (wv.word, wv.vector)))
            .collect::<Result<HashMap<_, _>>>();
        loader.close();
        loaded
    }

    /// Vectors of the given words that are in the file, plus the set of the
    /// ones that aren't.
    fn find<I, S>(&mut self, words: I) -> Result<FindOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: HashSet<String> = words.into_iter().map(Into::into).collect();
        let mut loader = self.loader(words, true)?;
        let word2vec = loader
            .by_ref()
            .map(|pair| pair.map(|wv| (wv.word, wv.vector)))
            .collect::<Result<HashMap<_, _>>>()?;
        let missing_words = loader.missing_words().clone();
        loader.close();
        Ok(FindOutput {
            word2vec,
            missing_words,
        })
    }

    /// Pairs whose word satisfies `predicate`.
    fn filter<P>(&mut self, predicate: P) -> Result<Filter<P>>
    where
        P: FnMut(&str) -> bool,
    {
        Ok(Filter {
            reader: self.reader()?,
            predicate,
            done: false,
        })
    }

    /// Write the vocabulary to a text file, one word per line, and return its
    /// path. Defaults to `<dir>/<name up to the first dot>_vocab.txt`.
    fn save_vocab(
        &mut self,
        path: Option<&Path>,
        encoding: TextEncoding,
        overwrite: bool,
    ) -> Result<PathBuf> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_vocab_path(self.path()),
        };
        if path.exists() && !overwrite {
            return Err(Error::FileAlreadyExists(path));
        }

        let bar = progress::bar(
            self.verbose(),
            self.vocab_size().map(|n| n as u64),
            "Saving vocabulary",
        );
        let words = self.words()?;
        write_atomically(&path, None, "", |out| {
            let mut line = Vec::new();
            for word in words {
                line.clear();
                encoding.encode_into(&word?, &mut line)?;
                encoding.encode_into("\n", &mut line)?;
                out.write_all(&line)?;
                bar.inc(1);
            }
            Ok(())
        })?;
        bar.finish_and_clear();
        Ok(path)
    }
}

impl<T: EmbFile + ?Sized> EmbFileExt for T {}

fn default_vocab_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or_default();
    path.with_file_name(format!("{}_vocab.txt", stem))
}

// ============================================================================
// Creation helpers shared by the formats
// ============================================================================

/// Fail if `path` exists and overwriting wasn't requested.
pub(crate) fn check_output_path(path: &Path, overwrite: bool) -> Result<()> {
    if path.exists() {
        if !overwrite {
            return Err(Error::FileAlreadyExists(path.to_path_buf()));
        }
        info!(
            "The file {} already exists and overwrite is set; it will be replaced",
            path.display()
        );
    }
    Ok(())
}

/// Number of pairs announced by the caller or by the iterator itself.
pub(crate) fn declared_vocab_size(
    options: &CreateOptions,
    pairs: &dyn Iterator<Item = Result<WordVector>>,
) -> Option<usize> {
    options.vocab_size.or(match pairs.size_hint() {
        (lower, Some(upper)) if lower == upper => Some(lower),
        _ => None,
    })
}

pub(crate) fn warn_if_wrong_vocab_size(declared: Option<usize>, actual: usize) {
    if let Some(declared) = declared {
        if declared != actual {
            warn!(
                "The actual number of word vectors ({}) differs from the declared one ({}); \
                 the actual one is written",
                actual, declared
            );
        }
    }
}

/// Validates pairs being written: consistent vector sizes, no forbidden
/// characters in words.
pub(crate) struct PairChecker {
    forbidden: &'static [char],
    vector_size: Option<usize>,
    count: usize,
}

impl PairChecker {
    pub(crate) fn new(forbidden: &'static [char]) -> Self {
        Self {
            forbidden,
            vector_size: None,
            count: 0,
        }
    }

    pub(crate) fn check(&mut self, pair: &WordVector) -> Result<()> {
        if let Some(c) = pair.word.chars().find(|c| self.forbidden.contains(c)) {
            return Err(Error::Argument(format!(
                "the word {:?} (index {}) contains the forbidden character {:?}",
                pair.word, self.count, c
            )));
        }
        match self.vector_size {
            None => self.vector_size = Some(pair.vector.len()),
            Some(size) if size != pair.vector.len() => {
                return Err(Error::Argument(format!(
                    "inconsistent vector_size: the first vector has size {} but the vector \
                     of index {} has size {}",
                    size,
                    self.count,
                    pair.vector.len()
                )))
            }
            Some(_) => {}
        }
        self.count += 1;
        Ok(())
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// Vector size of the first pair. Fails if nothing was checked.
    pub(crate) fn vector_size(&self) -> Result<usize> {
        self.vector_size
            .ok_or_else(|| Error::Argument("no word vectors to write".to_string()))
    }
}

/// Records written to an anonymous temp file, to be copied after a header.
pub(crate) struct StagedBody {
    pub(crate) file: File,
    pub(crate) count: usize,
    pub(crate) vector_size: usize,
}

/// Write every pair with `write_record` into an anonymous temp file.
pub(crate) fn stage_records<F>(
    pairs: &mut dyn Iterator<Item = Result<WordVector>>,
    forbidden: &'static [char],
    verbose: bool,
    declared: Option<usize>,
    mut write_record: F,
) -> Result<StagedBody>
where
    F: FnMut(&WordVector, &mut Vec<u8>) -> Result<()>,
{
    let mut checker = PairChecker::new(forbidden);
    let bar = progress::bar(verbose, declared.map(|n| n as u64), "Writing");
    let mut out = BufWriter::new(tempfile::tempfile()?);
    let mut record = Vec::new();
    for pair in pairs {
        let pair = pair?;
        checker.check(&pair)?;
        record.clear();
        write_record(&pair, &mut record)?;
        out.write_all(&record)?;
        bar.inc(1);
    }
    bar.finish_and_clear();
    let vector_size = checker.vector_size()?;

    let mut file = out.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(StagedBody {
        file,
        count: checker.count(),
        vector_size,
    })
}

/// Write `path` through a temp file in the same directory, renamed over the
/// target only once `write` succeeded.
pub(crate) fn write_atomically<F>(
    path: &Path,
    compression: Option<Compression>,
    member_name: &str,
    write: F,
) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let staged = NamedTempFile::new_in(dir)?;
    let file = staged.as_file().try_clone()?;
    let mut writer = CompressedWriter::new(BufWriter::new(file), compression, member_name)?;
    write(&mut writer)?;
    writer
        .finish()?
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?
        .sync_all()?;
    staged.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Name of the member inside a zip output: the output name minus `.zip`.
pub(crate) fn member_name(path: &Path) -> String {
    crate::compression::remove_compression_extension(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vocab_path() {
        assert_eq!(
            default_vocab_path(Path::new("/data/glove.6B.50d.txt.gz")),
            PathBuf::from("/data/glove_vocab.txt")
        );
    }

    #[test]
    fn test_filter_closes_reader_on_error() {
        use crate::reader::{tests::VecSource, Release};

        let reader = Reader::new(
            Box::new(VecSource::new(&[("a", vec![1.0]), ("b", vec![2.0])])),
            DType::F32,
        );
        let mut filter = Filter {
            reader,
            predicate: |_: &str| true,
            done: false,
        };
        filter.reader.resource().release();
        assert!(matches!(filter.next(), Some(Err(Error::IllegalState(_)))));
        assert!(filter.reader.is_closed());
        assert!(filter.next().is_none());
    }

    #[test]
    fn test_filter_closes_reader_on_bad_record() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.txt");
        std::fs::write(&path, "a 1 2\nb 3\n").unwrap();
        let mut file = crate::formats::TextEmbFile::open(&path, &OpenOptions::default()).unwrap();
        let mut filter = file.filter(|_| true).unwrap();
        assert!(filter.next().unwrap().is_ok());
        assert!(matches!(filter.next(), Some(Err(Error::BadFile(_)))));
        assert!(filter.reader.is_closed());
        assert!(filter.next().is_none());
    }

    #[test]
    fn test_pair_checker() {
        let mut checker = PairChecker::new(&[' ', '\n']);
        assert!(checker.vector_size().is_err());
        checker.check(&WordVector::new("a", vec![1.0, 2.0])).unwrap();
        checker.check(&WordVector::new("b", vec![3.0, 4.0])).unwrap();
        assert_eq!(checker.count(), 2);
        assert_eq!(checker.vector_size().unwrap(), 2);

        let err = checker.check(&WordVector::new("c", vec![1.0])).unwrap_err();
        assert!(err.to_string().contains("index 2"));
        let err = checker.check(&WordVector::new("two words", vec![1.0, 2.0])).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn test_declared_vocab_size() {
        let pairs = vec![Ok::<_, Error>(WordVector::new("a", vec![1.0]))];
        let iter = pairs.into_iter();
        assert_eq!(declared_vocab_size(&CreateOptions::default(), &iter), Some(1));
        let options = CreateOptions::default().with_vocab_size(7);
        assert_eq!(declared_vocab_size(&options, &iter), Some(7));
        let unsized_iter = std::iter::from_fn(|| None::<Result<WordVector>>);
        assert_eq!(declared_vocab_size(&CreateOptions::default(), &unsized_iter), None);
    }

    #[test]
    fn test_write_atomically() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out.txt");
        let err = write_atomically(&path, None, "", |out| {
            out.write_all(b"partial")?;
            Err(Error::Argument("stop".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(!path.exists());

        write_atomically(&path, None, "", |out| Ok(out.write_all(b"done")?)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"done");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }
}
