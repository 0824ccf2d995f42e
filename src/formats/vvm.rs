//! VVM: a tar archive holding the vocabulary, the vectors and their metadata.
//!
//! - `vocab.txt`: one word per line, in the declared encoding
//! - `vectors.bin`: raw vectors concatenated in vocabulary order
//! - `meta.json`: `vocab_size`, `vector_size`, `dtype` and `encoding`
//!
//! The vocabulary is loaded in memory when the file is opened. Vectors stay on
//! disk and are read by offset, so any vector can be fetched directly.

use crate::compression::{open_seekable, Compression, SeekableFile};
use crate::encoding::TextEncoding;
use crate::error::{Error, Result};
use crate::file::{
    check_output_path, declared_vocab_size, member_name, warn_if_wrong_vocab_size,
    write_atomically, CreateOptions, EmbFile, FileCore, OpenOptions, PairChecker,
};
use crate::loader::{RandomAccessLoader, VectorsLoader, WordLookup};
use crate::progress;
use crate::reader::{Reader, RecordSource};
use crate::types::{DType, Vector, WordVector};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Format identifier.
pub const FORMAT_ID: &str = "vvm";
/// Extension given to new VVM files.
pub const DEFAULT_EXTENSION: &str = ".vvm";

pub const VOCAB_FILENAME: &str = "vocab.txt";
pub const VECTORS_FILENAME: &str = "vectors.bin";
pub const META_FILENAME: &str = "meta.json";

const FORBIDDEN_IN_WORDS: &[char] = &['\n'];

/// Content of `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VvmMeta {
    pub vocab_size: usize,
    pub vector_size: usize,
    /// Numpy-style descriptor, e.g. `"<f4"`.
    pub dtype: String,
    pub encoding: String,
}

/// Words in file order, plus the reverse index.
struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, usize>,
}

impl Vocabulary {
    fn parse(bytes: &[u8], encoding: TextEncoding) -> Result<Self> {
        let text = encoding
            .decode(bytes)
            .map_err(|e| Error::BadFile(format!("{}: {}", VOCAB_FILENAME, e)))?;
        let words: Vec<String> = match text.strip_suffix('\n') {
            Some(body) => body.split('\n').map(str::to_string).collect(),
            None if text.is_empty() => Vec::new(),
            None => text.split('\n').map(str::to_string).collect(),
        };

        let mut index = HashMap::with_capacity(words.len());
        for (i, word) in words.iter().enumerate() {
            if index.insert(word.clone(), i).is_some() {
                return Err(Error::BadFile(format!(
                    "the word {:?} appears more than once in {}",
                    word, VOCAB_FILENAME
                )));
            }
        }
        Ok(Self { words, index })
    }
}

/// Location of a member's data inside the (uncompressed) archive.
#[derive(Debug, Clone, Copy)]
struct Member {
    offset: u64,
    size: u64,
}

/// Geometry of the vectors member, shared by everything reading it.
#[derive(Clone)]
struct VectorsTable {
    storage: Arc<SeekableFile>,
    offset: u64,
    dtype: DType,
    vector_bytes: usize,
}

impl VectorsTable {
    fn open(&self) -> Result<File> {
        let mut file = self.storage.open()?;
        file.seek(SeekFrom::Start(self.offset))?;
        Ok(file)
    }

    fn read_next(&self, input: &mut impl Read) -> Result<Vector> {
        let mut buf = vec![0u8; self.vector_bytes];
        input.read_exact(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => {
                Error::BadFile(format!("{} is truncated", VECTORS_FILENAME))
            }
            _ => Error::Io(e),
        })?;
        Ok(self.dtype.decode(&buf))
    }
}

/// Sequential access: words from the vocabulary, vectors read in order.
struct VvmSource {
    vocab: Arc<Vocabulary>,
    table: VectorsTable,
    input: BufReader<File>,
    next: usize,
}

impl RecordSource for VvmSource {
    fn read_word(&mut self) -> Result<Option<String>> {
        let word = self.vocab.words.get(self.next).cloned();
        if word.is_some() {
            self.next += 1;
        }
        Ok(word)
    }

    fn read_vector(&mut self) -> Result<Vector> {
        self.table.read_next(&mut self.input)
    }

    fn skip_vector(&mut self) -> Result<()> {
        self.input.seek_relative(self.table.vector_bytes as i64)?;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        self.next = 0;
        self.input.seek(SeekFrom::Start(self.table.offset))?;
        Ok(())
    }
}

/// Random access: word to index, then index to vector.
struct VectorLookup {
    vocab: Arc<Vocabulary>,
    table: VectorsTable,
    file: File,
    out_dtype: DType,
}

impl VectorLookup {
    fn vector_at(&mut self, index: usize) -> Result<Vector> {
        let offset = self.table.offset + (index * self.table.vector_bytes) as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut vector = self.table.read_next(&mut self.file)?;
        self.out_dtype.quantize_all(&mut vector);
        Ok(vector)
    }
}

impl WordLookup for VectorLookup {
    fn contains(&self, word: &str) -> bool {
        self.vocab.index.contains_key(word)
    }

    fn vector(&mut self, word: &str) -> Result<Vector> {
        match self.vocab.index.get(word) {
            Some(&index) => self.vector_at(index),
            None => Err(Error::missing([&word.to_string()])),
        }
    }
}

/// A VVM file.
pub struct VvmEmbFile {
    core: FileCore,
    meta: VvmMeta,
    encoding: TextEncoding,
    vocab: Arc<Vocabulary>,
    table: VectorsTable,
    /// Used by the direct access methods. Dropped on close.
    lookup: Option<VectorLookup>,
}

/// Locate the vectors member and read the two small ones.
fn read_members(storage: &SeekableFile, path: &Path) -> Result<(Member, Vec<u8>, Vec<u8>)> {
    let not_vvm = |e: io::Error| {
        Error::BadFile(format!("not a valid vvm file: {}: {}", path.display(), e))
    };
    let mut archive = tar::Archive::new(storage.open()?);
    let mut vectors = None;
    let mut meta = None;
    let mut vocab = None;
    for entry in archive.entries_with_seek().map_err(not_vvm)? {
        let mut entry = entry.map_err(not_vvm)?;
        let name = entry.path().map_err(not_vvm)?.to_string_lossy().into_owned();
        let member = Member {
            offset: entry.raw_file_position(),
            size: entry.size(),
        };
        if name == META_FILENAME || name == VOCAB_FILENAME {
            let mut data = Vec::with_capacity(member.size as usize);
            entry.read_to_end(&mut data).map_err(not_vvm)?;
            if name == META_FILENAME {
                meta = Some(data);
            } else {
                vocab = Some(data);
            }
        } else if name == VECTORS_FILENAME {
            vectors = Some(member);
        }
    }

    let missing = |name: &str| {
        Error::BadFile(format!(
            "missing file inside the archive {}: {}",
            path.display(),
            name
        ))
    };
    let meta = meta.ok_or_else(|| missing(META_FILENAME))?;
    let vocab = vocab.ok_or_else(|| missing(VOCAB_FILENAME))?;
    let vectors = vectors.ok_or_else(|| missing(VECTORS_FILENAME))?;
    Ok((vectors, meta, vocab))
}

impl VvmEmbFile {
    /// Open a VVM file, compressed or not. Encoding and dtype come from
    /// `meta.json`; only `out_dtype` and `verbose` are taken from `options`.
    pub fn open(path: &Path, options: &OpenOptions) -> Result<Self> {
        let storage = Arc::new(open_seekable(path)?);
        let (vectors, meta_bytes, vocab_bytes) = read_members(&storage, path)?;

        let meta: VvmMeta = serde_json::from_slice(&meta_bytes)?;
        let dtype: DType = meta.dtype.parse()?;
        let encoding: TextEncoding = meta.encoding.parse()?;
        let vocab = Vocabulary::parse(&vocab_bytes, encoding)?;
        if vocab.words.len() != meta.vocab_size {
            return Err(Error::BadFile(format!(
                "{} declares {} words but {} has {}",
                META_FILENAME,
                meta.vocab_size,
                VOCAB_FILENAME,
                vocab.words.len()
            )));
        }

        let vector_bytes = dtype.vector_bytes(meta.vector_size);
        let expected = (vector_bytes * meta.vocab_size) as u64;
        if vectors.size != expected {
            return Err(Error::BadFile(format!(
                "{} has {} bytes, expected {} ({} vectors of {} bytes)",
                VECTORS_FILENAME, vectors.size, expected, meta.vocab_size, vector_bytes
            )));
        }

        debug!(
            "Opened VVM file {} (vocab_size: {}, vector_size: {}, dtype: {}, encoding: {})",
            path.display(),
            meta.vocab_size,
            meta.vector_size,
            dtype,
            encoding
        );

        let out_dtype = options.out_dtype.unwrap_or(dtype);
        let vocab = Arc::new(vocab);
        let table = VectorsTable {
            storage,
            offset: vectors.offset,
            dtype,
            vector_bytes,
        };
        let lookup = VectorLookup {
            vocab: vocab.clone(),
            file: table.storage.open()?,
            table: table.clone(),
            out_dtype,
        };
        Ok(Self {
            core: FileCore::new(path, out_dtype, options.verbose),
            meta,
            encoding,
            vocab,
            table,
            lookup: Some(lookup),
        })
    }

    /// Content of `meta.json`.
    pub fn meta(&self) -> &VvmMeta {
        &self.meta
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Element type stored in `vectors.bin`.
    pub fn dtype(&self) -> DType {
        self.table.dtype
    }

    /// Index of a word in the file.
    pub fn index_of(&self, word: &str) -> Option<usize> {
        self.vocab.index.get(word).copied()
    }

    /// True if the file has a vector for `word`.
    pub fn contains(&self, word: &str) -> bool {
        self.vocab.index.contains_key(word)
    }

    /// Vector of a word, read directly from the file.
    pub fn vector(&mut self, word: &str) -> Result<Vector> {
        self.direct_lookup()?.vector(word)
    }

    /// Vector at a position in the file. Negative indices count from the end.
    pub fn vector_at(&mut self, index: i64) -> Result<Vector> {
        let len = self.vocab.words.len();
        let resolved = if index < 0 {
            index + len as i64
        } else {
            index
        };
        if resolved < 0 || resolved >= len as i64 {
            return Err(Error::IndexOutOfRange { index, len });
        }
        self.direct_lookup()?.vector_at(resolved as usize)
    }

    fn direct_lookup(&mut self) -> Result<&mut VectorLookup> {
        self.core.check_open()?;
        self.lookup.as_mut().ok_or_else(|| Error::closed("file"))
    }
}

impl EmbFile for VvmEmbFile {
    fn path(&self) -> &Path {
        &self.core.path
    }

    fn vocab_size(&self) -> Option<usize> {
        Some(self.meta.vocab_size)
    }

    fn vector_size(&self) -> usize {
        self.meta.vector_size
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
        let source = VvmSource {
            vocab: self.vocab.clone(),
            input: BufReader::new(self.table.open()?),
            table: self.table.clone(),
            next: 0,
        };
        Ok(self.core.track_reader(Box::new(source)))
    }

    fn loader(
        &mut self,
        words: HashSet<String>,
        missing_ok: bool,
    ) -> Result<Box<dyn VectorsLoader>> {
        self.core.check_open()?;
        let lookup = VectorLookup {
            vocab: self.vocab.clone(),
            file: self.table.storage.open()?,
            table: self.table.clone(),
            out_dtype: self.core.out_dtype,
        };
        let vocab = self.vocab.clone();
        let position = move |word: &str| vocab.index.get(word).copied().unwrap_or(usize::MAX);
        let path = self.core.path.clone();
        let loader = RandomAccessLoader::new(
            words,
            Box::new(lookup),
            Some(&position),
            missing_ok,
            self.core.verbose,
        )?
        .with_close_hook(Box::new(move || {
            debug!("Released the vectors of {}", path.display())
        }));
        self.core.track(loader.resource());
        Ok(Box::new(loader))
    }

    fn close(&mut self) {
        self.lookup = None;
        self.core.close();
    }
}

impl fmt::Display for VvmEmbFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core.describe(
            f,
            "VvmEmbFile",
            Some(self.meta.vocab_size),
            self.meta.vector_size,
        )
    }
}

/// Write pairs as a VVM file with elements of `options.dtype` (default `<f4`).
///
/// gzip, bzip2 and xz compress the tar stream itself. Zip is accepted but
/// only wraps the archive.
pub fn create(
    path: &Path,
    pairs: &mut dyn Iterator<Item = Result<WordVector>>,
    options: &CreateOptions,
) -> Result<()> {
    check_output_path(path, options.overwrite)?;
    let declared = declared_vocab_size(options, pairs);
    let encoding = options.encoding;
    let dtype = options.dtype.unwrap_or_default();

    let staging = TempDir::new()?;
    let vocab_path = staging.path().join(VOCAB_FILENAME);
    let vectors_path = staging.path().join(VECTORS_FILENAME);
    let meta_path = staging.path().join(META_FILENAME);

    let mut checker = PairChecker::new(FORBIDDEN_IN_WORDS);
    {
        let mut vocab_out = BufWriter::new(File::create(&vocab_path)?);
        let mut vectors_out = BufWriter::new(File::create(&vectors_path)?);
        let bar = progress::bar(
            options.verbose,
            declared.map(|n| n as u64),
            "Generating vocab.txt and vectors.bin",
        );
        let mut buf = Vec::new();
        for pair in pairs {
            let pair = pair?;
            checker.check(&pair)?;
            buf.clear();
            encoding.encode_into(&pair.word, &mut buf)?;
            encoding.encode_into("\n", &mut buf)?;
            vocab_out.write_all(&buf)?;
            buf.clear();
            dtype.encode_into(&pair.vector, &mut buf);
            vectors_out.write_all(&buf)?;
            bar.inc(1);
        }
        bar.finish_and_clear();
        vocab_out.flush()?;
        vectors_out.flush()?;
    }
    let vector_size = checker.vector_size()?;
    let vocab_size = checker.count();
    warn_if_wrong_vocab_size(declared, vocab_size);

    let meta = VvmMeta {
        vocab_size,
        vector_size,
        dtype: dtype.to_string(),
        encoding: encoding.name().to_string(),
    };
    std::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;

    if options.compression == Some(Compression::Zip) {
        warn!(
            "Zip wraps the tar archive of {} in a second archive; gz, bz2 and xz compress \
             the tar stream directly",
            path.display()
        );
    }
    write_atomically(path, options.compression, &member_name(path), |out| {
        let mut builder = tar::Builder::new(out);
        builder.append_path_with_name(&vocab_path, VOCAB_FILENAME)?;
        builder.append_path_with_name(&vectors_path, VECTORS_FILENAME)?;
        builder.append_path_with_name(&meta_path, META_FILENAME)?;
        builder.into_inner()?;
        Ok(())
    })?;
    debug!(
        "Created VVM file {} with {} words ({})",
        path.display(),
        vocab_size,
        dtype
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::EmbFileExt;

    fn pairs() -> Vec<WordVector> {
        vec![
            WordVector::new("zeta", vec![0.0, 0.5]),
            WordVector::new("alpha", vec![1.0, 1.5]),
            WordVector::new("mid word", vec![2.0, 2.5]),
            WordVector::new("ünï", vec![3.0, 3.5]),
        ]
    }

    fn create_vvm(dir: &Path, name: &str, options: &CreateOptions) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut iter = pairs().into_iter().map(Ok::<_, Error>);
        create(&path, &mut iter, options).unwrap();
        path
    }

    #[test]
    fn test_round_trip_and_meta() {
        let tmp = TempDir::new().unwrap();
        let options = CreateOptions::default()
            .with_encoding(TextEncoding::Utf16Le)
            .with_dtype(DType::F64);
        let path = create_vvm(tmp.path(), "v.vvm", &options);

        let mut file = VvmEmbFile::open(&path, &OpenOptions::default()).unwrap();
        assert_eq!(
            file.meta(),
            &VvmMeta {
                vocab_size: 4,
                vector_size: 2,
                dtype: "<f8".to_string(),
                encoding: "utf-16-le".to_string(),
            }
        );
        assert_eq!(file.out_dtype(), DType::F64);
        assert_eq!(file.to_list().unwrap(), pairs());
    }

    #[test]
    fn test_direct_access() {
        let tmp = TempDir::new().unwrap();
        let path = create_vvm(tmp.path(), "v.vvm", &CreateOptions::default());
        let mut file = VvmEmbFile::open(&path, &OpenOptions::default()).unwrap();

        assert!(file.contains("mid word"));
        assert!(!file.contains("nope"));
        assert_eq!(file.index_of("alpha"), Some(1));
        assert_eq!(file.vector("ünï").unwrap(), vec![3.0, 3.5]);
        assert_eq!(file.vector_at(0).unwrap(), vec![0.0, 0.5]);
        assert_eq!(file.vector_at(-1).unwrap(), vec![3.0, 3.5]);
        assert!(matches!(
            file.vector_at(4),
            Err(Error::IndexOutOfRange { index: 4, len: 4 })
        ));
        assert!(matches!(
            file.vector_at(-5),
            Err(Error::IndexOutOfRange { index: -5, .. })
        ));
        assert!(matches!(file.vector("nope"), Err(Error::KeyNotFound { .. })));

        file.close();
        assert!(matches!(file.vector("alpha"), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_loader_in_file_order() {
        let tmp = TempDir::new().unwrap();
        let path = create_vvm(tmp.path(), "v.vvm", &CreateOptions::default());
        let mut file = VvmEmbFile::open(&path, &OpenOptions::default()).unwrap();

        let words: HashSet<String> = ["ünï", "zeta", "missing"]
            .iter()
            .map(|w| w.to_string())
            .collect();
        let mut loader = file.loader(words, true).unwrap();
        assert_eq!(loader.missing_words().len(), 1);
        let order: Vec<String> = loader.by_ref().map(|r| r.unwrap().word).collect();
        assert_eq!(order, vec!["zeta", "ünï"]);
    }

    #[test]
    fn test_compressed() {
        let tmp = TempDir::new().unwrap();
        for compression in [Compression::Gzip, Compression::Xz, Compression::Zip] {
            let name = format!("v.vvm{}", compression.extension());
            let options = CreateOptions::default().with_compression(compression);
            let path = create_vvm(tmp.path(), &name, &options);
            let mut file = VvmEmbFile::open(&path, &OpenOptions::default()).unwrap();
            assert_eq!(file.to_list().unwrap(), pairs());
            assert_eq!(file.vector("alpha").unwrap(), vec![1.0, 1.5]);
        }
    }

    #[test]
    fn test_skip_vectors() {
        let tmp = TempDir::new().unwrap();
        let path = create_vvm(tmp.path(), "v.vvm", &CreateOptions::default());
        let mut file = VvmEmbFile::open(&path, &OpenOptions::default()).unwrap();
        let mut reader = file.reader().unwrap();
        reader.next_word().unwrap();
        reader.next_word().unwrap();
        assert_eq!(reader.next_word().unwrap().as_deref(), Some("mid word"));
        assert_eq!(reader.current_vector().unwrap(), &[2.0, 2.5]);
        reader.reset().unwrap();
        reader.next_word().unwrap();
        assert_eq!(reader.current_vector().unwrap(), &[0.0, 0.5]);
    }

    #[test]
    fn test_newline_in_word() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.vvm");
        let mut iter = vec![Ok::<_, Error>(WordVector::new("two\nlines", vec![1.0]))].into_iter();
        let err = create(&path, &mut iter, &CreateOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_not_a_tar() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fake.vvm");
        std::fs::write(&path, b"definitely not a tar archive").unwrap();
        assert!(VvmEmbFile::open(&path, &OpenOptions::default()).is_err());
    }

    #[test]
    fn test_vocabulary_parse() {
        let vocab = Vocabulary::parse(b"a\nb\n", TextEncoding::Utf8).unwrap();
        assert_eq!(vocab.words, vec!["a", "b"]);
        assert!(Vocabulary::parse(b"", TextEncoding::Utf8).unwrap().words.is_empty());
        assert!(matches!(
            Vocabulary::parse(b"a\na\n", TextEncoding::Utf8),
            Err(Error::BadFile(_))
        ));
    }
}
