//! Format registry: maps format ids and file extensions to the functions that
//! open and create files of each format.

use crate::compression::remove_compression_extension;
use crate::error::{Error, Result};
use crate::file::{CreateOptions, EmbFile, EmbFileExt, OpenOptions};
use crate::formats::{binary, text, vvm, BinaryEmbFile, TextEmbFile, VvmEmbFile};
use crate::types::WordVector;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Opens a file of a given format.
pub type OpenFn = fn(&Path, &OpenOptions) -> Result<Box<dyn EmbFile>>;

/// Writes pairs as a file of a given format.
pub type CreateFn =
    fn(&Path, &mut dyn Iterator<Item = Result<WordVector>>, &CreateOptions) -> Result<()>;

/// Everything the registry knows about a format.
#[derive(Clone, Copy)]
pub struct FormatSpec {
    pub id: &'static str,
    pub open: OpenFn,
    pub create: CreateFn,
    /// Extension given to new files, with the leading dot.
    pub default_extension: &'static str,
}

impl fmt::Debug for FormatSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatSpec")
            .field("id", &self.id)
            .field("default_extension", &self.default_extension)
            .finish_non_exhaustive()
    }
}

fn open_binary(path: &Path, options: &OpenOptions) -> Result<Box<dyn EmbFile>> {
    Ok(Box::new(BinaryEmbFile::open(path, options)?))
}

fn open_text(path: &Path, options: &OpenOptions) -> Result<Box<dyn EmbFile>> {
    Ok(Box::new(TextEmbFile::open(path, options)?))
}

fn open_vvm(path: &Path, options: &OpenOptions) -> Result<Box<dyn EmbFile>> {
    Ok(Box::new(VvmEmbFile::open(path, options)?))
}

impl FormatSpec {
    /// The word2vec binary format.
    pub fn binary() -> Self {
        Self {
            id: binary::FORMAT_ID,
            open: open_binary,
            create: binary::create,
            default_extension: binary::DEFAULT_EXTENSION,
        }
    }

    /// The text format (GloVe, fastText).
    pub fn text() -> Self {
        Self {
            id: text::FORMAT_ID,
            open: open_text,
            create: text::create,
            default_extension: text::DEFAULT_EXTENSION,
        }
    }

    pub fn vvm() -> Self {
        Self {
            id: vvm::FORMAT_ID,
            open: open_vvm,
            create: vvm::create,
            default_extension: vvm::DEFAULT_EXTENSION,
        }
    }
}

/// Formats by id, and the extensions bound to each of them.
///
/// The [`Default`] registry knows `bin` (`.bin`), `txt` (`.txt`, `.vec`) and
/// `vvm` (`.vvm`).
#[derive(Debug, Clone)]
pub struct FormatRegistry {
    /// In registration order.
    formats: Vec<FormatSpec>,
    /// (extension, format id), in association order.
    extensions: Vec<(String, &'static str)>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let defaults = [
            (FormatSpec::binary(), &[".bin"][..]),
            (FormatSpec::text(), &[".txt", ".vec"][..]),
            (FormatSpec::vvm(), &[".vvm"][..]),
        ];
        for (spec, extensions) in defaults {
            registry.formats.push(spec);
            for ext in extensions {
                registry.extensions.push((ext.to_string(), spec.id));
            }
        }
        registry
    }
}

impl FormatRegistry {
    /// A registry with no format.
    pub fn empty() -> Self {
        Self {
            formats: Vec::new(),
            extensions: Vec::new(),
        }
    }

    /// Register a format and bind `extensions` to it.
    ///
    /// Fails if the id is taken, unless `overwrite`: the new spec then replaces
    /// the old one, whose extensions are unbound.
    pub fn register(
        &mut self,
        spec: FormatSpec,
        extensions: &[&str],
        overwrite: bool,
    ) -> Result<()> {
        match self.formats.iter().position(|f| f.id == spec.id) {
            Some(_) if !overwrite => {
                return Err(Error::Argument(format!(
                    "the format id {:?} is already registered",
                    spec.id
                )))
            }
            Some(i) => {
                debug!("Replacing the format {:?}", spec.id);
                self.extensions.retain(|(_, id)| *id != spec.id);
                self.formats[i] = spec;
            }
            None => self.formats.push(spec),
        }
        for ext in extensions {
            self.associate_extension(ext, spec.id, overwrite)?;
        }
        Ok(())
    }

    /// Bind an extension (with its leading dot) to a registered format.
    ///
    /// Fails if the extension is bound to a format already, unless
    /// `overwrite`, which moves it.
    pub fn associate_extension(
        &mut self,
        ext: &str,
        format_id: &str,
        overwrite: bool,
    ) -> Result<()> {
        if !ext.starts_with('.') {
            return Err(Error::Argument(format!(
                "extensions must start with a dot; invalid: {:?}",
                ext
            )));
        }
        let id = self.resolve_by_id(format_id)?.id;

        if let Some(i) = self.extensions.iter().position(|(e, _)| e == ext) {
            if !overwrite {
                return Err(Error::Argument(format!(
                    "the extension {:?} is already associated to the format {:?}",
                    ext, self.extensions[i].1
                )));
            }
            self.extensions.remove(i);
        }
        self.extensions.push((ext.to_string(), id));
        Ok(())
    }

    /// Registered format ids, in registration order.
    pub fn format_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.formats.iter().map(|f| f.id)
    }

    /// Bound extensions, in association order.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(|(ext, _)| ext.as_str())
    }

    /// Extensions bound to a format.
    pub fn extensions_of<'a>(&'a self, format_id: &'a str) -> impl Iterator<Item = &'a str> {
        self.extensions
            .iter()
            .filter(move |(_, id)| *id == format_id)
            .map(|(ext, _)| ext.as_str())
    }

    pub fn resolve_by_id(&self, format_id: &str) -> Result<&FormatSpec> {
        self.formats
            .iter()
            .find(|f| f.id == format_id)
            .ok_or_else(|| {
                Error::Argument(format!(
                    "unknown format {:?}; known formats are: {}",
                    format_id,
                    self.format_ids().collect::<Vec<_>>().join(", ")
                ))
            })
    }

    pub fn resolve_by_extension(&self, ext: &str) -> Result<&FormatSpec> {
        let id = self
            .extensions
            .iter()
            .find(|(e, _)| e == ext)
            .map(|(_, id)| *id)
            .ok_or_else(|| {
                Error::Argument(format!(
                    "unknown file extension {:?}; supported extensions are: {}. If the format is \
                     supported, pass its format id or associate the extension to it",
                    ext,
                    self.extensions().collect::<Vec<_>>().join(", ")
                ))
            })?;
        self.resolve_by_id(id)
    }

    /// Format of a path, from its last extension once a compression extension
    /// is removed (`vectors.txt.gz` is a `txt` file).
    pub fn resolve_path(&self, path: &Path) -> Result<&FormatSpec> {
        let stripped = remove_compression_extension(path);
        match stripped.extension() {
            Some(ext) => self.resolve_by_extension(&format!(".{}", ext.to_string_lossy())),
            None => Err(Error::Argument(format!(
                "can't infer the format of {}: the file has no extension; pass a format id",
                path.display()
            ))),
        }
    }

    /// Open a file of the format `format_id`, or of the format inferred from
    /// its extension.
    pub fn open(
        &self,
        path: &Path,
        format_id: Option<&str>,
        options: &OpenOptions,
    ) -> Result<Box<dyn EmbFile>> {
        let spec = match format_id {
            Some(id) => self.resolve_by_id(id)?,
            None => self.resolve_path(path)?,
        };
        if !path.exists() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        (spec.open)(path, options)
    }

    /// Write pairs to `path` in the format `format_id`.
    pub fn create(
        &self,
        format_id: &str,
        path: &Path,
        pairs: &mut dyn Iterator<Item = Result<WordVector>>,
        options: &CreateOptions,
    ) -> Result<()> {
        let spec = self.resolve_by_id(format_id)?;
        (spec.create)(path, pairs, options)
    }

    /// Copy the content of `source` into a new file of format `format_id`.
    /// See [`create_from_file`].
    pub fn copy_file(
        &self,
        source: &mut dyn EmbFile,
        format_id: &str,
        out_dir: Option<&Path>,
        out_filename: Option<&str>,
        options: &CreateOptions,
    ) -> Result<PathBuf> {
        let spec = self.resolve_by_id(format_id)?;
        create_from_file(source, spec, out_dir, out_filename, options)
    }
}

impl fmt::Display for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const HEADERS: [&str; 3] = ["Format ID", "Extensions", "Default extension"];
        let rows: Vec<[String; 3]> = self
            .formats
            .iter()
            .map(|spec| {
                [
                    spec.id.to_string(),
                    self.extensions_of(spec.id).collect::<Vec<_>>().join(", "),
                    spec.default_extension.to_string(),
                ]
            })
            .collect();

        let mut widths = HEADERS.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        write_row(f, &HEADERS, &widths)?;
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        write_row(f, &rule, &widths)?;
        for row in &rows {
            write_row(f, row, &widths)?;
        }
        Ok(())
    }
}

fn write_row<S: AsRef<str>>(
    f: &mut fmt::Formatter<'_>,
    cells: &[S],
    widths: &[usize],
) -> fmt::Result {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell.as_ref(), width = width))
        .collect::<Vec<_>>()
        .join("  ");
    writeln!(f, "{}", line.trim_end())
}

/// Write the content of `source` as a new file of the format `spec`.
///
/// The file goes to `out_dir` (default: the directory of `source`) and is named
/// `out_filename`, or else after the source: compression extension removed,
/// then the last extension replaced by the format's default one, plus the
/// compression's. The declared vocab size defaults to the source's.
pub fn create_from_file(
    source: &mut dyn EmbFile,
    spec: &FormatSpec,
    out_dir: Option<&Path>,
    out_filename: Option<&str>,
    options: &CreateOptions,
) -> Result<PathBuf> {
    let out_dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => source
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    let filename = match out_filename {
        Some(name) => PathBuf::from(name),
        None => {
            let mut extension = spec.default_extension.trim_start_matches('.').to_string();
            if let Some(compression) = options.compression {
                extension.push_str(compression.extension());
            }
            let base = remove_compression_extension(source.path()).with_extension(extension);
            base.file_name().map(PathBuf::from).unwrap_or_default()
        }
    };
    let out_path = out_dir.join(filename);

    let mut options = options.clone();
    if options.vocab_size.is_none() {
        options.vocab_size = source.vocab_size();
    }
    debug!(
        "Copying {} ({}) to {} ({})",
        source.path().display(),
        source.format_id(),
        out_path.display(),
        spec.id
    );
    let mut pairs = source.word_vectors()?;
    (spec.create)(&out_path, &mut pairs, &options)?;
    Ok(out_path)
}

/// Open a file, inferring its format from its extension.
///
/// ```no_run
/// use embfile::EmbFileExt;
///
/// # fn main() -> embfile::Result<()> {
/// let mut file = embfile::open("glove.6B.50d.txt.gz")?;
/// let found = file.find(["hello", "world"])?;
/// println!("{} words are missing", found.missing_words.len());
/// # Ok(())
/// # }
/// ```
pub fn open(path: impl AsRef<Path>) -> Result<Box<dyn EmbFile>> {
    open_with(path, None, &OpenOptions::default())
}

/// Open a file with explicit options, and optionally an explicit format id.
pub fn open_with(
    path: impl AsRef<Path>,
    format_id: Option<&str>,
    options: &OpenOptions,
) -> Result<Box<dyn EmbFile>> {
    FormatRegistry::default().open(path.as_ref(), format_id, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_registry() {
        let registry = FormatRegistry::default();
        assert_eq!(registry.format_ids().collect::<Vec<_>>(), vec!["bin", "txt", "vvm"]);
        assert_eq!(
            registry.extensions_of("txt").collect::<Vec<_>>(),
            vec![".txt", ".vec"]
        );
        assert_eq!(registry.resolve_by_extension(".vec").unwrap().id, "txt");
        assert!(registry.resolve_by_id("nope").is_err());
    }

    #[test]
    fn test_resolve_path() {
        let registry = FormatRegistry::default();
        let id = |p: &str| registry.resolve_path(Path::new(p)).map(|spec| spec.id);
        assert_eq!(id("a/glove.6B.50d.txt").unwrap(), "txt");
        assert_eq!(id("file.txt.gz").unwrap(), "txt");
        assert_eq!(id("file.bin.bz2").unwrap(), "bin");
        assert_eq!(id("file.vvm.lzma").unwrap(), "vvm");
        assert!(matches!(id("file.gz"), Err(Error::Argument(_))));
        assert!(matches!(id("noext"), Err(Error::Argument(_))));

        let err = id("file.csv").unwrap_err().to_string();
        assert!(err.contains(".csv"));
        assert!(err.contains(".bin, .txt, .vec, .vvm"));
    }

    #[test]
    fn test_register_and_overwrite() {
        let mut registry = FormatRegistry::default();
        let custom = FormatSpec {
            id: "txt",
            ..FormatSpec::text()
        };
        assert!(registry.register(custom, &[".emb"], false).is_err());

        registry.register(custom, &[".emb"], true).unwrap();
        assert_eq!(registry.extensions_of("txt").collect::<Vec<_>>(), vec![".emb"]);
        assert!(registry.resolve_by_extension(".vec").is_err());
        assert_eq!(registry.format_ids().count(), 3);
    }

    #[test]
    fn test_associate_extension() {
        let mut registry = FormatRegistry::default();
        assert!(registry.associate_extension("w2v", "bin", false).is_err());
        assert!(registry.associate_extension(".w2v", "nope", false).is_err());
        registry.associate_extension(".w2v", "bin", false).unwrap();
        assert_eq!(registry.resolve_by_extension(".w2v").unwrap().id, "bin");

        assert!(registry.associate_extension(".vec", "bin", false).is_err());
        registry.associate_extension(".vec", "bin", true).unwrap();
        assert_eq!(registry.resolve_by_extension(".vec").unwrap().id, "bin");
        assert_eq!(registry.extensions_of("txt").collect::<Vec<_>>(), vec![".txt"]);
    }

    #[test]
    fn test_display() {
        let table = FormatRegistry::default().to_string();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "Format ID  Extensions  Default extension");
        assert_eq!(lines[1], "---------  ----------  -----------------");
        assert_eq!(lines[3], "txt        .txt, .vec  .txt");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_open_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = open(tmp.path().join("nothing.txt")).err().unwrap();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn test_copy_file_naming() {
        let tmp = TempDir::new().unwrap();
        let registry = FormatRegistry::default();
        let source_path = tmp.path().join("glove.50d.txt.gz");
        let pairs = vec![
            WordVector::new("a", vec![1.0, 2.0]),
            WordVector::new("b", vec![3.0, 4.0]),
        ];
        let options = CreateOptions::default()
            .with_compression(crate::compression::Compression::Gzip);
        let mut iter = pairs.clone().into_iter().map(Ok::<_, Error>);
        registry.create("txt", &source_path, &mut iter, &options).unwrap();

        let mut source = registry.open(&source_path, None, &OpenOptions::default()).unwrap();
        let copy_options =
            CreateOptions::default().with_compression(crate::compression::Compression::Bzip2);
        let out = registry
            .copy_file(source.as_mut(), "vvm", None, None, &copy_options)
            .unwrap();
        assert_eq!(out, tmp.path().join("glove.50d.vvm.bz2"));

        let mut copy = open(&out).unwrap();
        assert_eq!(copy.format_id(), "vvm");
        assert_eq!(copy.to_list().unwrap(), pairs);

        let named = registry
            .copy_file(
                copy.as_mut(),
                "bin",
                Some(tmp.path()),
                Some("renamed.bin"),
                &CreateOptions::default(),
            )
            .unwrap();
        assert_eq!(named, tmp.path().join("renamed.bin"));
        assert_eq!(open(&named).unwrap().to_list().unwrap(), pairs);
    }
}
