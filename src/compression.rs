//! Compression adapter: reading, writing and extracting gzip, bzip2, xz/lzma
//! and zip files.
//!
//! For reading, the compression is inferred from the file extension
//! ([`open_read`]) or from its magic number ([`sniff`], [`open_seekable`]).

use crate::error::{Error, Result};
use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::{NamedTempFile, TempPath};
use tracing::info;
use xz2::read::XzDecoder;
use xz2::stream::Stream;
use xz2::write::XzEncoder;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const XZ_PRESET: u32 = 6;

/// Supported compression formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
    Zip,
}

impl Compression {
    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Bzip2 => "bz2",
            Compression::Xz => "xz",
            Compression::Zip => "zip",
        }
    }

    /// Default file extension, including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Gzip => ".gz",
            Compression::Bzip2 => ".bz2",
            Compression::Xz => ".xz",
            Compression::Zip => ".zip",
        }
    }

    /// Compression associated to an extension like `".gz"`.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            ".gz" | ".gzip" => Some(Compression::Gzip),
            ".bz2" => Some(Compression::Bzip2),
            ".xz" | ".lzma" => Some(Compression::Xz),
            ".zip" => Some(Compression::Zip),
            _ => None,
        }
    }

    /// Compression implied by the last extension of a path.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Self::from_extension(&format!(".{}", ext))
    }

    /// Identify a compression from the first bytes of a file.
    pub fn from_magic(head: &[u8]) -> Option<Self> {
        if head.starts_with(&[0x1f, 0x8b]) {
            Some(Compression::Gzip)
        } else if head.starts_with(b"BZh") {
            Some(Compression::Bzip2)
        } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00])
            || head.starts_with(&[0x5d, 0x00, 0x00])
        {
            Some(Compression::Xz)
        } else if head.starts_with(b"PK\x03\x04") {
            Some(Compression::Zip)
        } else {
            None
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "gz" | "gzip" => Ok(Compression::Gzip),
            "bz2" | "bzip2" => Ok(Compression::Bzip2),
            "xz" | "lzma" => Ok(Compression::Xz),
            "zip" => Ok(Compression::Zip),
            _ => Err(Error::Argument(format!(
                "unknown compression {:?}; known compressions are: gz, bz2, xz, zip",
                s
            ))),
        }
    }
}

/// Identify the compression of a file from its magic number.
pub fn sniff(path: &Path) -> Result<Option<Compression>> {
    let mut file = open_existing(path)?;
    let mut head = [0u8; 6];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(Compression::from_magic(&head[..filled]))
}

/// Strip one trailing compression extension, if any.
pub fn remove_compression_extension(path: &Path) -> PathBuf {
    match Compression::from_path(path) {
        Some(_) => path.with_extension(""),
        None => path.to_path_buf(),
    }
}

fn open_existing(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
        _ => Error::Io(e),
    })
}

fn zip_error(path: &Path, err: zip::result::ZipError) -> Error {
    Error::BadFile(format!("{}: {}", path.display(), err))
}

fn decoder(compression: Compression, file: File) -> Result<Box<dyn Read + Send>> {
    let input = BufReader::new(file);
    Ok(match compression {
        Compression::Gzip => Box::new(MultiGzDecoder::new(input)),
        Compression::Bzip2 => Box::new(MultiBzDecoder::new(input)),
        Compression::Xz => {
            let stream = Stream::new_auto_decoder(u64::MAX, xz2::stream::CONCATENATED)
                .map_err(|e| Error::BadFile(format!("can't set up the xz decoder: {}", e)))?;
            Box::new(XzDecoder::new_stream(input, stream))
        }
        Compression::Zip => {
            return Err(Error::Argument(
                "zip archives are not streams; extract their member first".to_string(),
            ))
        }
    })
}

/// Name of the only file in a zip archive.
fn single_zip_member<R: Read + Seek>(archive: &mut ZipArchive<R>, path: &Path) -> Result<String> {
    let names: Vec<String> = archive
        .file_names()
        .filter(|name| !name.ends_with('/'))
        .map(str::to_string)
        .collect();
    match names.as_slice() {
        [] => Err(Error::BadFile(format!("empty archive: {}", path.display()))),
        [name] => Ok(name.clone()),
        _ => Err(Error::Argument(format!(
            "the archive {} contains more than one file; a member name is required",
            path.display()
        ))),
    }
}

/// Copy a zip member into `out`.
fn copy_zip_member(path: &Path, member: Option<&str>, out: &mut impl Write) -> Result<u64> {
    let mut archive = ZipArchive::new(open_existing(path)?).map_err(|e| zip_error(path, e))?;
    let name = match member {
        Some(name) => name.to_string(),
        None => single_zip_member(&mut archive, path)?,
    };
    let mut entry = archive.by_name(&name).map_err(|e| zip_error(path, e))?;
    Ok(io::copy(&mut entry, out)?)
}

/// Open a file for reading, decompressing it according to its extension.
///
/// Zip archives must hold exactly one file, which is extracted to an anonymous
/// temp file first.
pub fn open_read(path: &Path) -> Result<Box<dyn Read + Send>> {
    match Compression::from_path(path) {
        None => Ok(Box::new(BufReader::new(open_existing(path)?))),
        Some(Compression::Zip) => {
            let mut staged = tempfile::tempfile()?;
            copy_zip_member(path, None, &mut staged)?;
            staged.seek(SeekFrom::Start(0))?;
            Ok(Box::new(BufReader::new(staged)))
        }
        Some(compression) => decoder(compression, open_existing(path)?),
    }
}

/// A file on disk that can be read with random access. Decompressed copies are
/// deleted when this is dropped.
#[derive(Debug)]
pub struct SeekableFile {
    path: PathBuf,
    staged: Option<TempPath>,
}

impl SeekableFile {
    /// Path of the uncompressed data.
    pub fn path(&self) -> &Path {
        self.staged.as_deref().unwrap_or(self.path.as_path())
    }

    /// True if the data was decompressed into a temp file.
    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Open a new handle to the uncompressed data.
    pub fn open(&self) -> Result<File> {
        Ok(File::open(self.path())?)
    }
}

/// Give random access to a possibly compressed file. The compression is
/// detected from the magic number; compressed files are decompressed once into
/// a temp file.
pub fn open_seekable(path: &Path) -> Result<SeekableFile> {
    let Some(compression) = sniff(path)? else {
        return Ok(SeekableFile {
            path: path.to_path_buf(),
            staged: None,
        });
    };

    let mut staged = NamedTempFile::new()?;
    let written = match compression {
        Compression::Zip => copy_zip_member(path, None, staged.as_file_mut())?,
        _ => io::copy(
            &mut decoder(compression, open_existing(path)?)?,
            staged.as_file_mut(),
        )?,
    };
    staged.as_file_mut().flush()?;
    info!(
        "Decompressed {} ({}, {} bytes) to {}",
        path.display(),
        compression,
        written,
        staged.path().display()
    );
    Ok(SeekableFile {
        path: path.to_path_buf(),
        staged: Some(staged.into_temp_path()),
    })
}

/// A writer compressing into `W`. Zip output holds a single member.
pub enum CompressedWriter<W: Write + Seek> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Bzip2(BzEncoder<W>),
    Xz(XzEncoder<W>),
    Zip(ZipWriter<W>),
}

impl<W: Write + Seek> CompressedWriter<W> {
    /// Wrap `inner`. `member_name` names the zip member; other formats ignore it.
    pub fn new(inner: W, compression: Option<Compression>, member_name: &str) -> Result<Self> {
        Ok(match compression {
            None => CompressedWriter::Plain(inner),
            Some(Compression::Gzip) => {
                CompressedWriter::Gzip(GzEncoder::new(inner, flate2::Compression::default()))
            }
            Some(Compression::Bzip2) => {
                CompressedWriter::Bzip2(BzEncoder::new(inner, bzip2::Compression::default()))
            }
            Some(Compression::Xz) => CompressedWriter::Xz(XzEncoder::new(inner, XZ_PRESET)),
            Some(Compression::Zip) => {
                let mut writer = ZipWriter::new(inner);
                let options =
                    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
                writer
                    .start_file(member_name, options)
                    .map_err(|e| Error::Io(io::Error::other(e)))?;
                CompressedWriter::Zip(writer)
            }
        })
    }

    /// Flush the compressed trailer and return the inner writer.
    pub fn finish(self) -> Result<W> {
        let mut inner = match self {
            CompressedWriter::Plain(w) => w,
            CompressedWriter::Gzip(w) => w.finish()?,
            CompressedWriter::Bzip2(w) => w.finish()?,
            CompressedWriter::Xz(w) => w.finish()?,
            CompressedWriter::Zip(w) => w.finish().map_err(|e| Error::Io(io::Error::other(e)))?,
        };
        inner.flush()?;
        Ok(inner)
    }

    fn inner_mut(&mut self) -> &mut dyn Write {
        match self {
            CompressedWriter::Plain(w) => w,
            CompressedWriter::Gzip(w) => w,
            CompressedWriter::Bzip2(w) => w,
            CompressedWriter::Xz(w) => w,
            CompressedWriter::Zip(w) => w,
        }
    }
}

impl<W: Write + Seek> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner_mut().flush()
    }
}

fn extraction_path(
    src: &Path,
    member: Option<&str>,
    dest_dir: Option<&Path>,
    dest_filename: Option<&str>,
) -> PathBuf {
    let dest_dir = dest_dir.unwrap_or_else(|| Path::new("."));
    let filename = match (dest_filename, member) {
        (Some(name), _) => PathBuf::from(name),
        (None, Some(member)) => PathBuf::from(member),
        (None, None) => src
            .file_name()
            .map(|name| remove_compression_extension(Path::new(name)))
            .unwrap_or_default(),
    };
    dest_dir.join(filename)
}

/// A tar archive (possibly compressed) that isn't a VVM file.
fn is_plain_tar(path: &Path) -> Result<bool> {
    let without_compression = remove_compression_extension(path);
    let is_vvm = [path, without_compression.as_path()]
        .iter()
        .any(|p| p.extension().is_some_and(|ext| ext == "vvm"));
    if is_vvm {
        return Ok(false);
    }
    let mut head = Vec::with_capacity(512);
    open_read(path)?.take(512).read_to_end(&mut head)?;
    Ok(head.len() >= 262 && &head[257..262] == b"ustar")
}

fn copy_tar_member(path: &Path, member: Option<&str>, out: &mut impl Write) -> Result<u64> {
    let tar_error = |e: io::Error| Error::BadFile(format!("{}: {}", path.display(), e));
    let name = match member {
        Some(name) => name.to_string(),
        None => {
            let mut archive = tar::Archive::new(open_read(path)?);
            let mut names = Vec::new();
            for entry in archive.entries().map_err(tar_error)? {
                let entry = entry.map_err(tar_error)?;
                if entry.header().entry_type().is_file() {
                    names.push(entry.path().map_err(tar_error)?.to_string_lossy().into_owned());
                }
            }
            match names.len() {
                0 => return Err(Error::BadFile(format!("empty archive: {}", path.display()))),
                1 => names.remove(0),
                _ => {
                    return Err(Error::Argument(format!(
                        "the archive {} contains more than one file; a member name is required",
                        path.display()
                    )))
                }
            }
        }
    };

    let mut archive = tar::Archive::new(open_read(path)?);
    for entry in archive.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;
        if entry.path().map_err(tar_error)?.to_string_lossy() == name {
            return Ok(io::copy(&mut entry, out)?);
        }
    }
    Err(Error::Argument(format!(
        "no member named {:?} in {}",
        name,
        path.display()
    )))
}

/// Extract a file compressed with gzip, bzip2 or xz, or a member of a zip or
/// tar archive.
///
/// Archives holding more than one file need `member`. The destination defaults
/// to `member` (or the source name without its compression extension) in the
/// current directory. Data goes to `<dest>.part` first and is renamed once
/// complete.
pub fn extract(
    src: &Path,
    member: Option<&str>,
    dest_dir: Option<&Path>,
    dest_filename: Option<&str>,
    overwrite: bool,
) -> Result<PathBuf> {
    let dest = extraction_path(src, member, dest_dir, dest_filename);
    if dest.exists() {
        if !overwrite {
            return Err(Error::FileAlreadyExists(dest));
        }
        info!(
            "The file {} already exists and overwrite is set; removing it",
            dest.display()
        );
        fs::remove_file(&dest)?;
    }

    let mut part_name = dest.file_name().unwrap_or_default().to_os_string();
    part_name.push(".part");
    let part = dest.with_file_name(part_name);

    let result = (|| -> Result<u64> {
        let mut out = File::create(&part)?;
        let written = if sniff(src)? == Some(Compression::Zip) {
            copy_zip_member(src, member, &mut out)?
        } else if is_plain_tar(src)? {
            copy_tar_member(src, member, &mut out)?
        } else {
            io::copy(&mut open_read(src)?, &mut out)?
        };
        out.flush()?;
        Ok(written)
    })();

    match result {
        Ok(written) => {
            fs::rename(&part, &dest)?;
            info!("Extracted {} bytes to {}", written, dest.display());
            Ok(dest)
        }
        Err(e) => {
            let _ = fs::remove_file(&part);
            Err(e)
        }
    }
}

/// Like [`extract`], but returns the destination untouched if it already exists.
pub fn extract_if_missing(
    src: &Path,
    member: Option<&str>,
    dest_dir: Option<&Path>,
    dest_filename: Option<&str>,
) -> Result<PathBuf> {
    let dest = extraction_path(src, member, dest_dir, dest_filename);
    if dest.exists() {
        info!("Nothing to decompress, the file already exists: {}", dest.display());
        return Ok(dest);
    }
    info!("Extracting file to: {}", dest.display());
    extract(src, member, dest_dir, dest_filename, false)
}
