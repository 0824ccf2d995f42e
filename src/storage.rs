//! Byte windows over embedding files.
//!
//! Readers consume files through a [`ByteWindow`]: a cursor exposing the bytes
//! currently available, which can be asked for more. Uncompressed files are
//! memory-mapped and expose everything at once. Compressed files are decoded
//! incrementally into a growing buffer.

use crate::compression::{self, Compression};
use crate::error::Result;
use bytes::{Buf, BytesMut};
use memmap2::Mmap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Read chunk size for streamed windows (64KB).
const CHUNK_SIZE: usize = 64 * 1024;

/// A forward cursor over a byte stream with on-demand refill.
pub trait ByteWindow: Send {
    /// Bytes available from the cursor on, without further reads.
    fn available(&self) -> &[u8];

    /// Try to make more bytes available. Returns false at end of data.
    fn fill_more(&mut self) -> Result<bool>;

    /// Advance the cursor. `n` must not exceed `available().len()`.
    fn consume(&mut self, n: usize);

    /// Move the cursor back to the first byte.
    fn rewind(&mut self) -> Result<()>;

    /// Absolute offset of the cursor.
    fn position(&self) -> u64;

    /// Total length of the data, if known up front.
    fn total_len(&self) -> Option<u64> {
        None
    }

    /// Make sure at least `n` bytes are available. Returns false if the data
    /// ends first.
    fn ensure(&mut self, n: usize) -> Result<bool> {
        while self.available().len() < n {
            if !self.fill_more()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Skip `n` bytes without keeping them around. Returns false if the data
    /// ends first.
    fn skip(&mut self, n: usize) -> Result<bool> {
        let mut remaining = n;
        loop {
            let step = remaining.min(self.available().len());
            self.consume(step);
            remaining -= step;
            if remaining == 0 {
                return Ok(true);
            }
            if !self.fill_more()? {
                return Ok(false);
            }
        }
    }

    /// True if no byte is left.
    fn at_end(&mut self) -> Result<bool> {
        Ok(self.available().is_empty() && !self.fill_more()?)
    }
}

/// Open the most efficient window for a path: a memory map for plain files,
/// a decoding stream for compressed ones.
pub fn open_window(path: &Path) -> Result<Box<dyn ByteWindow>> {
    match Compression::from_path(path) {
        Some(_) => Ok(Box::new(StreamWindow::open(path))),
        None => Ok(Box::new(MappedWindow::open(path)?)),
    }
}

/// A memory-mapped file. Everything is available immediately.
pub struct MappedWindow {
    /// None for empty files, which can't be mapped.
    mmap: Option<Mmap>,
    pos: usize,
}

impl MappedWindow {
    /// Map a file read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = if file.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: the map is read-only; files are not modified while a handle is open
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { mmap, pos: 0 })
    }

    fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl ByteWindow for MappedWindow {
    fn available(&self) -> &[u8] {
        &self.data()[self.pos..]
    }

    fn fill_more(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data().len());
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.data().len() as u64)
    }
}

type Opener = Box<dyn FnMut() -> Result<Box<dyn Read + Send>> + Send>;

/// A window over a (possibly decompressing) reader. Rewinding reopens the source.
pub struct StreamWindow {
    opener: Opener,
    reader: Option<Box<dyn Read + Send>>,
    buf: BytesMut,
    chunk_size: usize,
    eof: bool,
    /// Absolute offset of `buf[0]`.
    offset: u64,
}

impl StreamWindow {
    /// Stream a file through [`compression::open_read`].
    pub fn open(path: &Path) -> Self {
        let path: PathBuf = path.to_path_buf();
        Self::with_opener(Box::new(move || compression::open_read(&path)))
    }

    /// Stream whatever the opener returns. The opener runs lazily, and again on
    /// every rewind.
    pub fn with_opener(opener: Opener) -> Self {
        Self {
            opener,
            reader: None,
            buf: BytesMut::new(),
            chunk_size: CHUNK_SIZE,
            eof: false,
            offset: 0,
        }
    }

    /// Set the read chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl ByteWindow for StreamWindow {
    fn available(&self) -> &[u8] {
        &self.buf
    }

    fn fill_more(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if self.reader.is_none() {
            self.reader = Some((self.opener)()?);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };

        let start = self.buf.len();
        self.buf.resize(start + self.chunk_size, 0);
        let read = loop {
            match reader.read(&mut self.buf[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e.into());
                }
            }
        };
        self.buf.truncate(start + read);
        if read == 0 {
            self.eof = true;
            self.reader = None;
        }
        Ok(read > 0)
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
        self.offset += n as u64;
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader = None;
        self.buf.clear();
        self.eof = false;
        self.offset = 0;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn stream_of(data: &'static [u8], chunk_size: usize) -> StreamWindow {
        StreamWindow::with_opener(Box::new(move || {
            Ok(Box::new(Cursor::new(data)) as Box<dyn Read + Send>)
        }))
        .with_chunk_size(chunk_size)
    }

    #[test]
    fn test_stream_window_refill() {
        let mut window = stream_of(b"hello world", 3);
        assert!(window.available().is_empty());
        assert!(window.ensure(5).unwrap());
        assert_eq!(&window.available()[..5], b"hello");
        window.consume(6);
        assert_eq!(window.position(), 6);
        assert!(window.ensure(5).unwrap());
        assert_eq!(&window.available()[..5], b"world");
        assert!(!window.ensure(6).unwrap());
    }

    #[test]
    fn test_stream_window_skip_and_rewind() {
        let mut window = stream_of(b"0123456789", 4);
        assert!(window.skip(7).unwrap());
        assert!(window.ensure(3).unwrap());
        assert_eq!(window.available(), b"789");
        assert!(!window.skip(10).unwrap());
        assert!(window.at_end().unwrap());

        window.rewind().unwrap();
        assert_eq!(window.position(), 0);
        assert!(window.ensure(2).unwrap());
        assert_eq!(&window.available()[..2], b"01");
    }

    #[test]
    fn test_mapped_window() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abcdef").unwrap();
        file.flush().unwrap();

        let mut window = MappedWindow::open(file.path()).unwrap();
        assert_eq!(window.total_len(), Some(6));
        assert!(!window.fill_more().unwrap());
        window.consume(4);
        assert_eq!(window.available(), b"ef");
        assert!(!window.skip(3).unwrap());
        window.rewind().unwrap();
        assert_eq!(window.available(), b"abcdef");
    }

    #[test]
    fn test_mapped_window_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let mut window = MappedWindow::open(file.path()).unwrap();
        assert!(window.at_end().unwrap());
    }
}
