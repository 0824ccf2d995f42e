//! Sequential readers over embedding files.
//!
//! Every format exposes its records through a [`RecordSource`]; the cursor
//! discipline (lazy vectors, skipping unread vectors, closed/exhausted states)
//! lives once in [`Reader`].

use crate::error::{Error, Result};
use crate::types::{DType, Vector};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Low-level record access implemented by each format.
///
/// Records alternate word, vector, word, vector... `read_vector` and
/// `skip_vector` are only called right after a successful `read_word`.
pub trait RecordSource: Send {
    /// Read the next word. `None` at the end of the file.
    fn read_word(&mut self) -> Result<Option<String>>;

    /// Read and decode the vector of the last word.
    fn read_vector(&mut self) -> Result<Vector>;

    /// Move past the vector of the last word without decoding it.
    fn skip_vector(&mut self) -> Result<()>;

    /// Go back to the first record.
    fn rewind(&mut self) -> Result<()>;
}

/// A resource a file handle can force-release when it's closed.
pub(crate) trait Release: Send + Sync {
    fn release(&self);
}

impl<T: Send> Release for Mutex<Option<T>> {
    fn release(&self) {
        self.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

pub(crate) fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resources (readers, loaders) created by a file handle. Only weak references
/// are kept: dropping a child frees it without involving the handle.
#[derive(Default)]
pub(crate) struct Children {
    resources: Vec<Weak<dyn Release>>,
}

impl Children {
    pub(crate) fn register(&mut self, resource: Arc<dyn Release>) {
        self.resources.retain(|weak| weak.strong_count() > 0);
        self.resources.push(Arc::downgrade(&resource));
    }

    /// Release every live child, in registration order.
    pub(crate) fn release_all(&mut self) {
        for weak in self.resources.drain(..) {
            if let Some(resource) = weak.upgrade() {
                resource.release();
            }
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.resources.iter().filter(|w| w.strong_count() > 0).count()
    }
}

type SourceSlot = Arc<Mutex<Option<Box<dyn RecordSource>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    PointingToWord,
    PointingToVector,
    Exhausted,
    Closed,
}

/// A cursor over the (word, vector) records of a file.
///
/// ```no_run
/// # fn main() -> embfile::Result<()> {
/// use embfile::EmbFile;
///
/// let mut file = embfile::open("vectors.txt")?;
/// let mut reader = file.reader()?;
/// while let Some(word) = reader.next_word()? {
///     if word.starts_with('a') {
///         let vector = reader.current_vector()?;
///         println!("{} {:?}", word, vector);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Reader {
    slot: SourceSlot,
    state: State,
    vector: Option<Vector>,
    out_dtype: DType,
}

impl Reader {
    /// Wrap a record source. Vectors are rounded to `out_dtype`.
    pub fn new(source: Box<dyn RecordSource>, out_dtype: DType) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(source))),
            state: State::NotStarted,
            vector: None,
            out_dtype,
        }
    }

    pub(crate) fn resource(&self) -> Arc<dyn Release> {
        self.slot.clone()
    }

    /// Advance to the next word, skipping the vector of the current one if it
    /// was never read. Returns `None` at the end of the file.
    pub fn next_word(&mut self) -> Result<Option<String>> {
        let mut guard = lock(&self.slot);
        let Some(source) = guard.as_mut() else {
            self.state = State::Closed;
            return Err(Error::closed("reader"));
        };
        match self.state {
            State::Closed => return Err(Error::closed("reader")),
            State::Exhausted => return Ok(None),
            State::PointingToWord => {
                source.skip_vector()?;
                // No current record until read_word succeeds; a retry must not skip again
                self.state = State::NotStarted;
            }
            State::NotStarted | State::PointingToVector => {}
        }
        self.vector = None;
        match source.read_word()? {
            Some(word) => {
                self.state = State::PointingToWord;
                Ok(Some(word))
            }
            None => {
                self.state = State::Exhausted;
                Ok(None)
            }
        }
    }

    /// Vector of the current word. Decoded on first access, then cached until
    /// the reader advances.
    pub fn current_vector(&mut self) -> Result<&[f32]> {
        match self.state {
            State::NotStarted => {
                return Err(Error::IllegalState(
                    "no current vector: call next_word() first".to_string(),
                ))
            }
            State::Exhausted => {
                return Err(Error::IllegalState(
                    "no current vector: the reader is exhausted".to_string(),
                ))
            }
            State::Closed => return Err(Error::closed("reader")),
            State::PointingToWord | State::PointingToVector => {}
        }
        let mut guard = lock(&self.slot);
        let Some(source) = guard.as_mut() else {
            self.state = State::Closed;
            self.vector = None;
            return Err(Error::closed("reader"));
        };
        if self.vector.is_none() {
            let mut vector = source.read_vector()?;
            self.out_dtype.quantize_all(&mut vector);
            self.vector = Some(vector);
            self.state = State::PointingToVector;
        }
        Ok(self.vector.as_deref().unwrap_or(&[]))
    }

    /// Go back to the beginning of the file.
    pub fn reset(&mut self) -> Result<()> {
        let mut guard = lock(&self.slot);
        match guard.as_mut() {
            Some(source) if self.state != State::Closed => source.rewind()?,
            _ => {
                self.state = State::Closed;
                return Err(Error::closed("reader"));
            }
        }
        self.vector = None;
        self.state = State::NotStarted;
        Ok(())
    }

    /// Release the underlying stream. Idempotent.
    pub fn close(&mut self) {
        lock(&self.slot).take();
        self.vector = None;
        self.state = State::Closed;
    }

    /// True once closed, directly or by the file that created it.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed || lock(&self.slot).is_none()
    }
}
