//! Loaders: look up a set of words in a file and yield the pairs found.
//!
//! Files without an index are scanned once from the top ([`SequentialLoader`]);
//! files with one are queried word by word ([`RandomAccessLoader`]).

use crate::error::{Error, Result};
use crate::progress;
use crate::reader::{lock, Reader, Release};
use crate::types::{Vector, WordVector};
use indicatif::ProgressBar;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Iterator over the (word, vector) pairs found for a set of target words.
///
/// Pairs may come in any order. Once the iteration ends, [`missing_words`]
/// holds the target words that are not in the file. With `missing_ok` unset, a
/// loader ends with a [`Error::KeyNotFound`] instead.
///
/// [`missing_words`]: VectorsLoader::missing_words
pub trait VectorsLoader: Iterator<Item = Result<WordVector>> + Send {
    /// Target words not found (yet). Final once the iteration is over.
    fn missing_words(&self) -> &HashSet<String>;

    /// Release the resources held by the loader. Idempotent.
    fn close(&mut self);
}

/// Builds a [`Error::KeyNotFound`] listing words in sorted order.
pub(crate) fn missing_error(words: &HashSet<String>) -> Error {
    let mut sorted: Vec<&String> = words.iter().collect();
    sorted.sort();
    Error::missing(sorted)
}

/// Scans a file from the beginning, yielding a pair whenever it meets a target
/// word. Vectors of other words are skipped without being decoded.
///
/// Whether a word is missing is only known once the whole file has been read.
pub struct SequentialLoader {
    reader: Reader,
    pending: HashSet<String>,
    missing_ok: bool,
    finished: bool,
    progress: ProgressBar,
}

impl SequentialLoader {
    /// `vocab_size`, when known, sizes the progress bar.
    pub fn new(
        reader: Reader,
        words: HashSet<String>,
        missing_ok: bool,
        verbose: bool,
        vocab_size: Option<usize>,
    ) -> Self {
        let progress = progress::bar(verbose, vocab_size.map(|n| n as u64), "Reading");
        Self {
            reader,
            pending: words,
            missing_ok,
            finished: false,
            progress,
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.progress.finish_and_clear();
            self.reader.close();
        }
    }

    fn scan(&mut self) -> Result<Option<WordVector>> {
        while let Some(word) = self.reader.next_word()? {
            self.progress.inc(1);
            if self.pending.remove(&word) {
                let vector = self.reader.current_vector()?.to_vec();
                return Ok(Some(WordVector::new(word, vector)));
            }
        }
        Ok(None)
    }
}

impl Iterator for SequentialLoader {
    type Item = Result<WordVector>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.pending.is_empty() {
            self.finish();
            return None;
        }
        match self.scan() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.finish();
                if self.missing_ok {
                    None
                } else {
                    Some(Err(missing_error(&self.pending)))
                }
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }
}

impl VectorsLoader for SequentialLoader {
    fn missing_words(&self) -> &HashSet<String> {
        &self.pending
    }

    fn close(&mut self) {
        self.finish();
    }
}

/// Word to vector access for files with an index.
pub trait WordLookup: Send {
    /// True if the word is in the file.
    fn contains(&self, word: &str) -> bool;

    /// Vector of a word. [`Error::KeyNotFound`] if it's not in the file.
    fn vector(&mut self, word: &str) -> Result<Vector>;
}

type LookupSlot = Arc<Mutex<Option<Box<dyn WordLookup>>>>;

/// Yields the vectors of the target words that are in the file, looking each
/// one up. Missing words are known as soon as the loader is built.
pub struct RandomAccessLoader {
    lookup: LookupSlot,
    words: std::vec::IntoIter<String>,
    missing: HashSet<String>,
    progress: ProgressBar,
    on_close: Option<Box<dyn FnOnce() + Send>>,
    closed: bool,
}

impl RandomAccessLoader {
    /// Split `words` into available and missing ones.
    ///
    /// With `position` (the index of a word in the file), available words are
    /// loaded in file order, which keeps reads mostly sequential. Fails with
    /// [`Error::KeyNotFound`] if a word is missing and `missing_ok` is unset.
    pub fn new(
        words: HashSet<String>,
        lookup: Box<dyn WordLookup>,
        position: Option<&dyn Fn(&str) -> usize>,
        missing_ok: bool,
        verbose: bool,
    ) -> Result<Self> {
        let requested = words.len();
        let (available, missing): (HashSet<String>, HashSet<String>) =
            words.into_iter().partition(|word| lookup.contains(word));
        if !missing_ok && !missing.is_empty() {
            return Err(missing_error(&missing));
        }
        let mut available: Vec<String> = available.into_iter().collect();

        match position {
            Some(position) => available.sort_by_cached_key(|word| position(word.as_str())),
            None => available.sort(),
        }
        debug!(
            "Loading {} available vectors of {} requested",
            available.len(),
            requested
        );

        let message = format!(
            "Loading available vectors ({} of {})",
            available.len(),
            requested
        );
        let progress = progress::bar(verbose, Some(available.len() as u64), &message);
        Ok(Self {
            lookup: Arc::new(Mutex::new(Some(lookup))),
            words: available.into_iter(),
            missing,
            progress,
            on_close: None,
            closed: false,
        })
    }

    /// Run `hook` once when the loader is closed, exhausted or dropped.
    pub fn with_close_hook(mut self, hook: Box<dyn FnOnce() + Send>) -> Self {
        self.on_close = Some(hook);
        self
    }

    pub(crate) fn resource(&self) -> Arc<dyn Release> {
        self.lookup.clone()
    }

    fn next_pair(&mut self, word: String) -> Result<WordVector> {
        let mut guard = lock(&self.lookup);
        let lookup = guard.as_mut().ok_or_else(|| Error::closed("loader"))?;
        let vector = lookup.vector(&word)?;
        Ok(WordVector::new(word, vector))
    }
}

impl Iterator for RandomAccessLoader {
    type Item = Result<WordVector>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        let Some(word) = self.words.next() else {
            self.close();
            return None;
        };
        let result = self.next_pair(word);
        self.progress.inc(1);
        if result.is_err() {
            self.close();
        }
        Some(result)
    }
}

impl VectorsLoader for RandomAccessLoader {
    fn missing_words(&self) -> &HashSet<String> {
        &self.missing
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.progress.finish_and_clear();
        lock(&self.lookup).take();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl Drop for RandomAccessLoader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::tests::VecSource;
    use crate::types::DType;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn words(list: &[&str]) -> HashSet<String> {
        list.iter().map(|w| w.to_string()).collect()
    }

    fn reader() -> Reader {
        let source = VecSource::new(&[
            ("a", vec![1.0]),
            ("b", vec![2.0]),
            ("c", vec![3.0]),
            ("d", vec![4.0]),
        ]);
        Reader::new(Box::new(source), DType::F32)
    }

    struct MapLookup(HashMap<String, Vector>);

    impl WordLookup for MapLookup {
        fn contains(&self, word: &str) -> bool {
            self.0.contains_key(word)
        }

        fn vector(&mut self, word: &str) -> Result<Vector> {
            self.0
                .get(word)
                .cloned()
                .ok_or_else(|| Error::missing([&word.to_string()]))
        }
    }

    fn lookup() -> Box<dyn WordLookup> {
        let map = [("a", 0.0), ("b", 1.0), ("c", 2.0)]
            .iter()
            .map(|(w, v)| (w.to_string(), vec![*v]))
            .collect();
        Box::new(MapLookup(map))
    }

    #[test]
    fn test_sequential_loader_missing_ok() {
        let mut loader = SequentialLoader::new(reader(), words(&["c", "a", "z"]), true, false, None);
        let found: Vec<WordVector> = loader.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(
            found,
            vec![WordVector::new("a", vec![1.0]), WordVector::new("c", vec![3.0])]
        );
        assert_eq!(loader.missing_words(), &words(&["z"]));
        assert!(loader.reader.is_closed());
    }

    #[test]
    fn test_sequential_loader_stops_early() {
        let mut loader = SequentialLoader::new(reader(), words(&["b"]), false, false, None);
        assert_eq!(loader.next().unwrap().unwrap().word, "b");
        assert!(loader.next().is_none());
        assert!(loader.missing_words().is_empty());
        assert!(loader.reader.is_closed());
    }

    #[test]
    fn test_sequential_loader_key_not_found() {
        let loader = SequentialLoader::new(reader(), words(&["a", "y", "x"]), false, false, None);
        let results: Vec<Result<WordVector>> = loader.collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(Error::KeyNotFound { count, sample }) => {
                assert_eq!(*count, 2);
                assert_eq!(sample, &vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("unexpected result: {:?}", other.as_ref().map(|_| ())),
        }
    }

    #[test]
    fn test_random_access_loader_sorted_by_position() {
        let position = |word: &str| match word {
            "c" => 0,
            "a" => 1,
            _ => 2,
        };
        let loader =
            RandomAccessLoader::new(words(&["a", "b", "c", "q"]), lookup(), Some(&position), true, false)
                .unwrap();
        assert_eq!(loader.missing_words(), &words(&["q"]));
        let order: Vec<String> = loader.map(|r| r.unwrap().word).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_random_access_loader_sorted_by_word() {
        let loader =
            RandomAccessLoader::new(words(&["c", "q", "a", "b"]), lookup(), None, true, false)
                .unwrap();
        assert_eq!(loader.missing_words(), &words(&["q"]));
        let order: Vec<String> = loader.map(|r| r.unwrap().word).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_random_access_loader_fails_early() {
        let err = RandomAccessLoader::new(words(&["a", "q"]), lookup(), None, false, false)
            .err()
            .unwrap();
        assert!(matches!(err, Error::KeyNotFound { count: 1, .. }));
    }

    #[test]
    fn test_random_access_close_hook_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut loader = RandomAccessLoader::new(words(&["a"]), lookup(), None, true, false)
            .unwrap()
            .with_close_hook(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        assert!(loader.next().unwrap().is_ok());
        assert!(loader.next().is_none());
        loader.close();
        drop(loader);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_random_access_released_by_owner() {
        let mut loader =
            RandomAccessLoader::new(words(&["a", "b"]), lookup(), None, true, false).unwrap();
        loader.resource().release();
        assert!(matches!(loader.next(), Some(Err(Error::IllegalState(_)))));
        assert!(loader.next().is_none());
    }
}
