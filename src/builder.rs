//! Matrix builder: an embedding matrix for a vocabulary, with vectors loaded
//! from a file and generated for the words the file doesn't have.

use crate::error::{Error, Result};
use crate::file::EmbFile;
use crate::initializers::{Initializer, NormalInitializer};
use crate::progress;
use crate::types::DType;
use ndarray::{aview1, Array2, ArrayView1, Axis};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info};

/// How words are assigned to matrix rows.
#[derive(Debug, Clone)]
pub enum RowAssignment {
    /// Consecutive rows from `start_index`, in order. Rows before it stay zero;
    /// a repeated word keeps its first row.
    Words {
        words: Vec<String>,
        start_index: usize,
    },
    /// Explicit word to row mapping. Rows no word maps to stay zero.
    Mapping(HashMap<String, usize>),
}

impl RowAssignment {
    /// Words on consecutive rows starting from 0.
    pub fn words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::words_from(words, 0)
    }

    /// Words on consecutive rows starting from `start_index`.
    pub fn words_from<I, S>(words: I, start_index: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RowAssignment::Words {
            words: words.into_iter().map(Into::into).collect(),
            start_index,
        }
    }

    /// Resolve into a word to row map, validating it.
    fn into_word2index(self) -> Result<HashMap<String, usize>> {
        let word2index = match self {
            RowAssignment::Words { words, start_index } => {
                let mut word2index = HashMap::with_capacity(words.len());
                for word in words {
                    let next = start_index + word2index.len();
                    word2index.entry(word).or_insert(next);
                }
                word2index
            }
            RowAssignment::Mapping(word2index) => {
                let mut owners: HashMap<usize, &str> = HashMap::with_capacity(word2index.len());
                for (word, &row) in &word2index {
                    if let Some(other) = owners.insert(row, word) {
                        return Err(Error::Argument(format!(
                            "multiple words are mapped to the row {} ({:?} and {:?})",
                            row, other, word
                        )));
                    }
                }
                word2index
            }
        };
        if word2index.is_empty() {
            return Err(Error::Argument("empty set of words".to_string()));
        }
        Ok(word2index)
    }
}

impl From<HashMap<String, usize>> for RowAssignment {
    fn from(mapping: HashMap<String, usize>) -> Self {
        RowAssignment::Mapping(mapping)
    }
}

/// Options of [`build_matrix`].
pub struct BuildMatrixOptions {
    /// Precision of the matrix elements (default: the file's `out_dtype`).
    pub dtype: Option<DType>,
    /// Generates the rows of missing words; `None` leaves them at zero.
    /// Defaults to a [`NormalInitializer`].
    pub initializer: Option<Box<dyn Initializer>>,
    /// Show progress (default: the file's verbosity).
    pub verbose: Option<bool>,
}

impl Default for BuildMatrixOptions {
    fn default() -> Self {
        Self {
            dtype: None,
            initializer: Some(Box::new(NormalInitializer::new())),
            verbose: None,
        }
    }
}

impl BuildMatrixOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_initializer(mut self, initializer: impl Initializer + 'static) -> Self {
        self.initializer = Some(Box::new(initializer));
        self
    }

    /// Leave the rows of missing words at zero.
    pub fn without_initializer(mut self) -> Self {
        self.initializer = None;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = Some(verbose);
        self
    }
}

/// Result of [`build_matrix`].
#[derive(Debug, Clone)]
pub struct BuildMatrixOutput {
    /// `[max_row + 1, vector_size]` matrix.
    pub matrix: Array2<f32>,
    /// Row of each word.
    pub word2index: HashMap<String, usize>,
    /// Words not in the file.
    pub missing_words: HashSet<String>,
}

impl BuildMatrixOutput {
    /// Words whose vector comes from the file.
    pub fn found_words(&self) -> HashSet<&str> {
        self.word2index
            .keys()
            .filter(|word| !self.missing_words.contains(*word))
            .map(String::as_str)
            .collect()
    }

    /// Rows of the given words. [`Error::KeyNotFound`] if any word has no row.
    pub fn word_indexes<I, S>(&self, words: I) -> Result<Vec<usize>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut indexes = Vec::new();
        let mut unknown = Vec::new();
        for word in words {
            match self.word2index.get(word.as_ref()) {
                Some(&index) => indexes.push(index),
                None => unknown.push(word.as_ref().to_string()),
            }
        }
        if !unknown.is_empty() {
            return Err(Error::missing(&unknown));
        }
        Ok(indexes)
    }

    /// Row of a word.
    pub fn vector(&self, word: &str) -> Result<ArrayView1<'_, f32>> {
        let index = self.word_indexes([word])?[0];
        Ok(self.matrix.row(index))
    }

    /// One line per row: the values with `precision` decimals, followed by the
    /// row index and its word. Rows longer than `threshold` are summarized by
    /// their first and last three values.
    pub fn pretty(&self, precision: usize, threshold: usize) -> String {
        let mut owners: Vec<Option<&str>> = vec![None; self.matrix.nrows()];
        for (word, &index) in &self.word2index {
            owners[index] = Some(word);
        }
        let index_width = self.matrix.nrows().saturating_sub(1).to_string().len();

        let mut lines = Vec::with_capacity(owners.len());
        for (index, row) in self.matrix.axis_iter(Axis(0)).enumerate() {
            let mut line = format_row(row, precision, threshold);
            line.push_str(&format!("  # {:>width$}:", index, width = index_width));
            if let Some(word) = owners[index] {
                line.push(' ');
                line.push_str(word);
                if self.missing_words.contains(word) {
                    line.push_str(" [out of file vocabulary]");
                }
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

impl fmt::Display for BuildMatrixOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty(3, 5))
    }
}

/// Numbers with a leading space in place of the sign of non-negative values.
fn format_value(value: f32, precision: usize) -> String {
    let text = format!("{:.*}", precision, value);
    if text.starts_with('-') {
        text
    } else {
        format!(" {}", text)
    }
}

fn format_row(row: ArrayView1<'_, f32>, precision: usize, threshold: usize) -> String {
    const EDGE: usize = 3;
    let len = row.len();
    let cells: Vec<String> = if len > threshold && len > 2 * EDGE {
        row.iter()
            .take(EDGE)
            .map(|&v| format_value(v, precision))
            .chain(std::iter::once("...".to_string()))
            .chain(row.iter().skip(len - EDGE).map(|&v| format_value(v, precision)))
            .collect()
    } else {
        row.iter().map(|&v| format_value(v, precision)).collect()
    };
    format!("[{}]", cells.join(" "))
}

/// Build an embedding matrix for the words in `rows`.
///
/// Words found in `file` get their vector; the others (the missing words) get
/// one from `options.initializer`, fit first on the found vectors if it's
/// fittable. Arguments are validated before anything is read.
///
/// ```no_run
/// use embfile::{build_matrix, BuildMatrixOptions, RowAssignment};
///
/// # fn main() -> embfile::Result<()> {
/// let mut file = embfile::open("glove.6B.50d.txt")?;
/// let rows = RowAssignment::words_from(["<pad>", "the", "cat"], 1);
/// let output = build_matrix(file.as_mut(), rows, BuildMatrixOptions::default())?;
/// println!("{}", output);
/// # Ok(())
/// # }
/// ```
pub fn build_matrix<F>(
    file: &mut F,
    rows: RowAssignment,
    options: BuildMatrixOptions,
) -> Result<BuildMatrixOutput>
where
    F: EmbFile + ?Sized,
{
    let word2index = rows.into_word2index()?;
    if file.is_closed() {
        return Err(Error::closed("file"));
    }
    let BuildMatrixOptions {
        dtype,
        mut initializer,
        verbose,
    } = options;
    let dtype = dtype.unwrap_or_else(|| file.out_dtype());
    let verbose = verbose.unwrap_or_else(|| file.verbose());

    let vector_size = file.vector_size();
    let num_rows = word2index.values().max().map_or(0, |max| max + 1);
    let mut matrix = Array2::<f32>::zeros((num_rows, vector_size));
    debug!(
        "Building a {}x{} matrix ({}) for {} words",
        num_rows,
        vector_size,
        dtype,
        word2index.len()
    );

    let words: HashSet<String> = word2index.keys().cloned().collect();
    let mut loader = file.loader(words, true)?;
    let mut found_rows = Vec::new();
    for pair in loader.by_ref() {
        let mut pair = pair?;
        if pair.vector.len() != vector_size {
            return Err(Error::BadFile(format!(
                "the vector of {:?} has size {}, expected {}",
                pair.word,
                pair.vector.len(),
                vector_size
            )));
        }
        let Some(&row) = word2index.get(&pair.word) else {
            continue;
        };
        dtype.quantize_all(&mut pair.vector);
        matrix.row_mut(row).assign(&aview1(&pair.vector));
        found_rows.push(row);
    }
    let missing_words = loader.missing_words().clone();
    loader.close();
    info!(
        "Found {} of {} words in {}",
        found_rows.len(),
        word2index.len(),
        file.path().display()
    );

    if let Some(initializer) = initializer.as_deref_mut() {
        if !missing_words.is_empty() {
            if initializer.is_fittable() && !found_rows.is_empty() {
                let found = matrix.select(Axis(0), &found_rows);
                initializer.fit(found.view())?;
            }
            let mut missing_rows: Vec<usize> =
                missing_words.iter().filter_map(|w| word2index.get(w).copied()).collect();
            missing_rows.sort_unstable();
            initialize_rows(&mut matrix, &missing_rows, initializer, dtype, verbose)?;
        }
    }

    Ok(BuildMatrixOutput {
        matrix,
        word2index,
        missing_words,
    })
}

fn initialize_rows(
    matrix: &mut Array2<f32>,
    rows: &[usize],
    initializer: &mut dyn Initializer,
    dtype: DType,
    verbose: bool,
) -> Result<()> {
    let vector_size = matrix.ncols();
    let wrong_size = |len: usize| {
        Error::Argument(format!(
            "the initializer generated a vector of size {}, expected {}",
            len, vector_size
        ))
    };

    if let Some(block) = initializer.generate_block(rows.len(), vector_size)? {
        if block.dim() != (rows.len(), vector_size) {
            return Err(Error::Argument(format!(
                "the initializer generated a block of shape {:?}, expected {:?}",
                block.dim(),
                (rows.len(), vector_size)
            )));
        }
        for (&row, generated) in rows.iter().zip(block.axis_iter(Axis(0))) {
            let mut target = matrix.row_mut(row);
            target.assign(&generated);
            target.mapv_inplace(|v| dtype.quantize(v));
        }
        return Ok(());
    }

    let bar = progress::bar(
        verbose,
        Some(rows.len() as u64),
        "Initializing missing word vectors",
    );
    for &row in rows {
        let mut vector = initializer.generate(vector_size)?;
        if vector.len() != vector_size {
            return Err(wrong_size(vector.len()));
        }
        dtype.quantize_all(&mut vector);
        matrix.row_mut(row).assign(&aview1(&vector));
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(())
}
