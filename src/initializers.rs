//! Initializers for the vectors of out-of-vocabulary words.
//!
//! [`build_matrix`](crate::build_matrix) asks an [`Initializer`] for the rows
//! of the words it couldn't find. Fittable initializers first see the rows
//! that were found.

use crate::error::{Error, Result};
use crate::types::Vector;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// Generates vectors for missing words.
///
/// Any `FnMut(usize) -> Vector` closure, called with the vector size, is an
/// initializer too.
pub trait Initializer {
    /// True if [`fit`](Initializer::fit) should be called before generating.
    fn is_fittable(&self) -> bool {
        false
    }

    /// Compute the statistics used for generation from the found vectors
    /// (one per row).
    fn fit(&mut self, _found: ArrayView2<'_, f32>) -> Result<()> {
        Ok(())
    }

    /// Generate one vector.
    fn generate(&mut self, vector_size: usize) -> Result<Vector>;

    /// Generate `rows` vectors at once. `None` if the initializer only
    /// generates one vector at a time.
    fn generate_block(&mut self, _rows: usize, _vector_size: usize) -> Result<Option<Array2<f32>>> {
        Ok(None)
    }
}

impl<F> Initializer for F
where
    F: FnMut(usize) -> Vector,
{
    fn generate(&mut self, vector_size: usize) -> Result<Vector> {
        Ok(self(vector_size))
    }
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn normal(mean: f32, deviation: f32) -> Result<Normal<f32>> {
    if deviation < 0.0 {
        return Err(Error::Argument(format!(
            "the standard deviation must not be negative, got {}",
            deviation
        )));
    }
    Normal::new(mean, deviation).map_err(|e| {
        Error::Argument(format!(
            "invalid normal distribution (mean {}, deviation {}): {}",
            mean, deviation, e
        ))
    })
}

/// Samples each column from a normal distribution with the mean and standard
/// deviation of the same column in the fitted vectors.
///
/// Generating before fitting is an [`Error::IllegalState`].
#[derive(Debug, Clone)]
pub struct NormalInitializer {
    columns: Option<Vec<Normal<f32>>>,
    mean: Option<Array1<f32>>,
    deviation: Option<Array1<f32>>,
    rng: StdRng,
}

impl NormalInitializer {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// An initializer producing the same vectors on every run.
    pub fn with_seed(seed: u64) -> Self {
        Self::build(Some(seed))
    }

    fn build(seed: Option<u64>) -> Self {
        Self {
            columns: None,
            mean: None,
            deviation: None,
            rng: rng_from(seed),
        }
    }

    /// Per-column mean, once fitted.
    pub fn mean(&self) -> Option<&Array1<f32>> {
        self.mean.as_ref()
    }

    /// Per-column standard deviation, once fitted.
    pub fn deviation(&self) -> Option<&Array1<f32>> {
        self.deviation.as_ref()
    }

    fn fitted_columns(&self, vector_size: usize) -> Result<&[Normal<f32>]> {
        let columns = self.columns.as_deref().ok_or_else(|| {
            Error::IllegalState("the initializer must be fit before generating vectors".to_string())
        })?;
        if columns.len() != vector_size {
            return Err(Error::Argument(format!(
                "the initializer was fit on vectors of size {}, not {}",
                columns.len(),
                vector_size
            )));
        }
        Ok(columns)
    }
}

impl Default for NormalInitializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Initializer for NormalInitializer {
    fn is_fittable(&self) -> bool {
        true
    }

    fn fit(&mut self, found: ArrayView2<'_, f32>) -> Result<()> {
        let mean = found
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Argument("can't fit on an empty set of vectors".to_string()))?;
        let deviation = found.std_axis(Axis(0), 0.0);
        let columns = mean
            .iter()
            .zip(deviation.iter())
            .map(|(&m, &d)| normal(m, d))
            .collect::<Result<Vec<_>>>()?;
        self.columns = Some(columns);
        self.mean = Some(mean);
        self.deviation = Some(deviation);
        Ok(())
    }

    fn generate(&mut self, vector_size: usize) -> Result<Vector> {
        let columns = self.fitted_columns(vector_size)?.to_vec();
        Ok(columns.iter().map(|n| n.sample(&mut self.rng)).collect())
    }

    fn generate_block(&mut self, rows: usize, vector_size: usize) -> Result<Option<Array2<f32>>> {
        let columns = self.fitted_columns(vector_size)?.to_vec();
        let rng = &mut self.rng;
        Ok(Some(Array2::from_shape_fn((rows, vector_size), |(_, j)| {
            columns[j].sample(rng)
        })))
    }
}

/// Samples every element from the same normal distribution. The deviation
/// defaults to `1 / vector_size`.
#[derive(Debug, Clone)]
pub struct NormalSampler {
    pub mean: f32,
    pub deviation: Option<f32>,
    rng: StdRng,
}

impl NormalSampler {
    pub fn new(mean: f32, deviation: Option<f32>) -> Self {
        Self {
            mean,
            deviation,
            rng: rng_from(None),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = rng_from(Some(seed));
        self
    }

    fn distribution(&self, vector_size: usize) -> Result<Normal<f32>> {
        if vector_size == 0 {
            return Err(Error::Argument("vector_size must be positive".to_string()));
        }
        let deviation = self.deviation.unwrap_or(1.0 / vector_size as f32);
        normal(self.mean, deviation)
    }
}

impl Default for NormalSampler {
    fn default() -> Self {
        Self::new(0.0, None)
    }
}

impl Initializer for NormalSampler {
    fn generate(&mut self, vector_size: usize) -> Result<Vector> {
        let distribution = self.distribution(vector_size)?;
        Ok((0..vector_size)
            .map(|_| distribution.sample(&mut self.rng))
            .collect())
    }

    fn generate_block(&mut self, rows: usize, vector_size: usize) -> Result<Option<Array2<f32>>> {
        let distribution = self.distribution(vector_size)?;
        let rng = &mut self.rng;
        Ok(Some(Array2::from_shape_fn((rows, vector_size), |_| {
            distribution.sample(rng)
        })))
    }
}
