//! Numeric kernels run inside a single PE: the row block matrix-vector product, the dot product,
//! and the vector population helpers used by the dot benchmark.

use rand::Rng;
use rayon::prelude::*;

use std::time::Instant;

/// Element type of the matrix-vector benchmark.
///
/// Rows of the default problem's result reach `~1.5 * N^2`, which does not fit in 32 bits.
pub type Elem = i64;

/// How a kernel uses the threads available to the calling PE.
///
/// `Parallel` runs on the current rayon pool, inside [LamellarWorld::install][crate::LamellarWorld::install]
/// that is the PE's own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelMode {
    Serial,
    Parallel,
}

impl KernelMode {
    pub fn from_flag(parallel: bool) -> KernelMode {
        if parallel {
            KernelMode::Parallel
        } else {
            KernelMode::Serial
        }
    }
}

/// A dense row major matrix stored in one contiguous buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<Elem>,
}

impl Matrix {
    /// Build a `rows x cols` matrix whose entry `(i, j)` is `f(i, j)`.
    pub fn from_fn<F>(rows: usize, cols: usize, mode: KernelMode, f: F) -> Matrix
    where
        F: Fn(usize, usize) -> Elem + Sync,
    {
        let mut data = vec![0; rows * cols];
        if cols > 0 {
            let fill_row = |(i, row): (usize, &mut [Elem])| {
                for (j, elem) in row.iter_mut().enumerate() {
                    *elem = f(i, j);
                }
            };
            match mode {
                KernelMode::Serial => data.chunks_mut(cols).enumerate().for_each(fill_row),
                KernelMode::Parallel => data.par_chunks_mut(cols).enumerate().for_each(fill_row),
            }
        }
        Matrix { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[Elem] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

fn row_dot(row: &[Elem], v: &[Elem]) -> Elem {
    row.iter().zip(v).map(|(a, b)| a * b).sum()
}

/// `result[i] = sum_j m[i][j] * v[j]` for every row of `m`.
///
/// # Panics
/// if `v.len() != m.cols()`
pub fn mat_vec(m: &Matrix, v: &[Elem], mode: KernelMode) -> Vec<Elem> {
    assert_eq!(
        v.len(),
        m.cols(),
        "vector length does not match the number of matrix columns"
    );
    let mut result = vec![0; m.rows()];
    match mode {
        KernelMode::Serial => result
            .iter_mut()
            .enumerate()
            .for_each(|(i, r)| *r = row_dot(m.row(i), v)),
        KernelMode::Parallel => result
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, r)| *r = row_dot(m.row(i), v)),
    }
    result
}

/// Sum of the element-wise products of `v1` and `v2`.
///
/// The parallel reduction order is not fixed, results may differ in the last bits between runs.
pub fn dot_product(v1: &[f64], v2: &[f64], mode: KernelMode) -> f64 {
    assert_eq!(v1.len(), v2.len(), "vectors must have the same length");
    match mode {
        KernelMode::Serial => v1.iter().zip(v2).map(|(a, b)| a * b).sum(),
        KernelMode::Parallel => v1.par_iter().zip(v2).map(|(a, b)| a * b).sum(),
    }
}

/// How the dot benchmark populates its vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillType {
    /// uniform values in `[0, 1)`
    Random,
    /// `v[n] = n`
    Sequential,
    /// all ones
    Unit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFillTypeError(String);

impl std::fmt::Display for ParseFillTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown population type {:?}, expected one of rnd, seq, uni",
            self.0
        )
    }
}

impl std::error::Error for ParseFillTypeError {}

impl std::str::FromStr for FillType {
    type Err = ParseFillTypeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rnd" => Ok(FillType::Random),
            "seq" => Ok(FillType::Sequential),
            "uni" => Ok(FillType::Unit),
            _ => Err(ParseFillTypeError(s.to_owned())),
        }
    }
}

impl std::fmt::Display for FillType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FillType::Random => write!(f, "rnd"),
            FillType::Sequential => write!(f, "seq"),
            FillType::Unit => write!(f, "uni"),
        }
    }
}

/// Populate both vectors according to `fill`, returning the elapsed time in seconds.
pub fn fill_vectors(v1: &mut [f64], v2: &mut [f64], fill: FillType, mode: KernelMode) -> f64 {
    let timer = Instant::now();
    match (fill, mode) {
        (FillType::Random, KernelMode::Serial) => {
            let mut rng = rand::thread_rng();
            v1.iter_mut().for_each(|x| *x = rng.gen::<f64>());
            v2.iter_mut().for_each(|x| *x = rng.gen::<f64>());
        }
        (FillType::Random, KernelMode::Parallel) => {
            v1.par_iter_mut()
                .chain(v2.par_iter_mut())
                .for_each_init(rand::thread_rng, |rng, x| *x = rng.gen::<f64>());
        }
        (FillType::Sequential, KernelMode::Serial) => {
            for (n, (a, b)) in v1.iter_mut().zip(v2.iter_mut()).enumerate() {
                *a = n as f64;
                *b = n as f64;
            }
        }
        (FillType::Sequential, KernelMode::Parallel) => {
            v1.par_iter_mut()
                .zip(v2.par_iter_mut())
                .enumerate()
                .for_each(|(n, (a, b))| {
                    *a = n as f64;
                    *b = n as f64;
                });
        }
        (FillType::Unit, _) => {
            v1.fill(1.0);
            v2.fill(1.0);
        }
    }
    timer.elapsed().as_secs_f64()
}
