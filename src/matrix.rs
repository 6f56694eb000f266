//! Matrices of computation nodes: linear algebra over [`Scalar`] grids.
//!
//! A [`Matrix`] is a `height x width` grid of scalar nodes. Operators either
//! materialize a new grid of new nodes (multiply, softmax, concatenation) or
//! return a view sharing the underlying cells (transpose, row/column
//! selection). Dimension mismatches are fatal input errors and fail at the
//! call site.

use crate::context::Context;
use crate::gradient::GradientMap;
use crate::key::{Key, VariableKey};
use crate::scalar::Scalar;
use rand::Rng;
use std::rc::Rc;

/// A `height x width` grid of scalar computation nodes.
///
/// Cells are shared handles, so cloning a matrix or taking a view never copies
/// node state.
#[derive(Clone)]
pub struct Matrix<K: Key> {
    cells: Rc<Vec<Scalar<K>>>,
    height: usize,
    width: usize,
    /// Row length of the backing storage (view dims may be swapped).
    base_width: usize,
    transposed: bool,
}

/// Sum of one or more cells, without forcing a two-term minimum.
fn sum_all<K: Key>(mut terms: Vec<Scalar<K>>) -> Scalar<K> {
    assert!(!terms.is_empty(), "cannot sum zero cells");
    if terms.len() == 1 {
        terms.pop().unwrap()
    } else {
        Scalar::sum(terms)
    }
}

impl<K: Key> Matrix<K> {
    fn from_storage(cells: Vec<Scalar<K>>, height: usize, width: usize) -> Self {
        assert_eq!(cells.len(), height * width);
        Matrix {
            cells: Rc::new(cells),
            height,
            width,
            base_width: width,
            transposed: false,
        }
    }

    /// Matrix built cell-by-cell from `f(row, col)`.
    pub fn from_fn(height: usize, width: usize, mut f: impl FnMut(usize, usize) -> Scalar<K>) -> Self {
        let mut cells = Vec::with_capacity(height * width);
        for r in 0..height {
            for c in 0..width {
                cells.push(f(r, c));
            }
        }
        Matrix::from_storage(cells, height, width)
    }

    /// Fresh variable per cell, keyed `(id, row, col)` and valued from `ctx`.
    ///
    /// # Panics
    /// When any cell key is missing from the context template.
    pub fn from_variables(id: K, height: usize, width: usize, ctx: &Context<K>) -> Self {
        Matrix::from_fn(height, width, |r, c| {
            ctx.variable(VariableKey::cell(id.clone(), r, c))
        })
    }

    /// Constant-mode read of a matrix variable: same values, no derivative
    /// tracking. For inference-only use.
    pub fn from_context_constants(id: K, height: usize, width: usize, ctx: &Context<K>) -> Self {
        Matrix::from_fn(height, width, |r, c| {
            ctx.constant(&VariableKey::cell(id.clone(), r, c))
        })
    }

    /// Every cell the same constant.
    pub fn from_constant(value: f64, height: usize, width: usize) -> Self {
        Matrix::from_fn(height, width, |_, _| Scalar::constant(value))
    }

    /// Constant matrix from row-major numeric data. Rows must be rectangular.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let height = rows.len();
        assert!(height > 0, "matrix needs at least one row");
        let width = rows[0].len();
        assert!(
            rows.iter().all(|r| r.len() == width),
            "ragged rows: expected width {width}"
        );
        Matrix::from_fn(height, width, |r, c| Scalar::constant(rows[r][c]))
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Cell at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> &Scalar<K> {
        assert!(
            row < self.height && col < self.width,
            "cell ({row}, {col}) out of range for {}x{} matrix",
            self.height,
            self.width
        );
        let idx = if self.transposed {
            col * self.base_width + row
        } else {
            row * self.base_width + col
        };
        &self.cells[idx]
    }

    // -------------------------------------------------------------------------
    // Pointwise and structural operators
    // -------------------------------------------------------------------------

    /// Pointwise sum. Dimensions must match exactly.
    pub fn add(&self, other: &Matrix<K>) -> Matrix<K> {
        self.assert_same_shape(other, "add");
        Matrix::from_fn(self.height, self.width, |r, c| {
            self.get(r, c).plus(other.get(r, c))
        })
    }

    /// Pointwise product. Dimensions must match exactly.
    pub fn pointwise_times(&self, other: &Matrix<K>) -> Matrix<K> {
        self.assert_same_shape(other, "pointwise_times");
        Matrix::from_fn(self.height, self.width, |r, c| {
            self.get(r, c).times(other.get(r, c))
        })
    }

    fn assert_same_shape(&self, other: &Matrix<K>, op: &str) {
        assert!(
            self.height == other.height && self.width == other.width,
            "{op}: {}x{} vs {}x{}",
            self.height,
            self.width,
            other.height,
            other.width
        );
    }

    /// Matrix multiply with immediately-materialized cells.
    ///
    /// Each output cell carries `sum_k left(i,k) * right(k,j)` and a sparse
    /// gradient realized at construction. Multiply is the highest-fan-in
    /// operator; layering lazy sum/product nodes here is the dominant
    /// recomputation risk, so the gradient is paid for once up front.
    pub fn times(&self, other: &Matrix<K>) -> Matrix<K> {
        assert_eq!(
            self.width, other.height,
            "times: {}x{} is incompatible with {}x{}",
            self.height, self.width, other.height, other.width
        );
        Matrix::from_fn(self.height, other.width, |i, j| {
            let mut value = 0.0;
            let mut gradient = GradientMap::with_bucket_hint(self.width * 2);
            for k in 0..self.width {
                let left = self.get(i, k);
                let right = other.get(k, j);
                value += left.value() * right.value();
                let rv = right.value();
                if rv != 0.0 {
                    left.for_each_derivative(&mut |key, d| gradient.accumulate(key, d * rv));
                }
                let lv = left.value();
                if lv != 0.0 {
                    right.for_each_derivative(&mut |key, d| gradient.accumulate(key, d * lv));
                }
            }
            Scalar::materialized(value, gradient)
        })
    }

    /// Matrix multiply with lazy cells: identical values to [`Matrix::times`],
    /// but each cell stays a sum-of-products node.
    ///
    /// For results consumed once, or cached/discarded shortly after, where
    /// forced materialization would be wasted.
    pub fn streaming_times(&self, other: &Matrix<K>) -> Matrix<K> {
        assert_eq!(
            self.width, other.height,
            "streaming_times: {}x{} is incompatible with {}x{}",
            self.height, self.width, other.height, other.width
        );
        Matrix::from_fn(self.height, other.width, |i, j| {
            sum_all(
                (0..self.width)
                    .map(|k| self.get(i, k).times(other.get(k, j)))
                    .collect(),
            )
        })
    }

    /// Vertical concatenation: `self` stacked above `other`. Widths must match.
    pub fn vcat(&self, other: &Matrix<K>) -> Matrix<K> {
        assert_eq!(
            self.width, other.width,
            "vcat: width {} vs {}",
            self.width, other.width
        );
        Matrix::from_fn(self.height + other.height, self.width, |r, c| {
            if r < self.height {
                self.get(r, c).clone()
            } else {
                other.get(r - self.height, c).clone()
            }
        })
    }

    /// Zero-copy transposed view. Transposing twice returns the original
    /// orientation over the same cells.
    pub fn transpose(&self) -> Matrix<K> {
        Matrix {
            cells: Rc::clone(&self.cells),
            height: self.width,
            width: self.height,
            base_width: self.base_width,
            transposed: !self.transposed,
        }
    }

    // -------------------------------------------------------------------------
    // Softmax and selection/sampling
    // -------------------------------------------------------------------------

    /// Softmax down a single column.
    ///
    /// The column's numeric maximum is subtracted as a constant (not
    /// differentiated through) before exponentiating, so large logits cannot
    /// overflow; the result is normalized by the sum of exponentials.
    pub fn softmax(&self) -> Matrix<K> {
        assert_eq!(self.width, 1, "softmax expects a width-1 matrix");
        let max = (0..self.height)
            .map(|r| self.get(r, 0).value())
            .fold(f64::NEG_INFINITY, f64::max);
        let max = Scalar::constant(max);
        let exps: Vec<Scalar<K>> = (0..self.height)
            .map(|r| self.get(r, 0).minus(&max).exp())
            .collect();
        let total = sum_all(exps.clone());
        Matrix::from_fn(self.height, 1, |r, _| exps[r].divide(&total))
    }

    /// Reduced matrix of the given rows, sharing the source cells.
    pub fn get_rows(&self, rows: &[usize]) -> Matrix<K> {
        Matrix::from_fn(rows.len(), self.width, |r, c| self.get(rows[r], c).clone())
    }

    /// Reduced matrix of the given columns, sharing the source cells.
    pub fn get_columns(&self, cols: &[usize]) -> Matrix<K> {
        Matrix::from_fn(self.height, cols.len(), |r, c| self.get(r, cols[c]).clone())
    }

    /// Reduced matrix of `count + 1` distinct rows: `required` plus `count`
    /// rows drawn without replacement from the rest.
    ///
    /// The mechanism behind sampled-softmax losses: the true label row is
    /// always present, negatives are random. Returns the selected indices in
    /// ascending order alongside the reduced matrix.
    ///
    /// # Panics
    /// When `required` is out of range or `count >= height`.
    pub fn select_and_sample_rows(
        &self,
        required: usize,
        count: usize,
        rng: &mut impl Rng,
    ) -> (Vec<usize>, Matrix<K>) {
        let indices = sample_distinct(self.height, count, required, rng);
        let matrix = self.get_rows(&indices);
        (indices, matrix)
    }

    /// Same-shape matrix with all but `count + 1` sampled columns zeroed.
    ///
    /// `required` is always kept. Unselected columns become constant zero, so
    /// no gradient flows through them.
    pub fn select_and_sample_columns_with_elimination(
        &self,
        required: usize,
        count: usize,
        rng: &mut impl Rng,
    ) -> (Vec<usize>, Matrix<K>) {
        let indices = sample_distinct(self.width, count, required, rng);
        let matrix = Matrix::from_fn(self.height, self.width, |r, c| {
            if indices.binary_search(&c).is_ok() {
                self.get(r, c).clone()
            } else {
                Scalar::constant(0.0)
            }
        });
        (indices, matrix)
    }

    /// Euclidean distance from each column to a width-1 `reference` column,
    /// as a `1 x width` matrix.
    ///
    /// Built from `power(0.5)` of the summed squared differences. Used for
    /// nearest-neighbor comparison, not for differentiated distance
    /// minimization.
    pub fn column_proximity(&self, reference: &Matrix<K>) -> Matrix<K> {
        assert_eq!(reference.width, 1, "column_proximity reference must be width-1");
        assert_eq!(
            self.height, reference.height,
            "column_proximity: height {} vs {}",
            self.height, reference.height
        );
        Matrix::from_fn(1, self.width, |_, c| self.distance_to(reference, c))
    }

    /// [`Matrix::column_proximity`] over a sampled column subset: `required`
    /// plus `count` random columns get real distances, every other column
    /// reports `f64::MAX`.
    pub fn sampled_column_proximity(
        &self,
        reference: &Matrix<K>,
        required: usize,
        count: usize,
        rng: &mut impl Rng,
    ) -> (Vec<usize>, Matrix<K>) {
        assert_eq!(reference.width, 1, "column_proximity reference must be width-1");
        assert_eq!(
            self.height, reference.height,
            "column_proximity: height {} vs {}",
            self.height, reference.height
        );
        let indices = sample_distinct(self.width, count, required, rng);
        let matrix = Matrix::from_fn(1, self.width, |_, c| {
            if indices.binary_search(&c).is_ok() {
                self.distance_to(reference, c)
            } else {
                Scalar::constant(f64::MAX)
            }
        });
        (indices, matrix)
    }

    fn distance_to(&self, reference: &Matrix<K>, col: usize) -> Scalar<K> {
        let squares = (0..self.height)
            .map(|r| {
                let diff = self.get(r, col).minus(reference.get(r, 0));
                diff.times(&diff)
            })
            .collect();
        sum_all(squares).power(0.5)
    }
}

/// `count + 1` distinct indices below `max`, always including `forced`,
/// sampled without replacement, returned in ascending order.
fn sample_distinct(max: usize, count: usize, forced: usize, rng: &mut impl Rng) -> Vec<usize> {
    assert!(forced < max, "forced index {forced} out of range for {max}");
    assert!(
        count < max,
        "cannot sample {count} extra indices from a population of {max}"
    );
    let mut indices: Vec<usize> = rand::seq::index::sample(rng, max - 1, count)
        .iter()
        .map(|i| if i >= forced { i + 1 } else { i })
        .collect();
    indices.push(forced);
    indices.sort_unstable();
    indices
}
