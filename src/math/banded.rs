//! Diagonal-band sparse matrices and a no-pivot banded LU factorization.
//!
//! Upwind asset-transition generators have a fixed, small set of nonzero
//! diagonals: liquid neighbors at offsets -1/+1 and illiquid neighbors at
//! -stride/+stride. The implicit solver matrices assembled from them are
//! strictly diagonally dominant, so Gaussian elimination without pivoting is
//! stable, and the factorization fills in nothing outside the band
//! rectangle.

use nalgebra::DMatrix;

use crate::core::SolveError;

/// Rows whose column `row + offset` stays inside an `n x n` matrix.
#[inline]
fn row_range(n: usize, offset: isize) -> (usize, usize) {
    let lo = if offset < 0 {
        (offset.unsigned_abs()).min(n)
    } else {
        0
    };
    let hi = if offset > 0 {
        n.saturating_sub(offset as usize)
    } else {
        n
    };
    (lo, hi)
}

/// Sparse matrix stored as diagonals at fixed offsets.
///
/// `band(k)[row]` holds the entry `(row, row + offsets[k])`; positions whose
/// column falls outside the matrix are kept at zero and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct BandedMatrix {
    n: usize,
    offsets: Vec<isize>,
    bands: Vec<Vec<f64>>,
}

impl BandedMatrix {
    /// Zero matrix with the given diagonal offsets (sorted, deduplicated).
    pub fn zeros(n: usize, mut offsets: Vec<isize>) -> Self {
        offsets.sort_unstable();
        offsets.dedup();
        let bands = offsets.iter().map(|_| vec![0.0; n]).collect();
        Self { n, offsets, bands }
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn offsets(&self) -> &[isize] {
        &self.offsets
    }

    /// Position of `offset` in the band list.
    pub fn offset_index(&self, offset: isize) -> Option<usize> {
        self.offsets.iter().position(|&o| o == offset)
    }

    #[inline]
    pub fn band(&self, k: usize) -> &[f64] {
        &self.bands[k]
    }

    #[inline]
    pub fn band_mut(&mut self, k: usize) -> &mut [f64] {
        &mut self.bands[k]
    }

    #[inline]
    fn in_range(n: usize, row: usize, offset: isize) -> bool {
        let col = row as isize + offset;
        col >= 0 && (col as usize) < n
    }

    /// Adds `value` to the entry `(row, row + offsets[band])`.
    #[inline]
    pub fn add_at(&mut self, band: usize, row: usize, value: f64) {
        debug_assert!(Self::in_range(self.n, row, self.offsets[band]));
        self.bands[band][row] += value;
    }

    /// Entry `(row, col)`; zero off the stored diagonals.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        debug_assert!(row < self.n && col < self.n);
        let offset = col as isize - row as isize;
        match self.offset_index(offset) {
            Some(k) => self.bands[k][row],
            None => 0.0,
        }
    }

    pub fn row_sum(&self, row: usize) -> f64 {
        let mut sum = 0.0;
        for (k, &offset) in self.offsets.iter().enumerate() {
            if Self::in_range(self.n, row, offset) {
                sum += self.bands[k][row];
            }
        }
        sum
    }

    /// `y = self * x`.
    pub fn matvec(&self, x: &[f64], y: &mut [f64]) {
        debug_assert_eq!(x.len(), self.n);
        debug_assert_eq!(y.len(), self.n);
        y.fill(0.0);
        for (k, &offset) in self.offsets.iter().enumerate() {
            let band = &self.bands[k];
            let (lo, hi) = row_range(self.n, offset);
            for row in lo..hi {
                let col = (row as isize + offset) as usize;
                y[row] = band[row].mul_add(x[col], y[row]);
            }
        }
    }

    /// Transposed matrix (offsets negated, entries re-indexed by column).
    pub fn transpose(&self) -> BandedMatrix {
        let m = self.offsets.len();
        let offsets: Vec<isize> = self.offsets.iter().rev().map(|&o| -o).collect();
        let mut bands = vec![vec![0.0; self.n]; m];
        for (k, &offset) in self.offsets.iter().enumerate() {
            let flipped = m - 1 - k;
            let (lo, hi) = row_range(self.n, offset);
            for row in lo..hi {
                let col = (row as isize + offset) as usize;
                bands[flipped][col] = self.bands[k][row];
            }
        }
        BandedMatrix {
            n: self.n,
            offsets,
            bands,
        }
    }

    /// Copies the square sub-matrix covering rows `start..start + len`.
    /// Entries coupling the block to the outside must be zero.
    pub fn block(&self, start: usize, len: usize) -> BandedMatrix {
        debug_assert!(start + len <= self.n);
        let mut out = BandedMatrix::zeros(len, self.offsets.clone());
        for (k, &offset) in self.offsets.iter().enumerate() {
            for local in 0..len {
                let row = start + local;
                let col = row as isize + offset;
                if col < start as isize || col >= (start + len) as isize {
                    debug_assert!(
                        !Self::in_range(self.n, row, offset) || self.bands[k][row] == 0.0,
                        "block extraction would drop a nonzero coupling entry"
                    );
                    continue;
                }
                out.bands[k][local] = self.bands[k][row];
            }
        }
        out
    }

    /// Dense copy, for the direct solvers and for tests.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.n, self.n);
        for (k, &offset) in self.offsets.iter().enumerate() {
            let (lo, hi) = row_range(self.n, offset);
            for row in lo..hi {
                let col = (row as isize + offset) as usize;
                dense[(row, col)] = self.bands[k][row];
            }
        }
        dense
    }
}

/// LU factorization of a banded matrix without pivoting.
///
/// Storage is the LAPACK-style band rectangle: row `i` keeps columns
/// `i - lower ..= i + upper` contiguously, with `L` (unit diagonal, implied)
/// below and `U` on/above the diagonal after factorization.
#[derive(Debug, Clone)]
pub struct BandedLu {
    n: usize,
    lower: usize,
    upper: usize,
    data: Vec<f64>,
}

impl BandedLu {
    pub fn factor(matrix: &BandedMatrix) -> Result<Self, SolveError> {
        let n = matrix.n();
        let lower = matrix
            .offsets()
            .first()
            .map_or(0, |&o| o.min(0).unsigned_abs());
        let upper = matrix.offsets().last().map_or(0, |&o| o.max(0) as usize);
        let width = lower + upper + 1;
        let mut data = vec![0.0; n * width];
        for (k, &offset) in matrix.offsets().iter().enumerate() {
            let (lo, hi) = row_range(n, offset);
            let band = matrix.band(k);
            for row in lo..hi {
                data[row * width + (offset + lower as isize) as usize] = band[row];
            }
        }

        for i in 0..n {
            let pivot = data[i * width + lower];
            if pivot.abs() <= 1.0e-14 {
                return Err(SolveError::NumericalError(format!(
                    "singular pivot in banded factorization at row {i}"
                )));
            }
            let row_hi = (i + lower).min(n - 1);
            for r in i + 1..=row_hi {
                let col_i = i + lower - r;
                let factor = data[r * width + col_i] / pivot;
                data[r * width + col_i] = factor;
                if factor != 0.0 {
                    let col_hi = (i + upper).min(n - 1);
                    for c in i + 1..=col_hi {
                        let dst = c + lower - r;
                        let src = c + lower - i;
                        data[r * width + dst] -= factor * data[i * width + src];
                    }
                }
            }
        }
        Ok(Self {
            n,
            lower,
            upper,
            data,
        })
    }

    /// Solves `self * out = rhs` in place.
    pub fn solve_in_place(&self, x: &mut [f64]) {
        debug_assert_eq!(x.len(), self.n);
        let width = self.lower + self.upper + 1;
        for i in 0..self.n {
            let j_lo = i.saturating_sub(self.lower);
            let mut sum = x[i];
            for j in j_lo..i {
                sum -= self.data[i * width + (j + self.lower - i)] * x[j];
            }
            x[i] = sum;
        }
        for i in (0..self.n).rev() {
            let j_hi = (i + self.upper).min(self.n - 1);
            let mut sum = x[i];
            for j in i + 1..=j_hi {
                sum -= self.data[i * width + (j + self.lower - i)] * x[j];
            }
            x[i] = sum / self.data[i * width + self.lower];
        }
    }

    pub fn solve(&self, rhs: &[f64], out: &mut [f64]) {
        out.copy_from_slice(rhs);
        self.solve_in_place(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_dominant(n: usize, offsets: Vec<isize>, seed: u64) -> BandedMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut m = BandedMatrix::zeros(n, offsets);
        let diag = m.offset_index(0).unwrap();
        for k in 0..m.offsets().len() {
            if k == diag {
                continue;
            }
            let offset = m.offsets()[k];
            let (lo, hi) = super::row_range(n, offset);
            for row in lo..hi {
                let v = rng.random::<f64>();
                m.add_at(k, row, v);
                m.add_at(diag, row, v + 0.5);
            }
        }
        for row in 0..n {
            m.add_at(diag, row, 1.0);
        }
        m
    }

    #[test]
    fn banded_solve_matches_dense_lu() {
        let m = random_dominant(24, vec![-5, -1, 0, 1, 5], 11);
        let mut rng = StdRng::seed_from_u64(12);
        let rhs: Vec<f64> = (0..24).map(|_| rng.random::<f64>() - 0.5).collect();

        let lu = BandedLu::factor(&m).unwrap();
        let mut x = rhs.clone();
        lu.solve_in_place(&mut x);

        let dense = m.to_dense();
        let reference = dense.lu().solve(&DVector::from_vec(rhs)).unwrap();
        for i in 0..24 {
            assert_relative_eq!(x[i], reference[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn matvec_matches_dense_product() {
        let m = random_dominant(17, vec![-4, -1, 0, 1, 4], 3);
        let x: Vec<f64> = (0..17).map(|i| (i as f64).sin()).collect();
        let mut y = vec![0.0; 17];
        m.matvec(&x, &mut y);
        let dense = m.to_dense() * DVector::from_vec(x);
        for i in 0..17 {
            assert_relative_eq!(y[i], dense[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn transpose_swaps_entries() {
        let m = random_dominant(12, vec![-3, -1, 0, 1, 3], 5);
        let t = m.transpose();
        for i in 0..12 {
            for j in 0..12 {
                assert_relative_eq!(m.get(i, j), t.get(j, i), epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn block_extraction_preserves_entries() {
        let mut m = BandedMatrix::zeros(8, vec![-1, 0, 1]);
        let diag = m.offset_index(0).unwrap();
        let up = m.offset_index(1).unwrap();
        for row in 0..8 {
            m.add_at(diag, row, row as f64 + 1.0);
        }
        // couple rows only within the halves [0,4) and [4,8)
        for row in [0usize, 1, 2, 4, 5, 6] {
            m.add_at(up, row, 0.25);
        }
        let b = m.block(4, 4);
        assert_relative_eq!(b.get(0, 0), 5.0);
        assert_relative_eq!(b.get(2, 3), 0.25);
        assert_relative_eq!(b.get(3, 3), 8.0);
    }

    #[test]
    fn zero_matrix_is_reported_singular() {
        let m = BandedMatrix::zeros(4, vec![-1, 0, 1]);
        assert!(matches!(
            BandedLu::factor(&m),
            Err(SolveError::NumericalError(_))
        ));
    }

    #[test]
    fn row_sum_skips_out_of_range_positions() {
        let mut m = BandedMatrix::zeros(3, vec![-1, 0, 1]);
        let diag = m.offset_index(0).unwrap();
        for row in 0..3 {
            m.add_at(diag, row, 2.0);
        }
        assert_relative_eq!(m.row_sum(0), 2.0);
        assert_relative_eq!(m.row_sum(2), 2.0);
    }
}
