//! Fixed-size dense matrices for the Kalman filters and plane fitting.
//!
//! State sizes are compile-time constants (7 for orientation, 6 for
//! position, 3 for plane covariance), so [`Matrix`] stores a plain
//! `[[f64; C]; R]` and every shape mismatch is a type error.
//!
//! # Example
//!
//! ```rust
//! use chiroptera_types::linalg::Matrix;
//!
//! let a = Matrix::<2, 2>::from_rows([[4.0, 7.0], [2.0, 6.0]]);
//! let inv = a.try_inverse().expect("non-singular");
//! let id = a * inv;
//! assert!((id[(0, 0)] - 1.0).abs() < 1e-12);
//! assert!(id[(0, 1)].abs() < 1e-12);
//! ```

use std::ops::{Add, Index, IndexMut, Mul, Sub};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Dense `R × C` matrix of `f64`, row-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix<const R: usize, const C: usize> {
    data: [[f64; C]; R],
}

/// Column vector of length `N`.
pub type Vector<const N: usize> = Matrix<N, 1>;

impl<const R: usize, const C: usize> Matrix<R, C> {
    pub const fn zeros() -> Self {
        Self { data: [[0.0; C]; R] }
    }

    pub const fn from_rows(data: [[f64; C]; R]) -> Self {
        Self { data }
    }

    pub fn rows(&self) -> &[[f64; C]; R] {
        &self.data
    }

    pub fn transpose(&self) -> Matrix<C, R> {
        let mut out = Matrix::<C, R>::zeros();
        for r in 0..R {
            for c in 0..C {
                out.data[c][r] = self.data[r][c];
            }
        }
        out
    }

    pub fn scale(&self, k: f64) -> Self {
        let mut out = *self;
        for row in out.data.iter_mut() {
            for v in row.iter_mut() {
                *v *= k;
            }
        }
        out
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().flatten().all(|v| v.is_finite())
    }
}

impl<const N: usize> Matrix<N, N> {
    pub fn identity() -> Self {
        Self::from_diagonal([1.0; N])
    }

    pub fn from_diagonal(diag: [f64; N]) -> Self {
        let mut out = Self::zeros();
        for (i, d) in diag.into_iter().enumerate() {
            out.data[i][i] = d;
        }
        out
    }

    pub fn diagonal(&self) -> [f64; N] {
        let mut out = [0.0; N];
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.data[i][i];
        }
        out
    }

    pub fn trace(&self) -> f64 {
        self.diagonal().iter().sum()
    }

    /// Average with the transpose, removing the asymmetry that creeps into
    /// covariance matrices through rounding.
    pub fn symmetrized(&self) -> Self {
        let mut out = *self;
        for r in 0..N {
            for c in (r + 1)..N {
                let v = 0.5 * (self.data[r][c] + self.data[c][r]);
                out.data[r][c] = v;
                out.data[c][r] = v;
            }
        }
        out
    }

    /// Gauss–Jordan inverse with partial pivoting.
    ///
    /// Returns `None` for a singular (or numerically singular) matrix.
    pub fn try_inverse(&self) -> Option<Self> {
        let mut a = self.data;
        let mut inv = Self::identity().data;

        for col in 0..N {
            let pivot = (col..N).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
            if a[pivot][col].abs() < 1e-14 {
                return None;
            }
            a.swap(col, pivot);
            inv.swap(col, pivot);

            let p = a[col][col];
            for c in 0..N {
                a[col][c] /= p;
                inv[col][c] /= p;
            }
            for r in 0..N {
                if r == col {
                    continue;
                }
                let f = a[r][col];
                if f == 0.0 {
                    continue;
                }
                for c in 0..N {
                    a[r][c] -= f * a[col][c];
                    inv[r][c] -= f * inv[col][c];
                }
            }
        }

        let out = Self::from_rows(inv);
        out.is_finite().then_some(out)
    }
}

impl<const N: usize> Matrix<N, 1> {
    pub fn from_column(values: [f64; N]) -> Self {
        let mut out = Self::zeros();
        for (i, v) in values.into_iter().enumerate() {
            out.data[i][0] = v;
        }
        out
    }

    pub fn column(&self) -> [f64; N] {
        let mut out = [0.0; N];
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.data[i][0];
        }
        out
    }
}

impl Matrix<3, 3> {
    /// Eigen-decomposition of a symmetric 3×3 matrix by cyclic Jacobi
    /// rotations.
    ///
    /// Returns the eigenvalues in ascending order together with the matching
    /// unit eigenvectors (`vectors[i]` belongs to `values[i]`).
    pub fn symmetric_eigen(&self) -> ([f64; 3], [[f64; 3]; 3]) {
        let mut a = self.symmetrized();
        let mut v = Self::identity();

        for _sweep in 0..64 {
            let off = a.data[0][1].abs() + a.data[0][2].abs() + a.data[1][2].abs();
            if off < 1e-15 {
                break;
            }
            for (p, q) in [(0, 1), (0, 2), (1, 2)] {
                let apq = a.data[p][q];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let theta = (a.data[q][q] - a.data[p][p]) / (2.0 * apq);
                let t = if theta >= 0.0 { 1.0 } else { -1.0 }
                    / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                let mut j = Self::identity();
                j.data[p][p] = c;
                j.data[q][q] = c;
                j.data[p][q] = s;
                j.data[q][p] = -s;

                a = j.transpose() * a * j;
                v = v * j;
            }
        }

        let mut order = [0usize, 1, 2];
        order.sort_by(|&i, &j| a.data[i][i].total_cmp(&a.data[j][j]));

        let mut values = [0.0; 3];
        let mut vectors = [[0.0; 3]; 3];
        for (k, &i) in order.iter().enumerate() {
            values[k] = a.data[i][i];
            vectors[k] = [v.data[0][i], v.data[1][i], v.data[2][i]];
        }
        (values, vectors)
    }
}

impl<const R: usize, const C: usize> Index<(usize, usize)> for Matrix<R, C> {
    type Output = f64;
    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        &self.data[r][c]
    }
}

impl<const R: usize, const C: usize> IndexMut<(usize, usize)> for Matrix<R, C> {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        &mut self.data[r][c]
    }
}

impl<const R: usize, const C: usize> Add for Matrix<R, C> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        let mut out = self;
        for r in 0..R {
            for c in 0..C {
                out.data[r][c] += rhs.data[r][c];
            }
        }
        out
    }
}

impl<const R: usize, const C: usize> Sub for Matrix<R, C> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        let mut out = self;
        for r in 0..R {
            for c in 0..C {
                out.data[r][c] -= rhs.data[r][c];
            }
        }
        out
    }
}

impl<const R: usize, const K: usize, const C: usize> Mul<Matrix<K, C>> for Matrix<R, K> {
    type Output = Matrix<R, C>;
    fn mul(self, rhs: Matrix<K, C>) -> Matrix<R, C> {
        let mut out = Matrix::<R, C>::zeros();
        for r in 0..R {
            for c in 0..C {
                let mut acc = 0.0;
                for k in 0..K {
                    acc += self.data[r][k] * rhs.data[k][c];
                }
                out.data[r][c] = acc;
            }
        }
        out
    }
}

// Serialised as a list of rows so snapshots stay readable in JSON/TOML.
impl<const R: usize, const C: usize> Serialize for Matrix<R, C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.data.iter().map(|row| row.as_slice()))
    }
}

impl<'de, const R: usize, const C: usize> Deserialize<'de> for Matrix<R, C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let rows: Vec<Vec<f64>> = Vec::deserialize(deserializer)?;
        if rows.len() != R {
            return Err(D::Error::custom(format!("expected {R} rows, got {}", rows.len())));
        }
        let mut out = Self::zeros();
        for (r, row) in rows.into_iter().enumerate() {
            if row.len() != C {
                return Err(D::Error::custom(format!(
                    "row {r}: expected {C} columns, got {}",
                    row.len()
                )));
            }
            out.data[r].copy_from_slice(&row);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_multiplicative_neutral() {
        let a = Matrix::<3, 3>::from_rows([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 10.0]]);
        assert_eq!(a * Matrix::identity(), a);
        assert_eq!(Matrix::identity() * a, a);
    }

    #[test]
    fn rectangular_product_shapes() {
        let a = Matrix::<2, 3>::from_rows([[1.0, 0.0, 2.0], [0.0, 1.0, 0.0]]);
        let b = Vector::<3>::from_column([1.0, 2.0, 3.0]);
        let c = a * b;
        assert_eq!(c.column(), [7.0, 2.0]);
        assert_eq!(a.transpose()[(2, 0)], 2.0);
    }

    #[test]
    fn inverse_of_singular_is_none() {
        let a = Matrix::<2, 2>::from_rows([[1.0, 2.0], [2.0, 4.0]]);
        assert!(a.try_inverse().is_none());
    }

    #[test]
    fn inverse_needs_pivoting() {
        let a = Matrix::<3, 3>::from_rows([[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 2.0]]);
        let inv = a.try_inverse().expect("invertible");
        let id = a * inv;
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((id[(r, c)] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn symmetric_eigen_recovers_diagonal() {
        let a = Matrix::<3, 3>::from_diagonal([3.0, 1.0, 2.0]);
        let (values, vectors) = a.symmetric_eigen();
        assert_eq!(values, [1.0, 2.0, 3.0]);
        assert!((vectors[0][1].abs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn symmetric_eigen_satisfies_definition() {
        let a = Matrix::<3, 3>::from_rows([[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 1.0]]);
        let (values, vectors) = a.symmetric_eigen();
        assert!(values[0] <= values[1] && values[1] <= values[2]);
        for (lambda, v) in values.iter().zip(vectors.iter()) {
            let x = Vector::<3>::from_column(*v);
            let ax = a * x;
            for i in 0..3 {
                assert!((ax[(i, 0)] - lambda * v[i]).abs() < 1e-9);
            }
            let norm: f64 = v.iter().map(|c| c * c).sum::<f64>().sqrt();
            assert!((norm - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn serde_roundtrip_checks_shape() {
        let a = Matrix::<2, 2>::from_rows([[1.0, 2.0], [3.0, 4.0]]);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "[[1.0,2.0],[3.0,4.0]]");
        let back: Matrix<2, 2> = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
        assert!(serde_json::from_str::<Matrix<3, 2>>(&json).is_err());
    }
}
