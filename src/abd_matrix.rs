//! Almost-block-diagonal normal matrix (spec §4.7): a symmetric matrix
//! made of `D` diagonal blocks coupled through a single dense border
//! block, solved by block LU plus a Schur complement on the border
//! rather than a dense factorization of the whole `K×K` system.

use nalgebra::{DMatrix, DVector};

use crate::errors::FitError;

#[derive(Debug, Clone)]
pub struct ABDMatrix {
    /// `D_k`, one per dataset.
    diagonal_blocks: Vec<DMatrix<f64>>,
    /// `C_k`: `n_k × n_B` coupling of dataset `k`'s locals to the border.
    border_blocks: Vec<DMatrix<f64>>,
    /// `D_B`: the border's own dense block.
    border_diagonal: DMatrix<f64>,
    /// `local_indices[k]` holds, for each row/column of `diagonal_blocks[k]`,
    /// its position in the externally-visible fit-index-ordered vector.
    local_indices: Vec<Vec<usize>>,
    /// Likewise for the border.
    border_indices: Vec<usize>,
    total_free: usize,
}

impl ABDMatrix {
    pub fn new(
        diagonal_blocks: Vec<DMatrix<f64>>,
        border_blocks: Vec<DMatrix<f64>>,
        border_diagonal: DMatrix<f64>,
        local_indices: Vec<Vec<usize>>,
        border_indices: Vec<usize>,
        total_free: usize,
    ) -> Self {
        ABDMatrix {
            diagonal_blocks,
            border_blocks,
            border_diagonal,
            local_indices,
            border_indices,
            total_free,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.diagonal_blocks.len()
    }

    pub fn border_size(&self) -> usize {
        self.border_diagonal.nrows()
    }

    pub fn diagonal_block(&self, k: usize) -> &DMatrix<f64> {
        &self.diagonal_blocks[k]
    }

    pub fn border_block(&self, k: usize) -> &DMatrix<f64> {
        &self.border_blocks[k]
    }

    /// Applies a per-fit-index scale vector `s` to every entry,
    /// `A[i,j] *= s[i] * s[j]` (spec §4.9's `scaleByMagnitude`), used
    /// to build the scaled normal matrix before damping/solving.
    pub fn scale_rows_cols(&mut self, scale: &[f64]) {
        for k in 0..self.diagonal_blocks.len() {
            let n = self.diagonal_blocks[k].nrows();
            for i in 0..n {
                for j in 0..n {
                    self.diagonal_blocks[k][(i, j)] *=
                        scale[self.local_indices[k][i]] * scale[self.local_indices[k][j]];
                }
            }
            let (rows, cols) = self.border_blocks[k].shape();
            for i in 0..rows {
                for j in 0..cols {
                    self.border_blocks[k][(i, j)] *=
                        scale[self.local_indices[k][i]] * scale[self.border_indices[j]];
                }
            }
        }
        let n_border = self.border_diagonal.nrows();
        for i in 0..n_border {
            for j in 0..n_border {
                self.border_diagonal[(i, j)] *= scale[self.border_indices[i]] * scale[self.border_indices[j]];
            }
        }
    }

    /// `addToDiagonal(lambda)`: Levenberg-Marquardt damping, applied to
    /// every diagonal entry including the border's.
    pub fn add_to_diagonal(&mut self, lambda: f64) {
        for block in &mut self.diagonal_blocks {
            for i in 0..block.nrows() {
                block[(i, i)] += lambda;
            }
        }
        for i in 0..self.border_diagonal.nrows() {
            self.border_diagonal[(i, i)] += lambda;
        }
    }

    fn gather(&self, k: usize, v: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.local_indices[k].len(),
            self.local_indices[k].iter().map(|&i| v[i]),
        )
    }

    fn gather_border(&self, v: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.border_indices.len(),
            self.border_indices.iter().map(|&i| v[i]),
        )
    }

    /// Solve `A x = b`, `A = J^T J + λI` as assembled by `add_to_diagonal`,
    /// via block LU on each `D_k` and a Schur complement on the border
    /// (spec §4.7 steps 1-4). `b` and the returned vector are in
    /// fit-index order.
    pub fn solve(&self, b: &DVector<f64>) -> Result<DVector<f64>, FitError> {
        let n_border = self.border_size();
        let mut schur = self.border_diagonal.clone();
        let mut rhs_border = self.gather_border(b);

        // per-block reduced quantities, kept for the back-substitution pass
        let mut e_blocks = Vec::with_capacity(self.num_blocks());
        let mut reduced_b = Vec::with_capacity(self.num_blocks());

        for k in 0..self.num_blocks() {
            let d_k = &self.diagonal_blocks[k];
            let c_k = &self.border_blocks[k];
            let b_k = self.gather(k, b);

            let lu = d_k.clone().lu();
            let e_k = if n_border > 0 {
                lu.solve(c_k)
                    .ok_or_else(|| FitError::runtime("singular diagonal block in ABDMatrix::solve"))?
            } else {
                DMatrix::zeros(d_k.nrows(), 0)
            };
            let b_prime_k = lu
                .solve(&b_k)
                .ok_or_else(|| FitError::runtime("singular diagonal block in ABDMatrix::solve"))?;

            if n_border > 0 {
                schur -= c_k.transpose() * &e_k;
                rhs_border -= c_k.transpose() * &b_prime_k;
            }

            e_blocks.push(e_k);
            reduced_b.push(b_prime_k);
        }

        let x_border = if n_border > 0 {
            schur
                .lu()
                .solve(&rhs_border)
                .ok_or_else(|| FitError::runtime("singular Schur complement in ABDMatrix::solve"))?
        } else {
            DVector::zeros(0)
        };

        let mut x = DVector::zeros(self.total_free);
        for (&i, &v) in self.border_indices.iter().zip(x_border.iter()) {
            x[i] = v;
        }
        for k in 0..self.num_blocks() {
            let x_k = if n_border > 0 {
                &reduced_b[k] - &e_blocks[k] * &x_border
            } else {
                reduced_b[k].clone()
            };
            for (&i, &v) in self.local_indices[k].iter().zip(x_k.iter()) {
                x[i] = v;
            }
        }
        Ok(x)
    }

    /// Full dense inverse, used only for covariance output (§4.11):
    /// solves once per unit basis vector, reusing the same block
    /// solve as the main LM step.
    pub fn invert(&self) -> Result<DMatrix<f64>, FitError> {
        let n = self.total_free;
        let mut inverse = DMatrix::zeros(n, n);
        for col in 0..n {
            let mut e = DVector::zeros(n);
            e[col] = 1.0;
            let x = self.solve(&e)?;
            inverse.column_mut(col).copy_from(&x);
        }
        Ok(inverse)
    }

    /// Materializes the full dense `K×K` matrix (used by tests to check
    /// equivalence with a plain dense normal-equations solve).
    pub fn to_dense(&self) -> DMatrix<f64> {
        let n = self.total_free;
        let mut dense = DMatrix::zeros(n, n);
        for i in 0..self.border_indices.len() {
            for j in 0..self.border_indices.len() {
                dense[(self.border_indices[i], self.border_indices[j])] = self.border_diagonal[(i, j)];
            }
        }
        for k in 0..self.num_blocks() {
            let locals = &self.local_indices[k];
            for (ai, &gi) in locals.iter().enumerate() {
                for (aj, &gj) in locals.iter().enumerate() {
                    dense[(gi, gj)] = self.diagonal_blocks[k][(ai, aj)];
                }
                for (bj, &gj) in self.border_indices.iter().enumerate() {
                    let v = self.border_blocks[k][(ai, bj)];
                    dense[(gi, gj)] = v;
                    dense[(gj, gi)] = v;
                }
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_block_no_border() -> ABDMatrix {
        ABDMatrix::new(
            vec![
                DMatrix::from_row_slice(1, 1, &[4.0]),
                DMatrix::from_row_slice(1, 1, &[9.0]),
            ],
            vec![DMatrix::zeros(1, 0), DMatrix::zeros(1, 0)],
            DMatrix::zeros(0, 0),
            vec![vec![0], vec![1]],
            vec![],
            2,
        )
    }

    #[test]
    fn test_solve_block_diagonal_no_border() {
        let abd = two_block_no_border();
        let b = DVector::from_vec(vec![8.0, 18.0]);
        let x = abd.solve(&b).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-10);
        assert!((x[1] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_solve_matches_dense_with_border() {
        let abd = ABDMatrix::new(
            vec![DMatrix::from_row_slice(1, 1, &[3.0])],
            vec![DMatrix::from_row_slice(1, 1, &[1.0])],
            DMatrix::from_row_slice(1, 1, &[5.0]),
            vec![vec![0]],
            vec![1],
            2,
        );
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let x = abd.solve(&b).unwrap();

        let dense = abd.to_dense();
        let expected = dense.lu().solve(&b).unwrap();
        assert!((x - expected).norm() < 1e-9);
    }

    #[test]
    fn test_add_to_diagonal_affects_border_and_blocks() {
        let mut abd = two_block_no_border();
        abd.add_to_diagonal(1.0);
        assert_eq!(abd.diagonal_block(0)[(0, 0)], 5.0);
        assert_eq!(abd.diagonal_block(1)[(0, 0)], 10.0);
    }

    #[test]
    fn test_invert_matches_dense_inverse() {
        let abd = ABDMatrix::new(
            vec![DMatrix::from_row_slice(1, 1, &[3.0])],
            vec![DMatrix::from_row_slice(1, 1, &[1.0])],
            DMatrix::from_row_slice(1, 1, &[5.0]),
            vec![vec![0]],
            vec![1],
            2,
        );
        let inv = abd.invert().unwrap();
        let dense_inv = abd.to_dense().try_inverse().unwrap();
        assert!((inv - dense_inv).norm() < 1e-9);
    }

    #[test]
    fn test_singular_block_reports_runtime_error() {
        let abd = ABDMatrix::new(
            vec![DMatrix::from_row_slice(1, 1, &[0.0])],
            vec![DMatrix::zeros(1, 0)],
            DMatrix::zeros(0, 0),
            vec![vec![0]],
            vec![],
            1,
        );
        let b = DVector::from_vec(vec![1.0]);
        assert!(abd.solve(&b).is_err());
    }
}
