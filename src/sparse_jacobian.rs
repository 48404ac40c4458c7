//! The sparse jacobian (spec §4.6): one dense column per global free
//! parameter, one dense sub-column per per-dataset free parameter.
//! Implicit zeros outside a column's support are never stored, which
//! is what makes `gradient`/`jTj` cheaper than the dense equivalent
//! when per-dataset parameters dominate.

use nalgebra::DVector;

use crate::abd_matrix::ABDMatrix;
use crate::dataset_layout::DatasetLayout;
use crate::errors::FitError;
use crate::packing::PackingPlan;

/// One column of the jacobian, indexed externally by `fit_index`.
#[derive(Debug, Clone)]
pub enum JacobianColumn {
    /// A global free parameter: affects every dataset, so the column
    /// spans the full residual vector.
    Global(DVector<f64>),
    /// A per-dataset free parameter: affects only its own dataset.
    Dataset { ds_index: usize, values: DVector<f64> },
}

impl JacobianColumn {
    fn support(&self, ds: usize) -> Option<&[f64]> {
        match self {
            JacobianColumn::Global(v) => Some(v.as_slice()),
            JacobianColumn::Dataset { ds_index, values } => {
                if *ds_index == ds {
                    Some(values.as_slice())
                } else {
                    None
                }
            }
        }
    }

    /// Zero-pads a per-dataset column out to the full residual-vector
    /// length; returns a global column unchanged. This is
    /// `parameterVector(paramIdx)` from §4.6.
    pub fn full_length(&self, layout: &DatasetLayout) -> DVector<f64> {
        match self {
            JacobianColumn::Global(v) => v.clone(),
            JacobianColumn::Dataset { ds_index, values } => {
                let mut full = DVector::zeros(layout.total_points());
                full.rows_mut(layout.offset(*ds_index), values.len())
                    .copy_from(values);
                full
            }
        }
    }

    /// `parameterVector(paramIdx, dsIdx)`: the sub-view for one
    /// dataset, if this column has one.
    pub fn dataset_view(&self, ds: usize, layout: &DatasetLayout) -> Option<DVector<f64>> {
        match self {
            JacobianColumn::Global(v) => Some(DVector::from_column_slice(
                &v.as_slice()[layout.range(ds)],
            )),
            JacobianColumn::Dataset { ds_index, values } => {
                (*ds_index == ds).then(|| values.clone())
            }
        }
    }

    /// `spliceParameter`: scale a freshly computed finite-difference
    /// contribution by `1/step` in place.
    pub fn scale(&mut self, factor: f64) {
        match self {
            JacobianColumn::Global(v) => *v *= factor,
            JacobianColumn::Dataset { values, .. } => *values *= factor,
        }
    }

    /// Consumes the column, returning its support-sized values without
    /// the dataset-layout zero padding `full_length` would add.
    pub(crate) fn into_values(self) -> DVector<f64> {
        match self {
            JacobianColumn::Global(v) => v,
            JacobianColumn::Dataset { values, .. } => values,
        }
    }
}

#[derive(Debug)]
pub struct SparseJacobian {
    /// Indexed by `fit_index`.
    pub columns: Vec<JacobianColumn>,
}

impl SparseJacobian {
    pub fn new(columns: Vec<JacobianColumn>) -> Self {
        SparseJacobian { columns }
    }

    /// `gradient = Jᵀ · residuals`.
    pub fn gradient(&self, residuals: &DVector<f64>, layout: &DatasetLayout) -> DVector<f64> {
        let mut g = DVector::zeros(self.columns.len());
        for (fi, col) in self.columns.iter().enumerate() {
            g[fi] = match col {
                JacobianColumn::Global(v) => v.dot(residuals),
                JacobianColumn::Dataset { ds_index, values } => {
                    let r = residuals.rows(layout.offset(*ds_index), values.len());
                    values.dot(&r.clone_owned())
                }
            };
        }
        g
    }

    /// `jTj = Jᵀ · J`, assembled directly into block-sparse
    /// [`ABDMatrix`] form (border = global free parameters, one
    /// diagonal block per dataset's per-dataset free parameters) —
    /// the dense cross terms between unrelated datasets are never
    /// computed.
    pub fn jtj(&self, plan: &PackingPlan, layout: &DatasetLayout) -> ABDMatrix {
        let border = &plan.global_free;
        let n_border = border.len();
        let n_datasets = plan.per_dataset_free.len();

        let mut d_border = nalgebra::DMatrix::<f64>::zeros(n_border, n_border);
        for (bi, &fi) in border.iter().enumerate() {
            for (bj, &fj) in border.iter().enumerate() {
                d_border[(bi, bj)] = dot_over_datasets(
                    &self.columns[fi],
                    &self.columns[fj],
                    0..n_datasets,
                    layout,
                );
            }
        }

        let mut diagonal_blocks = Vec::with_capacity(n_datasets);
        let mut border_blocks = Vec::with_capacity(n_datasets);
        for (ds, locals) in plan.per_dataset_free.iter().enumerate() {
            let n_k = locals.len();
            let mut d_k = nalgebra::DMatrix::<f64>::zeros(n_k, n_k);
            for (ai, &fi) in locals.iter().enumerate() {
                for (aj, &fj) in locals.iter().enumerate() {
                    d_k[(ai, aj)] =
                        dot_over_datasets(&self.columns[fi], &self.columns[fj], ds..ds + 1, layout);
                }
            }
            let mut c_k = nalgebra::DMatrix::<f64>::zeros(n_k, n_border);
            for (ai, &fi) in locals.iter().enumerate() {
                for (bj, &fj) in border.iter().enumerate() {
                    c_k[(ai, bj)] =
                        dot_over_datasets(&self.columns[fi], &self.columns[fj], ds..ds + 1, layout);
                }
            }
            diagonal_blocks.push(d_k);
            border_blocks.push(c_k);
        }

        ABDMatrix::new(
            diagonal_blocks,
            border_blocks,
            d_border,
            plan.per_dataset_free.clone(),
            border.clone(),
            plan.free_count,
        )
    }

    /// `gradient`, scaled element-wise by a per-`fit_index` factor
    /// (spec §4.9's `scaleByMagnitude`/`globalScalingOrder`). Passing
    /// an all-ones `scale` recovers plain `gradient`.
    pub fn gradient_scaled(
        &self,
        residuals: &DVector<f64>,
        layout: &DatasetLayout,
        scale: &[f64],
    ) -> DVector<f64> {
        let mut g = self.gradient(residuals, layout);
        for (gi, &s) in g.iter_mut().zip(scale.iter()) {
            *gi *= s;
        }
        g
    }

    /// `jtj`, with row/column `i` scaled by `scale[i]` — equivalent to
    /// building `jtj` from a jacobian whose columns were each multiplied
    /// by `scale[i]` beforehand, but without materializing that copy.
    pub fn jtj_scaled(&self, plan: &PackingPlan, layout: &DatasetLayout, scale: &[f64]) -> ABDMatrix {
        let mut abd = self.jtj(plan, layout);
        abd.scale_rows_cols(scale);
        abd
    }

    pub fn free_count(&self) -> usize {
        self.columns.len()
    }

    /// Integrity check used by tests and by `FitData` construction:
    /// every dataset-scoped column must reference a dataset that
    /// actually exists in `layout`.
    pub fn validate(&self, layout: &DatasetLayout) -> Result<(), FitError> {
        for col in &self.columns {
            if let JacobianColumn::Dataset { ds_index, values } = col {
                if *ds_index >= layout.num_datasets() {
                    return Err(FitError::internal("jacobian column references unknown dataset"));
                }
                if values.len() != layout.row_count(*ds_index) {
                    return Err(FitError::internal(
                        "jacobian column length does not match dataset row count",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn dot_over_datasets(
    a: &JacobianColumn,
    b: &JacobianColumn,
    datasets: std::ops::Range<usize>,
    _layout: &DatasetLayout,
) -> f64 {
    let mut total = 0.0;
    for ds in datasets {
        if let (Some(sa), Some(sb)) = (a.support(ds), b.support(ds)) {
            total += sa.iter().zip(sb.iter()).map(|(x, y)| x * y).sum::<f64>();
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_global_column() {
        let layout = DatasetLayout::new(vec![2, 2]);
        let col = JacobianColumn::Global(DVector::from_vec(vec![1.0, 1.0, 1.0, 1.0]));
        let jac = SparseJacobian::new(vec![col]);
        let residuals = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let g = jac.gradient(&residuals, &layout);
        assert_eq!(g[0], 10.0);
    }

    #[test]
    fn test_gradient_dataset_column_ignores_other_dataset() {
        let layout = DatasetLayout::new(vec![2, 2]);
        let col = JacobianColumn::Dataset {
            ds_index: 1,
            values: DVector::from_vec(vec![1.0, 1.0]),
        };
        let jac = SparseJacobian::new(vec![col]);
        let residuals = DVector::from_vec(vec![100.0, 100.0, 3.0, 4.0]);
        let g = jac.gradient(&residuals, &layout);
        assert_eq!(g[0], 7.0);
    }

    #[test]
    fn test_full_length_zero_pads() {
        let layout = DatasetLayout::new(vec![2, 2]);
        let col = JacobianColumn::Dataset {
            ds_index: 1,
            values: DVector::from_vec(vec![5.0, 6.0]),
        };
        let full = col.full_length(&layout);
        assert_eq!(full.as_slice(), &[0.0, 0.0, 5.0, 6.0]);
    }

    #[test]
    fn test_jtj_cross_dataset_is_zero() {
        let layout = DatasetLayout::new(vec![1, 1]);
        let plan = PackingPlan {
            free_count: 2,
            parameters_by_definition: vec![],
            global_free: vec![],
            per_dataset_free: vec![vec![0], vec![1]],
            fit_index_entry: vec![0, 1],
        };
        let jac = SparseJacobian::new(vec![
            JacobianColumn::Dataset {
                ds_index: 0,
                values: DVector::from_vec(vec![2.0]),
            },
            JacobianColumn::Dataset {
                ds_index: 1,
                values: DVector::from_vec(vec![3.0]),
            },
        ]);
        let abd = jac.jtj(&plan, &layout);
        assert_eq!(abd.diagonal_block(0)[(0, 0)], 4.0);
        assert_eq!(abd.diagonal_block(1)[(0, 0)], 9.0);
    }
}
