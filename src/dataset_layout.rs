//! Row-offset bookkeeping for the datasets bound to a fit (spec §3's
//! `FitData`: "per-dataset point counts and total size").
//!
//! This crate does not own dataset *content* (reading buffers, x/y
//! columns, weights are the caller's concern, out of scope per §1) —
//! only the row counts needed to lay out the residual vector and the
//! sparse jacobian in dataset order.

use crate::errors::FitError;

#[derive(Debug, Clone)]
pub struct DatasetLayout {
    row_counts: Vec<usize>,
    offsets: Vec<usize>,
    total_points: usize,
}

impl DatasetLayout {
    pub fn new(row_counts: Vec<usize>) -> Self {
        let mut offsets = Vec::with_capacity(row_counts.len());
        let mut acc = 0usize;
        for &n in &row_counts {
            offsets.push(acc);
            acc += n;
        }
        DatasetLayout {
            row_counts,
            offsets,
            total_points: acc,
        }
    }

    pub fn num_datasets(&self) -> usize {
        self.row_counts.len()
    }

    pub fn total_points(&self) -> usize {
        self.total_points
    }

    pub fn row_count(&self, ds: usize) -> usize {
        self.row_counts[ds]
    }

    pub fn offset(&self, ds: usize) -> usize {
        self.offsets[ds]
    }

    pub fn range(&self, ds: usize) -> std::ops::Range<usize> {
        self.offsets[ds]..self.offsets[ds] + self.row_counts[ds]
    }

    pub fn dataset_of_row(&self, row: usize) -> Result<usize, FitError> {
        self.offsets
            .iter()
            .rposition(|&o| o <= row)
            .filter(|&ds| row < self.offsets[ds] + self.row_counts[ds])
            .ok_or_else(|| FitError::internal("row index outside any dataset range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_and_total() {
        let layout = DatasetLayout::new(vec![3, 5, 2]);
        assert_eq!(layout.offset(0), 0);
        assert_eq!(layout.offset(1), 3);
        assert_eq!(layout.offset(2), 8);
        assert_eq!(layout.total_points(), 10);
    }

    #[test]
    fn test_range_matches_row_count() {
        let layout = DatasetLayout::new(vec![3, 5, 2]);
        assert_eq!(layout.range(1), 3..8);
    }

    #[test]
    fn test_dataset_of_row() {
        let layout = DatasetLayout::new(vec![3, 5, 2]);
        assert_eq!(layout.dataset_of_row(0).unwrap(), 0);
        assert_eq!(layout.dataset_of_row(4).unwrap(), 1);
        assert_eq!(layout.dataset_of_row(9).unwrap(), 2);
        assert!(layout.dataset_of_row(10).is_err());
    }
}
