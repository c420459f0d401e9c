//! Compressed sparse row weight matrices.

use crate::types::MaskVariant;

/// How missing (`NaN`) source values are treated when applying weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    /// Rescale by the weight of valid contributors; `NaN` if there are none.
    Renormalize,
    /// Treat missing values as zero.
    ZeroFill,
}

impl MissingPolicy {
    pub fn for_variant(variant: MaskVariant) -> Self {
        match variant {
            MaskVariant::Masked => Self::Renormalize,
            MaskVariant::Unmasked => Self::ZeroFill,
        }
    }
}

/// Sparse matrix with one row per target cell and one column per source cell.
///
/// Rows without any contributing source cell are listed in `empty_rows` and
/// always produce `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseWeights {
    n_src: usize,
    n_dst: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    weights: Vec<f64>,
    empty_rows: Vec<usize>,
}

impl SparseWeights {
    /// Build from CSR arrays, validating structure.
    pub fn new(
        n_src: usize,
        n_dst: usize,
        indptr: Vec<usize>,
        indices: Vec<usize>,
        weights: Vec<f64>,
    ) -> Result<Self, String> {
        if indptr.len() != n_dst + 1 {
            return Err(format!(
                "indptr has {} entries, expected {}",
                indptr.len(),
                n_dst + 1
            ));
        }
        if indices.len() != weights.len() {
            return Err(format!(
                "{} column indices but {} weights",
                indices.len(),
                weights.len()
            ));
        }
        if indptr.first() != Some(&0) || indptr.last() != Some(&indices.len()) {
            return Err("indptr does not span the stored entries".to_string());
        }
        if indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err("indptr is not monotonic".to_string());
        }
        if let Some(&col) = indices.iter().find(|&&c| c >= n_src) {
            return Err(format!("column index {} out of range ({} source cells)", col, n_src));
        }

        let empty_rows = indptr
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0] == w[1])
            .map(|(row, _)| row)
            .collect();

        Ok(Self {
            n_src,
            n_dst,
            indptr,
            indices,
            weights,
            empty_rows,
        })
    }

    /// Build from coordinate triplets in any order.
    pub fn from_triplets(
        n_src: usize,
        n_dst: usize,
        rows: &[usize],
        cols: &[usize],
        weights: &[f64],
    ) -> Result<Self, String> {
        if rows.len() != cols.len() || rows.len() != weights.len() {
            return Err("triplet arrays differ in length".to_string());
        }
        if let Some(&row) = rows.iter().find(|&&r| r >= n_dst) {
            return Err(format!("row index {} out of range ({} target cells)", row, n_dst));
        }

        let mut indptr = vec![0usize; n_dst + 1];
        for &r in rows {
            indptr[r + 1] += 1;
        }
        for i in 0..n_dst {
            indptr[i + 1] += indptr[i];
        }

        let mut next = indptr.clone();
        let mut indices = vec![0usize; rows.len()];
        let mut values = vec![0f64; rows.len()];
        for ((&r, &c), &w) in rows.iter().zip(cols).zip(weights) {
            let slot = next[r];
            indices[slot] = c;
            values[slot] = w;
            next[r] += 1;
        }

        Self::new(n_src, n_dst, indptr, indices, values)
    }

    pub fn identity(n: usize) -> Self {
        Self {
            n_src: n,
            n_dst: n,
            indptr: (0..=n).collect(),
            indices: (0..n).collect(),
            weights: vec![1.0; n],
            empty_rows: Vec::new(),
        }
    }

    pub fn n_src(&self) -> usize {
        self.n_src
    }

    pub fn n_dst(&self) -> usize {
        self.n_dst
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn empty_rows(&self) -> &[usize] {
        &self.empty_rows
    }

    pub fn row(&self, row: usize) -> (&[usize], &[f64]) {
        let (start, end) = (self.indptr[row], self.indptr[row + 1]);
        (&self.indices[start..end], &self.weights[start..end])
    }

    pub fn row_sum(&self, row: usize) -> f64 {
        self.row(row).1.iter().sum()
    }

    /// Multiply one source vector into one target vector.
    pub fn apply(&self, src: &[f64], dst: &mut [f64], policy: MissingPolicy) {
        debug_assert_eq!(src.len(), self.n_src);
        debug_assert_eq!(dst.len(), self.n_dst);

        for (row, out) in dst.iter_mut().enumerate() {
            let (cols, weights) = self.row(row);
            if cols.is_empty() {
                *out = f64::NAN;
                continue;
            }

            let mut acc = 0.0;
            let mut total = 0.0;
            let mut valid = 0.0;
            for (&c, &w) in cols.iter().zip(weights) {
                total += w;
                let v = src[c];
                if v.is_nan() {
                    continue;
                }
                acc += w * v;
                valid += w;
            }

            *out = match policy {
                MissingPolicy::ZeroFill => acc,
                MissingPolicy::Renormalize if valid == 0.0 => f64::NAN,
                MissingPolicy::Renormalize if valid == total => acc,
                MissingPolicy::Renormalize => acc * total / valid,
            };
        }
    }

    /// Structural check: bounds, finite weights, and (for conservative
    /// weights) unit row sums on every non-empty row.
    pub fn check(&self, conservative: bool, tolerance: f64) -> Result<(), String> {
        if self.indptr.len() != self.n_dst + 1 {
            return Err("indptr length does not match target size".to_string());
        }
        if self.indices.iter().any(|&c| c >= self.n_src) {
            return Err("column index out of range".to_string());
        }
        if let Some(pos) = self.weights.iter().position(|w| !w.is_finite()) {
            return Err(format!("non-finite weight at entry {}", pos));
        }
        for &row in &self.empty_rows {
            if self.indptr[row] != self.indptr[row + 1] {
                return Err(format!("row {} is flagged empty but has entries", row));
            }
        }
        if conservative {
            for row in 0..self.n_dst {
                if self.indptr[row] == self.indptr[row + 1] {
                    continue;
                }
                let sum = self.row_sum(row);
                if (sum - 1.0).abs() > tolerance {
                    return Err(format!(
                        "row {} sums to {:.9}, expected 1 within {:e}",
                        row, sum, tolerance
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3 source cells onto 2 target cells; target 1 averages sources 1 and 2.
    fn average() -> SparseWeights {
        SparseWeights::from_triplets(3, 2, &[1, 0, 1], &[1, 0, 2], &[0.5, 1.0, 0.5]).unwrap()
    }

    #[test]
    fn test_triplets_to_csr() {
        let w = average();
        assert_eq!(w.indptr(), &[0, 1, 3]);
        assert_eq!(w.row(1).0, &[1, 2]);
        assert_eq!(w.nnz(), 3);
        assert!(w.empty_rows().is_empty());
        assert!(w.check(true, 1e-12).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(SparseWeights::from_triplets(2, 2, &[0], &[2], &[1.0]).is_err());
        assert!(SparseWeights::from_triplets(2, 2, &[2], &[0], &[1.0]).is_err());
        assert!(SparseWeights::new(2, 2, vec![0, 1], vec![0], vec![1.0]).is_err());
    }

    #[test]
    fn test_empty_rows_flagged_and_missing() {
        let w = SparseWeights::from_triplets(2, 3, &[0, 2], &[0, 1], &[1.0, 1.0]).unwrap();
        assert_eq!(w.empty_rows(), &[1]);

        let mut out = vec![0.0; 3];
        w.apply(&[4.0, 5.0], &mut out, MissingPolicy::ZeroFill);
        assert_eq!(out[0], 4.0);
        assert!(out[1].is_nan());
        assert_eq!(out[2], 5.0);
    }

    #[test]
    fn test_missing_policies() {
        let w = average();
        let src = [1.0, 2.0, f64::NAN];

        let mut masked = vec![0.0; 2];
        w.apply(&src, &mut masked, MissingPolicy::Renormalize);
        assert_eq!(masked, vec![1.0, 2.0]);

        let mut unmasked = vec![0.0; 2];
        w.apply(&src, &mut unmasked, MissingPolicy::ZeroFill);
        assert_eq!(unmasked, vec![1.0, 1.0]);

        let mut all_missing = vec![0.0; 2];
        w.apply(&[1.0, f64::NAN, f64::NAN], &mut all_missing, MissingPolicy::Renormalize);
        assert!(all_missing[1].is_nan());
    }

    #[test]
    fn test_check_detects_bad_row_sum() {
        let w = SparseWeights::from_triplets(2, 1, &[0, 0], &[0, 1], &[0.5, 0.6]).unwrap();
        assert!(w.check(true, 1e-6).is_err());
        assert!(w.check(false, 1e-6).is_ok());

        let nan = SparseWeights::from_triplets(1, 1, &[0], &[0], &[f64::NAN]).unwrap();
        assert!(nan.check(false, 1e-6).is_err());
    }

    #[test]
    fn test_identity() {
        let w = SparseWeights::identity(4);
        let mut out = vec![0.0; 4];
        w.apply(&[1.0, 2.0, 3.0, 4.0], &mut out, MissingPolicy::Renormalize);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
