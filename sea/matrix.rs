//! Preparation of the gene-by-condition matrix.
//!
//! A raw matrix arrives as parsed from its source file. Preparation decides
//! whether it is binary membership data or quantitative specificity data and
//! transforms it accordingly. Binary matrices keep their raw 0/1 values and
//! gain per-column totals. Quantitative matrices are conditioned against any
//! requested columns, row-normalized, then replaced column by column with
//! specificity percentiles: rank 1 is the most specific gene, and every rank
//! is divided by the number of genes that carry an interval (the universe),
//! not by the matrix height.

use std::collections::BTreeSet;

use ahash::AHashMap;
use log::warn;
use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::types::ConfigError;

/// A matrix exactly as read: values untouched, names in file order.
#[derive(Debug, Clone)]
pub struct RawMatrix {
    pub row_names: Vec<String>,
    pub col_names: Vec<String>,
    pub values: Array2<f64>,
}

impl RawMatrix {
    /// Gene name to row position. Duplicate names keep the last occurrence.
    pub fn row_index(&self) -> AHashMap<String, usize> {
        self.row_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect()
    }
}

/// Per-column totals of a binary matrix: how many genes are "on" in each
/// condition, and that count as a fraction of the universe.
#[derive(Debug, Clone)]
pub struct BinaryStats {
    pub on_genes: Vec<u64>,
    pub on_fraction: Vec<f64>,
}

/// The prepared matrix every scoring function reads from. Quantitative values
/// are specificity percentiles; binary values are the raw 0/1 memberships.
#[derive(Debug)]
pub struct SpecificityMatrix {
    values: Array2<f64>,
    row_names: Vec<String>,
    col_names: Vec<String>,
    universe: u64,
    binary: Option<BinaryStats>,
}

impl SpecificityMatrix {
    /// Validates the requested condition columns, then runs the binary or
    /// quantitative pipeline. `universe` is the number of matrix rows with at
    /// least one genomic interval.
    pub fn prepare(
        raw: RawMatrix,
        conditions: &BTreeSet<String>,
        universe: u64,
    ) -> Result<SpecificityMatrix, ConfigError> {
        let missing: Vec<String> = conditions
            .iter()
            .filter(|name| !raw.col_names.contains(name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::ConditionsNotFound(missing));
        }

        let RawMatrix {
            row_names,
            mut col_names,
            mut values,
        } = raw;

        // The first column decides the mode for the whole matrix.
        let binary_mode = values.column(0).iter().all(|&v| v == 0.0 || v == 1.0);

        let binary = if binary_mode {
            if !conditions.is_empty() {
                warn!("the matrix is binary; conditioning columns are ignored");
            }
            let on_genes: Vec<u64> = values
                .sum_axis(Axis(0))
                .iter()
                .map(|&s| s as u64)
                .collect();
            let on_fraction = on_genes
                .iter()
                .map(|&n| n as f64 / universe as f64)
                .collect();
            Some(BinaryStats {
                on_genes,
                on_fraction,
            })
        } else {
            condition_columns(&mut values, &mut col_names, conditions);
            normalize_rows(&mut values);
            for j in 0..values.ncols() {
                let ranks = rank_descending(values.column(j));
                values
                    .column_mut(j)
                    .assign(&(&ranks / universe as f64));
            }
            None
        };

        Ok(SpecificityMatrix {
            values,
            row_names,
            col_names,
            universe,
            binary,
        })
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.values[(row, col)]
    }

    pub fn row_names(&self) -> &[String] {
        &self.row_names
    }

    pub fn condition_names(&self) -> &[String] {
        &self.col_names
    }

    pub fn condition_name(&self, col: usize) -> &str {
        &self.col_names[col]
    }

    pub fn universe(&self) -> u64 {
        self.universe
    }

    pub fn is_binary(&self) -> bool {
        self.binary.is_some()
    }

    pub fn binary_stats(&self) -> Option<&BinaryStats> {
        self.binary.as_ref()
    }
}

/// Projects every column orthogonal to each conditioning column in turn, then
/// deletes the conditioning columns. Each projection takes a fresh snapshot of
/// the conditioning column, so earlier projections are respected.
fn condition_columns(
    values: &mut Array2<f64>,
    col_names: &mut Vec<String>,
    conditions: &BTreeSet<String>,
) {
    if conditions.is_empty() {
        return;
    }
    let mut targets: Vec<usize> = Vec::with_capacity(conditions.len());
    for name in conditions {
        if let Some(idx) = col_names.iter().position(|c| c == name) {
            targets.push(idx);
        }
    }
    for &idx in &targets {
        let b = values.column(idx).to_owned();
        let bb = b.dot(&b);
        for j in 0..values.ncols() {
            let factor = values.column(j).dot(&b) / bb;
            values
                .column_mut(j)
                .zip_mut_with(&b, |v, &bv| *v -= factor * bv);
        }
    }
    // Delete from the right so earlier positions stay valid.
    let mut doomed = targets;
    doomed.sort_unstable();
    for &idx in doomed.iter().rev() {
        values.remove_index(Axis(1), idx);
        col_names.remove(idx);
    }
}

/// Scales each row to unit Euclidean length.
fn normalize_rows(values: &mut Array2<f64>) {
    for mut row in values.rows_mut() {
        let norm = row.dot(&row).sqrt();
        row.mapv_inplace(|v| v / norm);
    }
}

/// Ranks in descending order: the largest value gets rank 1. Tied values all
/// receive the mean of the ranks they span. NaN entries (all-zero rows after
/// normalization) keep NaN, so their scores are suppressed downstream instead
/// of masquerading as real ranks.
pub fn rank_descending(values: ArrayView1<f64>) -> Array1<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).filter(|&i| !values[i].is_nan()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));

    let mut ranks = Array1::from_elem(n, f64::NAN);
    let ranked = order.len();
    let mut i = 0;
    while i < ranked {
        let mut j = i + 1;
        while j < ranked && values[order[j]] == values[order[i]] {
            j += 1;
        }
        // Mean of the 1-based ranks i+1 ..= j.
        let rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for &idx in &order[i..j] {
            ranks[idx] = rank;
        }
        i = j;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn raw(rows: &[&str], cols: &[&str], values: Array2<f64>) -> RawMatrix {
        RawMatrix {
            row_names: rows.iter().map(|s| s.to_string()).collect(),
            col_names: cols.iter().map(|s| s.to_string()).collect(),
            values,
        }
    }

    #[test]
    fn ranks_of_distinct_values() {
        let ranks = rank_descending(array![0.3, 0.9, 0.1].view());
        assert_eq!(ranks, array![2.0, 1.0, 3.0]);
    }

    #[test]
    fn tied_values_share_the_mean_rank() {
        let ranks = rank_descending(array![0.5, 0.9, 0.5, 0.1].view());
        // 0.9 -> 1, the two 0.5s span ranks 2 and 3, 0.1 -> 4.
        assert_eq!(ranks, array![2.5, 1.0, 2.5, 4.0]);
    }

    #[test]
    fn all_equal_values_share_one_rank() {
        let ranks = rank_descending(array![0.2, 0.2, 0.2].view());
        assert_eq!(ranks, array![2.0, 2.0, 2.0]);
    }

    #[test]
    fn nan_entries_rank_as_nan() {
        let ranks = rank_descending(array![0.3, f64::NAN, 0.9].view());
        assert!(ranks[1].is_nan());
        assert_eq!(ranks[0], 2.0);
        assert_eq!(ranks[2], 1.0);
    }

    #[test]
    fn first_column_of_zeros_and_ones_selects_binary_mode() {
        let m = raw(
            &["A", "B"],
            &["c1", "c2"],
            array![[1.0, 0.7], [0.0, 0.2]],
        );
        let prepared = SpecificityMatrix::prepare(m, &BTreeSet::new(), 2).unwrap();
        assert!(prepared.is_binary());
        // Binary values pass through untouched.
        assert_eq!(prepared.value(0, 1), 0.7);
    }

    #[test]
    fn binary_stats_count_on_genes_per_column() {
        let m = raw(
            &["A", "B", "C", "D"],
            &["c1", "c2"],
            array![[1.0, 0.0], [1.0, 1.0], [0.0, 0.0], [1.0, 1.0]],
        );
        let prepared = SpecificityMatrix::prepare(m, &BTreeSet::new(), 4).unwrap();
        let stats = prepared.binary_stats().unwrap();
        assert_eq!(stats.on_genes, vec![3, 2]);
        assert_relative_eq!(stats.on_fraction[0], 0.75);
        assert_relative_eq!(stats.on_fraction[1], 0.5);
    }

    #[test]
    fn quantitative_pipeline_yields_percentiles() {
        let m = raw(
            &["A", "B", "C"],
            &["c1", "c2"],
            array![[1.0, 0.5], [0.2, 0.2], [0.9, 0.1]],
        );
        let prepared = SpecificityMatrix::prepare(m, &BTreeSet::new(), 3).unwrap();
        assert!(!prepared.is_binary());
        // After row normalization c1 holds [0.894, 0.707, 0.994]:
        // C ranks first, then A, then B.
        assert_relative_eq!(prepared.value(0, 0), 2.0 / 3.0);
        assert_relative_eq!(prepared.value(1, 0), 1.0);
        assert_relative_eq!(prepared.value(2, 0), 1.0 / 3.0);
        // c2 holds [0.447, 0.707, 0.110]: B first, then A, then C.
        assert_relative_eq!(prepared.value(0, 1), 2.0 / 3.0);
        assert_relative_eq!(prepared.value(1, 1), 1.0 / 3.0);
        assert_relative_eq!(prepared.value(2, 1), 1.0);
    }

    #[test]
    fn percentiles_stay_within_unit_range() {
        let m = raw(
            &["A", "B", "C", "D"],
            &["c1", "c2", "c3"],
            array![
                [3.0, 0.5, 2.2],
                [0.2, 1.2, 0.4],
                [5.9, 0.1, 1.0],
                [1.5, 2.0, 0.6]
            ],
        );
        let prepared = SpecificityMatrix::prepare(m, &BTreeSet::new(), 4).unwrap();
        for row in 0..prepared.nrows() {
            for col in 0..prepared.ncols() {
                let v = prepared.value(row, col);
                assert!(v > 0.0 && v <= 1.0, "percentile out of range: {v}");
            }
        }
    }

    #[test]
    fn conditioning_removes_columns_and_projects() {
        let m = raw(
            &["A", "B", "C"],
            &["x", "ctrl"],
            array![[2.0, 1.0], [0.0, 1.0], [1.0, 0.0]],
        );
        let conditions: BTreeSet<String> = ["ctrl".to_string()].into();
        let prepared = SpecificityMatrix::prepare(m, &conditions, 3).unwrap();
        assert_eq!(prepared.condition_names(), ["x".to_string()]);
        // Projected x is [1, -1, 1]; normalized rows keep [1, -1, 1];
        // ranks are [1.5, 3, 1.5] over a universe of 3.
        assert_relative_eq!(prepared.value(0, 0), 0.5);
        assert_relative_eq!(prepared.value(1, 0), 1.0);
        assert_relative_eq!(prepared.value(2, 0), 0.5);
    }

    #[test]
    fn missing_conditions_are_all_reported() {
        let m = raw(&["A"], &["c1"], array![[0.4]]);
        let conditions: BTreeSet<String> =
            ["nope".to_string(), "also-nope".to_string()].into();
        let err = SpecificityMatrix::prepare(m, &conditions, 1).unwrap_err();
        match err {
            ConfigError::ConditionsNotFound(names) => {
                assert_eq!(names, vec!["also-nope".to_string(), "nope".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rank_divisor_is_the_universe_not_the_height() {
        // Four rows but only a three-gene universe: the top-ranked gene gets
        // 1/3 rather than 1/4.
        let m = raw(
            &["A", "B", "C", "D"],
            &["c1", "c2"],
            array![[1.0, 0.1], [0.8, 0.3], [0.6, 0.5], [0.4, 0.7]],
        );
        let prepared = SpecificityMatrix::prepare(m, &BTreeSet::new(), 3).unwrap();
        assert_relative_eq!(prepared.value(0, 0), 1.0 / 3.0);
        assert_relative_eq!(prepared.value(3, 0), 4.0 / 3.0);
    }
}
