//! Genomic interval index mapping loci to the gene matrix rows they overlap.
//!
//! One centered interval tree per chromosome. Each stored interval carries the
//! matrix row index of its gene, so a query returns rows directly. Overlap is
//! closed on both ends: `[a, b]` and `[c, d]` overlap when `a <= d && b >= c`.
//! Queries resolve in two phases: the locus itself first, then the locus
//! expanded by a symmetric distance if the exact query found nothing.

use ahash::{AHashMap, AHashSet};

use crate::types::{Geneset, GenomicInterval};

/// A gene interval destined for the index: its matrix row plus coordinates.
type RowInterval = (u64, u64, usize);

struct TreeNode {
    center: u64,
    /// Intervals crossing `center`, ascending by start.
    by_start: Vec<RowInterval>,
    /// The same intervals, descending by end.
    by_end: Vec<RowInterval>,
    left: Option<Box<TreeNode>>,
    right: Option<Box<TreeNode>>,
}

impl TreeNode {
    fn build(intervals: Vec<RowInterval>) -> Option<Box<TreeNode>> {
        if intervals.is_empty() {
            return None;
        }
        // The midpoint of the median interval. That interval always crosses
        // the center, so both partitions shrink and recursion terminates.
        let (s, e, _) = intervals[intervals.len() / 2];
        let center = s + (e - s) / 2;

        let mut crossing = Vec::new();
        let mut left = Vec::new();
        let mut right = Vec::new();
        for iv in intervals {
            if iv.1 < center {
                left.push(iv);
            } else if iv.0 > center {
                right.push(iv);
            } else {
                crossing.push(iv);
            }
        }

        let mut by_start = crossing;
        by_start.sort_unstable_by_key(|&(s, _, _)| s);
        let mut by_end = by_start.clone();
        by_end.sort_unstable_by_key(|&(_, e, _)| std::cmp::Reverse(e));

        Some(Box::new(TreeNode {
            center,
            by_start,
            by_end,
            left: TreeNode::build(left),
            right: TreeNode::build(right),
        }))
    }

    fn collect(&self, start: u64, end: u64, out: &mut Vec<usize>) {
        if end < self.center {
            // Crossing intervals end at or after center, so only their start
            // can disqualify them.
            for &(s, _, row) in &self.by_start {
                if s > end {
                    break;
                }
                out.push(row);
            }
            if let Some(node) = &self.left {
                node.collect(start, end, out);
            }
        } else if start > self.center {
            for &(_, e, row) in &self.by_end {
                if e < start {
                    break;
                }
                out.push(row);
            }
            if let Some(node) = &self.right {
                node.collect(start, end, out);
            }
        } else {
            // The query spans the center: every crossing interval overlaps.
            for &(_, _, row) in &self.by_start {
                out.push(row);
            }
            if let Some(node) = &self.left {
                node.collect(start, end, out);
            }
            if let Some(node) = &self.right {
                node.collect(start, end, out);
            }
        }
    }
}

/// The per-chromosome forest, plus the universe statistics every downstream
/// probability calculation depends on.
pub struct IntervalIndex {
    trees: AHashMap<String, Box<TreeNode>>,
    /// Distinct matrix rows that carry at least one interval. This is the
    /// statistical universe: the hypergeometric population and the rank
    /// divisor both use it.
    indexed_rows: u64,
    /// Matrix rows with no interval anywhere.
    missing_rows: usize,
    /// Interval file rows naming genes absent from the matrix.
    skipped_intervals: usize,
}

impl IntervalIndex {
    /// Indexes `intervals` against the matrix rows named in `row_index`.
    /// Intervals whose gene is not a matrix row are dropped and counted;
    /// duplicate gene names contribute one interval each under the same row.
    pub fn build(
        intervals: &[(String, GenomicInterval)],
        row_index: &AHashMap<String, usize>,
    ) -> IntervalIndex {
        let mut per_chrom: AHashMap<String, Vec<RowInterval>> = AHashMap::new();
        let mut seen_rows: AHashSet<usize> = AHashSet::new();
        let mut skipped_intervals = 0usize;

        for (gene, iv) in intervals {
            match row_index.get(gene) {
                Some(&row) => {
                    seen_rows.insert(row);
                    per_chrom
                        .entry(iv.chrom.clone())
                        .or_default()
                        .push((iv.start, iv.end, row));
                }
                None => skipped_intervals += 1,
            }
        }

        let mut trees = AHashMap::new();
        for (chrom, mut list) in per_chrom {
            list.sort_unstable_by_key(|&(s, e, _)| (s, e));
            if let Some(root) = TreeNode::build(list) {
                trees.insert(chrom, root);
            }
        }

        IntervalIndex {
            trees,
            indexed_rows: seen_rows.len() as u64,
            missing_rows: row_index.len() - seen_rows.len(),
            skipped_intervals,
        }
    }

    /// Matrix rows with at least one interval; the population size for every
    /// downstream probability model.
    pub fn indexed_rows(&self) -> u64 {
        self.indexed_rows
    }

    pub fn missing_rows(&self) -> usize {
        self.missing_rows
    }

    pub fn skipped_intervals(&self) -> usize {
        self.skipped_intervals
    }

    /// Rows whose interval overlaps `[start, end]` on `chrom`, sorted and
    /// deduplicated. Insertion order never influences the result.
    pub fn overlapping_rows(&self, chrom: &str, start: u64, end: u64) -> Geneset {
        let mut rows = Vec::new();
        if let Some(root) = self.trees.get(chrom) {
            root.collect(start, end, &mut rows);
        }
        rows.sort_unstable();
        rows.dedup();
        rows
    }

    /// The two-phase query: the exact locus first; if that yields nothing,
    /// the locus expanded by `slop` on both sides, with the expanded start
    /// clamped at 1 so it never wraps.
    pub fn geneset_for(&self, locus: &GenomicInterval, slop: u64) -> Geneset {
        let exact = self.overlapping_rows(&locus.chrom, locus.start, locus.end);
        if !exact.is_empty() {
            return exact;
        }
        let start = locus.start.saturating_sub(slop).max(1);
        let end = locus.end.saturating_add(slop);
        self.overlapping_rows(&locus.chrom, start, end)
    }
}
