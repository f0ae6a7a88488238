//! Turning named loci into gene sets.
//!
//! Resolution walks the requested locus names, classifies the ones that
//! cannot be tested (unknown name, or no overlapping gene even after
//! expansion), and attaches a gene set to the rest. Loci whose gene sets
//! share any gene are then merged into a single combined locus so that one
//! genomic signal is never counted twice. Merging is transitive: if A shares
//! a gene with C and B shares a gene with C, then A, B, and C collapse into
//! one locus even when A and B have no gene in common.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use ahash::AHashMap;
use itertools::Itertools;

use crate::intervals::IntervalIndex;
use crate::types::{Geneset, GenomicInterval, MAX_GENESET_SIZE};

/// The outcome of resolving a locus list: testable loci with their gene
/// sets, plus the two classes of dropped names.
pub struct LocusPartition {
    pub genesets: BTreeMap<String, Geneset>,
    /// Names with no known genomic position.
    pub absent: BTreeSet<String>,
    /// Names whose position overlaps no gene, even after expansion.
    pub naked: BTreeSet<String>,
}

pub fn resolve_loci(
    names: &BTreeSet<String>,
    positions: &AHashMap<String, GenomicInterval>,
    index: &IntervalIndex,
    slop: u64,
) -> LocusPartition {
    let mut genesets = BTreeMap::new();
    let mut absent = BTreeSet::new();
    let mut naked = BTreeSet::new();
    for name in names {
        match positions.get(name) {
            None => {
                absent.insert(name.clone());
            }
            Some(locus) => {
                let genes = index.geneset_for(locus, slop);
                if genes.is_empty() {
                    naked.insert(name.clone());
                } else {
                    genesets.insert(name.clone(), genes);
                }
            }
        }
    }
    LocusPartition {
        genesets,
        absent,
        naked,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Loci absorbed into a combined locus.
    pub merged_loci: usize,
    /// Combined loci produced.
    pub merged_groups: usize,
}

/// Collapses loci with overlapping gene sets into combined loci. A combined
/// locus is named by joining its members' names with commas in ascending
/// name order, and its gene set is the union of theirs. Applying the merge
/// to its own output changes nothing.
pub fn merge_overlapping(
    genesets: &BTreeMap<String, Geneset>,
) -> (BTreeMap<String, Geneset>, MergeStats) {
    let names: Vec<&String> = genesets.keys().collect();
    let sets: Vec<&Geneset> = genesets.values().collect();
    let n = names.len();

    let mut components = DisjointSet::new(n);
    for (i, j) in (0..n).tuple_combinations() {
        if intersects(sets[i], sets[j]) {
            components.union(i, j);
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        groups.entry(components.find(i)).or_default().push(i);
    }

    let mut merged = BTreeMap::new();
    let mut stats = MergeStats {
        merged_loci: 0,
        merged_groups: 0,
    };
    for members in groups.values() {
        if members.len() == 1 {
            let i = members[0];
            merged.insert(names[i].clone(), sets[i].clone());
            continue;
        }
        stats.merged_loci += members.len();
        stats.merged_groups += 1;
        let combined_name = members.iter().map(|&i| names[i]).join(",");
        let mut genes: Geneset = members
            .iter()
            .flat_map(|&i| sets[i].iter().copied())
            .collect();
        genes.sort_unstable();
        genes.dedup();
        merged.insert(combined_name, genes);
    }
    (merged, stats)
}

/// Gene-set sizes in locus name order, each capped at [`MAX_GENESET_SIZE`].
/// This is the size profile matched null collections reproduce.
pub fn capped_sizes(genesets: &BTreeMap<String, Geneset>) -> Vec<usize> {
    genesets
        .values()
        .map(|g| g.len().min(MAX_GENESET_SIZE))
        .collect()
}

fn intersects(a: &[usize], b: &[usize]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => return true,
        }
    }
    false
}

/// Union-find with path halving. Roots are always the smallest member index,
/// so group order follows locus name order.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> DisjointSet {
        DisjointSet {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}
