// ========================================================================================
//                         Null Locus Pools and Collection Sampling
// ========================================================================================
//
// The null locus list defines the space the empirical distribution is drawn
// from. Every null locus that resolves to a non-empty gene set is eligible;
// eligible loci are additionally binned by capped gene-set size so matched
// sampling can reproduce the size profile of the test loci. Binning caps the
// size key, never the set: a 15-gene locus sits in the largest bin with all
// 15 genes.
//
// Reproducibility contract: every random decision in a run derives its own
// generator from the run seed and the coordinates of the decision (draw
// stream, replicate, column, draw index). Two runs with the same seed make
// identical draws no matter how many threads execute them.

use std::collections::BTreeSet;

use ahash::{AHashMap, AHashSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::intervals::IntervalIndex;
use crate::types::{ConfigError, Geneset, GenomicInterval, MAX_GENESET_SIZE};

/// Eligible null loci, kept twice: binned by capped size for matched draws,
/// and flat for random draws. Pool order follows null name order, so the
/// pools are identical across runs.
pub struct NullPools {
    bins: AHashMap<usize, Vec<Geneset>>,
    eligible_names: Vec<String>,
    eligible_sets: Vec<Geneset>,
}

impl NullPools {
    pub fn build(
        null_names: &BTreeSet<String>,
        positions: &AHashMap<String, GenomicInterval>,
        index: &IntervalIndex,
        slop: u64,
    ) -> NullPools {
        let mut bins: AHashMap<usize, Vec<Geneset>> = AHashMap::new();
        let mut eligible_names = Vec::new();
        let mut eligible_sets = Vec::new();
        for name in null_names {
            let Some(locus) = positions.get(name) else {
                continue;
            };
            let genes = index.geneset_for(locus, slop);
            if genes.is_empty() {
                continue;
            }
            bins.entry(genes.len().min(MAX_GENESET_SIZE))
                .or_default()
                .push(genes.clone());
            eligible_names.push(name.clone());
            eligible_sets.push(genes);
        }
        NullPools {
            bins,
            eligible_names,
            eligible_sets,
        }
    }

    pub fn eligible_len(&self) -> usize {
        self.eligible_sets.len()
    }

    pub fn bin_len(&self, size: usize) -> usize {
        self.bins.get(&size).map_or(0, Vec::len)
    }

    /// Bin sizes and their pool sizes, ascending by bin size.
    pub fn bin_summary(&self) -> Vec<(usize, usize)> {
        let mut summary: Vec<(usize, usize)> =
            self.bins.iter().map(|(&s, pool)| (s, pool.len())).collect();
        summary.sort_unstable();
        summary
    }

    /// Draws `n` distinct eligible null locus names. Used to synthesize a
    /// test list in the `randomN` mode; the names then flow through the same
    /// resolution path as a user-provided list.
    pub fn draw_random_names(
        &self,
        n: usize,
        rng: &mut StdRng,
    ) -> Result<BTreeSet<String>, ConfigError> {
        if n > self.eligible_names.len() {
            return Err(ConfigError::NotEnoughNullLoci {
                requested: n,
                eligible: self.eligible_names.len(),
            });
        }
        let mut chosen = AHashSet::with_capacity(n);
        let mut names = BTreeSet::new();
        while names.len() < n {
            let idx = rng.gen_range(0..self.eligible_names.len());
            if chosen.insert(idx) {
                names.insert(self.eligible_names[idx].clone());
            }
        }
        Ok(names)
    }
}

/// Draws one null collection per call. Construction resolves and validates
/// everything up front, so a draw can never fail and never allocates beyond
/// the output vector.
pub enum Sampler<'a> {
    /// One pool reference per test locus, in locus order.
    Matched { pools: Vec<&'a [Geneset]> },
    Random { sets: &'a [Geneset], loci: usize },
}

impl<'a> Sampler<'a> {
    /// A sampler reproducing the capped size profile `sizes`. Fails if any
    /// required bin is empty; with no matching null locus the match is
    /// impossible and the run cannot proceed.
    pub fn matched(pools: &'a NullPools, sizes: &[usize]) -> Result<Sampler<'a>, ConfigError> {
        let mut per_locus = Vec::with_capacity(sizes.len());
        for &size in sizes {
            match pools.bins.get(&size) {
                Some(pool) if !pool.is_empty() => per_locus.push(pool.as_slice()),
                _ => return Err(ConfigError::EmptyBin { size }),
            }
        }
        Ok(Sampler::Matched { pools: per_locus })
    }

    /// A sampler drawing `loci` distinct eligible null loci per collection.
    pub fn random(pools: &'a NullPools, loci: usize) -> Result<Sampler<'a>, ConfigError> {
        if loci > pools.eligible_sets.len() {
            return Err(ConfigError::NotEnoughNullLoci {
                requested: loci,
                eligible: pools.eligible_sets.len(),
            });
        }
        Ok(Sampler::Random {
            sets: &pools.eligible_sets,
            loci,
        })
    }

    pub fn draw(&self, rng: &mut StdRng) -> Vec<&'a [usize]> {
        match self {
            Sampler::Matched { pools } => pools
                .iter()
                .map(|pool| {
                    let pool: &'a [Geneset] = pool;
                    pool[rng.gen_range(0..pool.len())].as_slice()
                })
                .collect(),
            Sampler::Random { sets, loci } => {
                let sets: &'a [Geneset] = sets;
                if *loci == sets.len() {
                    return sets.iter().map(Geneset::as_slice).collect();
                }
                let mut chosen = AHashSet::with_capacity(*loci);
                let mut out = Vec::with_capacity(*loci);
                while out.len() < *loci {
                    let idx = rng.gen_range(0..sets.len());
                    if chosen.insert(idx) {
                        out.push(sets[idx].as_slice());
                    }
                }
                out
            }
        }
    }
}

/// Generator for one null draw. `replicate_tag` is 0 for the test loci and
/// `r + 1` for null replicate `r`; `draw` counts draws within the column.
pub fn null_draw_rng(seed: u64, replicate_tag: u64, column: u64, draw: u64) -> StdRng {
    derive(seed, [0, replicate_tag, column, draw])
}

/// Generator for assembling one observed collection: the `randomN` name list
/// (tag 0) or a null replicate's own loci (tag `r + 1`).
pub fn observed_draw_rng(seed: u64, replicate_tag: u64) -> StdRng {
    derive(seed, [1, replicate_tag, 0, 0])
}

fn derive(seed: u64, words: [u64; 4]) -> StdRng {
    let mut state = splitmix64(seed);
    for word in words {
        state = splitmix64(state ^ word);
    }
    StdRng::seed_from_u64(state)
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
