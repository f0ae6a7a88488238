// ========================================================================================
//                      The Empirical Enrichment Engine
// ========================================================================================
//
// One pass of the engine scores an observed locus collection against every
// matrix column and turns each column score into an empirical p-value by
// drawing null collections until either enough nulls matched the observation
// or the iteration ceiling is reached. Draws run in doubling batches so cheap
// columns exit after a hundred draws while interesting ones earn the full
// budget.
//
// Batches are data-parallel. Each draw seeds its own generator from the run
// seed and the draw's coordinates, so the work can be split across any number
// of threads without changing a single drawn collection.

use std::io::IsTerminal;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use rayon::prelude::*;

use crate::matrix::SpecificityMatrix;
use crate::sample::{Sampler, null_draw_rng};
use crate::score::ScoreStrategy;
use crate::types::{PValueRecord, RunConfig};

/// Null draws in the first batch. Every later batch doubles until the
/// remainder to the ceiling is smaller than the next doubling.
const INITIAL_BATCH: u64 = 100;

pub struct Engine<'a> {
    matrix: &'a SpecificityMatrix,
    sampler: &'a Sampler<'a>,
    strategy: ScoreStrategy,
    config: &'a RunConfig,
}

impl<'a> Engine<'a> {
    pub fn new(
        matrix: &'a SpecificityMatrix,
        sampler: &'a Sampler<'a>,
        strategy: ScoreStrategy,
        config: &'a RunConfig,
    ) -> Engine<'a> {
        Engine {
            matrix,
            sampler,
            strategy,
            config,
        }
    }

    /// Tests `observed` against every column. `replicate` tags the records
    /// when the observed collection is itself a null replicate; the test loci
    /// run untagged. The null stream for replicate `r` is disjoint from the
    /// untagged stream, so replicates never reuse the test loci's draws.
    pub fn test_columns<S>(
        &self,
        observed: &[S],
        replicate: Option<u64>,
        progress: Option<&ProgressBar>,
    ) -> Vec<PValueRecord>
    where
        S: AsRef<[usize]> + Sync,
    {
        let replicate_tag = replicate.map_or(0, |r| r + 1);
        let schedule = batch_schedule(INITIAL_BATCH, self.config.max_iterations);
        let seed = self.config.seed;

        let mut records = Vec::with_capacity(self.matrix.ncols());
        for col in 0..self.matrix.ncols() {
            let observed_score = self.strategy.score(self.matrix, col, observed);

            // Nothing observed: no null can do worse, so skip the draws.
            if observed_score <= 0.0 {
                records.push(PValueRecord {
                    condition: self.matrix.condition_name(col).to_string(),
                    pvalue: 1.0,
                    nulls_observed: 0,
                    nulls_tested: 0,
                    replicate,
                });
                if let Some(bar) = progress {
                    bar.inc(1);
                }
                continue;
            }

            let mut nulls_tested = 0u64;
            let mut nulls_observed = 0u64;
            for &count in &schedule {
                let base = nulls_tested;
                let hits: u64 = (0..count)
                    .into_par_iter()
                    .map(|i| {
                        let mut rng =
                            null_draw_rng(seed, replicate_tag, col as u64, base + i);
                        let null = self.sampler.draw(&mut rng);
                        u64::from(
                            self.strategy.score(self.matrix, col, &null) >= observed_score,
                        )
                    })
                    .sum();
                nulls_observed += hits;
                nulls_tested += count;
                if nulls_observed >= self.config.min_observations {
                    break;
                }
            }

            // Phipson & Smyth: +1 in both counts keeps the estimate exact
            // and never zero.
            let pvalue = (nulls_observed as f64 + 1.0) / (nulls_tested as f64 + 1.0);
            debug!(
                "column {} score {observed_score:.4}: {nulls_observed}/{nulls_tested} nulls at or above",
                self.matrix.condition_name(col)
            );
            records.push(PValueRecord {
                condition: self.matrix.condition_name(col).to_string(),
                pvalue,
                nulls_observed,
                nulls_tested,
                replicate,
            });
            if let Some(bar) = progress {
                bar.inc(1);
            }
        }
        records
    }
}

/// The draw counts per batch: `first`, then doubling, then the remainder up
/// to `ceiling`. A ceiling below `first` is raised to it, so the first batch
/// always runs in full.
pub fn batch_schedule(first: u64, ceiling: u64) -> Vec<u64> {
    let ceiling = ceiling.max(first);
    let mut batches = vec![first];
    let mut sum = first;
    let mut step = first;
    while sum.saturating_add(step.saturating_mul(2)) < ceiling {
        step = step.saturating_mul(2);
        batches.push(step);
        sum = sum.saturating_add(step);
    }
    if ceiling > sum {
        batches.push(ceiling - sum);
    }
    batches
}

/// Progress on stderr when attached to a terminal, hidden otherwise so
/// redirected runs stay clean.
pub fn create_progress_bar(len: u64, message: &'static str) -> ProgressBar {
    let bar = if std::io::stderr().is_terminal() {
        ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::stderr_with_hz(20))
    } else {
        ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::hidden())
    };
    bar.set_style(
        ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("Internal Error: Invalid progress bar template string.")
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    bar.set_message(message);
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intervals::IntervalIndex;
    use crate::matrix::RawMatrix;
    use crate::sample::NullPools;
    use crate::types::{GenomicInterval, ScoreMethod};
    use ahash::AHashMap;
    use ndarray::Array2;
    use std::collections::BTreeSet;

    #[test]
    fn schedule_doubles_then_tops_off() {
        assert_eq!(batch_schedule(100, 1_000), vec![100, 200, 400, 300]);
        assert_eq!(batch_schedule(100, 250), vec![100, 150]);
        assert_eq!(batch_schedule(100, 10_000), vec![100, 200, 400, 800, 1_600, 3_200, 3_700]);
    }

    #[test]
    fn schedule_sums_to_the_ceiling() {
        for ceiling in [100u64, 101, 999, 1_000, 54_321, 1_000_000] {
            let schedule = batch_schedule(100, ceiling);
            assert_eq!(schedule.iter().sum::<u64>(), ceiling.max(100));
            assert!(schedule.iter().all(|&c| c > 0));
        }
    }

    #[test]
    fn low_ceiling_is_raised_to_the_first_batch() {
        assert_eq!(batch_schedule(100, 1), vec![100]);
        assert_eq!(batch_schedule(100, 100), vec![100]);
    }

    /// Ten genes tiled along one chromosome, a null locus over each gene,
    /// and five null loci spanning two adjacent genes. First-column
    /// percentiles are (row + 1) / 10.
    fn fixture() -> (SpecificityMatrix, NullPools) {
        let mut row_index = AHashMap::new();
        let mut gene_intervals = Vec::new();
        for i in 0..10u64 {
            let gene = format!("G{i}");
            row_index.insert(gene.clone(), i as usize);
            gene_intervals.push((
                gene,
                GenomicInterval {
                    chrom: "1".to_string(),
                    start: i * 10_000 + 1_000,
                    end: i * 10_000 + 2_000,
                },
            ));
        }
        let index = IntervalIndex::build(&gene_intervals, &row_index);

        let mut positions = AHashMap::new();
        let mut null_names = BTreeSet::new();
        for i in 0..10u64 {
            let name = format!("n{i}");
            positions.insert(
                name.clone(),
                GenomicInterval {
                    chrom: "1".to_string(),
                    start: i * 10_000 + 1_500,
                    end: i * 10_000 + 1_500,
                },
            );
            null_names.insert(name);
        }
        for i in 0..5u64 {
            let name = format!("m{i}");
            positions.insert(
                name.clone(),
                GenomicInterval {
                    chrom: "1".to_string(),
                    start: i * 10_000 + 1_500,
                    end: (i + 1) * 10_000 + 1_500,
                },
            );
            null_names.insert(name);
        }
        let pools = NullPools::build(&null_names, &positions, &index, 0);

        let mut values = Array2::zeros((10, 2));
        for row in 0..10 {
            let theta = (row + 1) as f64 * 0.15;
            values[(row, 0)] = theta.cos();
            values[(row, 1)] = theta.sin();
        }
        let raw = RawMatrix {
            row_names: (0..10).map(|i| format!("G{i}")).collect(),
            col_names: vec!["alpha".to_string(), "beta".to_string()],
            values,
        };
        let matrix = SpecificityMatrix::prepare(raw, &BTreeSet::new(), 10).unwrap();
        (matrix, pools)
    }

    fn config(min_observations: u64, max_iterations: u64) -> RunConfig {
        RunConfig {
            slop: 0,
            null_snpset_replicates: 0,
            min_observations,
            max_iterations,
            score_method: ScoreMethod::Single,
            seed: 99,
        }
    }

    #[test]
    fn records_are_internally_consistent() {
        let (matrix, pools) = fixture();
        let sampler = Sampler::matched(&pools, &[1, 2]).unwrap();
        let config = config(5, 200);
        let engine = Engine::new(
            &matrix,
            &sampler,
            ScoreStrategy::QuantitativeSingle,
            &config,
        );
        let observed = vec![vec![0usize], vec![2, 3]];
        let records = engine.test_columns(&observed, None, None);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].condition, "alpha");
        assert_eq!(records[1].condition, "beta");
        for record in &records {
            assert!(record.pvalue > 0.0 && record.pvalue <= 1.0);
            assert!(record.nulls_observed <= record.nulls_tested);
            assert!(record.nulls_tested <= 200);
            let expect = (record.nulls_observed as f64 + 1.0)
                / (record.nulls_tested as f64 + 1.0);
            assert_eq!(record.pvalue, expect);
            assert_eq!(record.replicate, None);
        }
    }

    #[test]
    fn tiny_matrix_emits_one_record_per_column() {
        // Three genes, two conditions, one locus reaching genes 0 and 2.
        let mut row_index = AHashMap::new();
        let gene_intervals: Vec<(String, GenomicInterval)> =
            [("G0", 1_000u64, 2_000u64), ("G1", 1_200, 1_800), ("G2", 2_100, 3_000)]
                .iter()
                .enumerate()
                .map(|(row, &(gene, start, end))| {
                    row_index.insert(gene.to_string(), row);
                    (
                        gene.to_string(),
                        GenomicInterval {
                            chrom: "1".to_string(),
                            start,
                            end,
                        },
                    )
                })
                .collect();
        let index = IntervalIndex::build(&gene_intervals, &row_index);

        let mut positions = AHashMap::new();
        let mut null_names = BTreeSet::new();
        for (name, start, end) in [
            ("n0", 1_500u64, 1_500u64),
            ("n1", 1_250, 1_750),
            ("n2", 1_900, 2_200),
        ] {
            positions.insert(
                name.to_string(),
                GenomicInterval {
                    chrom: "1".to_string(),
                    start,
                    end,
                },
            );
            null_names.insert(name.to_string());
        }
        let pools = NullPools::build(&null_names, &positions, &index, 0);
        assert_eq!(pools.bin_len(2), 3);

        let raw = RawMatrix {
            row_names: vec!["G0".to_string(), "G1".to_string(), "G2".to_string()],
            col_names: vec!["c1".to_string(), "c2".to_string()],
            values: ndarray::array![[1.0, 0.5], [0.2, 0.2], [0.9, 0.1]],
        };
        let matrix = SpecificityMatrix::prepare(raw, &BTreeSet::new(), 3).unwrap();
        assert!(!matrix.is_binary());

        let sampler = Sampler::matched(&pools, &[2]).unwrap();
        let config = config(1, 100);
        let engine = Engine::new(
            &matrix,
            &sampler,
            ScoreStrategy::QuantitativeSingle,
            &config,
        );
        let records = engine.test_columns(&[vec![0usize, 2]], None, None);

        assert_eq!(records.len(), 2);
        for record in &records {
            assert!(record.nulls_tested <= 100);
            let expect = (record.nulls_observed as f64 + 1.0)
                / (record.nulls_tested as f64 + 1.0);
            assert_eq!(record.pvalue, expect);
        }
    }

    #[test]
    fn zero_observed_score_short_circuits() {
        let (matrix, pools) = fixture();
        let sampler = Sampler::matched(&pools, &[1]).unwrap();
        let config = config(5, 200);
        let engine = Engine::new(
            &matrix,
            &sampler,
            ScoreStrategy::QuantitativeSingle,
            &config,
        );
        // Row 9 sits at percentile 1.0 in the first column: nothing observed.
        let records = engine.test_columns(&[vec![9usize]], None, None);
        assert_eq!(records[0].pvalue, 1.0);
        assert_eq!(records[0].nulls_observed, 0);
        assert_eq!(records[0].nulls_tested, 0);
    }

    #[test]
    fn same_seed_reproduces_identical_records() {
        let (matrix, pools) = fixture();
        let sampler = Sampler::matched(&pools, &[1, 2]).unwrap();
        let config = config(5, 200);
        let engine = Engine::new(
            &matrix,
            &sampler,
            ScoreStrategy::QuantitativeTotal,
            &config,
        );
        let observed = vec![vec![1usize], vec![4, 5]];
        let first = engine.test_columns(&observed, None, None);
        let second = engine.test_columns(&observed, None, None);
        assert_eq!(first, second);
    }

    #[test]
    fn records_do_not_depend_on_thread_count() {
        let (matrix, pools) = fixture();
        let sampler = Sampler::matched(&pools, &[1, 2]).unwrap();
        let config = config(5, 200);
        let engine = Engine::new(
            &matrix,
            &sampler,
            ScoreStrategy::QuantitativeSingle,
            &config,
        );
        let observed = vec![vec![0usize], vec![2, 3]];

        let single = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(|| engine.test_columns(&observed, None, None));
        let many = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap()
            .install(|| engine.test_columns(&observed, None, None));
        assert_eq!(single, many);
    }

    #[test]
    fn replicate_runs_are_tagged_and_use_their_own_stream() {
        let (matrix, pools) = fixture();
        let sampler = Sampler::matched(&pools, &[1, 2]).unwrap();
        let config = config(5, 200);
        let engine = Engine::new(
            &matrix,
            &sampler,
            ScoreStrategy::QuantitativeSingle,
            &config,
        );
        let observed = vec![vec![0usize], vec![2, 3]];
        let records = engine.test_columns(&observed, Some(3), None);
        for record in &records {
            assert_eq!(record.replicate, Some(3));
        }
    }
}
