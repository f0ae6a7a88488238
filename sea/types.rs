// ========================================================================================
//                              Shared Data Contracts
// ========================================================================================
//
// Types shared between modules. Anything used by a single module lives with
// that module instead.

use std::fmt;
use thiserror::Error;

/// Gene row indices overlapping one locus, sorted ascending and deduplicated.
pub type Geneset = Vec<usize>;

/// A geneset larger than this is binned under this size and sampled from the
/// same pool. Only binning is capped; scoring always sees the full set.
pub const MAX_GENESET_SIZE: usize = 10;

/// A named region of the genome, stored exactly as read from its source row.
/// Coordinates are treated as a closed interval with `end >= start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenomicInterval {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for GenomicInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
    }
}

/// How a gene set's evidence for a column is aggregated: the single most
/// specific gene, or the whole set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMethod {
    Single,
    Total,
}

impl fmt::Display for ScoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoreMethod::Single => write!(f, "single"),
            ScoreMethod::Total => write!(f, "total"),
        }
    }
}

/// How null locus collections are drawn: size-matched to the test loci, or
/// entirely at random (the `randomN` mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    Matched,
    /// Each collection is `loci` distinct null loci drawn without size
    /// matching.
    Random { loci: usize },
}

/// One enrichment result row: the empirical p-value for one condition column,
/// with the null counts that produced it. `replicate` is set only during the
/// null-replicate phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PValueRecord {
    pub condition: String,
    pub pvalue: f64,
    pub nulls_observed: u64,
    pub nulls_tested: u64,
    pub replicate: Option<u64>,
}

/// Scalar knobs for one run. Everything here is fixed before any computation
/// starts; `validate` is the single gate for the numeric thresholds.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Symmetric distance used to expand a locus that overlaps no gene.
    pub slop: u64,
    /// Null SNP-set replicates to score before the test loci.
    pub null_snpset_replicates: u64,
    /// Stop testing a column once this many nulls scored at least as high.
    pub min_observations: u64,
    /// Hard ceiling on null draws per column.
    pub max_iterations: u64,
    pub score_method: ScoreMethod,
    /// Run-level seed; every draw derives its own generator from it.
    pub seed: u64,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidMaxIterations);
        }
        if self.min_observations == 0 || self.min_observations >= self.max_iterations {
            return Err(ConfigError::InvalidMinObservations {
                got: self.min_observations,
                max: self.max_iterations,
            });
        }
        Ok(())
    }
}

/// A malformed run configuration. Always fatal, always reported before any
/// computation starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("--max-iterations must be at least 1")]
    InvalidMaxIterations,
    #[error(
        "--min-observations must be at least 1 and less than --max-iterations \
         (got {got} with --max-iterations {max})"
    )]
    InvalidMinObservations { got: u64, max: u64 },
    #[error("conditions not found in the --gene-matrix columns: {}", .0.join(", "))]
    ConditionsNotFound(Vec<String>),
    #[error("invalid --snps value '{0}': expected a readable file or 'randomN' (N >= 1)")]
    InvalidRandomSpec(String),
    #[error(
        "the test loci require null gene sets of size {size}, but no null locus \
         yields a gene set of that size"
    )]
    EmptyBin { size: usize },
    #[error(
        "cannot draw {requested} random loci: only {eligible} null loci overlap \
         at least one gene"
    )]
    NotEnoughNullLoci { requested: usize, eligible: usize },
}
