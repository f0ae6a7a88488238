// ========================================================================================
//
//                      THE RUN ORCHESTRATOR: SPECSEA
//
// ========================================================================================
//
// This module is the conductor of one enrichment run. Its sole responsibility
// is to sequence the pipeline defined in the library: read and validate the
// four inputs, prepare the specificity matrix, build the null pools, resolve
// the test loci, then drive the empirical testing engine and write the five
// result files. It owns every resource and decides what is fatal.
//
// All randomness flows from the single --seed value. The orchestrator hands
// the seed to the library and never touches a generator itself, so a run is
// reproducible from its args.txt alone.

use clap::{Parser, ValueEnum};
use log::{LevelFilter, info, warn};
use specsea::engine::{Engine, create_progress_bar};
use specsea::intervals::IntervalIndex;
use specsea::io::{read_gct, read_gene_intervals, read_locus_names, read_locus_positions};
use specsea::matrix::SpecificityMatrix;
use specsea::report::{
    NullPvalueWriter, write_condition_pvalues, write_snp_condition_scores, write_snp_genes,
};
use specsea::resolve::{capped_sizes, merge_overlapping, resolve_loci};
use specsea::sample::{NullPools, Sampler, observed_draw_rng};
use specsea::score::ScoreStrategy;
use specsea::types::{ConfigError, Geneset, RunConfig, SamplingMode, ScoreMethod};
use std::collections::BTreeSet;
use std::error::Error;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "specsea",
    version,
    about = "Tests trait-associated SNP sets for enrichment of condition-specific genes."
)]
struct Args {
    /// SNPs to test: a file of names (text or .gz), or 'randomN' to draw N
    /// random null SNPs instead.
    #[clap(long, value_name = "FILE|randomN")]
    snps: String,

    /// Gene-by-condition specificity matrix in GCT format (.gct or .gct.gz).
    #[clap(long, value_name = "FILE")]
    gene_matrix: PathBuf,

    /// BED file with one interval per gene.
    #[clap(long, value_name = "FILE")]
    gene_intervals: PathBuf,

    /// BED file with the genomic position of every SNP.
    #[clap(long, value_name = "FILE")]
    snp_intervals: PathBuf,

    /// Null SNPs matched in genomic properties to the tested SNPs, e.g. an
    /// LD-pruned genotyping platform.
    #[clap(long, value_name = "FILE")]
    null_snps: PathBuf,

    /// Output directory, created if missing.
    #[clap(long, value_name = "DIR")]
    out: PathBuf,

    /// File of matrix columns to project out before testing.
    #[clap(long, value_name = "FILE")]
    condition: Option<PathBuf>,

    /// Locus score: the single most specific gene, or the total over the
    /// locus's genes.
    #[clap(long, value_enum, default_value = "single")]
    score: ScoreArg,

    /// If a SNP overlaps no gene interval, extend its interval this many
    /// nucleotides and try again.
    #[clap(long, value_name = "BP", default_value_t = 250_000.0)]
    slop: f64,

    /// Number of threads, clamped to the machine's CPU count.
    #[clap(long, default_value_t = 1)]
    threads: usize,

    /// Test this many matched null SNP sets first, to give the test loci's
    /// p-values a null distribution to stand against.
    #[clap(long, value_name = "N", default_value_t = 10)]
    null_snpsets: u64,

    /// Stop testing a column after this many null sets scored at least as
    /// high as the tested set. Increase for more accurate p-values.
    #[clap(long, value_name = "N", default_value_t = 25)]
    min_observations: u64,

    /// Ceiling on null sets tested per column. Increase to resolve smaller
    /// p-values. Accepts scientific notation, e.g. 1e6.
    #[clap(long, value_name = "N", default_value_t = 1_000.0)]
    max_iterations: f64,

    /// Seed for every random draw in the run.
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// More logging per occurrence (-v debug, -vv trace).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScoreArg {
    Single,
    Total,
}

impl ScoreArg {
    fn method(self) -> ScoreMethod {
        match self {
            ScoreArg::Single => ScoreMethod::Single,
            ScoreArg::Total => ScoreMethod::Total,
        }
    }
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    let args = Args::parse();
    init_logger(args.verbose);
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    // --- Phase 1: Configuration ---
    let config = RunConfig {
        slop: args.slop as u64,
        null_snpset_replicates: args.null_snpsets,
        min_observations: args.min_observations,
        max_iterations: args.max_iterations as u64,
        score_method: args.score.method(),
        seed: args.seed,
    };
    config.validate()?;

    let threads = args.threads.clamp(1, num_cpus::get());
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;
    info!("using {threads} thread(s)");

    fs::create_dir_all(&args.out)
        .map_err(|e| format!("cannot create output directory {}: {e}", args.out.display()))?;
    write_args_file(&args)?;

    // --- Phase 2: Inputs ---
    let positions = read_locus_positions(&args.snp_intervals)?;
    info!(
        "{}: {} SNP positions",
        args.snp_intervals.display(),
        positions.len()
    );

    let null_names = read_locus_names(&args.null_snps)?;
    info!("{}: {} null SNPs", args.null_snps.display(), null_names.len());

    let conditions = match &args.condition {
        Some(path) => {
            let names = read_locus_names(path)?;
            info!("{}: {} conditions to project out", path.display(), names.len());
            names
        }
        None => BTreeSet::new(),
    };

    let raw = read_gct(&args.gene_matrix)?;
    info!(
        "{}: {} genes x {} conditions",
        args.gene_matrix.display(),
        raw.row_names.len(),
        raw.col_names.len()
    );

    let gene_intervals = read_gene_intervals(&args.gene_intervals)?;
    info!(
        "{}: {} gene intervals",
        args.gene_intervals.display(),
        gene_intervals.len()
    );

    // --- Phase 3: The Interval Index and the Matrix ---
    let row_index = raw.row_index();
    let index = IntervalIndex::build(&gene_intervals, &row_index);
    if index.skipped_intervals() > 0 {
        info!(
            "skipped {} intervals for genes absent from the matrix",
            index.skipped_intervals()
        );
    }
    if index.missing_rows() > 0 {
        info!(
            "{} matrix genes have no interval and cannot be reached by any locus",
            index.missing_rows()
        );
    }
    info!("universe: {} genes with at least one interval", index.indexed_rows());

    let matrix = SpecificityMatrix::prepare(raw, &conditions, index.indexed_rows())?;
    if matrix.is_binary() {
        info!("the matrix is binary; using binary scoring");
    } else {
        info!("the matrix is quantitative; values replaced by specificity percentiles");
    }

    // --- Phase 4: Null Pools ---
    let pools = NullPools::build(&null_names, &positions, &index, config.slop);
    info!(
        "{} of {} null SNPs are eligible (known position, at least one gene)",
        pools.eligible_len(),
        null_names.len()
    );

    // --- Phase 5: The Test Loci ---
    let (user_names, mode) = if Path::new(&args.snps).exists() {
        let names = read_locus_names(Path::new(&args.snps))?;
        info!("{}: {} SNPs to test", args.snps, names.len());
        (names, SamplingMode::Matched)
    } else if let Some(n) = parse_random_spec(&args.snps) {
        let mut rng = observed_draw_rng(config.seed, 0);
        let names = pools.draw_random_names(n, &mut rng)?;
        info!("testing {n} random null SNPs in place of a user list");
        (names, SamplingMode::Random { loci: n })
    } else {
        return Err(ConfigError::InvalidRandomSpec(args.snps.clone()).into());
    };

    let mut partition = resolve_loci(&user_names, &positions, &index, config.slop);
    if !partition.absent.is_empty() {
        warn!(
            "{} SNPs have no known position: {}",
            partition.absent.len(),
            itertools::join(&partition.absent, ", ")
        );
    }
    if !partition.naked.is_empty() {
        warn!(
            "{} SNPs overlap no gene, even with slop {}: {}",
            partition.naked.len(),
            config.slop,
            itertools::join(&partition.naked, ", ")
        );
    }

    let (merged, merge_stats) = merge_overlapping(&partition.genesets);
    if merge_stats.merged_groups > 0 {
        info!(
            "merged {} SNPs with shared genes into {} combined loci",
            merge_stats.merged_loci, merge_stats.merged_groups
        );
    }
    partition.genesets = merged;
    info!("testing {} loci", partition.genesets.len());
    if partition.genesets.is_empty() {
        warn!("no testable locus remains; every p-value will be 1");
    }

    let snp_genes_path = args.out.join("snp_genes.txt");
    write_snp_genes(&snp_genes_path, &partition, &positions, matrix.row_names())
        .map_err(|e| format!("cannot write {}: {e}", snp_genes_path.display()))?;

    // --- Phase 6: The Sampler and the Engine ---
    let sizes = capped_sizes(&partition.genesets);
    for (size, pool) in pools.bin_summary() {
        if sizes.contains(&size) {
            info!("null pool for gene-set size {size}: {pool} loci");
        }
    }
    let sampler = match mode {
        SamplingMode::Matched => Sampler::matched(&pools, &sizes)?,
        SamplingMode::Random { loci } => Sampler::random(&pools, loci)?,
    };

    let strategy = ScoreStrategy::select(config.score_method, matrix.is_binary());
    let engine = Engine::new(&matrix, &sampler, strategy, &config);
    let observed: Vec<Geneset> = partition.genesets.values().cloned().collect();

    // --- Phase 7: Null SNP-Set Replicates ---
    if config.null_snpset_replicates > 0 {
        let null_path = args.out.join("null_pvalues.txt");
        let mut writer = NullPvalueWriter::create(&null_path)
            .map_err(|e| format!("cannot write {}: {e}", null_path.display()))?;
        let bar = create_progress_bar(
            config.null_snpset_replicates * matrix.ncols() as u64,
            "null SNP sets",
        );
        for replicate in 0..config.null_snpset_replicates {
            let mut rng = observed_draw_rng(config.seed, replicate + 1);
            let null_observed = sampler.draw(&mut rng);
            let records = engine.test_columns(&null_observed, Some(replicate), Some(&bar));
            writer
                .append(&records)
                .map_err(|e| format!("cannot write {}: {e}", null_path.display()))?;
        }
        writer
            .finish()
            .map_err(|e| format!("cannot write {}: {e}", null_path.display()))?;
        bar.finish_and_clear();
        info!(
            "tested {} null SNP-set replicates",
            config.null_snpset_replicates
        );
    }

    // --- Phase 8: Per-Locus Scores ---
    let scores_path = args.out.join("snp_condition_scores.txt");
    write_snp_condition_scores(&scores_path, &matrix, &partition.genesets)
        .map_err(|e| format!("cannot write {}: {e}", scores_path.display()))?;

    // --- Phase 9: The Test Loci's P-Values ---
    let bar = create_progress_bar(matrix.ncols() as u64, "conditions");
    let records = engine.test_columns(&observed, None, Some(&bar));
    bar.finish_and_clear();

    let pvalues_path = args.out.join("condition_pvalues.txt");
    write_condition_pvalues(&pvalues_path, &records)
        .map_err(|e| format!("cannot write {}: {e}", pvalues_path.display()))?;
    info!("wrote {}", pvalues_path.display());

    eprintln!("> Total execution time: {:.2?}", start_time.elapsed());
    Ok(())
}

/// Accepts `randomN` with a positive N, the alternative to a SNP list file.
fn parse_random_spec(spec: &str) -> Option<usize> {
    spec.strip_prefix("random")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|&n| n > 0)
}

/// Records the exact invocation so a run can be reproduced from its output
/// directory alone.
fn write_args_file(args: &Args) -> Result<(), Box<dyn Error>> {
    let path = args.out.join("args.txt");
    write_args_inner(args, &path).map_err(|e| format!("cannot write {}: {e}", path.display()))?;
    Ok(())
}

fn write_args_inner(args: &Args, path: &Path) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "# specsea {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "{:<18} {}", "--snps", args.snps)?;
    writeln!(out, "{:<18} {}", "--gene-matrix", args.gene_matrix.display())?;
    writeln!(out, "{:<18} {}", "--gene-intervals", args.gene_intervals.display())?;
    writeln!(out, "{:<18} {}", "--snp-intervals", args.snp_intervals.display())?;
    writeln!(out, "{:<18} {}", "--null-snps", args.null_snps.display())?;
    if let Some(condition) = &args.condition {
        writeln!(out, "{:<18} {}", "--condition", condition.display())?;
    }
    writeln!(out, "{:<18} {}", "--out", args.out.display())?;
    writeln!(out, "{:<18} {}", "--score", args.score.method())?;
    writeln!(out, "{:<18} {}", "--slop", args.slop)?;
    writeln!(out, "{:<18} {}", "--threads", args.threads)?;
    writeln!(out, "{:<18} {}", "--null-snpsets", args.null_snpsets)?;
    writeln!(out, "{:<18} {}", "--min-observations", args.min_observations)?;
    writeln!(out, "{:<18} {}", "--max-iterations", args.max_iterations)?;
    writeln!(out, "{:<18} {}", "--seed", args.seed)?;
    writeln!(out)?;
    out.flush()
}
