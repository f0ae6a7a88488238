// ========================================================================================
//                              Collection Scoring
// ========================================================================================
//
// A collection of gene sets is scored against one matrix column. Each gene
// set contributes the negative log of a tail probability; the column score is
// the sum over the collection. Binary and quantitative matrices use different
// probability models, and each model has a `single` flavor (only the most
// specific gene counts) and a `total` flavor (the whole set counts). The same
// four functions score the observed loci and every null draw, so any bias
// cancels in the comparison.
//
// Probability edge cases follow one rule: if the column total ends up
// non-finite (an underflowed tail, or a rejected distribution parameter), the
// column score is 0.0, which downstream reads as "nothing observed".

use statrs::distribution::{
    Binomial, ContinuousCDF, Discrete, DiscreteCDF, Gamma, Hypergeometric,
};

use crate::matrix::SpecificityMatrix;
use crate::types::ScoreMethod;

/// The concrete scoring function for a run, fixed once the matrix mode is
/// known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreStrategy {
    BinarySingle,
    BinaryTotal,
    QuantitativeSingle,
    QuantitativeTotal,
}

impl ScoreStrategy {
    pub fn select(method: ScoreMethod, binary: bool) -> ScoreStrategy {
        match (method, binary) {
            (ScoreMethod::Single, true) => ScoreStrategy::BinarySingle,
            (ScoreMethod::Total, true) => ScoreStrategy::BinaryTotal,
            (ScoreMethod::Single, false) => ScoreStrategy::QuantitativeSingle,
            (ScoreMethod::Total, false) => ScoreStrategy::QuantitativeTotal,
        }
    }

    /// Scores `genesets` against column `col`. Accepts both owned gene sets
    /// and borrowed slices so null draws never have to copy.
    pub fn score<S: AsRef<[usize]>>(
        self,
        matrix: &SpecificityMatrix,
        col: usize,
        genesets: &[S],
    ) -> f64 {
        let total = match self {
            ScoreStrategy::BinarySingle => binary_single(matrix, col, genesets),
            ScoreStrategy::BinaryTotal => binary_total(matrix, col, genesets),
            ScoreStrategy::QuantitativeSingle => quantitative_single(matrix, col, genesets),
            ScoreStrategy::QuantitativeTotal => quantitative_total(matrix, col, genesets),
        };
        if total.is_finite() { total } else { 0.0 }
    }
}

/// P(at least one gene of the set is on), via the hypergeometric chance of
/// drawing zero on-genes. Sets with no on-gene contribute nothing.
fn binary_single<S: AsRef<[usize]>>(
    matrix: &SpecificityMatrix,
    col: usize,
    genesets: &[S],
) -> f64 {
    let Some(stats) = matrix.binary_stats() else {
        return f64::NAN;
    };
    let on = stats.on_genes[col];
    let off = matrix.universe().saturating_sub(on);
    let mut total = 0.0;
    for geneset in genesets {
        let genes = geneset.as_ref();
        if genes.iter().any(|&g| matrix.value(g, col) > 0.0) {
            let none_on = Hypergeometric::new(on + off, on, genes.len() as u64)
                .map(|d| d.pmf(0))
                .unwrap_or(f64::NAN);
            total += -(1.0 - none_on).ln();
        }
    }
    total
}

/// Upper hypergeometric tail: P(at least as many on-genes as observed in the
/// set).
fn binary_total<S: AsRef<[usize]>>(
    matrix: &SpecificityMatrix,
    col: usize,
    genesets: &[S],
) -> f64 {
    let Some(stats) = matrix.binary_stats() else {
        return f64::NAN;
    };
    let on = stats.on_genes[col];
    let off = matrix.universe().saturating_sub(on);
    let mut total = 0.0;
    for geneset in genesets {
        let genes = geneset.as_ref();
        let k = genes
            .iter()
            .filter(|&&g| matrix.value(g, col) > 0.0)
            .count() as u64;
        if k > 0 {
            let tail = Hypergeometric::new(on + off, on, genes.len() as u64)
                .map(|d| d.sf(k - 1))
                .unwrap_or(f64::NAN);
            total += -tail.ln();
        }
    }
    total
}

/// P(the minimum of `t` uniform percentiles is at most the observed minimum).
/// A set whose best percentile is 1.0 contributes nothing.
fn quantitative_single<S: AsRef<[usize]>>(
    matrix: &SpecificityMatrix,
    col: usize,
    genesets: &[S],
) -> f64 {
    let mut total = 0.0;
    for geneset in genesets {
        let genes = geneset.as_ref();
        let mut best = 1.0f64;
        for &g in genes {
            best = best.min(matrix.value(g, col));
        }
        if best < 1.0 {
            let p = 1.0 - (1.0 - best).powi(genes.len() as i32);
            total += -p.ln();
        }
    }
    total
}

/// Gamma upper tail of the summed percentile surprisals. Under the null the
/// sum of `t` values of -ln(percentile) is Gamma(t, 1) distributed. A NaN
/// percentile (all-zero row) counts as 1.0: zero surprisal.
fn quantitative_total<S: AsRef<[usize]>>(
    matrix: &SpecificityMatrix,
    col: usize,
    genesets: &[S],
) -> f64 {
    let mut total = 0.0;
    for geneset in genesets {
        let genes = geneset.as_ref();
        let surprisal: f64 = genes
            .iter()
            .map(|&g| {
                let v = matrix.value(g, col);
                if v.is_nan() { 0.0 } else { -v.ln() }
            })
            .sum();
        let tail = Gamma::new(genes.len() as f64, 1.0)
            .map(|d| d.sf(surprisal))
            .unwrap_or(f64::NAN);
        total += -tail.ln();
    }
    total
}

/// One locus-condition cell of the per-locus report: the probability of the
/// locus's evidence in that column, and the responsible gene when a single
/// gene is responsible.
#[derive(Debug, Clone, PartialEq)]
pub struct LocusConditionScore {
    /// Row of the most specific gene; `None` for binary matrices (the whole
    /// set is responsible) and for sets whose best percentile is 1.0.
    pub gene: Option<usize>,
    pub score: f64,
}

pub fn locus_condition_score(
    matrix: &SpecificityMatrix,
    col: usize,
    genes: &[usize],
) -> LocusConditionScore {
    if let Some(stats) = matrix.binary_stats() {
        let k = genes
            .iter()
            .filter(|&&g| matrix.value(g, col) > 0.0)
            .count() as u64;
        let score = Binomial::new(stats.on_fraction[col], stats.on_genes[col])
            .map(|d| d.pmf(k))
            .unwrap_or(f64::NAN);
        return LocusConditionScore { gene: None, score };
    }
    let mut best = 1.0f64;
    let mut best_gene = None;
    for &g in genes {
        let v = matrix.value(g, col);
        if v < best {
            best = v;
            best_gene = Some(g);
        }
    }
    let score = if best < 1.0 {
        1.0 - (1.0 - best).powi(genes.len() as i32)
    } else {
        1.0
    };
    LocusConditionScore {
        gene: best_gene,
        score,
    }
}
