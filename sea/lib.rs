//! Specificity enrichment testing for trait-associated locus sets.
//!
//! Given a list of loci, a gene-by-condition specificity matrix, and gene
//! intervals, the crate resolves each locus to the genes it plausibly
//! regulates and asks, per condition, whether the resolved gene sets are
//! more condition-specific than size-matched null locus sets drawn from a
//! background list. Results are empirical Monte Carlo p-values.

pub mod engine;
pub mod intervals;
pub mod io;
pub mod matrix;
pub mod report;
pub mod resolve;
pub mod sample;
pub mod score;
pub mod types;
