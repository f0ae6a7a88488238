//! Writers for the result files.
//!
//! Every file is tab-separated with a single header line. Locus rows appear
//! in name order; untestable loci are reported too, with `NA` standing in
//! for whatever could not be determined.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use ahash::AHashMap;
use itertools::Itertools;

use crate::matrix::SpecificityMatrix;
use crate::resolve::LocusPartition;
use crate::score::locus_condition_score;
use crate::types::{Geneset, GenomicInterval, PValueRecord};

/// The per-condition enrichment results for the test loci.
pub fn write_condition_pvalues(path: &Path, records: &[PValueRecord]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "condition\tpvalue\tnulls_observed\tnulls_tested")?;
    for record in records {
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            record.condition, record.pvalue, record.nulls_observed, record.nulls_tested
        )?;
    }
    out.flush()
}

/// Accumulates the null replicate results, one appended block per replicate.
pub struct NullPvalueWriter {
    out: BufWriter<File>,
}

impl NullPvalueWriter {
    pub fn create(path: &Path) -> io::Result<NullPvalueWriter> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "condition\tpvalue\tnulls_observed\tnulls_tested\treplicate"
        )?;
        Ok(NullPvalueWriter { out })
    }

    pub fn append(&mut self, records: &[PValueRecord]) -> io::Result<()> {
        for record in records {
            writeln!(
                self.out,
                "{}\t{}\t{}\t{}\t{}",
                record.condition,
                record.pvalue,
                record.nulls_observed,
                record.nulls_tested,
                record.replicate.unwrap_or_default()
            )?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// One BED-like row per requested locus: unknown names first with `NA`
/// coordinates, then loci that reach no gene, then the testable loci with
/// their gene lists. A combined locus spans from its members' smallest start
/// to their largest end.
pub fn write_snp_genes(
    path: &Path,
    partition: &LocusPartition,
    positions: &AHashMap<String, GenomicInterval>,
    row_names: &[String],
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "chrom\tstart\tend\tsnp\tn_genes\tgenes")?;

    for name in &partition.absent {
        writeln!(out, "NA\tNA\tNA\t{name}\tNA\tNA")?;
    }
    for name in &partition.naked {
        if let Some(locus) = positions.get(name) {
            writeln!(
                out,
                "{}\t{}\t{}\t{name}\t0\tNA",
                locus.chrom, locus.start, locus.end
            )?;
        }
    }
    for (name, genes) in &partition.genesets {
        let (chrom, start, end) = locus_span(name, positions);
        let gene_names = genes.iter().map(|&g| &row_names[g]).join(",");
        writeln!(
            out,
            "{chrom}\t{start}\t{end}\t{name}\t{}\t{gene_names}",
            genes.len()
        )?;
    }
    out.flush()
}

fn locus_span<'a>(
    name: &str,
    positions: &'a AHashMap<String, GenomicInterval>,
) -> (&'a str, u64, u64) {
    let mut chrom = "NA";
    let mut span: Option<(u64, u64)> = None;
    for member in name.split(',') {
        let Some(locus) = positions.get(member) else {
            continue;
        };
        chrom = &locus.chrom;
        span = Some(match span {
            None => (locus.start, locus.end),
            Some((start, end)) => (start.min(locus.start), end.max(locus.end)),
        });
    }
    let (start, end) = span.unwrap_or((0, 0));
    (chrom, start, end)
}

/// The per-locus, per-condition specificity report. For quantitative runs
/// the `gene` column names the most specific gene of the locus, when one
/// stood out.
pub fn write_snp_condition_scores(
    path: &Path,
    matrix: &SpecificityMatrix,
    genesets: &BTreeMap<String, Geneset>,
) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "snp\tcondition\tgene\tscore")?;
    for (name, genes) in genesets {
        for col in 0..matrix.ncols() {
            let cell = locus_condition_score(matrix, col, genes);
            let gene = cell
                .gene
                .map_or("", |g| matrix.row_names()[g].as_str());
            writeln!(
                out,
                "{name}\t{}\t{gene}\t{}",
                matrix.condition_name(col),
                cell.score
            )?;
        }
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::RawMatrix;
    use ndarray::Array2;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn record(condition: &str, pvalue: f64, replicate: Option<u64>) -> PValueRecord {
        PValueRecord {
            condition: condition.to_string(),
            pvalue,
            nulls_observed: 3,
            nulls_tested: 100,
            replicate,
        }
    }

    fn interval(chrom: &str, start: u64, end: u64) -> GenomicInterval {
        GenomicInterval {
            chrom: chrom.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn condition_pvalues_have_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("condition_pvalues.txt");
        let records = vec![record("liver", 0.25, None), record("brain", 1.0, None)];
        write_condition_pvalues(&path, &records).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "condition\tpvalue\tnulls_observed\tnulls_tested");
        assert_eq!(lines[1], "liver\t0.25\t3\t100");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn null_pvalues_accumulate_replicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("null_pvalues.txt");
        let mut writer = NullPvalueWriter::create(&path).unwrap();
        writer.append(&[record("liver", 0.5, Some(0))]).unwrap();
        writer.append(&[record("liver", 0.75, Some(1))]).unwrap();
        writer.finish().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "condition\tpvalue\tnulls_observed\tnulls_tested\treplicate"
        );
        assert_eq!(lines[1], "liver\t0.5\t3\t100\t0");
        assert_eq!(lines[2], "liver\t0.75\t3\t100\t1");
    }

    #[test]
    fn snp_genes_report_all_three_locus_classes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snp_genes.txt");

        let mut positions = AHashMap::new();
        positions.insert("rs1".to_string(), interval("chr1", 100, 100));
        positions.insert("rs2".to_string(), interval("chr1", 180, 180));
        positions.insert("rs3".to_string(), interval("chr1", 500, 500));
        positions.insert("rs_naked".to_string(), interval("chr2", 5, 5));

        let mut genesets = BTreeMap::new();
        genesets.insert("rs1,rs2".to_string(), vec![0usize, 1]);
        genesets.insert("rs3".to_string(), vec![1usize]);
        let partition = LocusPartition {
            genesets,
            absent: ["rs_gone".to_string()].into(),
            naked: ["rs_naked".to_string()].into(),
        };
        let row_names = vec!["GA".to_string(), "GB".to_string()];

        write_snp_genes(&path, &partition, &positions, &row_names).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "chrom\tstart\tend\tsnp\tn_genes\tgenes");
        assert_eq!(lines[1], "NA\tNA\tNA\trs_gone\tNA\tNA");
        assert_eq!(lines[2], "chr2\t5\t5\trs_naked\t0\tNA");
        // The combined locus spans both member positions.
        assert_eq!(lines[3], "chr1\t100\t180\trs1,rs2\t2\tGA,GB");
        assert_eq!(lines[4], "chr1\t500\t500\trs3\t1\tGB");
    }

    #[test]
    fn scores_report_every_locus_condition_pair() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snp_condition_scores.txt");

        let mut values = Array2::zeros((5, 2));
        for row in 0..5 {
            let theta = (row + 1) as f64 * 0.2;
            values[(row, 0)] = theta.cos();
            values[(row, 1)] = theta.sin();
        }
        let raw = RawMatrix {
            row_names: (0..5).map(|i| format!("G{i}")).collect(),
            col_names: vec!["c1".to_string(), "c2".to_string()],
            values,
        };
        let matrix = SpecificityMatrix::prepare(raw, &BTreeSet::new(), 5).unwrap();

        let mut genesets = BTreeMap::new();
        genesets.insert("rs1".to_string(), vec![1usize, 3]);
        write_snp_condition_scores(&path, &matrix, &genesets).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "snp\tcondition\tgene\tscore");
        assert_eq!(lines.len(), 3);
        // Column c1: percentiles 0.4 and 0.8, so G1 drives the score.
        assert!(lines[1].starts_with("rs1\tc1\tG1\t"));
        // Column c2 ranks the high angles first, so G3 wins there.
        assert!(lines[2].starts_with("rs1\tc2\tG3\t"));
    }
}
