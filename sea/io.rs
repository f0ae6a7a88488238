//! Readers for the four input files.
//!
//! Every reader accepts plain text or gzip, decided by the `.gz` extension.
//! Parsing is strict: a malformed row is a hard error naming the file and
//! line, never a silently shortened dataset.
//!
//! Locus name lists are forgiving about layout because they are usually cut
//! from association results: `#` comment lines are skipped, and if the first
//! data line looks like a header naming a SNP column, names are read from
//! that column instead of the first.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use flate2::read::MultiGzDecoder;
use ndarray::Array2;
use thiserror::Error;

use crate::matrix::RawMatrix;
use crate::types::GenomicInterval;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} line {line}: expected at least {expected} whitespace-separated fields", .path.display())]
    ShortRow {
        path: PathBuf,
        line: usize,
        expected: usize,
    },
    #[error("{} line {line}: cannot parse '{value}' as a number", .path.display())]
    BadNumber {
        path: PathBuf,
        line: usize,
        value: String,
    },
    #[error("{} line {line}: interval end {end} is before start {start}", .path.display())]
    BadInterval {
        path: PathBuf,
        line: usize,
        start: u64,
        end: u64,
    },
    #[error("{} is not in GCT format: the first line must begin with '#1.2'", .path.display())]
    NotGct { path: PathBuf },
    #[error("{} line {line}: expected {expected} tab-separated fields, found {found}", .path.display())]
    WrongColumnCount {
        path: PathBuf,
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("{} line 2: expected positive row and column counts", .path.display())]
    GctHeader { path: PathBuf },
    #[error("{}: declared {declared} data rows but found only {found}", .path.display())]
    GctTruncated {
        path: PathBuf,
        declared: usize,
        found: usize,
    },
    #[error("no locus names found in {}", .path.display())]
    NoNames { path: PathBuf },
}

type InputLines = std::io::Lines<BufReader<Box<dyn Read + Send>>>;

/// Opens `path`, transparently decompressing when the extension is `.gz`.
fn open_reader(path: &Path) -> Result<BufReader<Box<dyn Read + Send>>, InputError> {
    let file = File::open(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader: Box<dyn Read + Send> =
        if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
    Ok(BufReader::new(reader))
}

fn next_line(
    lines: &mut InputLines,
    line_no: &mut usize,
    path: &Path,
) -> Result<Option<String>, InputError> {
    match lines.next() {
        None => Ok(None),
        Some(Err(source)) => Err(InputError::Io {
            path: path.to_path_buf(),
            source,
        }),
        Some(Ok(line)) => {
            *line_no += 1;
            Ok(Some(line.trim_end().to_string()))
        }
    }
}

/// Reads a locus name list: one name per line, `#` comments skipped. If the
/// first data line contains a field named `SNP`, `snp`, `name`, or `marker`,
/// it is treated as a header and names come from that column.
pub fn read_locus_names(path: &Path) -> Result<BTreeSet<String>, InputError> {
    const HEADER_NAMES: [&str; 4] = ["SNP", "snp", "name", "marker"];
    let mut lines = open_reader(path)?.lines();
    let mut line_no = 0usize;
    let mut names = BTreeSet::new();
    let mut column: Option<usize> = None;
    while let Some(line) = next_line(&mut lines, &mut line_no, path)? {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() || fields[0].starts_with('#') {
            continue;
        }
        let col = match column {
            Some(col) => col,
            None => {
                if let Some(col) = fields.iter().position(|f| HEADER_NAMES.contains(f)) {
                    column = Some(col);
                    continue;
                }
                column = Some(0);
                0
            }
        };
        if let Some(name) = fields.get(col) {
            names.insert((*name).to_string());
        }
    }
    if names.is_empty() {
        return Err(InputError::NoNames {
            path: path.to_path_buf(),
        });
    }
    Ok(names)
}

fn parse_bed_row(
    line: &str,
    line_no: usize,
    path: &Path,
) -> Result<Option<(String, GenomicInterval)>, InputError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.is_empty() || fields[0].starts_with('#') {
        return Ok(None);
    }
    if fields.len() < 4 {
        return Err(InputError::ShortRow {
            path: path.to_path_buf(),
            line: line_no,
            expected: 4,
        });
    }
    let parse = |value: &str| -> Result<u64, InputError> {
        value.parse().map_err(|_| InputError::BadNumber {
            path: path.to_path_buf(),
            line: line_no,
            value: value.to_string(),
        })
    };
    let start = parse(fields[1])?;
    let end = parse(fields[2])?;
    if end < start {
        return Err(InputError::BadInterval {
            path: path.to_path_buf(),
            line: line_no,
            start,
            end,
        });
    }
    Ok(Some((
        fields[3].to_string(),
        GenomicInterval {
            chrom: fields[0].to_string(),
            start,
            end,
        },
    )))
}

/// Reads gene intervals: `chrom start end name`, extra columns ignored.
/// Duplicate names are kept; a gene may legitimately carry several intervals.
pub fn read_gene_intervals(path: &Path) -> Result<Vec<(String, GenomicInterval)>, InputError> {
    let mut lines = open_reader(path)?.lines();
    let mut line_no = 0usize;
    let mut intervals = Vec::new();
    while let Some(line) = next_line(&mut lines, &mut line_no, path)? {
        if let Some(row) = parse_bed_row(&line, line_no, path)? {
            intervals.push(row);
        }
    }
    Ok(intervals)
}

/// Reads locus positions into a name-to-interval map. A name listed twice
/// keeps its last position.
pub fn read_locus_positions(
    path: &Path,
) -> Result<AHashMap<String, GenomicInterval>, InputError> {
    let mut lines = open_reader(path)?.lines();
    let mut line_no = 0usize;
    let mut positions = AHashMap::new();
    while let Some(line) = next_line(&mut lines, &mut line_no, path)? {
        if let Some((name, interval)) = parse_bed_row(&line, line_no, path)? {
            positions.insert(name, interval);
        }
    }
    Ok(positions)
}

/// Reads a GCT expression matrix: the `#1.2` magic, a `rows cols` line, a
/// header with two label columns, then exactly `rows` data lines. Values
/// must all parse; there is no missing-data convention.
pub fn read_gct(path: &Path) -> Result<RawMatrix, InputError> {
    let not_gct = || InputError::NotGct {
        path: path.to_path_buf(),
    };
    let mut lines = open_reader(path)?.lines();
    let mut line_no = 0usize;

    let magic = next_line(&mut lines, &mut line_no, path)?.ok_or_else(not_gct)?;
    if !magic.starts_with("#1.2") {
        return Err(not_gct());
    }

    let header = || InputError::GctHeader {
        path: path.to_path_buf(),
    };
    let dims = next_line(&mut lines, &mut line_no, path)?.ok_or_else(header)?;
    let mut parts = dims.split_whitespace();
    let nrows: usize = parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(header)?;
    let ncols: usize = parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(header)?;
    if nrows == 0 || ncols == 0 {
        return Err(header());
    }

    let names_line = next_line(&mut lines, &mut line_no, path)?.ok_or_else(header)?;
    let fields: Vec<&str> = names_line.split('\t').collect();
    if fields.len() != ncols + 2 {
        return Err(InputError::WrongColumnCount {
            path: path.to_path_buf(),
            line: line_no,
            expected: ncols + 2,
            found: fields.len(),
        });
    }
    let col_names: Vec<String> = fields[2..].iter().map(|s| s.trim().to_string()).collect();

    let mut row_names = Vec::with_capacity(nrows);
    let mut data = Vec::with_capacity(nrows * ncols);
    while row_names.len() < nrows {
        let Some(line) = next_line(&mut lines, &mut line_no, path)? else {
            return Err(InputError::GctTruncated {
                path: path.to_path_buf(),
                declared: nrows,
                found: row_names.len(),
            });
        };
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != ncols + 2 {
            return Err(InputError::WrongColumnCount {
                path: path.to_path_buf(),
                line: line_no,
                expected: ncols + 2,
                found: fields.len(),
            });
        }
        row_names.push(fields[0].to_string());
        for value in &fields[2..] {
            let parsed: f64 = value.trim().parse().map_err(|_| InputError::BadNumber {
                path: path.to_path_buf(),
                line: line_no,
                value: (*value).to_string(),
            })?;
            data.push(parsed);
        }
    }

    let values = Array2::from_shape_vec((nrows, ncols), data).map_err(|_| {
        InputError::GctTruncated {
            path: path.to_path_buf(),
            declared: nrows,
            found: row_names.len(),
        }
    })?;
    Ok(RawMatrix {
        row_names,
        col_names,
        values,
    })
}
