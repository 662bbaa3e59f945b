// ========================================================================================
//
//                 Population-relative statistics over plink score tables
//
// ========================================================================================

use crate::shared::files::count_lines;
use log::debug;
use statrs::function::erf::erf;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Score table has neither SCORE1_AVG nor SCORE1_SUM with ALLELE_CT: \"{header}\"")]
    MissingColumns { header: String },
    #[error("Score table contains no usable rows")]
    EmptyScoreSet,
}

/// Mean and sample standard deviation of per-sample average scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub n: usize,
    pub mean: f64,
    /// N-1 denominator. Zero for a single sample or when every value is identical.
    pub sd: f64,
}

/// Where an individual falls relative to a population summary.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Comparison {
    pub z_score: Option<f64>,
    pub percentile: Option<f64>,
}

#[derive(Clone, Copy)]
enum AverageSource {
    Average(usize),
    SumOverCount { sum: usize, count: usize },
}

impl AverageSource {
    fn from_header(columns: &[&str]) -> Option<Self> {
        let find = |name: &str| columns.iter().position(|c| *c == name);
        match (find("SCORE1_AVG"), find("SCORE1_SUM"), find("ALLELE_CT")) {
            (Some(avg), _, _) => Some(AverageSource::Average(avg)),
            (None, Some(sum), Some(count)) => Some(AverageSource::SumOverCount { sum, count }),
            _ => None,
        }
    }

    fn value(self, fields: &[&str]) -> Option<f64> {
        let parse = |i: usize| -> Option<f64> {
            let raw = fields.get(i)?;
            lexical_core::parse::<f64>(raw.as_bytes())
                .ok()
                .filter(|v| v.is_finite())
        };
        match self {
            AverageSource::Average(i) => parse(i),
            AverageSource::SumOverCount { sum, count } => {
                let count = parse(count).filter(|c| *c != 0.0)?;
                Some(parse(sum)? / count)
            }
        }
    }
}

/// Extracts one average per sample from a whitespace-delimited plink score table.
///
/// Uses `SCORE1_AVG` when present, else `SCORE1_SUM / ALLELE_CT`. Short rows, unparsable
/// values and zero allele counts are skipped.
pub fn parse_score_table<R: BufRead>(reader: R) -> Result<Vec<f64>, StatsError> {
    let stream_err = |source| StatsError::Io {
        path: PathBuf::from("<stream>"),
        source,
    };
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line.map_err(stream_err)?,
        None => return Err(StatsError::EmptyScoreSet),
    };
    let columns: Vec<&str> = header.split_whitespace().collect();
    let source = AverageSource::from_header(&columns).ok_or_else(|| StatsError::MissingColumns {
        header: header.trim().to_string(),
    })?;

    let mut values = Vec::new();
    let mut skipped = 0usize;
    for line in lines {
        let line = line.map_err(stream_err)?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        match source.value(&fields) {
            Some(v) => values.push(v),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("Skipped {skipped} unusable score rows");
    }
    Ok(values)
}

pub fn read_score_table(path: &Path) -> Result<Vec<f64>, StatsError> {
    let file = File::open(path).map_err(|source| StatsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_score_table(BufReader::new(file))
}

/// Summarizes a set of averages. An empty set is an error.
pub fn summarize(values: &[f64]) -> Result<ScoreSummary, StatsError> {
    let n = values.len();
    if n == 0 {
        return Err(StatsError::EmptyScoreSet);
    }
    let mean = values.iter().sum::<f64>() / n as f64;

    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(*v), hi.max(*v))
        });
    let sd = if n <= 1 || min == max {
        0.0
    } else {
        let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    };

    Ok(ScoreSummary { n, mean, sd })
}

/// Reads and summarizes a score table in one step.
pub fn summarize_table(path: &Path) -> Result<ScoreSummary, StatsError> {
    summarize(&read_score_table(path)?)
}

/// Standard normal CDF.
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// z-score and percentile of `individual_mean` within `population`.
///
/// Both are absent when the population has no spread or the result is not finite.
pub fn compare(individual_mean: f64, population: &ScoreSummary) -> Comparison {
    if population.sd.is_nan() || population.sd <= 0.0 {
        return Comparison::default();
    }
    let z = finite((individual_mean - population.mean) / population.sd);
    Comparison {
        z_score: z,
        percentile: z.map(normal_cdf).and_then(finite),
    }
}

/// Drops NaN and infinities.
pub fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Share of a definition's variants that survived into population scoring.
///
/// `lines(extraction list) / (lines(normalized score file) - 1) * 100`. Zero when either
/// file is unreadable or the score file has no data rows.
pub fn retention_percent(extraction_list: &Path, normalized_score: &Path) -> f64 {
    let (Ok(used), Ok(total)) = (count_lines(extraction_list), count_lines(normalized_score))
    else {
        return 0.0;
    };
    if total <= 1 {
        return 0.0;
    }
    used as f64 / (total - 1) as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::fs;
    use std::io::Cursor;

    #[test]
    fn summary_of_one_two_three() {
        let summary = summarize(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(summary.n, 3);
        assert_abs_diff_eq!(summary.mean, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.sd, 1.0, epsilon = 1e-12);

        let cmp = compare(3.0, &summary);
        assert_abs_diff_eq!(cmp.z_score.unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cmp.percentile.unwrap(), 0.841_344_746, epsilon = 1e-6);
    }

    #[test]
    fn identical_values_have_no_spread() {
        let summary = summarize(&[0.1, 0.1, 0.1, 0.1]).unwrap();
        assert_eq!(summary.sd, 0.0);
        assert_eq!(compare(0.5, &summary), Comparison::default());

        let single = summarize(&[4.2]).unwrap();
        assert_eq!(single.sd, 0.0);
    }

    #[test]
    fn empty_set_is_an_error() {
        assert!(matches!(summarize(&[]), Err(StatsError::EmptyScoreSet)));
    }

    #[test]
    fn average_column_is_preferred() {
        let table = "#IID\tALLELE_CT\tNAMED_ALLELE_DOSAGE_SUM\tSCORE1_AVG\tSCORE1_SUM\n\
a\t10\t5\t0.5\t5\n\
b\t10\t5\tnot-a-number\t5\n\
c\t10\n\
d\t8\t4\t0.25\t2\n";
        let values = parse_score_table(Cursor::new(table)).unwrap();
        assert_eq!(values, vec![0.5, 0.25]);
    }

    #[test]
    fn sum_over_count_is_used_without_average() {
        let table = "#IID ALLELE_CT SCORE1_SUM\na 4 2\nb 0 3\nc 5 1\n";
        let values = parse_score_table(Cursor::new(table)).unwrap();
        assert_eq!(values, vec![0.5, 0.2]);
    }

    #[test]
    fn missing_columns_are_reported() {
        let err = parse_score_table(Cursor::new("#IID ALLELE_CT\na 4\n")).unwrap_err();
        assert!(matches!(err, StatsError::MissingColumns { .. }));
    }

    #[test]
    fn retention_counts_lines_against_data_rows() {
        let dir = tempfile::tempdir().unwrap();
        let snplist = dir.path().join("PGS1.snplist");
        let score = dir.path().join("PGS1.norm.tsv");
        fs::write(&snplist, (0..80).map(|i| format!("rs{i}\n")).collect::<String>()).unwrap();
        let mut body = String::from("chr_name\tchr_position\teffect_allele\teffect_weight\n");
        for i in 0..120 {
            body.push_str(&format!("1\t{i}\tA\t0.1\n"));
        }
        fs::write(&score, body).unwrap();

        assert_abs_diff_eq!(retention_percent(&snplist, &score), 66.666_666_666, epsilon = 1e-6);
    }

    #[test]
    fn retention_is_zero_without_data_rows_or_files() {
        let dir = tempfile::tempdir().unwrap();
        let snplist = dir.path().join("a.snplist");
        let header_only = dir.path().join("a.tsv");
        fs::write(&snplist, "rs1\n").unwrap();
        fs::write(&header_only, "chr_name\tchr_position\teffect_allele\teffect_weight\n").unwrap();
        assert_eq!(retention_percent(&snplist, &header_only), 0.0);
        assert_eq!(retention_percent(&dir.path().join("missing"), &header_only), 0.0);
    }

    #[test]
    fn non_finite_values_are_dropped() {
        assert_eq!(finite(f64::NAN), None);
        assert_eq!(finite(f64::INFINITY), None);
        assert_eq!(finite(1.5), Some(1.5));
    }
}
