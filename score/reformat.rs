// ========================================================================================
//
//               PGS catalog score file diagnostics & reformatting
//
// ========================================================================================
//
// Score files arrive in many shapes: catalog files with metadata preambles and a dozen
// columns, bare four-column data without a header, rows that lost their leading rsID, or
// an already-prepared `rsID effect_allele effect_weight` table. All of them leave this
// module as one of two canonical layouts.

use crate::shared::files::open_text_source;
use crate::types::RowPolicy;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::Path;

// ========================================================================================
//                                   Public API
// ========================================================================================

/// Column names accepted as the weight column, in priority order.
pub const DEFAULT_WEIGHT_NAMES: [&str; 4] = ["effect_weight", "beta", "weight", "or"];

pub const POSITION_KEYED_HEADER: &str = "chr_name\tchr_position\teffect_allele\teffect_weight";
pub const VARIANT_ID_HEADER: &str = "rsID\teffect_allele\teffect_weight";

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Explicit weight column name. Falls back to `DEFAULT_WEIGHT_NAMES` when absent from
    /// the header.
    pub weight_column: Option<String>,
    pub row_policy: RowPolicy,
}

/// Which canonical layout a normalized file was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreFileShape {
    /// `chr_name chr_position effect_allele effect_weight`
    PositionKeyed,
    /// `rsID effect_allele effect_weight`, copied through unchanged.
    VariantIdPassthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub shape: ScoreFileShape,
    pub rows_written: usize,
    pub rows_skipped: usize,
}

/// A structured error type for the reformatting process, designed for useful diagnostics.
#[derive(Debug)]
pub enum ReformatError {
    /// An underlying I/O error.
    Io(io::Error),
    /// No header or data row was found.
    Empty,
    /// A required column could not be resolved to an index.
    MissingColumns {
        line_content: String,
        missing: Vec<&'static str>,
    },
    /// Neither the requested weight column nor any known synonym is present.
    NoWeightColumn {
        line_content: String,
        requested: Option<String>,
    },
    /// A data row does not reach the weight column even after padding.
    MalformedRow {
        line_number: usize,
        line_content: String,
        details: String,
    },
}

impl Display for ReformatError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "Failed to normalize PGS score file.")?;
        writeln!(
            f,
            "\n-- Diagnostic Details ----------------------------------------------------"
        )?;

        match self {
            ReformatError::Io(e) => {
                writeln!(f, "Reason:       An I/O error occurred.")?;
                writeln!(f, "Details:      {e}")?;
            }
            ReformatError::Empty => {
                writeln!(f, "Reason:       The file is empty.")?;
                writeln!(
                    f,
                    "Details:      No header or data row was found after skipping blank and '#' lines."
                )?;
            }
            ReformatError::MissingColumns {
                line_content,
                missing,
            } => {
                writeln!(f, "Line Content: \"{}\"", line_content.trim())?;
                writeln!(f, "Reason:       Required columns could not be located.")?;
                writeln!(f, "Details:      Missing: {}", missing.join(", "))?;
            }
            ReformatError::NoWeightColumn {
                line_content,
                requested,
            } => {
                writeln!(f, "Line Content: \"{}\"", line_content.trim())?;
                writeln!(f, "Reason:       No weight column was recognised.")?;
                match requested {
                    Some(name) => writeln!(
                        f,
                        "Details:      Requested '{name}' is absent, and none of {DEFAULT_WEIGHT_NAMES:?} are present."
                    )?,
                    None => writeln!(
                        f,
                        "Details:      Looked for {DEFAULT_WEIGHT_NAMES:?}."
                    )?,
                }
            }
            ReformatError::MalformedRow {
                line_number,
                line_content,
                details,
            } => {
                writeln!(f, "Line Number:  {line_number}")?;
                writeln!(f, "Line Content: \"{}\"", line_content.trim())?;
                writeln!(f, "Reason:       The row could not be rewritten.")?;
                writeln!(f, "Details:      {details}")?;
            }
        }
        write!(
            f,
            "--------------------------------------------------------------------------"
        )
    }
}

impl Error for ReformatError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReformatError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReformatError {
    fn from(err: io::Error) -> Self {
        ReformatError::Io(err)
    }
}

/// Returns true if the file's first substantive line starts with a `chr_name` column and
/// has at least four columns, i.e. rows still need a position to ID remap.
pub fn is_position_keyed(path: &Path) -> io::Result<bool> {
    let mut reader = open_text_source(path)?;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').collect();
        return Ok(fields.len() >= 4 && fields[0].trim().eq_ignore_ascii_case("chr_name"));
    }
}

/// Normalizes a score file on disk, transparently inflating gzip input.
///
/// The output file is removed again if normalization fails, so a partial file is never
/// mistaken for a finished one.
pub fn normalize_score_file(
    input_path: &Path,
    output_path: &Path,
    options: &NormalizeOptions,
) -> Result<NormalizeReport, ReformatError> {
    let reader = open_text_source(input_path)?;
    let mut writer = BufWriter::new(File::create(output_path)?);

    let result = normalize_score_stream(reader, &mut writer, options)
        .and_then(|report| writer.flush().map(|_| report).map_err(ReformatError::from));

    match result {
        Ok(report) => {
            info!(
                "Normalized {} -> {} ({} rows, {} skipped)",
                input_path.display(),
                output_path.display(),
                report.rows_written,
                report.rows_skipped
            );
            Ok(report)
        }
        Err(e) => {
            drop(writer);
            let _ = fs::remove_file(output_path);
            Err(e)
        }
    }
}

/// Rewrites a score file stream into one of the two canonical layouts.
pub fn normalize_score_stream<R: BufRead, W: Write>(
    mut reader: R,
    writer: &mut W,
    options: &NormalizeOptions,
) -> Result<NormalizeReport, ReformatError> {
    let mut lines = SubstantiveLines::new(&mut reader);
    let (first_number, first_line) = lines.next_line()?.ok_or(ReformatError::Empty)?;
    let first_fields: Vec<String> = first_line.split('\t').map(str::to_string).collect();

    if is_variant_id_header(&first_fields) {
        return passthrough(lines, writer, &first_line, options.row_policy);
    }

    let requested = options
        .weight_column
        .as_deref()
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty());

    let is_header = looks_like_header(&first_fields, requested.as_deref());
    let column_map = if is_header {
        ColumnMap::from_header(&first_fields)
    } else {
        ColumnMap::synthetic(first_fields.len())
    };

    let weight_key = column_map
        .resolve_weight(requested.as_deref())
        .ok_or_else(|| ReformatError::NoWeightColumn {
            line_content: first_line.clone(),
            requested: requested.clone(),
        })?;
    let indices = column_map.indices(&weight_key, &first_line)?;
    debug!(
        "Score columns: chr={} pos={} allele={} weight={} ('{weight_key}')",
        indices.chr, indices.pos, indices.allele, indices.weight
    );

    writeln!(writer, "{POSITION_KEYED_HEADER}")?;

    let mut rewriter = RowRewriter {
        header_width: first_fields.len(),
        indices,
        policy: options.row_policy,
        report: NormalizeReport {
            shape: ScoreFileShape::PositionKeyed,
            rows_written: 0,
            rows_skipped: 0,
        },
    };

    if !is_header {
        rewriter.write(writer, first_number, first_fields)?;
    }
    while let Some((number, line)) = lines.next_line()? {
        let fields = line.split('\t').map(str::to_string).collect();
        rewriter.write(writer, number, fields)?;
    }

    if rewriter.report.rows_skipped > 0 {
        warn!(
            "Skipped {} malformed score rows",
            rewriter.report.rows_skipped
        );
    }
    Ok(rewriter.report)
}

// ========================================================================================
//                             PRIVATE IMPLEMENTATION
// ========================================================================================

/// Yields trimmed, non-blank, non-comment lines with their 1-based line numbers.
struct SubstantiveLines<'a, R: BufRead> {
    reader: &'a mut R,
    buffer: String,
    line_number: usize,
}

impl<'a, R: BufRead> SubstantiveLines<'a, R> {
    fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            buffer: String::new(),
            line_number: 0,
        }
    }

    fn next_line(&mut self) -> io::Result<Option<(usize, String)>> {
        loop {
            self.buffer.clear();
            if self.reader.read_line(&mut self.buffer)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            let trimmed = self.buffer.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            return Ok(Some((self.line_number, trimmed.to_string())));
        }
    }
}

fn is_variant_id_header(fields: &[String]) -> bool {
    fields.len() == 3
        && fields[0].trim().eq_ignore_ascii_case("rsID")
        && fields[1].trim().eq_ignore_ascii_case("effect_allele")
        && fields[2].trim().eq_ignore_ascii_case("effect_weight")
}

fn looks_like_header(fields: &[String], requested_weight: Option<&str>) -> bool {
    let lower: Vec<String> = fields
        .iter()
        .map(|f| f.trim().to_ascii_lowercase())
        .collect();
    let has = |name: &str| lower.iter().any(|f| f == name);

    ["chr_name", "chr_position", "effect_allele"]
        .into_iter()
        .all(|name| has(name))
        && (DEFAULT_WEIGHT_NAMES.into_iter().any(|name| has(name))
            || requested_weight.is_some_and(|name| has(name)))
}

fn passthrough<R: BufRead, W: Write>(
    mut lines: SubstantiveLines<'_, R>,
    writer: &mut W,
    header: &str,
    policy: RowPolicy,
) -> Result<NormalizeReport, ReformatError> {
    let mut report = NormalizeReport {
        shape: ScoreFileShape::VariantIdPassthrough,
        rows_written: 0,
        rows_skipped: 0,
    };
    writeln!(writer, "{header}")?;

    while let Some((number, line)) = lines.next_line()? {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            let err = ReformatError::MalformedRow {
                line_number: number,
                line_content: line.clone(),
                details: format!("Expected at least 3 columns, found {}.", fields.len()),
            };
            match policy {
                RowPolicy::Strict => return Err(err),
                RowPolicy::Tolerant => {
                    debug!("Skipping score row {number}: fewer than 3 columns");
                    report.rows_skipped += 1;
                    continue;
                }
            }
        }
        writeln!(writer, "{}\t{}\t{}", fields[0], fields[1], fields[2])?;
        report.rows_written += 1;
    }
    Ok(report)
}

/// Lower-cased column name to index. Synthetic maps may hold names with no index.
struct ColumnMap(HashMap<String, Option<usize>>);

impl ColumnMap {
    fn from_header(fields: &[String]) -> Self {
        Self(
            fields
                .iter()
                .enumerate()
                .map(|(i, name)| (name.trim().to_ascii_lowercase(), Some(i)))
                .collect(),
        )
    }

    /// Positional layout for header-less files: chr, pos, allele, weight.
    fn synthetic(width: usize) -> Self {
        let idx = |i: usize| (i < width).then_some(i);
        Self(HashMap::from([
            ("chr_name".to_string(), idx(0)),
            ("chr_position".to_string(), idx(1)),
            ("effect_allele".to_string(), idx(2)),
            ("effect_weight".to_string(), idx(3)),
        ]))
    }

    fn resolve_weight(&self, requested: Option<&str>) -> Option<String> {
        if let Some(name) = requested {
            if self.0.contains_key(name) {
                return Some(name.to_string());
            }
            debug!("Weight column '{name}' not in header; trying defaults");
        }
        DEFAULT_WEIGHT_NAMES
            .iter()
            .find(|name| self.0.contains_key(**name))
            .map(|name| name.to_string())
    }

    fn indices(&self, weight_key: &str, line: &str) -> Result<ColumnIndices, ReformatError> {
        let lookup = |name: &str| self.0.get(name).copied().flatten();
        let chr = lookup("chr_name");
        let pos = lookup("chr_position");
        let allele = lookup("effect_allele");
        let weight = lookup(weight_key);

        match (chr, pos, allele, weight) {
            (Some(chr), Some(pos), Some(allele), Some(weight)) => Ok(ColumnIndices {
                chr,
                pos,
                allele,
                weight,
            }),
            _ => {
                let missing = [
                    ("chr_name", chr),
                    ("chr_position", pos),
                    ("effect_allele", allele),
                    ("effect_weight", weight),
                ]
                .into_iter()
                .filter(|(_, idx)| idx.is_none())
                .map(|(name, _)| name)
                .collect();
                Err(ReformatError::MissingColumns {
                    line_content: line.to_string(),
                    missing,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ColumnIndices {
    chr: usize,
    pos: usize,
    allele: usize,
    weight: usize,
}

struct RowRewriter {
    header_width: usize,
    indices: ColumnIndices,
    policy: RowPolicy,
    report: NormalizeReport,
}

impl RowRewriter {
    fn write<W: Write>(
        &mut self,
        writer: &mut W,
        line_number: usize,
        mut fields: Vec<String>,
    ) -> Result<(), ReformatError> {
        // A row one short of the header that starts with a chromosome lost its rsID.
        if fields.len() + 1 == self.header_width && starts_with_chromosome(&fields) {
            fields.insert(0, String::new());
        }
        if fields.len() < self.header_width {
            fields.resize(self.header_width, String::new());
        }

        if self.indices.weight >= fields.len() {
            let err = ReformatError::MalformedRow {
                line_number,
                line_content: fields.join("\t"),
                details: format!(
                    "Weight column {} is outside a row of {} fields.",
                    self.indices.weight + 1,
                    fields.len()
                ),
            };
            return match self.policy {
                RowPolicy::Strict => Err(err),
                RowPolicy::Tolerant => {
                    debug!("Skipping score row {line_number}: weight column absent");
                    self.report.rows_skipped += 1;
                    Ok(())
                }
            };
        }

        let ColumnIndices {
            chr,
            pos,
            allele,
            weight,
        } = self.indices;
        writeln!(
            writer,
            "{}\t{}\t{}\t{}",
            fields[chr], fields[pos], fields[allele], fields[weight]
        )?;
        self.report.rows_written += 1;
        Ok(())
    }
}

fn starts_with_chromosome(fields: &[String]) -> bool {
    fields.first().is_some_and(|first| {
        first.parse::<i64>().is_ok() || matches!(first.as_str(), "X" | "Y" | "MT")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run(input: &str, options: &NormalizeOptions) -> Result<(String, NormalizeReport), ReformatError> {
        let mut out = Vec::new();
        let report = normalize_score_stream(Cursor::new(input), &mut out, options)?;
        Ok((String::from_utf8(out).unwrap(), report))
    }

    #[test]
    fn catalog_file_is_reduced_to_four_columns() {
        let input = "###PGS CATALOG SCORING FILE\n#pgs_id=PGS000001\n\
rsID\tchr_name\tchr_position\teffect_allele\tother_allele\teffect_weight\n\
rs1\t1\t100\tA\tG\t0.5\n\
rs2\t2\t200\tC\tT\t-0.25\n";
        let (out, report) = run(input, &NormalizeOptions::default()).unwrap();
        assert_eq!(
            out,
            "chr_name\tchr_position\teffect_allele\teffect_weight\n1\t100\tA\t0.5\n2\t200\tC\t-0.25\n"
        );
        assert_eq!(report.shape, ScoreFileShape::PositionKeyed);
        assert_eq!(report.rows_written, 2);
    }

    #[test]
    fn beta_synonym_is_used_when_effect_weight_absent() {
        let input = "chr_name\tchr_position\teffect_allele\tbeta\n3\t300\tG\t1.5\n";
        let (out, _) = run(input, &NormalizeOptions::default()).unwrap();
        assert!(out.ends_with("3\t300\tG\t1.5\n"));
    }

    #[test]
    fn explicit_weight_column_wins_over_synonyms() {
        let input = "chr_name\tchr_position\teffect_allele\teffect_weight\tOR_adjusted\n1\t5\tA\t0.1\t0.9\n";
        let options = NormalizeOptions {
            weight_column: Some("OR_adjusted".to_string()),
            ..Default::default()
        };
        let (out, _) = run(input, &options).unwrap();
        assert!(out.ends_with("1\t5\tA\t0.9\n"));
    }

    #[test]
    fn absent_override_falls_back_to_synonyms() {
        let input = "chr_name\tchr_position\teffect_allele\tweight\n1\t5\tA\t0.3\n";
        let options = NormalizeOptions {
            weight_column: Some("score".to_string()),
            ..Default::default()
        };
        let (out, _) = run(input, &options).unwrap();
        assert!(out.ends_with("1\t5\tA\t0.3\n"));
    }

    #[test]
    fn headerless_data_is_read_positionally() {
        let (out, report) = run("1\t100\tA\t0.5\nX\t200\tT\t0.1\n", &NormalizeOptions::default()).unwrap();
        assert_eq!(
            out,
            "chr_name\tchr_position\teffect_allele\teffect_weight\n1\t100\tA\t0.5\nX\t200\tT\t0.1\n"
        );
        assert_eq!(report.rows_written, 2);
    }

    #[test]
    fn comma_delimited_header_is_missing_columns() {
        let err = run(
            "chr_name,chr_position,effect_allele,beta\n1,100,A,0.5\n",
            &NormalizeOptions::default(),
        )
        .unwrap_err();
        match err {
            ReformatError::MissingColumns { missing, .. } => {
                assert_eq!(missing, vec!["chr_position", "effect_allele", "effect_weight"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn header_without_weight_is_treated_as_data_and_fails_positionally() {
        let err = run(
            "chr_name\tchr_position\teffect_allele\n1\t100\tA\n",
            &NormalizeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ReformatError::MissingColumns { .. }));
    }

    #[test]
    fn missing_leading_rsid_is_padded() {
        let input = "rsID\tchr_name\tchr_position\teffect_allele\teffect_weight\n\
22\t1000\tA\t0.2\n\
MT\t16000\tC\t0.4\n";
        let (out, report) = run(input, &NormalizeOptions::default()).unwrap();
        assert!(out.contains("22\t1000\tA\t0.2\n"));
        assert!(out.contains("MT\t16000\tC\t0.4\n"));
        assert_eq!(report.rows_written, 2);
    }

    #[test]
    fn short_rows_follow_row_policy() {
        let input = "chr_name\tchr_position\teffect_allele\tother_allele\teffect_weight\tnote\n\
1\t100\tA\tG\t0.5\tx\n";
        // Trailing padding keeps short rows aligned to the header, so they are written.
        let (out, _) = run(&format!("{input}2\t200\n"), &NormalizeOptions::default()).unwrap();
        assert!(out.ends_with("2\t200\t\t\n"));

        let mut options = NormalizeOptions::default();
        let headerless = "1\t100\tA\n2\t200\tC\t0.4\n";
        let err = run(headerless, &options).unwrap_err();
        assert!(matches!(err, ReformatError::MissingColumns { .. }));

        options.row_policy = RowPolicy::Strict;
        let passthrough_input = "rsID\teffect_allele\teffect_weight\nrs1\tA\t0.1\nrs2\tC\n";
        let err = run(passthrough_input, &options).unwrap_err();
        assert!(matches!(err, ReformatError::MalformedRow { line_number: 3, .. }));

        options.row_policy = RowPolicy::Tolerant;
        let (out, report) = run(passthrough_input, &options).unwrap();
        assert_eq!(out, "rsID\teffect_allele\teffect_weight\nrs1\tA\t0.1\n");
        assert_eq!(report.rows_skipped, 1);
    }

    #[test]
    fn variant_id_table_passes_through() {
        let input = "# prepared\nRSID\tEffect_Allele\teffect_weight\nrs9\tT\t0.7\textra\n";
        let (out, report) = run(input, &NormalizeOptions::default()).unwrap();
        assert_eq!(out, "RSID\tEffect_Allele\teffect_weight\nrs9\tT\t0.7\n");
        assert_eq!(report.shape, ScoreFileShape::VariantIdPassthrough);
    }

    #[test]
    fn canonical_file_is_a_fixed_point() {
        let canonical = "chr_name\tchr_position\teffect_allele\teffect_weight\n1\t100\tA\t0.5\n2\t5\tG\t-1\n";
        let (once, _) = run(canonical, &NormalizeOptions::default()).unwrap();
        assert_eq!(once, canonical);
        let (twice, _) = run(&once, &NormalizeOptions::default()).unwrap();
        assert_eq!(twice, canonical);
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = run("# only comments\n\n", &NormalizeOptions::default()).unwrap_err();
        assert!(matches!(err, ReformatError::Empty));
    }

    #[test]
    fn position_keyed_detection_reads_first_substantive_line() {
        let dir = tempfile::tempdir().unwrap();
        let keyed = dir.path().join("a.tsv");
        let passthrough = dir.path().join("b.tsv");
        fs::write(&keyed, "# c\nchr_name\tchr_position\teffect_allele\teffect_weight\n").unwrap();
        fs::write(&passthrough, "rsID\teffect_allele\teffect_weight\n").unwrap();
        assert!(is_position_keyed(&keyed).unwrap());
        assert!(!is_position_keyed(&passthrough).unwrap());
    }
}
