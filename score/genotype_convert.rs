// ========================================================================================
//
//               Consumer DNA kit to PLINK conversion module
//
// ========================================================================================
//
// Raw exports from consumer genotyping services are rewritten into the four-column
// `rsid chrom pos genotype` text that `plink1 --23file` understands, then encoded to a
// harmonized pgen fileset inside the kit's processed directory.

use crate::config::PipelineConfig;
use crate::harmonize::{self, HarmonizeError, HarmonizeReport};
use crate::shared::files::open_text_source;
use crate::tool::{CancelToken, ToolError, ToolInvocation, ToolRunner};
use crate::types::{KitType, RowPolicy, normalize_chromosome};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KitConvertError {
    #[error("Could not recognise the kit layout: {0}")]
    FormatDetection(String),
    #[error("Invalid genotype row at line {line_number} ({reason}): \"{line_content}\"")]
    Validation {
        line_number: usize,
        line_content: String,
        reason: String,
    },
    #[error("The kit contains no usable genotype rows")]
    NoValidRows,
    #[error("Chip manifest file is missing: {}", .0.display())]
    MissingManifest(PathBuf),
    #[error(transparent)]
    Harmonize(#[from] HarmonizeError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> KitConvertError + '_ {
    move |source| KitConvertError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Counts from one normalization pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenotypeReport {
    pub kit_type: KitType,
    pub rows_written: usize,
    pub rows_dropped: usize,
}

/// Everything `convert_kit` leaves behind in the processed directory.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertedKit {
    pub kit_type: KitType,
    /// Prefix of the final `.pgen/.pvar/.psam` trio.
    pub genotype_prefix: PathBuf,
    pub genotypes: GenotypeReport,
    pub harmonized: HarmonizeReport,
}

// ========================================================================================
//                                  Row handling
// ========================================================================================

/// Splits on commas and tabs, discarding empty fields. Used for layout detection.
fn split_detection_fields(line: &str) -> Vec<&str> {
    line.split([',', '\t']).filter(|f| !f.is_empty()).collect()
}

/// Decides the kit layout from its first substantive line.
pub fn detect_kit_type(first_line: &str) -> Result<KitType, KitConvertError> {
    match split_detection_fields(first_line.trim()).len() {
        5 => Ok(KitType::Ancestry),
        4 => Ok(KitType::TwentyThreeAndMe),
        n => Err(KitConvertError::FormatDetection(format!(
            "expected 4 (23andMe) or 5 (AncestryDNA) columns, found {n}"
        ))),
    }
}

/// A genotype call is exactly two characters from `A C G T -`.
pub fn is_valid_genotype(call: &str) -> bool {
    call.len() == 2 && call.bytes().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T' | b'-'))
}

enum RowOutcome {
    Header,
    Canonical(String),
    Invalid(&'static str),
}

fn canonical_row(kit_type: KitType, line: &str) -> RowOutcome {
    let fields: Vec<&str> = match kit_type {
        KitType::Ancestry => split_detection_fields(line),
        KitType::TwentyThreeAndMe => line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty())
            .collect(),
    };

    if fields
        .first()
        .and_then(|f| f.get(..4))
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("rsid"))
    {
        return RowOutcome::Header;
    }

    let (id, chrom, pos, call) = match (kit_type, fields.as_slice()) {
        (KitType::Ancestry, [id, chrom, pos, a1, a2, ..]) => {
            (*id, *chrom, *pos, format!("{a1}{a2}").replace('0', "-"))
        }
        (KitType::TwentyThreeAndMe, [id, chrom, pos, call, ..]) => {
            (*id, *chrom, *pos, call.to_string())
        }
        _ => return RowOutcome::Invalid("too few columns"),
    };

    if !is_valid_genotype(&call) {
        return RowOutcome::Invalid("genotype must be two of A, C, G, T, -");
    }
    RowOutcome::Canonical(format!(
        "{id}\t{}\t{pos}\t{call}",
        normalize_chromosome(chrom)
    ))
}

/// Rewrites a raw kit stream into canonical four-column genotype rows in a single pass.
///
/// The layout is decided from the first non-blank, non-`#` line, which is then processed
/// like every other row. Invalid rows are dropped and counted, or abort the run under
/// `RowPolicy::Strict`.
pub fn normalize_genotype_stream<R: BufRead, W: Write>(
    mut reader: R,
    writer: &mut W,
    policy: RowPolicy,
) -> Result<GenotypeReport, KitConvertError> {
    let stream = Path::new("<stream>");
    let mut buffer = String::new();
    let mut line_number = 0usize;
    let mut report: Option<GenotypeReport> = None;

    loop {
        buffer.clear();
        if reader.read_line(&mut buffer).map_err(io_err(stream))? == 0 {
            break;
        }
        line_number += 1;
        let line = buffer.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let kit_type = match &report {
            Some(counts) => counts.kit_type,
            None => detect_kit_type(line)?,
        };
        let counts = report.get_or_insert(GenotypeReport {
            kit_type,
            rows_written: 0,
            rows_dropped: 0,
        });

        match canonical_row(kit_type, line) {
            RowOutcome::Header => {}
            RowOutcome::Canonical(row) => {
                writeln!(writer, "{row}").map_err(io_err(stream))?;
                counts.rows_written += 1;
            }
            RowOutcome::Invalid(reason) => match policy {
                RowPolicy::Strict => {
                    return Err(KitConvertError::Validation {
                        line_number,
                        line_content: line.to_string(),
                        reason: reason.to_string(),
                    });
                }
                RowPolicy::Tolerant => counts.rows_dropped += 1,
            },
        }
    }

    report.ok_or_else(|| KitConvertError::FormatDetection("the file has no data lines".into()))
}

/// File wrapper around `normalize_genotype_stream`; gzip-compressed kits are accepted.
pub fn normalize_genotype_file(
    raw_path: &Path,
    output_path: &Path,
    policy: RowPolicy,
) -> Result<GenotypeReport, KitConvertError> {
    let reader = open_text_source(raw_path).map_err(io_err(raw_path))?;
    let mut writer = BufWriter::new(File::create(output_path).map_err(io_err(output_path))?);
    let report = normalize_genotype_stream(reader, &mut writer, policy)?;
    writer.flush().map_err(io_err(output_path))?;

    if report.rows_dropped > 0 {
        log::warn!(
            "Dropped {} invalid genotype rows from {}",
            report.rows_dropped,
            raw_path.display()
        );
    }
    Ok(report)
}

// ========================================================================================
//                                  Conversion
// ========================================================================================

/// Converts a raw kit into a harmonized pgen fileset under `processed_dir`.
///
/// Steps: canonical text, `plink1` bed encode restricted to the chip's variant list,
/// allele harmonization against the chip's reference alleles, `plink2` pgen encode. The
/// intermediate text file is removed once the pgen exists.
pub fn convert_kit(
    raw_path: &Path,
    processed_dir: &Path,
    config: &PipelineConfig,
    runner: &ToolRunner,
    cancel: &CancelToken,
) -> Result<ConvertedKit, KitConvertError> {
    fs::create_dir_all(processed_dir).map_err(io_err(processed_dir))?;

    let base_name = raw_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kit".to_string());
    let intermediate = processed_dir.join(format!("{base_name}_4col.txt"));
    let genotype_prefix = processed_dir.join(&base_name);

    eprintln!("> Normalizing genotype kit {}...", raw_path.display());
    let genotypes = normalize_genotype_file(raw_path, &intermediate, config.row_policy)?;
    if genotypes.rows_written == 0 {
        let _ = fs::remove_file(&intermediate);
        return Err(KitConvertError::NoValidRows);
    }
    eprintln!(
        "> Detected {} kit: {} genotypes kept, {} dropped.",
        genotypes.kit_type, genotypes.rows_written, genotypes.rows_dropped
    );

    let chip = config.chip(genotypes.kit_type);
    let snplist = chip.snplist(genotypes.kit_type);
    let refallele = chip.refallele(genotypes.kit_type);
    for manifest in [&snplist, &refallele] {
        if !manifest.is_file() {
            return Err(KitConvertError::MissingManifest(manifest.clone()));
        }
    }

    runner.run(
        &ToolInvocation::new(&config.tools.plink1)
            .arg("--23file")
            .arg(&intermediate)
            .arg("--allele-acgt")
            .arg("--extract")
            .arg(&snplist)
            .arg("--make-bed")
            .arg("--out")
            .arg(&genotype_prefix),
        cancel,
    )?;

    let harmonized = harmonize::harmonize_bim_file(&genotype_prefix, &refallele)?;

    let mut encode = ToolInvocation::new(&config.tools.plink2)
        .arg("--bfile")
        .arg(&harmonized.patched_prefix)
        .arg("--ref-allele")
        .arg(&refallele)
        .arg("--make-pgen")
        .arg("--out")
        .arg(&genotype_prefix);
    if config.apply_exclusions && harmonized.report.excluded > 0 {
        encode = encode.arg("--exclude").arg(&harmonized.exclusion_list);
    }
    runner.run(&encode, cancel)?;

    fs::remove_file(&intermediate).map_err(io_err(&intermediate))?;
    eprintln!("> Kit encoded at {}.pgen", genotype_prefix.display());

    Ok(ConvertedKit {
        kit_type: genotypes.kit_type,
        genotype_prefix,
        genotypes,
        harmonized: harmonized.report,
    })
}
