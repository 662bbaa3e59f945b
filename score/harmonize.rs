// ========================================================================================
//
//                  Allele orientation repair for chip-derived .bim files
//
// ========================================================================================
//
// Text-to-bed conversion of a consumer kit leaves homozygous sites with a missing second
// allele and arbitrary A1/A2 order. Before the pgen re-encode, every row is oriented
// against the chip's reference-allele table. Rows that still cannot be made biallelic are
// listed in an exclusion file. No strand flipping is attempted.

use ahash::AHashMap;
use log::{debug, info};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The allele code plink writes for an unobserved allele.
pub const MISSING_ALLELE: &str = "0";

const BIM_FIELDS: usize = 6;

#[derive(Error, Debug)]
pub enum HarmonizeError {
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed .bim record at line {line_number}: expected 6 fields, found {found}")]
    MalformedRecord { line_number: usize, found: usize },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> HarmonizeError + '_ {
    move |source| HarmonizeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Variant ID to reference allele, loaded from a whitespace-delimited `.refallele` table.
#[derive(Debug, Default, Clone)]
pub struct AlleleReference {
    alleles: AHashMap<String, String>,
}

impl AlleleReference {
    pub fn from_path(path: &Path) -> Result<Self, HarmonizeError> {
        let file = File::open(path).map_err(io_err(path))?;
        Self::from_reader(BufReader::new(file)).map_err(io_err(path))
    }

    /// Rows with fewer than two fields are ignored. Later duplicates win.
    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut alleles = AHashMap::new();
        for line in reader.lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            if let (Some(id), Some(allele)) = (fields.next(), fields.next()) {
                alleles.insert(id.to_string(), allele.to_ascii_uppercase());
            }
        }
        Ok(Self { alleles })
    }

    pub fn get(&self, variant_id: &str) -> Option<&str> {
        self.alleles.get(variant_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.alleles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alleles.is_empty()
    }
}

/// What happened to one variant's allele pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlleleFix {
    pub filled: bool,
    pub swapped: bool,
    pub excluded: bool,
}

/// Orients one allele pair against `reference`.
///
/// Missing slots are filled with the reference allele, and the pair is swapped when only
/// the second slot carries it. A pair that is still missing an allele or is homozygous is
/// marked excluded; a homozygous pair has its second slot reset to the missing code.
/// Without a reference entry the pair is never filled or swapped.
pub fn harmonize_alleles(
    allele1: &mut String,
    allele2: &mut String,
    reference: Option<&str>,
) -> AlleleFix {
    let mut fix = AlleleFix::default();

    if let Some(reference) = reference.filter(|r| !r.is_empty()) {
        if allele1.as_str() == MISSING_ALLELE {
            *allele1 = reference.to_string();
            fix.filled = true;
        }
        if allele2.as_str() == MISSING_ALLELE {
            *allele2 = reference.to_string();
            fix.filled = true;
        }
        if allele2.as_str() == reference && allele1.as_str() != reference {
            std::mem::swap(allele1, allele2);
            fix.swapped = true;
        }
    }

    let identical = allele1 == allele2;
    fix.excluded =
        allele1.as_str() == MISSING_ALLELE || allele2.as_str() == MISSING_ALLELE || identical;
    if identical {
        *allele2 = MISSING_ALLELE.to_string();
    }
    fix
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HarmonizeReport {
    pub variants: usize,
    pub filled: usize,
    pub swapped: usize,
    pub excluded: usize,
}

/// Rewrites every `.bim` row from `bim` into `patched`, and writes each excluded variant
/// ID to `exclusions` once.
///
/// A row with fewer than six fields aborts the run: dropping it would misalign the
/// `.bim` with its `.bed`.
pub fn harmonize_bim<R: BufRead, W: Write, X: Write>(
    bim: R,
    reference: &AlleleReference,
    patched: &mut W,
    exclusions: &mut X,
) -> Result<HarmonizeReport, HarmonizeError> {
    let mut report = HarmonizeReport::default();
    let stream_err = |source| HarmonizeError::Io {
        path: PathBuf::from("<stream>"),
        source,
    };

    for (index, line) in bim.lines().enumerate() {
        let line = line.map_err(stream_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if fields.len() < BIM_FIELDS {
            return Err(HarmonizeError::MalformedRecord {
                line_number: index + 1,
                found: fields.len(),
            });
        }

        let (head, alleles) = fields.split_at_mut(4);
        let (allele1, allele2) = alleles.split_at_mut(1);
        let fix = harmonize_alleles(&mut allele1[0], &mut allele2[0], reference.get(&head[1]));

        report.variants += 1;
        report.filled += usize::from(fix.filled);
        report.swapped += usize::from(fix.swapped);
        if fix.excluded {
            report.excluded += 1;
            writeln!(exclusions, "{}", fields[1]).map_err(stream_err)?;
        }
        writeln!(patched, "{}", fields.join("\t")).map_err(stream_err)?;
    }

    Ok(report)
}

/// The file set produced by `harmonize_bim_file`.
#[derive(Debug, Clone, Serialize)]
pub struct HarmonizedFileset {
    /// `<base>_patched`, usable as a `--bfile` prefix.
    pub patched_prefix: PathBuf,
    pub exclusion_list: PathBuf,
    pub report: HarmonizeReport,
}

/// Patches `<base>.bim` into `<base>_patched.bim` and `<base>_exclude.txt`.
///
/// The matching `.bed` and `.fam`, when present, are moved next to the patched `.bim` so
/// the result is a complete fileset.
pub fn harmonize_bim_file(
    base: &Path,
    reference_path: &Path,
) -> Result<HarmonizedFileset, HarmonizeError> {
    let reference = AlleleReference::from_path(reference_path)?;
    debug!(
        "Loaded {} reference alleles from {}",
        reference.len(),
        reference_path.display()
    );

    let bim_path = with_suffix(base, ".bim");
    let patched_prefix = with_suffix(base, "_patched");
    let patched_bim = with_suffix(&patched_prefix, ".bim");
    let exclusion_list = with_suffix(base, "_exclude.txt");

    let input = BufReader::new(File::open(&bim_path).map_err(io_err(&bim_path))?);
    let mut patched = BufWriter::new(File::create(&patched_bim).map_err(io_err(&patched_bim))?);
    let mut exclusions =
        BufWriter::new(File::create(&exclusion_list).map_err(io_err(&exclusion_list))?);

    let report = harmonize_bim(input, &reference, &mut patched, &mut exclusions)?;
    patched.flush().map_err(io_err(&patched_bim))?;
    exclusions.flush().map_err(io_err(&exclusion_list))?;

    for ext in [".bed", ".fam"] {
        let from = with_suffix(base, ext);
        if from.exists() {
            let to = with_suffix(&patched_prefix, ext);
            fs::rename(&from, &to).map_err(io_err(&from))?;
        }
    }

    info!(
        "Harmonized {} variants ({} filled, {} swapped, {} excluded)",
        report.variants, report.filled, report.swapped, report.excluded
    );

    Ok(HarmonizedFileset {
        patched_prefix,
        exclusion_list,
        report,
    })
}

/// Appends a raw suffix to a path prefix; `Path::with_extension` would clobber dotted IDs.
pub(crate) fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
