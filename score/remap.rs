// ========================================================================================
//
//                     Position-keyed to variant-ID score rewriting
//
// ========================================================================================

use crate::reformat::{VARIANT_ID_HEADER, is_position_keyed};
use crate::shared::files::{compare_paths, open_text_source};
use crate::types::normalize_chromosome;
use ahash::AHashMap;
use log::{debug, info};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum RemapError {
    #[error("No .pvar variant manifest found under '{}'", .0.display())]
    ManifestNotFound(PathBuf),
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> RemapError + '_ {
    move |source| RemapError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// `chrom:pos` to variant ID, read from the first three columns of a `.pvar`.
///
/// Lossy by nature: multi-allelic sites sharing a position keep the last ID seen, and
/// rows whose ID is `.` are not indexed.
#[derive(Debug, Default)]
pub struct VariantManifest {
    ids: AHashMap<String, String>,
}

impl VariantManifest {
    pub fn from_path(path: &Path) -> Result<Self, RemapError> {
        let file = File::open(path).map_err(io_err(path))?;
        Self::from_reader(BufReader::new(file)).map_err(io_err(path))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut ids = AHashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }
            let mut cols = line.split('\t');
            if let (Some(chrom), Some(pos), Some(id)) = (cols.next(), cols.next(), cols.next()) {
                let id = id.trim();
                if id != "." && !id.is_empty() {
                    ids.insert(position_key(chrom, pos), id.to_string());
                }
            }
        }
        Ok(Self { ids })
    }

    pub fn lookup(&self, chrom: &str, pos: &str) -> Option<&str> {
        self.ids.get(&position_key(chrom, pos)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn position_key(chrom: &str, pos: &str) -> String {
    format!("{}:{}", normalize_chromosome(chrom), pos.trim())
}

/// Returns the first `.pvar` under `search_dir` (recursive, natural file-name order).
pub fn find_manifest(search_dir: &Path) -> Result<PathBuf, RemapError> {
    WalkDir::new(search_dir)
        .sort_by(|a, b| compare_paths(a.path(), b.path()))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .find(|p| p.extension().is_some_and(|ext| ext == "pvar"))
        .ok_or_else(|| RemapError::ManifestNotFound(search_dir.to_path_buf()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemapOutcome {
    /// The file was already keyed by variant ID and is used as-is.
    Unchanged(PathBuf),
    Remapped {
        path: PathBuf,
        kept: usize,
        unmapped: usize,
    },
}

impl RemapOutcome {
    pub fn path(&self) -> &Path {
        match self {
            RemapOutcome::Unchanged(path) => path,
            RemapOutcome::Remapped { path, .. } => path,
        }
    }
}

/// Rewrites a position-keyed score file to `<output_dir>/<stem>.rsid.score`.
///
/// Files that are not position-keyed are returned unchanged without touching the
/// manifest. Rows whose position is absent from the manifest are dropped; the count is
/// reported rather than treated as an error.
pub fn remap_score_file(
    score_path: &Path,
    manifest_search_dir: &Path,
    output_dir: &Path,
) -> Result<RemapOutcome, RemapError> {
    if !is_position_keyed(score_path).map_err(io_err(score_path))? {
        debug!("{} is keyed by variant ID; no remap", score_path.display());
        return Ok(RemapOutcome::Unchanged(score_path.to_path_buf()));
    }

    let manifest_path = find_manifest(manifest_search_dir)?;
    let manifest = VariantManifest::from_path(&manifest_path)?;
    debug!(
        "Indexed {} positions from {}",
        manifest.len(),
        manifest_path.display()
    );

    fs::create_dir_all(output_dir).map_err(io_err(output_dir))?;
    let stem = score_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "score".to_string());
    let output_path = output_dir.join(format!("{stem}.rsid.score"));

    let reader = open_text_source(score_path).map_err(io_err(score_path))?;
    let mut writer =
        BufWriter::new(File::create(&output_path).map_err(io_err(&output_path))?);
    let (kept, unmapped) =
        remap_rows(reader, &manifest, &mut writer).map_err(io_err(&output_path))?;
    writer.flush().map_err(io_err(&output_path))?;

    info!(
        "Remapped {} -> {} ({kept} kept, {unmapped} unmapped)",
        score_path.display(),
        output_path.display()
    );
    Ok(RemapOutcome::Remapped {
        path: output_path,
        kept,
        unmapped,
    })
}

/// Writes the variant-ID header, then one `(id, allele, weight)` row per mappable input
/// row. The first substantive line is the position-keyed header and is skipped.
fn remap_rows<R: BufRead, W: Write>(
    reader: R,
    manifest: &VariantManifest,
    writer: &mut W,
) -> io::Result<(usize, usize)> {
    writeln!(writer, "{VARIANT_ID_HEADER}")?;

    let (mut kept, mut unmapped) = (0usize, 0usize);
    let mut seen_header = false;
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if !seen_header {
            seen_header = true;
            continue;
        }
        let cols: Vec<&str> = trimmed.split('\t').collect();
        if cols.len() < 4 {
            unmapped += 1;
            continue;
        }
        match manifest.lookup(cols[0], cols[1]) {
            Some(id) => {
                writeln!(writer, "{id}\t{}\t{}", cols[2], cols[3])?;
                kept += 1;
            }
            None => unmapped += 1,
        }
    }
    Ok((kept, unmapped))
}
