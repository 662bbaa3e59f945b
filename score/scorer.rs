// ========================================================================================
//
//                               PLINK2 score invocation
//
// ========================================================================================

use crate::config::PipelineConfig;
use crate::harmonize::with_suffix;
use crate::remap::{RemapError, RemapOutcome, remap_score_file};
use crate::shared::files::files_with_extension;
use crate::tool::{CancelToken, ToolError, ToolInvocation, ToolRunner};
use crate::types::{KitType, canonical_id, trim_id};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("No allele frequency reference is configured for {kit_type} kits: {details}")]
    ReferenceConfiguration { kit_type: KitType, details: String },
    #[error("No .pgen genotype set found in '{}'", .0.display())]
    GenotypeSetNotFound(PathBuf),
    #[error(transparent)]
    Remap(#[from] RemapError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One scoring run of a definition against a genotype set.
#[derive(Debug, Clone)]
pub struct ScoreRequest<'a> {
    /// Prefix of the `.pgen/.pvar/.psam` trio.
    pub genotype_prefix: &'a Path,
    pub kit_type: KitType,
    pub score_path: &'a Path,
    /// Round-scoped directory receiving every artifact of this run.
    pub output_dir: &'a Path,
    /// Where to look for the `.pvar` used for remapping. Defaults to the genotype
    /// prefix's directory.
    pub manifest_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreOutput {
    /// Per-sample table written by `--score`.
    pub sscore_path: PathBuf,
    /// Variants actually used, from the `list-variants` modifier.
    pub variants_path: PathBuf,
    /// The score file handed to plink, after remapping.
    pub prepared: RemapOutcome,
}

pub struct Scorer<'a> {
    config: &'a PipelineConfig,
    runner: &'a ToolRunner,
}

impl<'a> Scorer<'a> {
    pub fn new(config: &'a PipelineConfig, runner: &'a ToolRunner) -> Self {
        Self { config, runner }
    }

    fn frequency_file(&self, kit_type: KitType) -> Result<&'a Path, ScoreError> {
        let freq = self
            .config
            .chip(kit_type)
            .freq_file
            .as_deref()
            .ok_or_else(|| ScoreError::ReferenceConfiguration {
                kit_type,
                details: "freq_file is not set".to_string(),
            })?;
        if !freq.is_file() {
            return Err(ScoreError::ReferenceConfiguration {
                kit_type,
                details: format!("'{}' does not exist", freq.display()),
            });
        }
        Ok(freq)
    }

    /// Scores one definition.
    ///
    /// When `<dir-of-prepared-file>/<id>.snplist` exists it is passed as `--extract`, which
    /// is how population scoring is restricted to the variants the individual kit used.
    pub fn score(
        &self,
        request: &ScoreRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<ScoreOutput, ScoreError> {
        let freq = self.frequency_file(request.kit_type)?;

        fs::create_dir_all(request.output_dir).map_err(|source| ScoreError::Io {
            path: request.output_dir.to_path_buf(),
            source,
        })?;

        let manifest_dir = match request.manifest_dir {
            Some(dir) => dir.to_path_buf(),
            None => request
                .genotype_prefix
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };
        let prepared = remap_score_file(request.score_path, &manifest_dir, request.output_dir)?;
        let out_prefix = request.output_dir.join(trim_id(request.score_path));

        let mut invocation = ToolInvocation::new(&self.config.tools.plink2)
            .arg("--pfile")
            .arg(request.genotype_prefix)
            .arg("--read-freq")
            .arg(freq)
            .arg("--score")
            .arg(prepared.path())
            .args(["cols=+scoresums", "header", "list-variants"])
            .arg("--out")
            .arg(&out_prefix);

        if let Some(extract) = extraction_list_for(prepared.path()) {
            debug!("Restricting scoring to {}", extract.display());
            invocation = invocation.arg("--extract").arg(extract);
        }

        self.runner.run(&invocation, cancel)?;

        Ok(ScoreOutput {
            sscore_path: with_suffix(&out_prefix, ".sscore"),
            variants_path: with_suffix(&out_prefix, ".sscore.vars"),
            prepared,
        })
    }

    /// Scores every definition against the genotype set found in `genotype_dir`.
    ///
    /// Failures are kept per definition ID; one bad score file never hides the others.
    pub fn batch_score(
        &self,
        genotype_dir: &Path,
        kit_type: KitType,
        score_paths: &[PathBuf],
        output_dir: &Path,
        manifest_dir: Option<&Path>,
        cancel: &CancelToken,
    ) -> BTreeMap<String, Result<ScoreOutput, ScoreError>> {
        let prefix = locate_genotype_prefix(genotype_dir);

        score_paths
            .iter()
            .map(|score_path| {
                let id = trim_id(score_path);
                let result = match &prefix {
                    Ok(prefix) => self.score(
                        &ScoreRequest {
                            genotype_prefix: prefix,
                            kit_type,
                            score_path,
                            output_dir,
                            manifest_dir,
                        },
                        cancel,
                    ),
                    Err(_) => Err(ScoreError::GenotypeSetNotFound(genotype_dir.to_path_buf())),
                };
                if let Ok(output) = &result {
                    info!("Scored {id} -> {}", output.sscore_path.display());
                }
                (id, result)
            })
            .collect()
    }
}

/// `<dir>/<id>.snplist` next to the prepared score file, if present.
fn extraction_list_for(prepared_score: &Path) -> Option<PathBuf> {
    let name = prepared_score.file_name()?.to_string_lossy().into_owned();
    let dir = prepared_score.parent()?;
    let candidate = dir.join(format!("{}.snplist", canonical_id(&name)));
    candidate.is_file().then_some(candidate)
}

/// Returns the prefix of the first `.pgen` in `dir`, in natural name order.
pub fn locate_genotype_prefix(dir: &Path) -> Result<PathBuf, ScoreError> {
    let pgens = files_with_extension(dir, "pgen").map_err(|source| ScoreError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    pgens
        .into_iter()
        .next()
        .map(|pgen| pgen.with_extension(""))
        .ok_or_else(|| ScoreError::GenotypeSetNotFound(dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn genotype_prefix_uses_natural_order() {
        let dir = tempdir().unwrap();
        for name in ["kit10.pgen", "kit2.pgen", "kit2.pvar"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        assert_eq!(
            locate_genotype_prefix(dir.path()).unwrap(),
            dir.path().join("kit2")
        );
    }

    #[test]
    fn missing_genotype_set_is_reported_per_definition() {
        let dir = tempdir().unwrap();
        let mut config = PipelineConfig::default();
        let freq = dir.path().join("ref.afreq");
        fs::write(&freq, "").unwrap();
        config.ancestry.freq_file = Some(freq);
        let runner = ToolRunner::new(Duration::from_secs(5));
        let scorer = Scorer::new(&config, &runner);

        let results = scorer.batch_score(
            dir.path(),
            KitType::Ancestry,
            &[dir.path().join("PGS1.norm.tsv"), dir.path().join("PGS2.norm.tsv")],
            &dir.path().join("out"),
            None,
            &CancelToken::new(),
        );
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| matches!(r, Err(ScoreError::GenotypeSetNotFound(_)))));
        assert!(results.contains_key("PGS1.norm"));
    }

    #[test]
    fn missing_frequency_reference_fails_before_running_tools() {
        let dir = tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.twenty_three_and_me.freq_file = None;
        let runner = ToolRunner::new(Duration::from_secs(5));
        let scorer = Scorer::new(&config, &runner);

        let err = scorer
            .score(
                &ScoreRequest {
                    genotype_prefix: &dir.path().join("kit"),
                    kit_type: KitType::TwentyThreeAndMe,
                    score_path: &dir.path().join("PGS1.norm.tsv"),
                    output_dir: dir.path(),
                    manifest_dir: None,
                },
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, ScoreError::ReferenceConfiguration { .. }));
    }

    #[test]
    fn extraction_list_is_matched_by_canonical_id() {
        let dir = tempdir().unwrap();
        let prepared = dir.path().join("PGS000001.norm.rsid.score");
        assert_eq!(extraction_list_for(&prepared), None);
        fs::write(dir.path().join("PGS000001.snplist"), "rs1\n").unwrap();
        assert_eq!(
            extraction_list_for(&prepared),
            Some(dir.path().join("PGS000001.snplist"))
        );
    }
}
