// ========================================================================================
//
//                         Kit ingestion and scoring rounds
//
// ========================================================================================
//
// The engine ties the stages together. Ingestion runs once per uploaded kit. A scoring
// round runs every requested definition against the kit and against the matching
// population panel, then reduces both score tables to one result per definition.

use crate::catalog::{CatalogError, ScoreCatalog};
use crate::config::{ConfigError, PipelineConfig};
use crate::download::{DefinitionFetcher, FetchError};
use crate::genotype_convert::{ConvertedKit, KitConvertError, convert_kit};
use crate::harmonize::HarmonizeError;
use crate::kit_store::{JsonKitStore, KitStore, StoreError};
use crate::reformat::ReformatError;
use crate::remap::RemapError;
use crate::results::{DefinitionResult, KitResults, ResultsCache};
use crate::scorer::{ScoreError, ScoreOutput, ScoreRequest, Scorer, locate_genotype_prefix};
use crate::stats::{self, ScoreSummary, StatsError};
use crate::tool::{CancelToken, ToolRunner};
use crate::types::{KitRecord, KitType, canonical_id, trim_id};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ========================================================================================
//                          Public API, context & error handling
// ========================================================================================

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Kit '{0}' was not found")]
    NotFound(String),
    #[error("Definition '{id}' is already scored in this round; skipped '{}'", .path.display())]
    DuplicateDefinition { id: String, path: PathBuf },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Convert(#[from] KitConvertError),
    #[error(transparent)]
    Harmonize(#[from] HarmonizeError),
    #[error(transparent)]
    Reformat(#[from] ReformatError),
    #[error(transparent)]
    Remap(#[from] RemapError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Score(#[from] ScoreError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error("Failed to build the scoring worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PipelineError + '_ {
    move |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Owns the injected collaborators. Cheap to share behind an `Arc`; every method takes
/// `&self`.
pub struct Engine {
    config: PipelineConfig,
    store: Arc<dyn KitStore>,
    catalog: Arc<ScoreCatalog>,
    results: Arc<ResultsCache>,
    runner: ToolRunner,
}

impl Engine {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn KitStore>,
        catalog: Arc<ScoreCatalog>,
        results: Arc<ResultsCache>,
    ) -> Self {
        let runner = ToolRunner::new(config.tool_timeout());
        Self {
            config,
            store,
            catalog,
            results,
            runner,
        }
    }

    /// Loads the catalog and opens the JSON kit store from the configured data directory.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let catalog =
            ScoreCatalog::load(&config.scores_metadata_path(), &config.ontology_traits_path())?;
        let store = JsonKitStore::open(&config.kit_store_path())?;
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(catalog),
            Arc::new(ResultsCache::new()),
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ScoreCatalog {
        &self.catalog
    }

    /// Copies a raw upload into the raw-upload directory, converts it into a harmonized
    /// genotype set and registers it under a new ID. Nothing is left behind for a kit
    /// that fails to convert.
    pub fn ingest_kit(
        &self,
        raw_path: &Path,
        cancel: &CancelToken,
    ) -> Result<(String, ConvertedKit), PipelineError> {
        let kit_id = new_identifier("kit");
        let raw_dir = self.config.upload_raw_dir.join(&kit_id);
        let processed_dir = self.config.upload_processed_dir.join(&kit_id);

        let discard = || {
            let _ = fs::remove_dir_all(&raw_dir);
            let _ = fs::remove_dir_all(&processed_dir);
        };

        let stored_raw = match stage_upload(raw_path, &raw_dir) {
            Ok(path) => path,
            Err(e) => {
                discard();
                return Err(e);
            }
        };
        let converted =
            match convert_kit(&stored_raw, &processed_dir, &self.config, &self.runner, cancel) {
                Ok(converted) => converted,
                Err(e) => {
                    discard();
                    return Err(e.into());
                }
            };

        self.store.insert(
            &kit_id,
            KitRecord {
                processed_dir,
                kit_type: converted.kit_type,
            },
        )?;
        info!("Registered kit {kit_id} ({})", converted.kit_type);
        Ok((kit_id, converted))
    }

    /// Downloads and normalizes the requested definitions. Failures stay per ID.
    pub fn prepare_definitions(
        &self,
        ids: &[String],
    ) -> BTreeMap<String, Result<PathBuf, FetchError>> {
        DefinitionFetcher::new(&self.catalog, &self.config).fetch_all(ids)
    }

    /// Runs one scoring round for a registered kit.
    ///
    /// Definitions run concurrently on a pool of `workers` threads. A definition that
    /// fails carries its error in its own entry, alongside whatever was computed before
    /// the failure. The whole round fails only when the kit
    /// is unknown, has no genotype set, or its round directories cannot be created. The
    /// results replace any earlier round for the kit.
    pub fn score_kit(
        &self,
        kit_id: &str,
        normalized_scores: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<KitResults, PipelineError> {
        let record = self
            .store
            .lookup(kit_id)
            .ok_or_else(|| PipelineError::NotFound(kit_id.to_string()))?;

        let round_id = new_identifier("round");
        let round = Round::new(&self.config, &record, &round_id)?;
        eprintln!(
            "> Scoring {} definitions for kit {kit_id} (round {round_id})",
            normalized_scores.len()
        );

        let (jobs, mut definitions) = self.claim_definitions(normalized_scores);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .build()?;
        let pb = create_progress_bar(jobs.len() as u64, "Scoring definitions");

        let scored: Vec<(String, DefinitionResult)> = pool.install(|| {
            jobs.par_iter()
                .map(|(id, score_path)| {
                    let trait_label = self.catalog.trait_label(id);
                    let result = self
                        .score_definition(&round, id, score_path, trait_label.clone(), cancel)
                        .unwrap_or_else(|e| {
                            warn!("Definition {id} failed for kit {kit_id}: {e}");
                            DefinitionResult::failed(trait_label, e)
                        });
                    pb.inc(1);
                    (id.clone(), result)
                })
                .collect()
        });
        pb.finish_and_clear();
        definitions.extend(scored);

        let results = KitResults {
            round_id,
            definitions,
        };
        self.results.insert(kit_id, results.clone());
        Ok(results)
    }

    /// Results of the kit's latest completed round.
    pub fn results(&self, kit_id: &str) -> Option<KitResults> {
        self.results.get(kit_id)
    }

    /// Assigns each input to the definition ID it scores under. The first file naming an
    /// ID claims it; a later file with the same ID gets an error entry keyed by its path,
    /// since both would otherwise share staging names. A path listed twice is scored once.
    fn claim_definitions<'p>(
        &self,
        normalized_scores: &'p [PathBuf],
    ) -> (Vec<(String, &'p Path)>, BTreeMap<String, DefinitionResult>) {
        let mut seen_paths = HashSet::new();
        let mut claimed = HashSet::new();
        let mut jobs = Vec::new();
        let mut rejected = BTreeMap::new();

        for path in normalized_scores {
            if !seen_paths.insert(path.as_path()) {
                warn!("{} was requested more than once; scoring it once", path.display());
                continue;
            }
            let id = canonical_id(&trim_id(path)).to_string();
            if claimed.insert(id.clone()) {
                jobs.push((id, path.as_path()));
                continue;
            }
            let trait_label = self.catalog.trait_label(&id);
            let err = PipelineError::DuplicateDefinition {
                id,
                path: path.clone(),
            };
            warn!("{err}");
            rejected.insert(
                path.display().to_string(),
                DefinitionResult::failed(trait_label, err),
            );
        }
        (jobs, rejected)
    }

    /// Individual score, then population score restricted to the variants the
    /// individual used, then statistics. Once the individual run succeeds its mean and
    /// retention are kept even if the population side fails.
    fn score_definition(
        &self,
        round: &Round,
        id: &str,
        score_path: &Path,
        trait_label: String,
        cancel: &CancelToken,
    ) -> Result<DefinitionResult, PipelineError> {
        let scorer = Scorer::new(&self.config, &self.runner);

        let individual = scorer.score(
            &ScoreRequest {
                genotype_prefix: &round.kit_prefix,
                kit_type: round.kit_type,
                score_path,
                output_dir: &round.kit_output_dir,
                manifest_dir: None,
            },
            cancel,
        )?;
        let user = stats::summarize_table(&individual.sscore_path)?;

        let mut result = DefinitionResult {
            user_mean: stats::finite(user.mean),
            trait_label,
            retention_percent: stats::finite(stats::retention_percent(
                &individual.variants_path,
                score_path,
            ))
            .unwrap_or(0.0),
            ..Default::default()
        };

        match self.score_population(&scorer, round, id, &individual, cancel) {
            Ok(panel) => {
                let comparison = stats::compare(user.mean, &panel);
                result.population_mean = stats::finite(panel.mean);
                result.z_score = comparison.z_score;
                result.percentile = comparison.percentile;
            }
            Err(e) => {
                warn!("Population scoring of {id} failed: {e}");
                result.error = Some(e.to_string());
            }
        }
        Ok(result)
    }

    /// Stages the individual's prepared score and variant list under the round's panel
    /// directory and scores the population against them.
    fn score_population(
        &self,
        scorer: &Scorer<'_>,
        round: &Round,
        id: &str,
        individual: &ScoreOutput,
        cancel: &CancelToken,
    ) -> Result<ScoreSummary, PipelineError> {
        let extraction_list = round.staging.path().join(format!("{id}.snplist"));
        let staged_score = round.staging.path().join(format!("{id}.score"));
        fs::copy(&individual.variants_path, &extraction_list)
            .map_err(io_err(&individual.variants_path))?;
        fs::copy(individual.prepared.path(), &staged_score)
            .map_err(io_err(individual.prepared.path()))?;

        let population_prefix = locate_genotype_prefix(&round.panel_dir)?;
        let population = scorer.score(
            &ScoreRequest {
                genotype_prefix: &population_prefix,
                kit_type: round.kit_type,
                score_path: &staged_score,
                output_dir: round.staging.path(),
                manifest_dir: Some(&round.panel_dir),
            },
            cancel,
        )?;
        Ok(stats::summarize_table(&population.sscore_path)?)
    }
}

// ========================================================================================
//                             PRIVATE IMPLEMENTATION
// ========================================================================================

/// Paths shared by every definition of one round.
struct Round {
    kit_type: KitType,
    kit_prefix: PathBuf,
    kit_output_dir: PathBuf,
    panel_dir: PathBuf,
    staging: StagingDir,
}

impl Round {
    fn new(
        config: &PipelineConfig,
        record: &KitRecord,
        round_id: &str,
    ) -> Result<Self, PipelineError> {
        let kit_prefix = locate_genotype_prefix(&record.processed_dir)?;
        let kit_output_dir = record
            .processed_dir
            .join(&config.score_output_dir_name)
            .join(round_id);
        fs::create_dir_all(&kit_output_dir).map_err(io_err(&kit_output_dir))?;

        let panel_dir = config.chip(record.kit_type).panel_dir.clone();
        let staging =
            StagingDir::create(panel_dir.join(&config.score_output_dir_name).join(round_id))?;

        Ok(Self {
            kit_type: record.kit_type,
            kit_prefix,
            kit_output_dir,
            panel_dir,
            staging,
        })
    }
}

/// Population artifacts of one round. Removed when the round is dropped, success or not.
struct StagingDir(PathBuf);

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self, PipelineError> {
        fs::create_dir_all(&path).map_err(io_err(&path))?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            log::warn!("Could not remove staging directory {}: {e}", self.0.display());
        }
    }
}

/// Copies `raw_path` into `raw_dir` under its own file name.
fn stage_upload(raw_path: &Path, raw_dir: &Path) -> Result<PathBuf, PipelineError> {
    let file_name = raw_path
        .file_name()
        .ok_or_else(|| PipelineError::Io {
            path: raw_path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "upload has no file name"),
        })?;
    fs::create_dir_all(raw_dir).map_err(io_err(raw_dir))?;
    let stored = raw_dir.join(file_name);
    fs::copy(raw_path, &stored).map_err(io_err(raw_path))?;
    Ok(stored)
}

static IDENTIFIER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-unique identifier: wall-clock nanoseconds plus a counter, so two calls in
/// the same nanosecond still differ.
fn new_identifier(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = IDENTIFIER_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{nanos:x}-{seq}")
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}
