// ========================================================================================
//
//                              COMMAND-LINE FRONT END
//
// ========================================================================================
//
// Every pipeline stage is reachable on its own for debugging a single kit or score file,
// and the engine commands run the full ingest and scoring flow. Results go to stdout as
// JSON; progress and diagnostics go to stderr.

use clap::{CommandFactory, Parser, Subcommand};
use env_logger::Env;
use pgs_compare::config::PipelineConfig;
use pgs_compare::genotype_convert::{convert_kit, normalize_genotype_file};
use pgs_compare::harmonize::harmonize_bim_file;
use pgs_compare::kit_store::{JsonKitStore, KitStore};
use pgs_compare::pipeline::{Engine, PipelineError};
use pgs_compare::reformat::{NormalizeOptions, normalize_score_file};
use pgs_compare::remap::remap_score_file;
use pgs_compare::results::DefinitionResult;
use pgs_compare::scorer::{ScoreRequest, Scorer};
use pgs_compare::stats;
use pgs_compare::tool::{CancelToken, ToolRunner};
use pgs_compare::types::KitType;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser)]
#[command(
    name = "pgs-compare",
    version,
    about = "Normalize genotype kits and PGS score files, score them with PLINK, and compare against a reference population"
)]
struct Cli {
    /// TOML configuration file. Built-in defaults are used for anything it omits.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a raw kit into a harmonized pgen fileset
    #[command(name = "convert-kit")]
    ConvertKit {
        #[arg(value_name = "RAW_KIT")]
        raw: PathBuf,
        /// Directory receiving the processed fileset
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },

    /// Rewrite a raw kit as canonical four-column genotype text
    #[command(name = "normalize-kit")]
    NormalizeKit {
        #[arg(value_name = "RAW_KIT")]
        raw: PathBuf,
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
    },

    /// Rewrite a PGS scoring file in the canonical layout
    #[command(name = "normalize-score")]
    NormalizeScore {
        #[arg(value_name = "SCORE_FILE")]
        input: PathBuf,
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
        /// Use this column as the weight instead of the usual candidates
        #[arg(long, value_name = "COLUMN")]
        weight_column: Option<String>,
    },

    /// Orient the alleles of <PREFIX>.bim against a reference-allele table
    Harmonize {
        #[arg(value_name = "PREFIX")]
        prefix: PathBuf,
        #[arg(long, value_name = "FILE")]
        reference: PathBuf,
    },

    /// Re-key a position-keyed score file by variant ID
    Remap {
        #[arg(value_name = "SCORE_FILE")]
        score: PathBuf,
        /// Directory searched for the first .pvar manifest
        #[arg(long, value_name = "DIR")]
        manifest_dir: PathBuf,
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },

    /// Score one definition against a pgen fileset
    Score {
        /// Prefix of the .pgen/.pvar/.psam fileset
        #[arg(long, value_name = "PREFIX")]
        pfile: PathBuf,
        #[arg(long, value_name = "KIT_TYPE")]
        kit_type: KitType,
        #[arg(long, value_name = "SCORE_FILE")]
        score: PathBuf,
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
        #[arg(long, value_name = "DIR")]
        manifest_dir: Option<PathBuf>,
    },

    /// Compare an individual score table against a population score table
    Stats {
        #[arg(long, value_name = "SSCORE")]
        individual: PathBuf,
        #[arg(long, value_name = "SSCORE")]
        population: PathBuf,
        /// Variant list used for population scoring, for the retention figure
        #[arg(long, value_name = "FILE", requires = "normalized")]
        extract: Option<PathBuf>,
        /// Normalized score file the definition started from
        #[arg(long, value_name = "FILE", requires = "extract")]
        normalized: Option<PathBuf>,
    },

    /// Download and normalize definitions from the score catalog
    Fetch {
        #[arg(value_name = "PGS_ID", required = true)]
        ids: Vec<String>,
    },

    /// Convert a raw kit and register it in the kit store
    Ingest {
        #[arg(value_name = "RAW_KIT")]
        raw: PathBuf,
    },

    /// Run a scoring round for a registered kit
    #[command(name = "score-kit")]
    ScoreKit {
        #[arg(value_name = "KIT_ID")]
        kit_id: String,
        #[arg(value_name = "NORMALIZED_SCORE", required = true)]
        scores: Vec<PathBuf>,
    },

    /// Forget a registered kit
    #[command(name = "delete-kit")]
    DeleteKit {
        #[arg(value_name = "KIT_ID")]
        kit_id: String,
    },
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let Cli { config, command } = Cli::parse();
    let Some(command) = command else {
        let _ = Cli::command().print_help();
        println!();
        return;
    };

    if let Err(e) = run(config.as_deref(), command) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ========================================================================================
//                                  COMMAND DISPATCH
// ========================================================================================

fn run(config_path: Option<&Path>, command: Commands) -> Result<(), PipelineError> {
    let config = match config_path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    let cancel = CancelToken::new();
    let runner = ToolRunner::new(config.tool_timeout());

    match command {
        Commands::ConvertKit { raw, out } => {
            print_json(&convert_kit(&raw, &out, &config, &runner, &cancel)?)
        }
        Commands::NormalizeKit { raw, output } => {
            print_json(&normalize_genotype_file(&raw, &output, config.row_policy)?)
        }
        Commands::NormalizeScore {
            input,
            output,
            weight_column,
        } => {
            let options = NormalizeOptions {
                weight_column,
                row_policy: config.row_policy,
            };
            print_json(&normalize_score_file(&input, &output, &options)?)
        }
        Commands::Harmonize { prefix, reference } => {
            print_json(&harmonize_bim_file(&prefix, &reference)?)
        }
        Commands::Remap {
            score,
            manifest_dir,
            out,
        } => print_json(&remap_score_file(&score, &manifest_dir, &out)?),
        Commands::Score {
            pfile,
            kit_type,
            score,
            out,
            manifest_dir,
        } => {
            let scorer = Scorer::new(&config, &runner);
            let output = scorer.score(
                &ScoreRequest {
                    genotype_prefix: &pfile,
                    kit_type,
                    score_path: &score,
                    output_dir: &out,
                    manifest_dir: manifest_dir.as_deref(),
                },
                &cancel,
            )?;
            print_json(&output)
        }
        Commands::Stats {
            individual,
            population,
            extract,
            normalized,
        } => {
            let user = stats::summarize_table(&individual)?;
            let panel = stats::summarize_table(&population)?;
            let comparison = stats::compare(user.mean, &panel);
            let retention = match (extract, normalized) {
                (Some(extract), Some(normalized)) => {
                    stats::retention_percent(&extract, &normalized)
                }
                _ => 0.0,
            };
            let result = DefinitionResult {
                population_mean: stats::finite(panel.mean),
                user_mean: stats::finite(user.mean),
                z_score: comparison.z_score,
                percentile: comparison.percentile,
                trait_label: String::new(),
                retention_percent: retention,
                error: None,
            };
            print_json(&json!({
                "individual": user,
                "population": panel,
                "result": result,
            }))
        }
        Commands::Fetch { ids } => {
            let engine = Engine::from_config(config)?;
            let prepared = engine.prepare_definitions(&ids);
            let report: serde_json::Map<String, serde_json::Value> = prepared
                .into_iter()
                .map(|(id, result)| {
                    let value = match result {
                        Ok(path) => json!({ "path": path }),
                        Err(e) => json!({ "error": e.to_string() }),
                    };
                    (id, value)
                })
                .collect();
            print_json(&report)
        }
        Commands::Ingest { raw } => {
            let engine = Engine::from_config(config)?;
            let (kit_id, converted) = engine.ingest_kit(&raw, &cancel)?;
            print_json(&json!({ "kit_id": kit_id, "kit": converted }))
        }
        Commands::ScoreKit { kit_id, scores } => {
            let engine = Engine::from_config(config)?;
            print_json(&engine.score_kit(&kit_id, &scores, &cancel)?)
        }
        Commands::DeleteKit { kit_id } => {
            let store = JsonKitStore::open(&config.kit_store_path())?;
            if store.lookup(&kit_id).is_none() {
                return Err(PipelineError::NotFound(kit_id));
            }
            store.delete(&kit_id)?;
            print_json(&json!({ "deleted": kit_id }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), PipelineError> {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => log::error!("Could not render result as JSON: {e}"),
    }
    Ok(())
}
