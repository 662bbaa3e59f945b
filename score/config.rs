// ========================================================================================
//
//                         Directory layout and runtime settings
//
// ========================================================================================
//
// One canonical layout for every artifact the pipeline reads or writes. All fields carry
// defaults, so a TOML file only needs to mention what differs on a given host.

use crate::types::{KitType, RowPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Reference material for one chip family: the population panel scored alongside each
/// kit, its allele-frequency file, and the chip manifest used during kit conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChipConfig {
    /// Directory holding the population panel `.pgen/.pvar/.psam` trio.
    pub panel_dir: PathBuf,
    /// Allele frequencies handed to the scoring tool. Scoring fails without one.
    pub freq_file: Option<PathBuf>,
    /// Directory holding `<kit>.snplist` and `<kit>.refallele`.
    pub manifest_dir: PathBuf,
}

impl ChipConfig {
    pub fn snplist(&self, kit_type: KitType) -> PathBuf {
        self.manifest_dir.join(format!("{kit_type}.snplist"))
    }

    pub fn refallele(&self, kit_type: KitType) -> PathBuf {
        self.manifest_dir.join(format!("{kit_type}.refallele"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Executable used for the text-to-bed encoding step.
    pub plink1: String,
    /// Executable used for pgen encoding and scoring.
    pub plink2: String,
    /// Hard deadline for any single tool invocation.
    pub timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            plink1: "plink1".to_string(),
            plink2: "plink2".to_string(),
            timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Holds the catalog JSON files and the kit store.
    pub data_dir: PathBuf,
    pub upload_raw_dir: PathBuf,
    pub upload_processed_dir: PathBuf,
    /// One subdirectory per downloaded PGS definition.
    pub pgs_download_dir: PathBuf,
    /// Name of the scoring subdirectory inside kit and panel directories.
    pub score_output_dir_name: String,
    pub ancestry: ChipConfig,
    #[serde(rename = "23andme")]
    pub twenty_three_and_me: ChipConfig,
    pub tools: ToolConfig,
    pub row_policy: RowPolicy,
    /// Upper bound on definitions scored concurrently within one round.
    pub workers: usize,
    pub fetch_timeout_secs: u64,
    /// Pass the harmonizer's exclusion list to the final encoding step.
    pub apply_exclusions: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let reference_root = PathBuf::from("backend/data/reference_genomes/1000G");
        let manifest_root = PathBuf::from("backend/data/dna_chip_manifests");
        Self {
            data_dir: PathBuf::from("backend/data"),
            upload_raw_dir: PathBuf::from("uploads/user_kits/raw"),
            upload_processed_dir: PathBuf::from("uploads/user_kits/processed"),
            pgs_download_dir: PathBuf::from("backend/data/pgs_files"),
            score_output_dir_name: "scores".to_string(),
            ancestry: ChipConfig {
                panel_dir: reference_root.join("ancestry"),
                freq_file: Some(reference_root.join("ancestry").join("ancestry.afreq")),
                manifest_dir: manifest_root.join("ancestry_v2"),
            },
            twenty_three_and_me: ChipConfig {
                panel_dir: reference_root.join("23andme"),
                freq_file: Some(reference_root.join("23andme").join("23andme.afreq")),
                manifest_dir: manifest_root.join("23andme_v5"),
            },
            tools: ToolConfig::default(),
            row_policy: RowPolicy::Tolerant,
            workers: num_cpus::get().clamp(1, 4),
            fetch_timeout_secs: 300,
            apply_exclusions: false,
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration from a TOML file; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn chip(&self, kit_type: KitType) -> &ChipConfig {
        match kit_type {
            KitType::Ancestry => &self.ancestry,
            KitType::TwentyThreeAndMe => &self.twenty_three_and_me,
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn scores_metadata_path(&self) -> PathBuf {
        self.data_dir.join("scores_metadata.json")
    }

    pub fn ontology_traits_path(&self) -> PathBuf {
        self.data_dir.join("ontology_traits.json")
    }

    pub fn kit_store_path(&self) -> PathBuf {
        self.data_dir.join("kits.json")
    }
}
