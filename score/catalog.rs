// ========================================================================================
//
//                         PGS catalog metadata (read-only)
//
// ========================================================================================
//
// Two JSON exports are loaded once at startup: per-score metadata and the ontology trait
// index. Lookups are by canonical definition ID, i.e. the text before the first '.'.

use crate::types::canonical_id;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unable to open '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unable to parse '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One object from `scores_metadata.json`. Fields not named here are kept in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreMetadata {
    #[serde(rename = "Polygenic Score (PGS) ID")]
    pub id: String,
    #[serde(rename = "Reported Trait", alias = "Reported trait", default)]
    pub reported_trait: Option<String>,
    #[serde(rename = "FTP link", default)]
    pub ftp_link: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One object from `ontology_traits.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct OntologyTrait {
    #[serde(rename = "Ontology Trait ID")]
    pub id: String,
    #[serde(rename = "Ontology Trait Label", default)]
    pub label: String,
    #[serde(rename = "Ontology Trait Description", default)]
    pub description: String,
    #[serde(rename = "Ontology URL", default)]
    pub url: String,
    #[serde(rename = "PGS Files", default)]
    pub pgs_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScoreCatalog {
    scores: Vec<ScoreMetadata>,
    traits: Vec<OntologyTrait>,
}

impl ScoreCatalog {
    pub fn new(scores: Vec<ScoreMetadata>, traits: Vec<OntologyTrait>) -> Self {
        Self { scores, traits }
    }

    /// Loads both metadata files from their configured paths.
    pub fn load(scores_path: &Path, traits_path: &Path) -> Result<Self, CatalogError> {
        Ok(Self {
            scores: read_json(scores_path)?,
            traits: read_json(traits_path)?,
        })
    }

    pub fn scores(&self) -> &[ScoreMetadata] {
        &self.scores
    }

    pub fn traits(&self) -> &[OntologyTrait] {
        &self.traits
    }

    pub fn score(&self, id: &str) -> Option<&ScoreMetadata> {
        let id = canonical_id(id);
        self.scores.iter().find(|s| s.id == id)
    }

    /// The reported trait of a score, falling back to the label of any ontology trait
    /// that lists it. Empty when neither is known.
    pub fn trait_label(&self, id: &str) -> String {
        let id = canonical_id(id);
        if let Some(label) = self.score(id).and_then(|s| s.reported_trait.clone()) {
            return label;
        }
        self.traits
            .iter()
            .find(|t| t.pgs_files.iter().any(|f| f == id))
            .map(|t| t.label.clone())
            .unwrap_or_default()
    }

    pub fn score_url(&self, id: &str) -> Option<&str> {
        self.score(id)?
            .ftp_link
            .as_deref()
            .filter(|link| !link.trim().is_empty())
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CatalogError> {
    let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCORES: &str = r#"[
        {"Polygenic Score (PGS) ID": "PGS000001", "Reported Trait": "Breast cancer",
         "FTP link": "ftp://ftp.ebi.ac.uk/pub/databases/spot/pgs/scores/PGS000001/ScoringFiles/PGS000001.txt.gz",
         "Number of Variants": 77},
        {"Polygenic Score (PGS) ID": "PGS000002", "Reported trait": "Height"},
        {"Polygenic Score (PGS) ID": "PGS000003"}
    ]"#;

    const TRAITS: &str = r#"[
        {"Ontology Trait ID": "EFO_0004339", "Ontology Trait Label": "body height",
         "Ontology Trait Description": "", "Ontology URL": "http://www.ebi.ac.uk/efo/EFO_0004339",
         "PGS Files": ["PGS000003"]}
    ]"#;

    fn catalog() -> ScoreCatalog {
        ScoreCatalog::new(
            serde_json::from_str(SCORES).unwrap(),
            serde_json::from_str(TRAITS).unwrap(),
        )
    }

    #[test]
    fn trait_label_checks_scores_then_traits() {
        let catalog = catalog();
        assert_eq!(catalog.trait_label("PGS000001.norm"), "Breast cancer");
        assert_eq!(catalog.trait_label("PGS000002"), "Height");
        assert_eq!(catalog.trait_label("PGS000003"), "body height");
        assert_eq!(catalog.trait_label("PGS999999"), "");
    }

    #[test]
    fn extra_fields_are_retained() {
        let catalog = catalog();
        let score = catalog.score("PGS000001").unwrap();
        assert_eq!(score.extra["Number of Variants"], 77);
        assert!(catalog.score_url("PGS000001").unwrap().starts_with("ftp://"));
        assert_eq!(catalog.score_url("PGS000002"), None);
    }

    #[test]
    fn load_reports_the_failing_file() {
        let dir = tempfile::tempdir().unwrap();
        let scores = dir.path().join("scores_metadata.json");
        let traits = dir.path().join("ontology_traits.json");
        fs::write(&scores, SCORES).unwrap();
        fs::write(&traits, "{ not json").unwrap();
        match ScoreCatalog::load(&scores, &traits).unwrap_err() {
            CatalogError::Parse { path, .. } => assert_eq!(path, traits),
            other => panic!("unexpected error: {other}"),
        }
    }
}
