// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The genotyping platform family a raw kit was exported from. It decides the raw column
/// layout, the chip manifest, and the reference panel a kit is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KitType {
    #[serde(rename = "ancestry")]
    Ancestry,
    #[serde(rename = "23andme")]
    TwentyThreeAndMe,
}

impl KitType {
    pub fn as_str(self) -> &'static str {
        match self {
            KitType::Ancestry => "ancestry",
            KitType::TwentyThreeAndMe => "23andme",
        }
    }
}

impl fmt::Display for KitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KitType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ancestry" | "ancestrydna" => Ok(KitType::Ancestry),
            "23andme" => Ok(KitType::TwentyThreeAndMe),
            other => Err(format!(
                "Unknown kit type '{other}'. Expected 'ancestry' or '23andme'."
            )),
        }
    }
}

/// How a normalizer reacts to a row it cannot use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowPolicy {
    /// Drop the row, count it, and keep going.
    #[default]
    Tolerant,
    /// Abort the whole file on the first unusable row.
    Strict,
}

/// Where a processed kit lives and which chip produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KitRecord {
    pub processed_dir: PathBuf,
    pub kit_type: KitType,
}

/// Normalizes a chromosome code to the canonical `1..22, X, Y, MT` vocabulary.
///
/// The value is upper-cased and a leading `CHR` prefix (any case) is removed. The
/// numeric sex/mito codes used by genotyping chips are folded onto their names:
/// `23 -> X`, `24 -> Y`, `25 -> Y` (pseudo-autosomal), `26 -> MT`. Any other code is
/// passed through upper-cased, so the function is total and idempotent.
pub fn normalize_chromosome(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_prefix = match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") => &trimmed[3..],
        _ => trimmed,
    };
    let upper = without_prefix.to_ascii_uppercase();
    match upper.as_str() {
        "23" => "X".to_string(),
        "24" | "25" => "Y".to_string(),
        "26" => "MT".to_string(),
        _ => upper,
    }
}

/// Strips the final extension from a file name: `PGS000001.norm.tsv -> PGS000001.norm`.
pub fn trim_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reduces a derived name to its definition ID by cutting at the first dot:
/// `PGS000001.norm -> PGS000001`.
pub fn canonical_id(raw: &str) -> &str {
    match raw.find('.') {
        Some(dot) => &raw[..dot],
        None => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_chromosome_maps_chip_codes() {
        assert_eq!(normalize_chromosome("23"), "X");
        assert_eq!(normalize_chromosome("24"), "Y");
        assert_eq!(normalize_chromosome("25"), "Y");
        assert_eq!(normalize_chromosome("26"), "MT");
        assert_eq!(normalize_chromosome("chr7"), "7");
        assert_eq!(normalize_chromosome("CHRx"), "X");
        assert_eq!(normalize_chromosome("mt"), "MT");
    }

    #[test]
    fn normalize_chromosome_is_idempotent() {
        for raw in ["1", "22", "23", "24", "25", "26", "chr3", "X", "y", "MT", "XY", "0"] {
            let once = normalize_chromosome(raw);
            assert_eq!(normalize_chromosome(&once), once, "input {raw}");
        }
    }

    #[test]
    fn kit_type_round_trips_through_strings() {
        assert_eq!("ancestry".parse::<KitType>().unwrap(), KitType::Ancestry);
        assert_eq!("23andMe".parse::<KitType>().unwrap(), KitType::TwentyThreeAndMe);
        assert!("myheritage".parse::<KitType>().is_err());
        assert_eq!(KitType::TwentyThreeAndMe.to_string(), "23andme");
    }

    #[test]
    fn identifiers_are_derived_from_file_names() {
        let path = Path::new("/data/pgs_files/PGS000001/PGS000001.norm.tsv");
        assert_eq!(trim_id(path), "PGS000001.norm");
        assert_eq!(canonical_id(&trim_id(path)), "PGS000001");
        assert_eq!(canonical_id("PGS000002"), "PGS000002");
    }
}
