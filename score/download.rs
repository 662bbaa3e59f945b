// ========================================================================================
//
//                               SCORE FILE DOWNLOADER
//
// ========================================================================================

use crate::catalog::ScoreCatalog;
use crate::config::PipelineConfig;
use crate::reformat::{self, NormalizeOptions, ReformatError};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ========================================================================================
//                              PUBLIC API
// ========================================================================================

/// A specialized error type for the download and normalize workflow.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("'{0}' is not in the score catalog or has no download link")]
    UnknownDefinition(String),
    #[error("Network download of '{url}' failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("I/O error for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Reformat(#[from] ReformatError),
}

/// Resolves definition IDs to normalized score files under the download directory.
pub struct DefinitionFetcher<'a> {
    catalog: &'a ScoreCatalog,
    download_dir: PathBuf,
    timeout: Duration,
    options: NormalizeOptions,
    /// Parallel downloads stack their bars here. Hidden when stderr is not a terminal.
    progress: MultiProgress,
}

impl<'a> DefinitionFetcher<'a> {
    pub fn new(catalog: &'a ScoreCatalog, config: &PipelineConfig) -> Self {
        Self {
            catalog,
            download_dir: config.pgs_download_dir.clone(),
            timeout: config.fetch_timeout(),
            options: NormalizeOptions {
                weight_column: None,
                row_policy: config.row_policy,
            },
            progress: MultiProgress::with_draw_target(download_draw_target()),
        }
    }

    /// Path the normalized file for `id` is written to.
    pub fn normalized_path(&self, id: &str) -> PathBuf {
        self.download_dir.join(id).join(format!("{id}.norm.tsv"))
    }

    /// Downloads (unless already present) and normalizes one definition.
    ///
    /// The compressed file is kept at `<download_dir>/<id>/<basename>` so a later round
    /// only has to re-normalize.
    pub fn fetch(&self, id: &str) -> Result<PathBuf, FetchError> {
        let link = self
            .catalog
            .score_url(id)
            .ok_or_else(|| FetchError::UnknownDefinition(id.to_string()))?;
        let url = resolve_download_url(link);

        let dir = self.download_dir.join(id);
        fs::create_dir_all(&dir).map_err(|source| FetchError::Io {
            path: dir.clone(),
            source,
        })?;

        let file_name = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{id}.txt.gz"));
        let archive = dir.join(file_name);

        if archive.exists() {
            eprintln!("> Found existing downloaded file for {id}. Skipping download.");
        } else {
            download_file(&url, &archive, self.timeout, &self.progress)?;
        }

        let normalized = self.normalized_path(id);
        reformat::normalize_score_file(&archive, &normalized, &self.options)?;
        Ok(normalized)
    }

    /// Fetches every ID in parallel. Each ID succeeds or fails on its own.
    pub fn fetch_all(&self, ids: &[String]) -> BTreeMap<String, Result<PathBuf, FetchError>> {
        eprintln!(
            "> Preparing {} score definitions in {}",
            ids.len(),
            self.download_dir.display()
        );
        ids.par_iter()
            .map(|id| {
                let result = self.fetch(id);
                if let Err(e) = &result {
                    log::warn!("Could not prepare {id}: {e}");
                }
                (id.clone(), result)
            })
            .collect()
    }
}

/// Catalog links point at the EBI FTP server, which also serves the same paths over HTTPS.
pub fn resolve_download_url(link: &str) -> String {
    match link.strip_prefix("ftp://") {
        Some(rest) => format!("https://{rest}"),
        None => link.to_string(),
    }
}

// ========================================================================================
//                             PRIVATE IMPLEMENTATION
// ========================================================================================

fn download_draw_target() -> ProgressDrawTarget {
    if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    }
}

/// Streams `url` into `dest` with a hard deadline on the whole transfer.
///
/// Data lands in `<dest>.part` first and is renamed on completion, so an interrupted
/// download is never mistaken for a cached one.
fn download_file(
    url: &str,
    dest: &Path,
    timeout: Duration,
    bars: &MultiProgress,
) -> Result<(), FetchError> {
    let http_err = |source| FetchError::Http {
        url: url.to_string(),
        source,
    };
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| FetchError::Io { path, source }
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(http_err)?;
    let mut response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(http_err)?;

    let progress = match response.content_length() {
        Some(total) => {
            let bar = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bytes}/{total_bytes} {msg}",
            ) {
                bar.set_style(style);
            }
            bar
        }
        None => ProgressBar::new_spinner(),
    };
    let progress = bars.add(progress);
    progress.set_message(url.to_string());

    let mut partial = dest.as_os_str().to_os_string();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let file = File::create(&partial).map_err(io_err(&partial))?;
    let mut writer = progress.wrap_write(BufWriter::new(file));
    let copied = io::copy(&mut response, &mut writer);
    let flushed = writer.flush();
    progress.finish_and_clear();
    bars.remove(&progress);

    if let Err(source) = copied.and(flushed) {
        let _ = fs::remove_file(&partial);
        return Err(FetchError::Io {
            path: dest.to_path_buf(),
            source,
        });
    }

    fs::rename(&partial, dest).map_err(io_err(dest))?;
    log::info!("Downloaded {url} -> {}", dest.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ScoreCatalog, ScoreMetadata};
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn catalog_with(id: &str, link: Option<&str>) -> ScoreCatalog {
        let mut entry = serde_json::json!({ "Polygenic Score (PGS) ID": id });
        if let Some(link) = link {
            entry["FTP link"] = serde_json::Value::from(link);
        }
        let score: ScoreMetadata = serde_json::from_value(entry).unwrap();
        ScoreCatalog::new(vec![score], Vec::new())
    }

    #[test]
    fn ftp_links_are_rewritten() {
        assert_eq!(
            resolve_download_url("ftp://ftp.ebi.ac.uk/pub/PGS000001.txt.gz"),
            "https://ftp.ebi.ac.uk/pub/PGS000001.txt.gz"
        );
        assert_eq!(
            resolve_download_url("https://example.org/a.txt.gz"),
            "https://example.org/a.txt.gz"
        );
    }

    #[test]
    fn download_bars_follow_the_terminal() {
        let catalog = ScoreCatalog::default();
        let fetcher = DefinitionFetcher::new(&catalog, &PipelineConfig::default());
        assert_eq!(fetcher.progress.is_hidden(), !io::stderr().is_terminal());
    }

    #[test]
    fn unknown_definitions_are_isolated() {
        let catalog = catalog_with("PGS000001", None);
        let config = PipelineConfig::default();
        let fetcher = DefinitionFetcher::new(&catalog, &config);
        let results = fetcher.fetch_all(&["PGS000001".to_string(), "PGS404".to_string()]);
        assert!(matches!(results["PGS000001"], Err(FetchError::UnknownDefinition(_))));
        assert!(matches!(results["PGS404"], Err(FetchError::UnknownDefinition(_))));
    }

    #[test]
    fn cached_archive_is_normalized_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_with(
            "PGS000001",
            Some("ftp://ftp.ebi.ac.uk/pub/databases/spot/pgs/scores/PGS000001/ScoringFiles/PGS000001.txt.gz"),
        );
        let config = PipelineConfig {
            pgs_download_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };

        let archive_dir = dir.path().join("PGS000001");
        fs::create_dir_all(&archive_dir).unwrap();
        let mut encoder = GzEncoder::new(
            File::create(archive_dir.join("PGS000001.txt.gz")).unwrap(),
            Compression::default(),
        );
        encoder
            .write_all(b"#pgs_id=PGS000001\nrsID\tchr_name\tchr_position\teffect_allele\teffect_weight\nrs1\t1\t100\tA\t0.5\n")
            .unwrap();
        encoder.finish().unwrap();

        let fetcher = DefinitionFetcher::new(&catalog, &config);
        let normalized = fetcher.fetch("PGS000001").unwrap();
        assert_eq!(normalized, archive_dir.join("PGS000001.norm.tsv"));
        assert_eq!(
            fs::read_to_string(normalized).unwrap(),
            "chr_name\tchr_position\teffect_allele\teffect_weight\n1\t100\tA\t0.5\n"
        );
    }
}
