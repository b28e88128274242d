//! File Handlers Module
//!
//! This module walks the date-partitioned report tree (`<base>/<YYYY-MM-DD>/<file>`).
//! It extracts every archive that still needs it and parses the resulting XML
//! documents into a [`BatchSummary`]. Only first-level subdirectories of the base
//! are considered date buckets.
use crate::archive_handler::{gz_destination_name, has_suffix, ArchiveExtractor};
use crate::config::Config;
use crate::models::{BatchSummary, ReportEntry};
use crate::xml_parser::parse_report_file;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Counters for one extraction pass over the tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionStats {
    pub total_candidates: usize,
    pub extracted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub produced_paths: Vec<PathBuf>,
}

/// FileHandler runs extraction and parsing passes over a report tree.
pub struct FileHandler {
    config: Config,
}

impl FileHandler {
    /// Creates a new FileHandler with the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Extracts every `.zip` and `.gz` in every date bucket into its own bucket.
    ///
    /// With `skip_extracted` set, a `.gz` whose XML is newer than the archive is
    /// skipped, as is a `.zip` when any XML in its bucket is newer than it.
    pub fn extract_all(&self, base_dir: &Path) -> ExtractionStats {
        let mut stats = ExtractionStats::default();
        if !base_dir.is_dir() {
            log::warn!("Report directory not found: {}", base_dir.display());
            return stats;
        }
        let extractor = ArchiveExtractor::new(&self.config);

        for bucket in date_buckets(base_dir) {
            for file in bucket_files(&bucket) {
                if is_hidden(&file) || has_suffix(&file, ".xml") {
                    continue;
                }
                if !(has_suffix(&file, ".zip") || has_suffix(&file, ".gz")) {
                    continue;
                }
                stats.total_candidates += 1;

                if self.config.skip_extracted {
                    match already_extracted(&file, &bucket) {
                        Ok(true) => {
                            log::debug!("Skipping already extracted {}", file.display());
                            stats.skipped += 1;
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) => log::debug!("Cannot compare mtimes for {}: {}", file.display(), e),
                    }
                }

                let produced = extractor.extract(&file, &bucket);
                if produced.is_empty() {
                    log::warn!("No reports extracted from {}", file.display());
                    stats.failed += 1;
                } else {
                    stats.extracted += 1;
                    stats.produced_paths.extend(produced);
                }
            }
        }

        log::info!(
            "Extraction finished: {} candidates, {} extracted, {} skipped, {} failed",
            stats.total_candidates,
            stats.extracted,
            stats.skipped,
            stats.failed
        );
        stats
    }

    /// Optionally extracts, then parses every XML document in every date bucket once.
    ///
    /// `failed` counts failed extractions plus documents that did not parse.
    pub fn process_directory(&self, base_dir: &Path, extract: bool) -> BatchSummary {
        let mut summary = BatchSummary::default();
        if !base_dir.is_dir() {
            log::warn!("Report directory not found: {}", base_dir.display());
            return summary;
        }
        if extract {
            summary.failed += self.extract_all(base_dir).failed;
        }

        for bucket in date_buckets(base_dir) {
            let date = bucket
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            for file in bucket_files(&bucket) {
                if is_hidden(&file) {
                    continue;
                }
                summary.total_files += 1;
                if !has_suffix(&file, ".xml") {
                    continue;
                }
                let report = parse_report_file(&file);
                match &report.error {
                    None => {
                        summary.processed += 1;
                        summary.reports.push(ReportEntry::from_report(file.clone(), date.as_str(), &report));
                        summary.xml_files.push(file);
                    }
                    Some(e) => {
                        log::warn!("Failed to parse {}: {}", file.display(), e);
                        summary.failed += 1;
                    }
                }
            }
        }

        log::info!(
            "Processed {} of {} files ({} failed)",
            summary.processed,
            summary.total_files,
            summary.failed
        );
        summary
    }
}

/// First-level subdirectories of `base_dir`, sorted by name.
pub fn date_buckets(base_dir: &Path) -> Vec<PathBuf> {
    let mut buckets = list_dir(base_dir)
        .into_iter()
        .filter(|path| path.is_dir() && !is_hidden(path))
        .collect::<Vec<_>>();
    buckets.sort();
    buckets
}

fn bucket_files(bucket: &Path) -> Vec<PathBuf> {
    let mut files = list_dir(bucket)
        .into_iter()
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();
    files.sort();
    files
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(e) => {
            log::warn!("Cannot read {}: {}", dir.display(), e);
            Vec::new()
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

fn modified(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

/// Whether an archive's output is already present and newer than the archive.
fn already_extracted(archive: &Path, bucket: &Path) -> io::Result<bool> {
    let archive_mtime = modified(archive)?;
    if has_suffix(archive, ".gz") {
        let Some(name) = gz_destination_name(archive) else {
            return Ok(false);
        };
        let destination = bucket.join(name);
        if !destination.exists() {
            return Ok(false);
        }
        return Ok(modified(&destination)? > archive_mtime);
    }

    // A zip's member names are unknown until it is opened, so any newer XML in
    // the bucket stands in for its output.
    for file in bucket_files(bucket) {
        if has_suffix(&file, ".xml") && modified(&file)? > archive_mtime {
            return Ok(true);
        }
    }
    Ok(false)
}
