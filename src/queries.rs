//! Query Module
//!
//! Read-only views over a processed report tree, shaped for a presentation layer:
//! totals, per-domain figures, the daily trend, a single report in detail and the
//! raw XML of one stored document. Everything here is JSON-serializable.
use crate::aggregate::{summarize_by_domain, summarize_total, summarize_trend, AggregateSummary, DomainSummary, TrendBucket};
use crate::archive_handler::has_suffix;
use crate::error::{DmarcError, Result};
use crate::models::{BatchSummary, DmarcReport, ReportEntry};
use crate::xml_parser::parse_report_file;
use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::path::{Component, Path};

/// Grand totals plus the file counters of the batch they came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TotalsView {
    pub total_files: usize,
    pub processed: usize,
    pub failed: usize,
    #[serde(flatten)]
    pub summary: AggregateSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendsView {
    pub trends: Vec<TrendBucket>,
}

/// One report as listed in the batch, with its full re-parsed content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportDetail {
    pub report: ReportEntry,
    pub details: DmarcReport,
}

pub fn totals(batch: &BatchSummary) -> TotalsView {
    TotalsView {
        total_files: batch.total_files,
        processed: batch.processed,
        failed: batch.failed,
        summary: summarize_total(&batch.reports),
    }
}

pub fn domains(batch: &BatchSummary) -> Vec<DomainSummary> {
    summarize_by_domain(&batch.reports)
}

pub fn trends(batch: &BatchSummary, anchor: NaiveDate, window_days: u32) -> TrendsView {
    TrendsView {
        trends: summarize_trend(&batch.reports, anchor, window_days),
    }
}

/// Finds a report by id and re-parses its document.
///
/// Entries whose file has gone missing or no longer parses are passed over.
pub fn report_detail(batch: &BatchSummary, report_id: &str) -> Option<ReportDetail> {
    batch
        .reports
        .iter()
        .filter(|entry| entry.report_id == report_id && entry.file.exists())
        .find_map(|entry| {
            let details = parse_report_file(&entry.file);
            match &details.error {
                None => Some(ReportDetail {
                    report: entry.clone(),
                    details,
                }),
                Some(e) => {
                    log::warn!("Report {} no longer parses: {}", report_id, e);
                    None
                }
            }
        })
}

/// Returns the bytes of an XML document stored under `base_dir`.
///
/// The path must be relative, free of `..` segments, resolve inside the base and
/// name an `.xml` file both as requested and once resolved.
pub fn raw_document(base_dir: &Path, relative_path: &str) -> Result<Vec<u8>> {
    let relative = Path::new(relative_path);
    let escapes = relative_path.starts_with('/')
        || relative_path.starts_with('\\')
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative_path.is_empty() || escapes {
        return Err(DmarcError::InvalidPath(relative_path.to_string()));
    }

    let full_path = base_dir.join(relative);
    let base = fs::canonicalize(base_dir).map_err(|_| DmarcError::NotFound(base_dir.to_path_buf()))?;
    let resolved = fs::canonicalize(&full_path).map_err(|_| DmarcError::NotFound(full_path.clone()))?;
    if !resolved.starts_with(&base) {
        return Err(DmarcError::InvalidPath(relative_path.to_string()));
    }
    if !resolved.is_file() || !has_suffix(relative, ".xml") || !has_suffix(&resolved, ".xml") {
        return Err(DmarcError::UnsupportedFile(format!("Not an XML file: {}", relative_path)));
    }
    Ok(fs::read(&resolved)?)
}
