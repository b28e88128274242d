//! Data Models Module
//!
//! This module defines the core data structures of the ingestion pipeline: mail
//! attachments and stored files, decoded DMARC reports with their records, the
//! per-report summary, and the batch summary consumed by the presentation layer.
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

const UNKNOWN: &str = "Unknown";

/// An attachment as delivered by the mail collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub size: u64,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let size = payload.len() as u64;
        Attachment {
            filename: filename.into(),
            payload,
            content_type: content_type.into(),
            size,
        }
    }
}

/// A body part considered by the classifier's content gate.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyPart {
    pub content_type: String,
    pub charset: Option<String>,
    pub payload: Vec<u8>,
}

/// A message fetched from a mail source.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub id: String,
    pub subject: String,
    pub date: Option<DateTime<FixedOffset>>,
    pub attachments: Vec<Attachment>,
    pub body_parts: Vec<BodyPart>,
}

/// An attachment persisted under a date bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredFile {
    pub filename: String,
    pub original_filename: String,
    pub date: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DateRange {
    pub begin: i64,
    pub end: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReportMetadata {
    pub org_name: String,
    pub email: String,
    pub extra_contact_info: String,
    pub report_id: String,
    pub date_range: DateRange,
}

impl Default for ReportMetadata {
    fn default() -> Self {
        ReportMetadata {
            org_name: UNKNOWN.to_string(),
            email: UNKNOWN.to_string(),
            extra_contact_info: UNKNOWN.to_string(),
            report_id: UNKNOWN.to_string(),
            date_range: DateRange { begin: 0, end: 0 },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PolicyPublished {
    pub domain: String,
    pub adkim: String,
    pub aspf: String,
    pub p: String,
    pub sp: String,
    pub pct: u32,
}

impl Default for PolicyPublished {
    fn default() -> Self {
        PolicyPublished {
            domain: UNKNOWN.to_string(),
            adkim: "r".to_string(),
            aspf: "r".to_string(),
            p: "none".to_string(),
            sp: "none".to_string(),
            pct: 100,
        }
    }
}

impl PolicyPublished {
    /// The published policy, when it is one of the recognised values.
    pub fn policy(&self) -> Option<PolicyType> {
        self.p.parse().ok()
    }

    pub fn subdomain_policy(&self) -> Option<PolicyType> {
        self.sp.parse().ok()
    }

    pub fn dkim_alignment(&self) -> Option<AlignmentMode> {
        self.adkim.parse().ok()
    }

    pub fn spf_alignment(&self) -> Option<AlignmentMode> {
        self.aspf.parse().ok()
    }
}

/// The `<row>` of a record. Policy-evaluated results keep `None` when the
/// element was absent so that tallies can tell absence from a "none" value;
/// serialized rows show the defaulted value.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Row {
    pub source_ip: String,
    pub count: u64,
    #[serde(serialize_with = "serialize_or_none")]
    pub disposition: Option<String>,
    #[serde(serialize_with = "serialize_or_none")]
    pub dkim_result: Option<String>,
    #[serde(serialize_with = "serialize_or_none")]
    pub spf_result: Option<String>,
}

fn serialize_or_none<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(value.as_deref().unwrap_or("none"))
}

impl Default for Row {
    fn default() -> Self {
        Row {
            source_ip: UNKNOWN.to_string(),
            count: 0,
            disposition: None,
            dkim_result: None,
            spf_result: None,
        }
    }
}

impl Row {
    pub fn disposition(&self) -> &str {
        self.disposition.as_deref().unwrap_or("none")
    }

    pub fn dkim_result(&self) -> &str {
        self.dkim_result.as_deref().unwrap_or("none")
    }

    pub fn spf_result(&self) -> &str {
        self.spf_result.as_deref().unwrap_or("none")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AuthResult {
    pub domain: Option<String>,
    pub result: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AuthResults {
    pub dkim: Option<AuthResult>,
    pub spf: Option<AuthResult>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Record {
    pub row: Row,
    pub header_from: String,
    pub auth_results: Option<AuthResults>,
}

impl Default for Record {
    fn default() -> Self {
        Record {
            row: Row::default(),
            header_from: UNKNOWN.to_string(),
            auth_results: None,
        }
    }
}

/// Pass/fail counters of one report, weighted by record count.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportSummary {
    pub total_records: u64,
    pub spf_pass: u64,
    pub spf_fail: u64,
    pub dkim_pass: u64,
    pub dkim_fail: u64,
    pub dmarc_pass: u64,
    pub dmarc_fail: u64,
    pub disposition_pass: u64,
    pub disposition_fail: u64,
}

impl ReportSummary {
    /// Folds records into a summary. `None` when a weighted tally overflows.
    pub fn from_records<'a, I>(records: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        records
            .into_iter()
            .try_fold(ReportSummary::default(), ReportSummary::accumulate)
    }

    /// Returns the summary with one more record counted, or `None` on overflow.
    pub fn accumulate(self, record: &Record) -> Option<Self> {
        let row = &record.row;
        let weight = row.count;
        let mut next = self;
        next.total_records = next.total_records.checked_add(1)?;

        if let Some(spf) = row.spf_result.as_deref() {
            if spf == "pass" {
                next.spf_pass = next.spf_pass.checked_add(weight)?;
            } else {
                next.spf_fail = next.spf_fail.checked_add(weight)?;
            }
        }

        if let Some(dkim) = row.dkim_result.as_deref() {
            if dkim == "pass" {
                next.dkim_pass = next.dkim_pass.checked_add(weight)?;
            } else {
                next.dkim_fail = next.dkim_fail.checked_add(weight)?;
            }
        }

        match row.disposition.as_deref() {
            Some(disposition) => {
                if disposition == "none" {
                    next.disposition_pass = next.disposition_pass.checked_add(weight)?;
                    next.dmarc_pass = next.dmarc_pass.checked_add(weight)?;
                } else {
                    next.disposition_fail = next.disposition_fail.checked_add(weight)?;
                    next.dmarc_fail = next.dmarc_fail.checked_add(weight)?;
                }
            }
            None => {
                let aligned = row.spf_result.as_deref() == Some("pass")
                    || row.dkim_result.as_deref() == Some("pass");
                if aligned {
                    next.dmarc_pass = next.dmarc_pass.checked_add(weight)?;
                } else {
                    next.dmarc_fail = next.dmarc_fail.checked_add(weight)?;
                }
            }
        }

        Some(next)
    }

    /// Element-wise sum of two summaries, saturating at `u64::MAX`.
    pub fn merge(self, other: &ReportSummary) -> Self {
        ReportSummary {
            total_records: self.total_records.saturating_add(other.total_records),
            spf_pass: self.spf_pass.saturating_add(other.spf_pass),
            spf_fail: self.spf_fail.saturating_add(other.spf_fail),
            dkim_pass: self.dkim_pass.saturating_add(other.dkim_pass),
            dkim_fail: self.dkim_fail.saturating_add(other.dkim_fail),
            dmarc_pass: self.dmarc_pass.saturating_add(other.dmarc_pass),
            dmarc_fail: self.dmarc_fail.saturating_add(other.dmarc_fail),
            disposition_pass: self.disposition_pass.saturating_add(other.disposition_pass),
            disposition_fail: self.disposition_fail.saturating_add(other.disposition_fail),
        }
    }
}

/// A decoded aggregate report. A non-`None` `error` marks it as partial.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct DmarcReport {
    pub report_metadata: ReportMetadata,
    pub policy_published: PolicyPublished,
    pub records: Vec<Record>,
    pub summary: ReportSummary,
    pub error: Option<String>,
}

/// One successfully parsed report as listed in the batch summary.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReportEntry {
    pub file: PathBuf,
    pub date: String,
    pub report_id: String,
    pub domain: String,
    pub date_range_begin: i64,
    pub date_range_end: i64,
    pub summary: ReportSummary,
}

impl ReportEntry {
    pub fn from_report(file: PathBuf, date: impl Into<String>, report: &DmarcReport) -> Self {
        ReportEntry {
            file,
            date: date.into(),
            report_id: report.report_metadata.report_id.clone(),
            domain: report.policy_published.domain.clone(),
            date_range_begin: report.report_metadata.date_range.begin,
            date_range_end: report.report_metadata.date_range.end,
            summary: report.summary,
        }
    }
}

/// Result of processing a report tree.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct BatchSummary {
    pub total_files: usize,
    pub processed: usize,
    pub failed: usize,
    pub xml_files: Vec<PathBuf>,
    pub reports: Vec<ReportEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentMode {
    Relaxed,
    Strict,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PolicyType {
    None,
    Quarantine,
    Reject,
}

impl fmt::Display for AlignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentMode::Relaxed => write!(f, "relaxed"),
            AlignmentMode::Strict => write!(f, "strict"),
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::None => write!(f, "none"),
            PolicyType::Quarantine => write!(f, "quarantine"),
            PolicyType::Reject => write!(f, "reject"),
        }
    }
}

impl FromStr for AlignmentMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "r" | "relaxed" => Ok(AlignmentMode::Relaxed),
            "s" | "strict" => Ok(AlignmentMode::Strict),
            _ => Err(format!("Invalid alignment mode: {}", s)),
        }
    }
}

impl FromStr for PolicyType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(PolicyType::None),
            "quarantine" => Ok(PolicyType::Quarantine),
            "reject" => Ok(PolicyType::Reject),
            _ => Err(format!("Invalid policy type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(count: u64, disposition: Option<&str>, spf: Option<&str>, dkim: Option<&str>) -> Record {
        Record {
            row: Row {
                source_ip: "192.0.2.1".to_string(),
                count,
                disposition: disposition.map(str::to_string),
                dkim_result: dkim.map(str::to_string),
                spf_result: spf.map(str::to_string),
            },
            ..Record::default()
        }
    }

    #[test]
    fn test_dmarc_falls_back_to_spf_or_dkim() {
        let summary = ReportSummary::from_records(&[record(5, None, Some("pass"), Some("fail"))]).unwrap();
        assert_eq!(summary.dmarc_pass, 5);
        assert_eq!(summary.dmarc_fail, 0);
        assert_eq!(summary.spf_pass, 5);
        assert_eq!(summary.dkim_fail, 5);
        assert_eq!(summary.disposition_pass, 0);
        assert_eq!(summary.disposition_fail, 0);
    }

    #[test]
    fn test_disposition_overrides_fallback() {
        let summary =
            ReportSummary::from_records(&[record(3, Some("quarantine"), Some("pass"), None)]).unwrap();
        assert_eq!(summary.dmarc_fail, 3);
        assert_eq!(summary.dmarc_pass, 0);
        assert_eq!(summary.disposition_fail, 3);
        assert_eq!(summary.spf_pass, 3);
        assert_eq!(summary.dkim_pass + summary.dkim_fail, 0);
    }

    #[test]
    fn test_absent_results_count_neither_way() {
        let records = vec![
            record(4, Some("none"), Some("pass"), Some("pass")),
            record(6, Some("none"), None, Some("fail")),
        ];
        let summary = ReportSummary::from_records(&records).unwrap();
        assert_eq!(summary.total_records, 2);
        assert_eq!(summary.spf_pass + summary.spf_fail, 4);
        assert!(summary.spf_pass + summary.spf_fail < 10);
        assert_eq!(summary.dkim_pass, 4);
        assert_eq!(summary.dkim_fail, 6);
        assert_eq!(summary.disposition_pass, 10);
    }

    #[test]
    fn test_result_comparison_is_exact() {
        let summary = ReportSummary::from_records(&[record(2, Some("None"), Some("PASS"), None)]).unwrap();
        assert_eq!(summary.spf_fail, 2);
        assert_eq!(summary.disposition_fail, 2);
    }

    #[test]
    fn test_row_defaults() {
        let row = Row::default();
        assert_eq!(row.source_ip, "Unknown");
        assert_eq!(row.disposition(), "none");
        assert_eq!(row.spf_result(), "none");
        assert_eq!(row.dkim_result(), "none");
    }

    #[test]
    fn test_policy_helpers() {
        let policy = PolicyPublished {
            p: "Reject".to_string(),
            adkim: "s".to_string(),
            ..PolicyPublished::default()
        };
        assert_eq!(policy.policy(), Some(PolicyType::Reject));
        assert_eq!(policy.dkim_alignment(), Some(AlignmentMode::Strict));
        assert_eq!(policy.spf_alignment(), Some(AlignmentMode::Relaxed));
        assert_eq!(policy.subdomain_policy(), Some(PolicyType::None));
        assert!("bogus".parse::<PolicyType>().is_err());
    }

    #[test]
    fn test_overflowing_counts_fail_the_fold() {
        let records = vec![
            record(u64::MAX, Some("none"), Some("pass"), None),
            record(u64::MAX, Some("none"), Some("pass"), None),
        ];
        assert_eq!(ReportSummary::from_records(&records), None);
        assert!(ReportSummary::from_records(&records[..1]).is_some());

        let full = ReportSummary {
            spf_pass: u64::MAX,
            ..ReportSummary::default()
        };
        assert_eq!(full.merge(&full).spf_pass, u64::MAX);
    }

    #[test]
    fn test_absent_row_results_serialize_as_none() {
        let row = Row {
            count: 1,
            ..Row::default()
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["disposition"], "none");
        assert_eq!(json["dkim_result"], "none");
        assert_eq!(json["spf_result"], "none");
        assert_eq!(json["source_ip"], "Unknown");

        let evaluated = Row {
            spf_result: Some("fail".to_string()),
            ..row
        };
        assert_eq!(serde_json::to_value(&evaluated).unwrap()["spf_result"], "fail");
    }
}
