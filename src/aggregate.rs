//! Aggregation Module
//!
//! Folds per-report summaries into a grand total, per-domain totals and a rolling
//! window of daily buckets. Reports carrying a parse error never contribute.
//! All views are recomputed on demand and never persisted.
use crate::models::{DmarcReport, ReportEntry, ReportSummary};
use chrono::{DateTime, Days, NaiveDate};
use serde::Serialize;

/// Anything that carries a per-report summary.
pub trait Summarized {
    fn domain(&self) -> &str;
    fn date_range(&self) -> (i64, i64);
    fn summary(&self) -> &ReportSummary;

    /// Whether the report may be aggregated.
    fn is_valid(&self) -> bool {
        true
    }
}

impl Summarized for DmarcReport {
    fn domain(&self) -> &str {
        &self.policy_published.domain
    }

    fn date_range(&self) -> (i64, i64) {
        let range = &self.report_metadata.date_range;
        (range.begin, range.end)
    }

    fn summary(&self) -> &ReportSummary {
        &self.summary
    }

    fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

// Entries only exist for reports that parsed cleanly.
impl Summarized for ReportEntry {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn date_range(&self) -> (i64, i64) {
        (self.date_range_begin, self.date_range_end)
    }

    fn summary(&self) -> &ReportSummary {
        &self.summary
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub total_reports: usize,
    #[serde(flatten)]
    pub totals: ReportSummary,
    pub spf_pass_pct: f64,
    pub dkim_pass_pct: f64,
    pub dmarc_pass_pct: f64,
    pub disposition_pass_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainSummary {
    pub domain: String,
    pub total_reports: usize,
    pub total_records: u64,
    pub spf_pass: u64,
    pub spf_fail: u64,
    pub dkim_pass: u64,
    pub dkim_fail: u64,
    pub dmarc_pass: u64,
    pub dmarc_fail: u64,
}

impl DomainSummary {
    fn new(domain: &str) -> Self {
        DomainSummary {
            domain: domain.to_string(),
            total_reports: 0,
            total_records: 0,
            spf_pass: 0,
            spf_fail: 0,
            dkim_pass: 0,
            dkim_fail: 0,
            dmarc_pass: 0,
            dmarc_fail: 0,
        }
    }

    fn add(&mut self, summary: &ReportSummary) {
        self.total_reports += 1;
        self.total_records = self.total_records.saturating_add(summary.total_records);
        self.spf_pass = self.spf_pass.saturating_add(summary.spf_pass);
        self.spf_fail = self.spf_fail.saturating_add(summary.spf_fail);
        self.dkim_pass = self.dkim_pass.saturating_add(summary.dkim_pass);
        self.dkim_fail = self.dkim_fail.saturating_add(summary.dkim_fail);
        self.dmarc_pass = self.dmarc_pass.saturating_add(summary.dmarc_pass);
        self.dmarc_fail = self.dmarc_fail.saturating_add(summary.dmarc_fail);
    }
}

/// One calendar day of the trend window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendBucket {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub totals: ReportSummary,
    pub spf_pass_pct: f64,
    pub dkim_pass_pct: f64,
    pub dmarc_pass_pct: f64,
}

/// The summary of one report: the fold over its records. `None` when the
/// weighted tallies overflow.
pub fn summarize_one(report: &DmarcReport) -> Option<ReportSummary> {
    ReportSummary::from_records(&report.records)
}

/// `pass / (pass + fail) * 100`, rounded to two decimals; zero when nothing was counted.
pub fn pass_pct(pass: u64, fail: u64) -> f64 {
    if pass == 0 && fail == 0 {
        return 0.0;
    }
    (pass as f64 / (pass as f64 + fail as f64) * 10_000.0).round() / 100.0
}

pub fn summarize_total<R: Summarized>(reports: &[R]) -> AggregateSummary {
    let (total_reports, totals) = reports
        .iter()
        .filter(|r| r.is_valid())
        .fold((0, ReportSummary::default()), |(n, acc), r| (n + 1, acc.merge(r.summary())));
    AggregateSummary {
        total_reports,
        totals,
        spf_pass_pct: pass_pct(totals.spf_pass, totals.spf_fail),
        dkim_pass_pct: pass_pct(totals.dkim_pass, totals.dkim_fail),
        dmarc_pass_pct: pass_pct(totals.dmarc_pass, totals.dmarc_fail),
        disposition_pass_pct: pass_pct(totals.disposition_pass, totals.disposition_fail),
    }
}

/// Per-domain totals in order of each domain's first appearance.
pub fn summarize_by_domain<R: Summarized>(reports: &[R]) -> Vec<DomainSummary> {
    let mut domains: Vec<DomainSummary> = Vec::new();
    for report in reports.iter().filter(|r| r.is_valid()) {
        let position = match domains.iter().position(|d| d.domain == report.domain()) {
            Some(position) => position,
            None => {
                domains.push(DomainSummary::new(report.domain()));
                domains.len() - 1
            }
        };
        domains[position].add(report.summary());
    }
    domains
}

/// `window_days` daily buckets ending at `anchor`, oldest first.
///
/// A report counts in full towards every day between the UTC calendar dates of its
/// range's begin and end, inclusive.
pub fn summarize_trend<R: Summarized>(reports: &[R], anchor: NaiveDate, window_days: u32) -> Vec<TrendBucket> {
    let spans: Vec<(NaiveDate, NaiveDate, &ReportSummary)> = reports
        .iter()
        .filter(|r| r.is_valid())
        .filter_map(|r| {
            let (begin, end) = r.date_range();
            Some((utc_date(begin)?, utc_date(end)?, r.summary()))
        })
        .collect();

    (0..window_days)
        .rev()
        .filter_map(|offset| anchor.checked_sub_days(Days::new(u64::from(offset))))
        .map(|date| {
            let totals = spans
                .iter()
                .filter(|(begin, end, _)| *begin <= date && date <= *end)
                .fold(ReportSummary::default(), |acc, (_, _, summary)| acc.merge(summary));
            TrendBucket {
                date,
                totals,
                spf_pass_pct: pass_pct(totals.spf_pass, totals.spf_fail),
                dkim_pass_pct: pass_pct(totals.dkim_pass, totals.dkim_fail),
                dmarc_pass_pct: pass_pct(totals.dmarc_pass, totals.dmarc_fail),
            }
        })
        .collect()
}

fn utc_date(timestamp: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DateRange, PolicyPublished, Record, ReportMetadata, Row};
    use std::path::PathBuf;

    fn record(count: u64, disposition: Option<&str>, dkim: Option<&str>, spf: Option<&str>) -> Record {
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

    fn report(domain: &str, begin: i64, end: i64, records: Vec<Record>) -> DmarcReport {
        let summary = ReportSummary::from_records(&records).unwrap_or_default();
        DmarcReport {
            report_metadata: ReportMetadata {
                date_range: DateRange { begin, end },
                ..ReportMetadata::default()
            },
            policy_published: PolicyPublished {
                domain: domain.to_string(),
                ..PolicyPublished::default()
            },
            records,
            summary,
            error: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn midnight(d: u32) -> i64 {
        day(d).and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp()
    }

    #[test]
    fn test_zero_denominator_percentages() {
        let total = summarize_total::<DmarcReport>(&[]);
        assert_eq!(total.total_reports, 0);
        assert_eq!(total.spf_pass_pct, 0.0);
        assert_eq!(total.dkim_pass_pct, 0.0);
        assert_eq!(total.dmarc_pass_pct, 0.0);
        assert_eq!(total.disposition_pass_pct, 0.0);

        // Records with no policy-evaluated elements leave spf and dkim at zero.
        let bare = report("example.com", 0, 0, vec![record(4, None, None, None)]);
        let total = summarize_total(&[bare]);
        assert_eq!(total.spf_pass_pct, 0.0);
        assert_eq!(total.dmarc_pass_pct, 0.0);
        assert_eq!(total.totals.dmarc_fail, 4);
    }

    #[test]
    fn test_total_rounds_and_skips_errored_reports() {
        let good = report(
            "example.com",
            0,
            0,
            vec![
                record(1, Some("none"), Some("pass"), Some("pass")),
                record(2, Some("reject"), Some("fail"), Some("fail")),
            ],
        );
        let mut broken = report("example.com", 0, 0, vec![record(100, Some("none"), Some("pass"), Some("pass"))]);
        broken.error = Some("Parse error: truncated".to_string());

        let total = summarize_total(&[good, broken]);
        assert_eq!(total.total_reports, 1);
        assert_eq!(total.totals.total_records, 2);
        assert_eq!(total.totals.spf_pass, 1);
        assert_eq!(total.spf_pass_pct, 33.33);
        assert_eq!(total.disposition_pass_pct, 33.33);
    }

    #[test]
    fn test_by_domain_first_appearance_order() {
        let reports = [
            report("b.example", 0, 0, vec![record(3, Some("none"), Some("pass"), Some("fail"))]),
            report("a.example", 0, 0, vec![record(1, Some("none"), Some("pass"), Some("pass"))]),
            report("b.example", 0, 0, vec![record(2, None, Some("fail"), Some("pass"))]),
        ];
        let domains = summarize_by_domain(&reports);
        assert_eq!(
            domains.iter().map(|d| d.domain.as_str()).collect::<Vec<_>>(),
            ["b.example", "a.example"]
        );
        let b = &domains[0];
        assert_eq!(b.total_reports, 2);
        assert_eq!(b.total_records, 2);
        assert_eq!(b.spf_pass, 2);
        assert_eq!(b.spf_fail, 3);
        assert_eq!(b.dkim_pass, 3);
        assert_eq!(b.dkim_fail, 2);
        assert_eq!(b.dmarc_pass, 5);
    }

    #[test]
    fn test_trend_covers_every_day_in_range() {
        // Covers 2024-01-01 through 2024-01-03.
        let spanning = report(
            "example.com",
            midnight(1),
            midnight(3) + 3600,
            vec![record(5, Some("none"), Some("pass"), Some("pass"))],
        );
        let trend = summarize_trend(&[spanning], day(7), 7);
        assert_eq!(trend.len(), 7);
        assert_eq!(trend.first().map(|b| b.date), Some(day(1)));
        assert_eq!(trend.last().map(|b| b.date), Some(day(7)));
        for bucket in &trend[..3] {
            assert_eq!(bucket.totals.spf_pass, 5);
            assert_eq!(bucket.spf_pass_pct, 100.0);
        }
        for bucket in &trend[3..] {
            assert_eq!(bucket.totals, ReportSummary::default());
            assert_eq!(bucket.dmarc_pass_pct, 0.0);
        }
    }

    #[test]
    fn test_trend_over_batch_entries() {
        let parsed = report("example.com", midnight(6), midnight(6) + 86_399, vec![record(2, None, Some("pass"), None)]);
        let entry = ReportEntry::from_report(PathBuf::from("r.xml"), "2024-01-06", &parsed);
        let trend = summarize_trend(&[entry], day(7), 2);
        assert_eq!(trend.len(), 2);
        assert_eq!(trend[0].date, day(6));
        assert_eq!(trend[0].totals.dmarc_pass, 2);
        assert_eq!(trend[1].totals.total_records, 0);
        assert!(summarize_trend(&[parsed], day(7), 0).is_empty());
    }

    #[test]
    fn test_summarize_one_matches_parse_summary() {
        let r = report("example.com", 0, 0, vec![record(5, None, Some("fail"), Some("pass"))]);
        let s = summarize_one(&r).unwrap();
        assert_eq!(s, r.summary);
        assert_eq!(s.dmarc_pass, 5);
        assert_eq!(s.spf_pass, 5);
        assert_eq!(s.dkim_fail, 5);
        assert_eq!(s.disposition_pass + s.disposition_fail, 0);
    }
}
