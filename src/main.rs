//! dmarc-ingest - DMARC aggregate report collector and analyzer
//!
//! This tool collects DMARC aggregate reports from mail, stores their attachments by
//! date, extracts nested archives and parses every report. It prints totals,
//! per-domain figures and daily trends.
//!
//! The tool outputs results in one of three formats: Table, CSV, or JSON.

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use colored::*;
use dmarc_ingest::aggregate::{DomainSummary, TrendBucket};
use dmarc_ingest::models::{BatchSummary, DmarcReport};
use dmarc_ingest::queries::{self, TotalsView};
use dmarc_ingest::webhook::WebhookHandler;
use dmarc_ingest::{
    collect_reports_within, AttachmentStore, CollectStats, Config, EmlDirectory, ExtractionStats, FileHandler, ScanBounds,
};
use prettytable::{row, Table};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

/// CLI arguments for dmarc-ingest.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "DMARC aggregate report collector and analyzer",
    long_about = "dmarc-ingest collects DMARC aggregate reports from .eml files, stores their \
                  attachments under <DIR>/<YYYY-MM-DD>/, extracts nested ZIP/GZIP archives and \
                  summarizes SPF, DKIM and DMARC results in total, per domain and per day."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Base directory of the date-partitioned report tree (overrides DMARC_DIR)
    #[arg(short = 'd', long, global = true)]
    output_dir: Option<PathBuf>,

    /// Output format: table, csv, json
    #[arg(short, long, default_value = "table", global = true)]
    output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan .eml files for reports, save their attachments and extract them
    Collect {
        /// Directory of .eml files (overrides DMARC_MAIL_DIR)
        #[arg(long)]
        mail_dir: Option<PathBuf>,
        /// Only messages from the last N days
        #[arg(long)]
        days: Option<u32>,
        /// Examine at most N messages
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Extract every archive in the report tree
    Extract,
    /// Parse every report and print the batch summary
    Process {
        /// Parse existing XML only, without extracting archives first
        #[arg(long)]
        no_extract: bool,
    },
    /// Show totals per policy domain
    Domains,
    /// Show daily totals over a rolling window
    Trends {
        /// Window length in days (overrides DMARC_TREND_DAYS)
        #[arg(long)]
        days: Option<u32>,
        /// Last day of the window, YYYY-MM-DD (defaults to today)
        #[arg(long)]
        anchor: Option<NaiveDate>,
    },
    /// Show one report in detail
    Show {
        /// Report ID as found in report_metadata
        report_id: String,
    },
    /// Print a stored XML document verbatim
    Raw {
        /// Path relative to the report directory
        path: String,
    },
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity.
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(if cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let mut config = Config::new().context("Failed to load configuration")?;
    if let Some(dir) = &cli.output_dir {
        config.base_dir = dir.clone();
    }
    let base_dir = config.base_dir.clone();
    let format = cli.output;

    if matches!(format, OutputFormat::Table) && !matches!(cli.command, Command::Raw { .. }) {
        println!(
            "{}\n{}\n",
            "dmarc-ingest - DMARC Aggregate Report Analyzer".bold().green(),
            format!("Report directory: {}", base_dir.display()).as_str().dimmed()
        );
    }

    match cli.command {
        Command::Collect { mail_dir, days, limit } => {
            let Some(mail_dir) = mail_dir.or_else(|| config.mail_dir.clone()) else {
                bail!("No mail directory configured (set DMARC_MAIL_DIR or pass --mail-dir)");
            };
            log::info!("Collecting reports from {}", mail_dir.display());
            let mut source = EmlDirectory::new(mail_dir);
            let store = AttachmentStore::new(&base_dir);
            let bounds = ScanBounds::new(days, limit, Local::now().date_naive());
            let stats = collect_reports_within(&mut source, &store, config.max_protocol_errors, bounds);
            print_collect(&stats, format)?;
            let extraction = FileHandler::new(config).extract_all(&base_dir);
            print_extraction(&extraction, format)?;
        }
        Command::Extract => {
            let stats = FileHandler::new(config).extract_all(&base_dir);
            print_extraction(&stats, format)?;
        }
        Command::Process { no_extract } => {
            let webhook = WebhookHandler::from_config(&config)?;
            let batch = FileHandler::new(config).process_directory(&base_dir, !no_extract);
            let totals = queries::totals(&batch);
            print_batch(&batch, &totals, format)?;
            if let Some(webhook) = webhook {
                log::info!("Sending results to webhook");
                webhook
                    .send(&totals, &queries::domains(&batch))
                    .await
                    .context("Failed to send webhook")?;
            }
        }
        Command::Domains => {
            let batch = FileHandler::new(config).process_directory(&base_dir, true);
            print_domains(&queries::domains(&batch), format)?;
        }
        Command::Trends { days, anchor } => {
            let days = days.unwrap_or(config.trend_days);
            let anchor = anchor.unwrap_or_else(|| Local::now().date_naive());
            let batch = FileHandler::new(config).process_directory(&base_dir, true);
            print_trends(&queries::trends(&batch, anchor, days).trends, format)?;
        }
        Command::Show { report_id } => {
            let batch = FileHandler::new(config).process_directory(&base_dir, true);
            let Some(detail) = queries::report_detail(&batch, &report_id) else {
                bail!("Report not found: {}", report_id);
            };
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&detail)?),
                OutputFormat::Csv => write_records_csv(&detail.details)?,
                OutputFormat::Table => print_report_table(&detail.details),
            }
        }
        Command::Raw { path } => {
            let bytes = queries::raw_document(&base_dir, &path)
                .with_context(|| format!("Cannot read {}", path))?;
            std::io::stdout().write_all(&bytes)?;
        }
    }

    log::debug!("Done");
    Ok(())
}

fn print_key_values(title: &str, rows: &[(&str, String)]) {
    println!("{}", title.bold().blue());
    let mut table = Table::new();
    for (key, value) in rows {
        table.add_row(row![b->key, value]);
    }
    table.printstd();
}

fn print_collect(stats: &CollectStats, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(stats)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            for file in &stats.files {
                wtr.serialize(file)?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => {
            print_key_values(
                "Collection",
                &[
                    ("Emails processed", stats.emails_processed.to_string()),
                    ("Report emails", stats.reports_found.to_string()),
                    ("Emails with attachments", stats.emails_with_attachments.to_string()),
                    ("Attachments found", stats.attachments_found.to_string()),
                    ("Saved", stats.saved.to_string()),
                    ("Skipped (already exists)", stats.skipped.to_string()),
                    ("Failed", stats.failed.to_string()),
                    ("Outside scan window", stats.outside_window.to_string()),
                ],
            );
            if stats.stopped_early {
                println!("{}", "Scan stopped early after repeated mail errors.".yellow());
            }
        }
    }
    Ok(())
}

fn print_extraction(stats: &ExtractionStats, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(stats)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            wtr.write_record(["path"])?;
            for path in &stats.produced_paths {
                wtr.write_record([path.display().to_string()])?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => print_key_values(
            "Extraction",
            &[
                ("Archives found", stats.total_candidates.to_string()),
                ("Extracted", stats.extracted.to_string()),
                ("Skipped (already extracted)", stats.skipped.to_string()),
                ("Failed", stats.failed.to_string()),
                ("Documents produced", stats.produced_paths.len().to_string()),
            ],
        ),
    }
    Ok(())
}

fn print_batch(batch: &BatchSummary, totals: &TotalsView, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(batch)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            wtr.write_record([
                "file", "date", "report_id", "domain", "begin", "end", "records", "spf_pass", "spf_fail",
                "dkim_pass", "dkim_fail", "dmarc_pass", "dmarc_fail",
            ])?;
            for entry in &batch.reports {
                let s = &entry.summary;
                wtr.write_record([
                    entry.file.display().to_string(),
                    entry.date.clone(),
                    entry.report_id.clone(),
                    entry.domain.clone(),
                    entry.date_range_begin.to_string(),
                    entry.date_range_end.to_string(),
                    s.total_records.to_string(),
                    s.spf_pass.to_string(),
                    s.spf_fail.to_string(),
                    s.dkim_pass.to_string(),
                    s.dkim_fail.to_string(),
                    s.dmarc_pass.to_string(),
                    s.dmarc_fail.to_string(),
                ])?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => {
            if batch.reports.is_empty() {
                println!("{}", "No DMARC reports found.".yellow());
            } else {
                let mut table = Table::new();
                table.add_row(row!["Date", "Report ID", "Domain", "Records", "SPF", "DKIM", "DMARC"]);
                for entry in &batch.reports {
                    let s = &entry.summary;
                    table.add_row(row![
                        entry.date,
                        entry.report_id,
                        entry.domain,
                        s.total_records,
                        format!("{}/{}", s.spf_pass, s.spf_fail),
                        format!("{}/{}", s.dkim_pass, s.dkim_fail),
                        format!("{}/{}", s.dmarc_pass, s.dmarc_fail)
                    ]);
                }
                table.printstd();
            }
            let s = &totals.summary;
            print_key_values(
                "Summary",
                &[
                    ("Files", totals.total_files.to_string()),
                    ("Processed", totals.processed.to_string()),
                    ("Failed", totals.failed.to_string()),
                    ("Records", s.totals.total_records.to_string()),
                    ("SPF pass", format!("{}%", s.spf_pass_pct)),
                    ("DKIM pass", format!("{}%", s.dkim_pass_pct)),
                    ("DMARC pass", format!("{}%", s.dmarc_pass_pct)),
                    ("Disposition none", format!("{}%", s.disposition_pass_pct)),
                ],
            );
        }
    }
    Ok(())
}

fn print_domains(domains: &[DomainSummary], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(domains)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            for domain in domains {
                wtr.serialize(domain)?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => {
            if domains.is_empty() {
                println!("{}", "No domains found.".yellow());
                return Ok(());
            }
            let mut table = Table::new();
            table.add_row(row!["Domain", "Reports", "Records", "SPF", "DKIM", "DMARC"]);
            for d in domains {
                table.add_row(row![
                    d.domain,
                    d.total_reports,
                    d.total_records,
                    format!("{}/{}", d.spf_pass, d.spf_fail),
                    format!("{}/{}", d.dkim_pass, d.dkim_fail),
                    format!("{}/{}", d.dmarc_pass, d.dmarc_fail)
                ]);
            }
            table.printstd();
        }
    }
    Ok(())
}

fn print_trends(trends: &[TrendBucket], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(trends)?),
        OutputFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(std::io::stdout());
            wtr.write_record(["date", "records", "spf_pass_pct", "dkim_pass_pct", "dmarc_pass_pct"])?;
            for bucket in trends {
                wtr.write_record([
                    bucket.date.to_string(),
                    bucket.totals.total_records.to_string(),
                    bucket.spf_pass_pct.to_string(),
                    bucket.dkim_pass_pct.to_string(),
                    bucket.dmarc_pass_pct.to_string(),
                ])?;
            }
            wtr.flush()?;
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.add_row(row!["Date", "Records", "SPF %", "DKIM %", "DMARC %"]);
            for bucket in trends {
                table.add_row(row![
                    bucket.date,
                    bucket.totals.total_records,
                    bucket.spf_pass_pct,
                    bucket.dkim_pass_pct,
                    bucket.dmarc_pass_pct
                ]);
            }
            table.printstd();
        }
    }
    Ok(())
}

fn print_report_table(report: &DmarcReport) {
    let meta = &report.report_metadata;
    let policy = &report.policy_published;
    println!("{}", "DMARC Report".bold().blue());
    println!("{}", "----------------------------".dimmed());
    println!("{}: {}", "Organization".bold(), meta.org_name);
    println!("{}: {}", "Report ID".bold(), meta.report_id);
    println!("{}: {} - {}", "Date range".bold(), meta.date_range.begin, meta.date_range.end);
    println!("{}: {}", "Domain".bold(), policy.domain);
    println!("{}: {}", "SPF Alignment".bold(), display_or_raw(policy.spf_alignment(), &policy.aspf));
    println!("{}: {}", "DKIM Alignment".bold(), display_or_raw(policy.dkim_alignment(), &policy.adkim));
    println!(
        "{}: {} (subdomains: {})",
        "Policy".bold(),
        display_or_raw(policy.policy(), &policy.p),
        display_or_raw(policy.subdomain_policy(), &policy.sp)
    );
    println!("{}: {}\n", "Percentage Applied".bold(), policy.pct);

    if report.records.is_empty() {
        println!("{}", "No DMARC records found.".yellow());
        return;
    }
    let mut table = Table::new();
    table.add_row(row!["Source IP", "Count", "Disposition", "SPF", "DKIM", "Header From"]);
    for record in &report.records {
        let row = &record.row;
        table.add_row(row![
            row.source_ip,
            row.count,
            row.disposition(),
            row.spf_result(),
            row.dkim_result(),
            record.header_from
        ]);
    }
    table.printstd();
}

/// The recognised value's display form, or the published text as-is.
fn display_or_raw<T: std::fmt::Display>(parsed: Option<T>, raw: &str) -> String {
    parsed.map(|value| value.to_string()).unwrap_or_else(|| raw.to_string())
}

fn write_records_csv(report: &DmarcReport) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(std::io::stdout());
    wtr.write_record(["source_ip", "count", "disposition", "spf", "dkim", "header_from"])?;
    for record in &report.records {
        let row = &record.row;
        wtr.write_record([
            row.source_ip.clone(),
            row.count.to_string(),
            row.disposition().to_string(),
            row.spf_result().to_string(),
            row.dkim_result().to_string(),
            record.header_from.clone(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
