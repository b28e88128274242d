//! dmarc-ingest Library
//!
//! This library provides the DMARC aggregate-report pipeline: classifying report mail,
//! storing attachments by date, extracting nested archives, parsing reports, and
//! aggregating them into totals, per-domain and trend views. Configuration, error
//! handling and webhook delivery live here as well.

pub mod aggregate;
pub mod archive_handler;
pub mod attachment_store;
pub mod classifier;
pub mod config;
pub mod error;
pub mod file_handlers;
pub mod mailbox;
pub mod models;
pub mod queries;
pub mod webhook;
pub mod xml_parser;

pub use archive_handler::ArchiveExtractor;
pub use attachment_store::{AttachmentStore, SaveOutcome};
pub use classifier::is_report;
pub use config::Config;
pub use error::{DmarcError, MailError};
pub use file_handlers::{ExtractionStats, FileHandler};
pub use mailbox::{collect_reports, collect_reports_within, CollectStats, EmlDirectory, MailSource, ScanBounds};
pub use xml_parser::{parse_dmarc_xml, parse_report_file};
