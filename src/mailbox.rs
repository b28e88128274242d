//! Mailbox Module
//!
//! The boundary to whatever holds the report mail. A [`MailSource`] lists and
//! fetches messages; [`EmlDirectory`] is the bundled source over a directory of
//! `.eml` files. [`collect_reports`] runs the scan: fetch, classify, save. Several
//! protocol errors in a row, or a degraded session, stop the scan early.
use crate::attachment_store::{AttachmentStore, SaveOutcome};
use crate::classifier::is_report;
use crate::error::MailError;
use crate::models::{Attachment, BodyPart, MailMessage, StoredFile};
use chrono::{DateTime, Days, Local, NaiveDate};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

pub type MailResult<T> = std::result::Result<T, MailError>;

/// Content types whose text the classifier reads.
const BODY_CONTENT_TYPES: [&str; 4] = ["text/plain", "text/html", "application/xml", "text/xml"];

/// A store of messages that can be listed and fetched one by one.
pub trait MailSource {
    fn message_ids(&mut self) -> MailResult<Vec<String>>;
    fn fetch(&mut self, id: &str) -> MailResult<MailMessage>;
}

/// Messages stored as `.eml` files in one directory, in file-name order.
#[derive(Debug, Clone)]
pub struct EmlDirectory {
    dir: PathBuf,
}

impl EmlDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl MailSource for EmlDirectory {
    fn message_ids(&mut self) -> MailResult<Vec<String>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| MailError::SessionDegraded(format!("{}: {}", self.dir.display(), e)))?;
        let mut ids = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .map(|ext| ext.eq_ignore_ascii_case("eml"))
                    .unwrap_or(false)
            })
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    fn fetch(&mut self, id: &str) -> MailResult<MailMessage> {
        let path = self.dir.join(id);
        if Path::new(id).components().count() != 1 {
            return Err(MailError::Message(format!("invalid message id {}", id)));
        }
        let raw = fs::read(&path).map_err(|e| MailError::Message(format!("{}: {}", path.display(), e)))?;
        parse_message(id, &raw)
    }
}

/// Decodes a raw RFC 5322 message.
pub fn parse_message(id: &str, raw: &[u8]) -> MailResult<MailMessage> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Message(format!("cannot parse message {}", id)))?;

    let subject = parsed.subject().unwrap_or_default().to_string();
    // Keep the sender's offset so the date bucket is the sender's calendar day.
    let date = parsed
        .date()
        .and_then(|d| DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok());

    let attachments = parsed
        .attachments()
        .enumerate()
        .filter(|(_, part)| !part.contents().is_empty())
        .map(|(idx, part)| {
            let filename = part
                .attachment_name()
                .map(String::from)
                .unwrap_or_else(|| format!("attachment_{}", idx));
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            Attachment::new(filename, content_type, part.contents().to_vec())
        })
        .collect();

    let body_parts = parsed
        .parts
        .iter()
        .filter_map(|part| {
            let ct = part.content_type();
            let content_type = match ct {
                Some(ct) => match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub).to_lowercase(),
                    None => ct.ctype().to_lowercase(),
                },
                // Parts without a content type default to text/plain.
                None => "text/plain".to_string(),
            };
            if !BODY_CONTENT_TYPES.contains(&content_type.as_str()) {
                return None;
            }
            // Text parts come back from the parser already decoded to UTF-8.
            let charset = if matches!(part.body, PartType::Text(_) | PartType::Html(_)) {
                None
            } else {
                ct.and_then(|ct| ct.attribute("charset")).map(String::from)
            };
            Some(BodyPart {
                content_type,
                charset,
                payload: part.contents().to_vec(),
            })
        })
        .collect();

    Ok(MailMessage {
        id: id.to_string(),
        subject,
        date,
        attachments,
        body_parts,
    })
}

/// Limits on which messages a scan looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanBounds {
    /// Earliest message day to consider. Undated messages always qualify.
    pub since: Option<NaiveDate>,
    /// Most in-window messages to examine, in listing order.
    pub limit: Option<usize>,
}

impl ScanBounds {
    /// Bounds covering the last `days` days up to `today`; zero days means no window.
    pub fn new(days: Option<u32>, limit: Option<usize>, today: NaiveDate) -> Self {
        let since = days
            .filter(|days| *days > 0)
            .and_then(|days| today.checked_sub_days(Days::new(u64::from(days))));
        ScanBounds { since, limit }
    }

    fn admits(&self, message: &MailMessage) -> bool {
        match (self.since, message.date) {
            (Some(since), Some(date)) => date.date_naive() >= since,
            _ => true,
        }
    }
}

/// Counters for one collection scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectStats {
    pub emails_processed: usize,
    pub reports_found: usize,
    pub emails_with_attachments: usize,
    pub attachments_found: usize,
    pub saved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outside_window: usize,
    pub stopped_early: bool,
    pub files: Vec<StoredFile>,
}

/// Scans a mail source and saves the attachments of every report message.
///
/// Per-message and per-attachment failures are counted and skipped. The scan stops
/// with `stopped_early` set on a degraded session or after `max_protocol_errors`
/// consecutive protocol errors.
pub fn collect_reports<S>(source: &mut S, store: &AttachmentStore, max_protocol_errors: usize) -> CollectStats
where
    S: MailSource + ?Sized,
{
    collect_reports_within(source, store, max_protocol_errors, ScanBounds::default())
}

/// [`collect_reports`] restricted to messages inside `bounds`. Messages dated
/// before the window are counted in `outside_window` and otherwise ignored.
pub fn collect_reports_within<S>(
    source: &mut S,
    store: &AttachmentStore,
    max_protocol_errors: usize,
    bounds: ScanBounds,
) -> CollectStats
where
    S: MailSource + ?Sized,
{
    let mut stats = CollectStats::default();
    let ids = match source.message_ids() {
        Ok(ids) => ids,
        Err(e) => {
            log::warn!("Cannot list messages: {}", e);
            return stats;
        }
    };
    log::info!("Found {} message(s)", ids.len());

    let threshold = max_protocol_errors.max(1);
    let mut consecutive_protocol_errors = 0;
    for id in ids {
        if bounds.limit.is_some_and(|limit| stats.emails_processed >= limit) {
            log::info!("Message limit of {} reached", stats.emails_processed);
            break;
        }
        let fetched = source.fetch(&id);
        if let Ok(message) = &fetched {
            if !bounds.admits(message) {
                consecutive_protocol_errors = 0;
                stats.outside_window += 1;
                log::debug!("Outside the scan window: {}", id);
                continue;
            }
        }
        stats.emails_processed += 1;
        let message = match fetched {
            Ok(message) => {
                consecutive_protocol_errors = 0;
                message
            }
            Err(MailError::SessionDegraded(reason)) => {
                log::warn!("Session degraded at message {}: {}", id, reason);
                stats.failed += 1;
                stats.stopped_early = true;
                break;
            }
            Err(MailError::Protocol(reason)) => {
                consecutive_protocol_errors += 1;
                stats.failed += 1;
                log::warn!(
                    "Protocol error at message {} ({}/{}): {}",
                    id,
                    consecutive_protocol_errors,
                    threshold,
                    reason
                );
                if consecutive_protocol_errors >= threshold {
                    log::warn!("Too many consecutive protocol errors, stopping scan");
                    stats.stopped_early = true;
                    break;
                }
                continue;
            }
            Err(e @ MailError::Message(_)) => {
                consecutive_protocol_errors = 0;
                log::warn!("Skipping message {}: {}", id, e);
                stats.failed += 1;
                continue;
            }
        };

        if !is_report(&message.subject, &message.attachments, &message.body_parts) {
            log::debug!("Not a report: {}", message.subject);
            continue;
        }
        stats.reports_found += 1;
        if message.attachments.is_empty() {
            continue;
        }
        stats.emails_with_attachments += 1;
        stats.attachments_found += message.attachments.len();

        let date = message_date(&message);
        for attachment in &message.attachments {
            match store.save(attachment, date) {
                SaveOutcome::Saved(file) => {
                    stats.saved += 1;
                    stats.files.push(file);
                }
                SaveOutcome::Skipped(_) => stats.skipped += 1,
                SaveOutcome::Failed(reason) => {
                    log::warn!("Failed to save {}: {}", attachment.filename, reason);
                    stats.failed += 1;
                }
            }
        }
    }

    log::info!(
        "Collection finished: {} messages, {} reports, {} saved, {} skipped, {} failed",
        stats.emails_processed,
        stats.reports_found,
        stats.saved,
        stats.skipped,
        stats.failed
    );
    stats
}

/// Calendar day of a message in its own offset, or today when it has no date.
pub fn message_date(message: &MailMessage) -> NaiveDate {
    message
        .date
        .map(|date| date.date_naive())
        .unwrap_or_else(|| Local::now().date_naive())
}
