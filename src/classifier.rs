//! Classifier Module
//!
//! Decides whether a fetched message carries an aggregate report. The decision is
//! an ordered list of named gates evaluated left to right; the first gate that
//! matches settles it. A gate that errors is logged and counts as no match.
use crate::models::{Attachment, BodyPart};
use encoding_rs::{Encoding, UTF_8};
use lazy_static::lazy_static;
use regex::RegexSet;
use std::borrow::Cow;

lazy_static! {
    static ref SUBJECT_PATTERNS: Result<RegexSet, regex::Error> = RegexSet::new([
        r"report\s+domain\s*:",
        r"report-id\s*:",
        r"submitter\s*:",
        r"dmarc\s+aggregate\s+report",
        r"dmarc\s+failure\s+report",
        r"domain-based\s+message\s+authentication.*report",
    ]);
}

const REPORT_EXTENSIONS: [&str; 3] = [".zip", ".gz", ".xml"];
const FILENAME_DELIMITER: char = '!';
const TEXT_CONTENT_TYPES: [&str; 4] = ["text/plain", "text/html", "application/xml", "text/xml"];
const BODY_MARKERS: [&str; 3] = ["report domain:", "report-id:", "submitter:"];

/// Outcome of a single gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Match,
    NoMatch,
    Error(String),
}

impl From<bool> for Verdict {
    fn from(matched: bool) -> Self {
        if matched {
            Verdict::Match
        } else {
            Verdict::NoMatch
        }
    }
}

/// The parts of a message the gates look at.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub subject: &'a str,
    pub attachments: &'a [Attachment],
    pub body_parts: &'a [BodyPart],
}

/// A named predicate over a candidate message.
pub struct Gate {
    pub name: &'static str,
    pub check: fn(&Candidate<'_>) -> Verdict,
}

/// Gates in evaluation order.
pub const GATES: [Gate; 3] = [
    Gate {
        name: "subject",
        check: subject_gate,
    },
    Gate {
        name: "attachment-name",
        check: attachment_gate,
    },
    Gate {
        name: "body-content",
        check: body_gate,
    },
];

/// Returns true when any gate matches.
pub fn is_report(subject: &str, attachments: &[Attachment], body_parts: &[BodyPart]) -> bool {
    let candidate = Candidate {
        subject,
        attachments,
        body_parts,
    };
    for gate in &GATES {
        match (gate.check)(&candidate) {
            Verdict::Match => {
                log::debug!("Gate '{}' matched: {}", gate.name, subject);
                return true;
            }
            Verdict::NoMatch => {}
            Verdict::Error(reason) => {
                log::warn!("Gate '{}' failed: {}", gate.name, reason);
            }
        }
    }
    false
}

/// A report-style subject that also names a report domain or report id.
pub fn subject_gate(candidate: &Candidate<'_>) -> Verdict {
    let patterns = match SUBJECT_PATTERNS.as_ref() {
        Ok(patterns) => patterns,
        Err(e) => return Verdict::Error(e.to_string()),
    };
    let subject = candidate.subject.to_lowercase();
    let specific = subject.contains("report domain") || subject.contains("report-id");
    Verdict::from(specific && patterns.is_match(&subject))
}

/// An attachment named the way report generators name them, e.g.
/// `receiver!domain!begin!end.xml.gz`.
pub fn attachment_gate(candidate: &Candidate<'_>) -> Verdict {
    Verdict::from(candidate.attachments.iter().any(|attachment| {
        let name = attachment.filename.to_lowercase();
        REPORT_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) && name.contains(FILENAME_DELIMITER)
    }))
}

/// Report XML or report header lines in the message body.
pub fn body_gate(candidate: &Candidate<'_>) -> Verdict {
    let text = candidate
        .body_parts
        .iter()
        .filter(|part| is_text_part(part))
        .map(|part| decode_part(part).to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");

    let embedded_xml = text.contains("<feedback")
        && (text.contains("<report_metadata") || text.contains("<policy_published"));
    let header_lines = BODY_MARKERS.iter().all(|marker| text.contains(marker));
    Verdict::from(embedded_xml || header_lines)
}

fn is_text_part(part: &BodyPart) -> bool {
    let content_type = part.content_type.to_lowercase();
    TEXT_CONTENT_TYPES
        .iter()
        .any(|t| content_type.trim().starts_with(t))
}

/// Decodes a body part with its declared charset. Unknown charsets yield no text.
fn decode_part(part: &BodyPart) -> Cow<'_, str> {
    let encoding = match part.charset.as_deref() {
        Some(label) => match Encoding::for_label(label.trim().as_bytes()) {
            Some(encoding) => encoding,
            None => {
                log::debug!("Unknown charset '{}', ignoring body part", label);
                return Cow::Borrowed("");
            }
        },
        None => UTF_8,
    };
    let (text, _, had_errors) = encoding.decode(&part.payload);
    if had_errors {
        log::debug!("Body part contained malformed {} sequences", encoding.name());
    }
    text
}
