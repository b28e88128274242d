//! Error Handling Module
//!
//! This module defines custom error types for the ingestion pipeline using the
//! `thiserror` crate. Batch entry points never surface these to callers directly;
//! they are logged and folded into failure counters or `error` fields.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DmarcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Invalid format: {0}")]
    Format(String),

    #[error("File too large: {0}")]
    FileTooLarge(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, DmarcError>;

/// Errors raised by a mail source while listing or fetching messages.
#[derive(Error, Debug)]
pub enum MailError {
    /// A protocol-level failure talking to the mail store. Several in a row trip
    /// the scan's circuit breaker.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session is no longer usable; the scan stops immediately.
    #[error("Session degraded: {0}")]
    SessionDegraded(String),

    /// A single message could not be read or decoded.
    #[error("Message error: {0}")]
    Message(String),
}
