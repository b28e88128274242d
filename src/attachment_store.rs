//! Attachment Store Module
//!
//! Persists report attachments into `<base>/<YYYY-MM-DD>/<name>`. A file that is
//! already present with the same size is skipped. A different file under the same
//! name is written beside it with a time suffix, so nothing is ever overwritten.
use crate::models::{Attachment, StoredFile};
use chrono::{Local, NaiveDate, NaiveTime};
use std::fs;
use std::path::{Path, PathBuf};

const FALLBACK_NAME: &str = "attachment";

/// What happened to one attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(StoredFile),
    /// An identical-size file already exists at this path.
    Skipped(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base: PathBuf,
}

impl AttachmentStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Saves an attachment under the bucket for `date`.
    pub fn save(&self, attachment: &Attachment, date: NaiveDate) -> SaveOutcome {
        self.save_at(attachment, date, Local::now().time())
    }

    /// Like [`save`](Self::save) with an explicit clock for the collision suffix.
    pub fn save_at(&self, attachment: &Attachment, date: NaiveDate, now: NaiveTime) -> SaveOutcome {
        let date_dir = date.format("%Y-%m-%d").to_string();
        let bucket = self.base.join(&date_dir);
        if let Err(e) = fs::create_dir_all(&bucket) {
            return SaveOutcome::Failed(format!("cannot create {}: {}", bucket.display(), e));
        }

        let clean = sanitize_filename(&attachment.filename);
        let mut filename = clean.clone();
        let mut path = bucket.join(&filename);
        if let Ok(existing) = fs::metadata(&path) {
            if existing.len() == attachment.size {
                log::debug!("Skipped (already exists): {}/{}", date_dir, filename);
                return SaveOutcome::Skipped(path);
            }
            let stamp = now.format("%H%M%S").to_string();
            let mut counter = 0;
            loop {
                let tag = if counter == 0 {
                    stamp.clone()
                } else {
                    format!("{}_{}", stamp, counter)
                };
                filename = suffixed_name(&clean, &tag);
                path = bucket.join(&filename);
                if !path.exists() {
                    break;
                }
                counter += 1;
            }
        }

        if let Err(e) = fs::write(&path, &attachment.payload) {
            return SaveOutcome::Failed(format!("cannot write {}: {}", path.display(), e));
        }
        log::info!("Saved: {}/{} ({} bytes)", date_dir, filename, attachment.size);
        SaveOutcome::Saved(StoredFile {
            filename,
            original_filename: attachment.filename.clone(),
            date: date_dir,
            size: attachment.size,
            path,
        })
    }
}

/// Replaces path separators, control characters and `<>:"|?*` with `_`.
/// Blank names become `attachment`.
pub fn sanitize_filename(filename: &str) -> String {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    let cleaned: String = trimmed
        .chars()
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// `report.xml` + `101500` -> `report_101500.xml`. Only the last extension moves.
fn suffixed_name(filename: &str, tag: &str) -> String {
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, tag, ext.to_string_lossy()),
        None => format!("{}_{}", stem, tag),
    }
}
