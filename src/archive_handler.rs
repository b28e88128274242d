//! Archive Handler Module
//!
//! This module decodes report containers into terminal XML documents. The decode
//! chain is `zip -> {xml | gz}`, `gz -> xml` and `xml -> xml` (copied through).
//! Nested containers are handled with an explicit worklist rather than recursion,
//! and an intermediate `.gz` pulled out of a zip is removed only once its own decode
//! has succeeded.
//!
//! Size limits, member counts, compression ratios and member name lengths are
//! enforced from [`Config`]. Zip member paths are flattened to their last component,
//! so members can never be written outside the output directory.
use crate::config::Config;
use crate::error::{DmarcError, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

/// A pending unit of work in an extraction run.
#[derive(Debug, Clone, PartialEq)]
enum Task {
    /// Decode a file into the output directory. Intermediate files are removed
    /// once they decode successfully.
    Decode { path: PathBuf, intermediate: bool },
    RemoveIntermediate(PathBuf),
}

/// What one decode step produced.
#[derive(Debug)]
enum Decoded {
    /// Terminal documents.
    Documents(Vec<PathBuf>),
    /// Files unpacked from a zip, still to be decoded, in archive order.
    Members(Vec<PathBuf>),
}

/// Extracts report documents from ZIP, GZIP and XML files.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveExtractor<'a> {
    config: &'a Config,
}

impl<'a> ArchiveExtractor<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Decodes `source` into `output_dir` and returns the XML documents produced.
    ///
    /// Failures are logged and never propagate: a corrupt member only loses its own
    /// output, and an unreadable source yields an empty list. Files with any other
    /// suffix are ignored.
    pub fn extract(&self, source: &Path, output_dir: &Path) -> Vec<PathBuf> {
        let mut produced = Vec::new();
        if let Err(e) = fs::create_dir_all(output_dir) {
            log::warn!("Cannot create {}: {}", output_dir.display(), e);
            return produced;
        }

        let mut pending = vec![Task::Decode {
            path: source.to_path_buf(),
            intermediate: false,
        }];
        while let Some(task) = pending.pop() {
            match task {
                Task::Decode { path, intermediate } => match self.decode(&path, output_dir) {
                    Ok(Decoded::Documents(documents)) => {
                        produced.extend(documents);
                        if intermediate {
                            pending.push(Task::RemoveIntermediate(path));
                        }
                    }
                    Ok(Decoded::Members(members)) => {
                        // Reversed so members pop in archive order.
                        for member in members.into_iter().rev() {
                            let intermediate = has_suffix(&member, ".gz");
                            pending.push(Task::Decode {
                                path: member,
                                intermediate,
                            });
                        }
                    }
                    Err(e) => log::warn!("Error extracting {}: {}", path.display(), e),
                },
                Task::RemoveIntermediate(path) => {
                    if let Err(e) = fs::remove_file(&path) {
                        log::warn!("Could not remove {}: {}", path.display(), e);
                    }
                }
            }
        }
        produced
    }

    fn decode(&self, path: &Path, output_dir: &Path) -> Result<Decoded> {
        let size = fs::metadata(path)?.len();
        if size > self.config.max_file_size as u64 {
            return Err(DmarcError::FileTooLarge(format!(
                "File size {} bytes exceeds limit of {} bytes",
                size, self.config.max_file_size
            )));
        }

        if has_suffix(path, ".zip") {
            Ok(Decoded::Members(self.unpack_zip(path, output_dir)?))
        } else if has_suffix(path, ".gz") {
            Ok(Decoded::Documents(vec![self.decompress_gz(path, output_dir)?]))
        } else if has_suffix(path, ".xml") {
            Ok(Decoded::Documents(vec![copy_through(path, output_dir)?]))
        } else {
            log::debug!("Ignoring unsupported file {}", path.display());
            Ok(Decoded::Documents(Vec::new()))
        }
    }

    /// Writes the `.xml` and `.gz` members of a zip flat into `output_dir`.
    ///
    /// Only an unreadable archive or one with too many members fails as a whole. A
    /// member that breaks a limit or fails to write is logged and skipped, and the
    /// members written before and after it are still returned.
    fn unpack_zip(&self, path: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;
        if archive.len() > self.config.max_files_in_zip {
            return Err(DmarcError::Format(format!(
                "Too many files in archive: {}",
                archive.len()
            )));
        }

        let mut written = Vec::new();
        for index in 0..archive.len() {
            match self.unpack_member(&mut archive, index, output_dir) {
                Ok(Some(destination)) => written.push(destination),
                Ok(None) => {}
                Err(e) => log::warn!(
                    "Skipping member {} of {}: {}",
                    index,
                    path.display(),
                    e
                ),
            }
        }
        Ok(written)
    }

    fn unpack_member<R: Read + Seek>(
        &self,
        archive: &mut ZipArchive<R>,
        index: usize,
        output_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let mut member = archive.by_index(index)?;
        if member.is_dir() {
            return Ok(None);
        }
        let inner_name = member.name().to_string();
        let lower = inner_name.to_lowercase();
        if !(lower.ends_with(".xml") || lower.ends_with(".gz")) {
            log::debug!("Skipping zip member {}", inner_name);
            return Ok(None);
        }
        if inner_name.len() > self.config.max_filename_length {
            return Err(DmarcError::Format(format!("Filename too long: {}", inner_name)));
        }
        let Some(file_name) = flat_name(&inner_name) else {
            log::debug!("Skipping zip member without a usable name: {}", inner_name);
            return Ok(None);
        };

        let compressed_size = member.compressed_size();
        let uncompressed_size = member.size();
        if compressed_size > 0 {
            let compression_ratio = uncompressed_size as f64 / compressed_size as f64;
            if compression_ratio > self.config.max_compression_ratio {
                return Err(DmarcError::Format(format!(
                    "Suspicious compression ratio: {:.2}",
                    compression_ratio
                )));
            }
        }
        if uncompressed_size > self.config.max_decompressed_size as u64 {
            return Err(DmarcError::FileTooLarge(format!(
                "Member decompressed size too large: {} bytes",
                uncompressed_size
            )));
        }

        let destination = output_dir.join(file_name);
        write_limited(&mut member, &destination, self.config.max_decompressed_size)?;
        Ok(Some(destination))
    }

    /// Decompresses a `.gz` unless its destination document already exists.
    fn decompress_gz(&self, path: &Path, output_dir: &Path) -> Result<PathBuf> {
        let name = gz_destination_name(path)
            .ok_or_else(|| DmarcError::InvalidPath(path.display().to_string()))?;
        let destination = output_dir.join(name);
        if destination.exists() {
            log::debug!("Already extracted: {}", destination.display());
            return Ok(destination);
        }
        let file = File::open(path)?;
        let mut decoder = GzDecoder::new(BufReader::new(file));
        write_limited(&mut decoder, &destination, self.config.max_decompressed_size)?;
        Ok(destination)
    }
}

/// Name of the document a `.gz` decodes to: its stem, with `.xml` appended
/// unless the stem already ends in `.xml`.
pub fn gz_destination_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    if stem.is_empty() {
        return None;
    }
    if stem.to_lowercase().ends_with(".xml") {
        Some(stem)
    } else {
        Some(format!("{}.xml", stem))
    }
}

/// Case-insensitive suffix test on the file name.
pub fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase().ends_with(suffix))
        .unwrap_or(false)
}

/// Last path component of a zip member name.
fn flat_name(member_name: &str) -> Option<&str> {
    member_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

fn copy_through(path: &Path, output_dir: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| DmarcError::InvalidPath(path.display().to_string()))?;
    let destination = output_dir.join(name);
    if same_file(path, &destination) {
        return Ok(destination);
    }
    fs::copy(path, &destination)?;
    Ok(destination)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Streams `reader` into `destination` through a `.part` file, failing once more
/// than `limit` bytes come out.
fn write_limited<R: Read>(reader: &mut R, destination: &Path, limit: usize) -> Result<u64> {
    let file_name = destination
        .file_name()
        .ok_or_else(|| DmarcError::InvalidPath(destination.display().to_string()))?;
    let mut part_name = file_name.to_os_string();
    part_name.push(".part");
    let part = destination.with_file_name(part_name);

    let copied = {
        let mut out = File::create(&part)?;
        io::copy(&mut reader.take(limit as u64 + 1), &mut out)
    };
    let copied = match copied {
        Ok(copied) => copied,
        Err(e) => {
            let _ = fs::remove_file(&part);
            return Err(e.into());
        }
    };
    if copied > limit as u64 {
        let _ = fs::remove_file(&part);
        return Err(DmarcError::FileTooLarge(
            "Decompressed size too large".to_string(),
        ));
    }
    fs::rename(&part, destination)?;
    Ok(copied)
}
