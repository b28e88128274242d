//! Configuration Module
//!
//! This module reads configuration values from environment variables, provides
//! sensible defaults, and validates key parameters such as maximum file sizes and
//! decompression limits. The resulting [`Config`] is built once at startup and
//! passed by reference to every component that needs it.

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub mail_dir: Option<PathBuf>,
    pub webhook_url: Option<String>,
    pub webhook_timeout: u64,
    pub webhook_retries: u32,
    pub max_file_size: usize,
    pub max_decompressed_size: usize,
    pub max_files_in_zip: usize,
    pub max_compression_ratio: f64,
    pub max_filename_length: usize,
    pub skip_extracted: bool,
    pub trend_days: u32,
    pub max_protocol_errors: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_dir: PathBuf::from("dmarc-report"),
            mail_dir: None,
            webhook_url: None,
            webhook_timeout: 30,
            webhook_retries: 3,
            max_file_size: 10 * 1024 * 1024,
            max_decompressed_size: 100 * 1024 * 1024,
            max_files_in_zip: 1000,
            max_compression_ratio: 1000.0,
            max_filename_length: 256,
            skip_extracted: true,
            trend_days: 7,
            max_protocol_errors: 3,
        }
    }
}

impl Config {
    /// Creates a new configuration by reading environment variables.
    /// If a variable is missing or empty, a default value is used.
    pub fn new() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let non_empty = |key: &str| {
            lookup(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let max_file_size = parse_var(&lookup, "DMARC_MAX_FILE_SIZE").unwrap_or(defaults.max_file_size);
        if max_file_size > 500_000_000 {
            return Err(anyhow::anyhow!("Max file size too large (500MB limit)"));
        }

        let trend_days = parse_var(&lookup, "DMARC_TREND_DAYS").unwrap_or(defaults.trend_days);
        if trend_days == 0 {
            return Err(anyhow::anyhow!("Trend window must cover at least one day"));
        }

        // For webhook_timeout, try DMARC_WEBHOOK_TIMEOUT_SECS then DMARC_WEBHOOK_TIMEOUT.
        let webhook_timeout = parse_var(&lookup, "DMARC_WEBHOOK_TIMEOUT_SECS")
            .or_else(|| parse_var(&lookup, "DMARC_WEBHOOK_TIMEOUT"))
            .unwrap_or(defaults.webhook_timeout);

        let skip_extracted = match non_empty("DMARC_SKIP_EXTRACTED") {
            Some(v) => !matches!(v.to_lowercase().as_str(), "0" | "false" | "no" | "off"),
            None => defaults.skip_extracted,
        };

        Ok(Config {
            base_dir: non_empty("DMARC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.base_dir),
            mail_dir: non_empty("DMARC_MAIL_DIR").map(PathBuf::from),
            webhook_url: non_empty("DMARC_WEBHOOK_URL"),
            webhook_timeout,
            webhook_retries: parse_var(&lookup, "DMARC_WEBHOOK_RETRIES").unwrap_or(defaults.webhook_retries),
            max_file_size,
            max_decompressed_size: parse_var(&lookup, "DMARC_MAX_DECOMPRESSED_SIZE")
                .unwrap_or(defaults.max_decompressed_size),
            max_files_in_zip: parse_var(&lookup, "DMARC_MAX_FILES_IN_ZIP").unwrap_or(defaults.max_files_in_zip),
            max_compression_ratio: parse_var(&lookup, "DMARC_MAX_COMPRESSION_RATIO")
                .unwrap_or(defaults.max_compression_ratio),
            max_filename_length: parse_var(&lookup, "DMARC_MAX_FILENAME_LENGTH")
                .unwrap_or(defaults.max_filename_length),
            skip_extracted,
            trend_days,
            max_protocol_errors: parse_var(&lookup, "DMARC_MAX_PROTOCOL_ERRORS")
                .unwrap_or(defaults.max_protocol_errors),
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.base_dir, PathBuf::from("dmarc-report"));
        assert!(config.mail_dir.is_none());
        assert!(config.webhook_url.is_none());
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.webhook_timeout, 30);
        assert_eq!(config.webhook_retries, 3);
        assert_eq!(config.max_decompressed_size, 100 * 1024 * 1024);
        assert_eq!(config.max_files_in_zip, 1000);
        assert_eq!(config.max_compression_ratio, 1000.0);
        assert_eq!(config.max_filename_length, 256);
        assert!(config.skip_extracted);
        assert_eq!(config.trend_days, 7);
        assert_eq!(config.max_protocol_errors, 3);
    }

    #[test]
    fn test_config_from_env() {
        let config = Config::from_lookup(lookup(&[
            ("DMARC_DIR", "/var/dmarc"),
            ("DMARC_MAIL_DIR", "/var/mail/reports"),
            ("DMARC_WEBHOOK_URL", "  http://example.com  "),
            ("DMARC_MAX_FILE_SIZE", "5242880"),
            ("DMARC_WEBHOOK_TIMEOUT", "60"),
            ("DMARC_MAX_DECOMPRESSED_SIZE", "10485760"),
            ("DMARC_MAX_FILES_IN_ZIP", "500"),
            ("DMARC_MAX_COMPRESSION_RATIO", "500.0"),
            ("DMARC_MAX_FILENAME_LENGTH", "128"),
            ("DMARC_SKIP_EXTRACTED", "false"),
            ("DMARC_TREND_DAYS", "14"),
            ("DMARC_MAX_PROTOCOL_ERRORS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/var/dmarc"));
        assert_eq!(config.mail_dir, Some(PathBuf::from("/var/mail/reports")));
        assert_eq!(config.webhook_url, Some("http://example.com".to_string()));
        assert_eq!(config.max_file_size, 5242880);
        assert_eq!(config.webhook_timeout, 60);
        assert_eq!(config.max_decompressed_size, 10485760);
        assert_eq!(config.max_files_in_zip, 500);
        assert_eq!(config.max_compression_ratio, 500.0);
        assert_eq!(config.max_filename_length, 128);
        assert!(!config.skip_extracted);
        assert_eq!(config.trend_days, 14);
        assert_eq!(config.max_protocol_errors, 5);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("DMARC_MAX_FILES_IN_ZIP", "lots"),
            ("DMARC_WEBHOOK_URL", "   "),
        ]))
        .unwrap();
        assert_eq!(config.max_files_in_zip, 1000);
        assert!(config.webhook_url.is_none());
    }

    #[test]
    fn test_rejects_oversized_limits() {
        assert!(Config::from_lookup(lookup(&[("DMARC_MAX_FILE_SIZE", "600000000")])).is_err());
        assert!(Config::from_lookup(lookup(&[("DMARC_TREND_DAYS", "0")])).is_err());
    }
}
