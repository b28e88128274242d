//! Webhook Module
//!
//! This module posts aggregated report views to a remote webhook. It supports
//! retries with exponential backoff and handles timeouts.
use crate::aggregate::DomainSummary;
use crate::config::Config;
use crate::queries::TotalsView;
use anyhow::{Context, Result};
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    totals: &'a TotalsView,
    domains: &'a [DomainSummary],
    timestamp: chrono::DateTime<chrono::Utc>,
    version: &'static str,
}

/// WebhookHandler is responsible for sending aggregated views to a webhook URL.
#[derive(Debug)]
pub struct WebhookHandler {
    client: Client,
    url: Url,
    max_retries: u32,
}

impl WebhookHandler {
    /// Creates a new WebhookHandler with the given URL, timeout, and retry count.
    pub fn new(url: impl AsRef<str>, timeout: Duration, max_retries: u32) -> Result<Self> {
        let url = Url::parse(url.as_ref()).context("Invalid webhook URL")?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url,
            max_retries,
        })
    }

    /// Builds a handler from the configured URL, if one is set.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        config
            .webhook_url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_secs(config.webhook_timeout), config.webhook_retries))
            .transpose()
    }

    /// Sends the totals and per-domain views.
    ///
    /// Retries are attempted with exponential backoff. Returns an error if all retries fail.
    pub async fn send(&self, totals: &TotalsView, domains: &[DomainSummary]) -> Result<()> {
        let payload = WebhookPayload {
            totals,
            domains,
            timestamp: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
        };
        let mut last_error = None;
        for retry in 0..=self.max_retries {
            if retry > 0 {
                let delay = Duration::from_secs(2u64.pow(retry - 1));
                log::info!("Retrying webhook send in {:?}...", delay);
                sleep(delay).await;
            }
            match self.client.post(self.url.clone()).json(&payload).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        log::info!("Successfully sent webhook (attempt {})", retry + 1);
                        return Ok(());
                    }
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unable to read response body".to_string());
                    log::warn!("Webhook attempt {} failed: HTTP {} - Response: {}", retry + 1, status, body);
                    last_error = Some(format!("HTTP {} - {}", status, body));
                }
                Err(e) => {
                    log::warn!("Webhook attempt {} encountered error: {}", retry + 1, e);
                    if e.is_timeout() {
                        last_error = Some("timeout".to_string());
                    } else {
                        last_error = Some(e.to_string());
                    }
                }
            }
        }
        Err(anyhow::anyhow!(
            "Webhook failed after {} attempts: {:?}",
            self.max_retries + 1,
            last_error
        ))
    }
}
