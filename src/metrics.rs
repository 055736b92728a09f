//! Server-side metrics scraped from the serving system
//!
//! The metrics document groups named entries into `histograms`, `meters` and
//! `counters`. Every entry is a single-key object whose key is
//! `<service>:<metric>`, for example
//! `{"resnet:batch_size": {"mean": "3.50", "count": 12}}`. Numbers may be
//! JSON numbers or numeric strings. Entries without that shape are skipped
//! with a warning; a document without the three sections is rejected.
//!
//! A [`MetricsCollector`] scrapes once per emitted stats snapshot and stores
//! the result in the aggregator's history.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::stats::StatsAggregator;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to fetch metrics from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Malformed metrics document: {0}")]
    Malformed(String),
}

/// Per-service figures extracted from one metrics document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetrics {
    /// Mean batch size per service
    pub batch_sizes: BTreeMap<String, f64>,
    /// Mean queue length per service
    pub queue_sizes: BTreeMap<String, f64>,
    /// Prediction rate per service, per second
    pub throughputs: BTreeMap<String, f64>,
    /// Predictions served per service
    pub counts: BTreeMap<String, u64>,
}

impl ServerMetrics {
    pub fn parse(doc: &Value) -> Result<Self, MetricsError> {
        let mut metrics = ServerMetrics::default();

        for (service, metric, fields) in section_entries(doc, "histograms")? {
            let target = match metric {
                "batch_size" => &mut metrics.batch_sizes,
                "queue_size" => &mut metrics.queue_sizes,
                _ => continue,
            };
            match number(fields, "mean") {
                Some(mean) => {
                    target.insert(service.to_string(), mean);
                }
                None => warn!("Skipping histogram {}:{} without a numeric mean", service, metric),
            }
        }

        for (service, metric, fields) in section_entries(doc, "meters")? {
            if metric != "prediction_throughput" {
                continue;
            }
            match number(fields, "rate") {
                Some(rate) => {
                    metrics.throughputs.insert(service.to_string(), rate);
                }
                None => warn!("Skipping meter {}:{} without a numeric rate", service, metric),
            }
        }

        for (service, metric, fields) in section_entries(doc, "counters")? {
            if metric != "num_predictions" {
                continue;
            }
            match number(fields, "count") {
                Some(count) if count >= 0.0 && count.fract() == 0.0 => {
                    metrics.counts.insert(service.to_string(), count as u64);
                }
                _ => warn!("Skipping counter {}:{} without an integer count", service, metric),
            }
        }

        Ok(metrics)
    }
}

/// `(service, metric, fields)` for every well-formed entry of `section`.
fn section_entries<'a>(
    doc: &'a Value,
    section: &str,
) -> Result<Vec<(&'a str, &'a str, &'a Value)>, MetricsError> {
    let entries = doc
        .get(section)
        .and_then(Value::as_array)
        .ok_or_else(|| MetricsError::Malformed(format!("missing '{}' array", section)))?;

    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(object) = entry.as_object().filter(|o| o.len() == 1) else {
            warn!("Skipping {} entry that is not a single-key object: {}", section, entry);
            continue;
        };
        let Some((name, fields)) = object.iter().next() else {
            continue;
        };
        match name.split_once(':') {
            Some((service, metric)) if fields.is_object() => {
                parsed.push((service, metric, fields))
            }
            _ => warn!("Skipping {} entry {:?}", section, name),
        }
    }
    Ok(parsed)
}

fn number(fields: &Value, key: &str) -> Option<f64> {
    let value = match fields.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

/// Fetches the metrics document over HTTP
#[derive(Debug, Clone)]
pub struct MetricsScraper {
    url: String,
    client: reqwest::Client,
}

impl MetricsScraper {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, MetricsError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetricsError::Fetch {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The parsed figures plus the raw document.
    pub async fn fetch(&self) -> Result<(ServerMetrics, Value), MetricsError> {
        let fetch_error = |reason: String| MetricsError::Fetch {
            url: self.url.clone(),
            reason,
        };
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_error(format!("status {}", resp.status())));
        }
        let doc: Value = resp
            .json()
            .await
            .map_err(|e| MetricsError::Malformed(e.to_string()))?;
        let metrics = ServerMetrics::parse(&doc)?;
        Ok((metrics, doc))
    }
}

/// Background task scraping server metrics after each stats snapshot
pub struct MetricsCollector {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MetricsCollector {
    pub fn spawn(scraper: MetricsScraper, stats: Arc<StatsAggregator>) -> Self {
        let snapshots = stats.subscribe();
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(collect(scraper, stats, snapshots, stop_rx));
        Self { stop, handle }
    }

    /// Stop collecting. A snapshot emitted since the last scrape gets one
    /// final scrape first.
    pub async fn finish(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            warn!("Metrics collector ended abnormally: {}", e);
        }
    }
}

async fn collect(
    scraper: MetricsScraper,
    stats: Arc<StatsAggregator>,
    mut snapshots: watch::Receiver<usize>,
    mut stop: oneshot::Receiver<()>,
) {
    debug!("Collecting server metrics from {}", scraper.url());
    loop {
        tokio::select! {
            biased;
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return;
                }
                let _ = snapshots.borrow_and_update();
                scrape_into(&scraper, &stats).await;
            }
            _ = &mut stop => break,
        }
    }
    if snapshots.has_changed().unwrap_or(false) {
        let _ = snapshots.borrow_and_update();
        scrape_into(&scraper, &stats).await;
    }
}

async fn scrape_into(scraper: &MetricsScraper, stats: &StatsAggregator) {
    match scraper.fetch().await {
        Ok((metrics, doc)) => {
            info!(
                "batch_sizes: {:?}, queue_sizes: {:?}, counts: {:?}",
                metrics.batch_sizes, metrics.queue_sizes, metrics.counts
            );
            stats.record_server_metrics(&metrics, doc);
        }
        Err(e) => warn!("Skipping metrics scrape: {}", e),
    }
}
