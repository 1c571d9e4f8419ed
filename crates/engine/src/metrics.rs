//! Prometheus metrics for the cache engine.
//!
//! Exposes counters for transfers, queue processing and package operations.
//! Labels never carry site, file or component identifiers.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Transfer metrics
pub static FILES_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_files_downloaded_total",
        "Total number of files transferred into local storage",
    )
    .expect("metric creation failed")
});

pub static BYTES_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_bytes_downloaded_total",
        "Total bytes written to local storage by downloads",
    )
    .expect("metric creation failed")
});

pub static FILES_NOT_MODIFIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_files_not_modified_total",
        "Total conditional refreshes answered with not modified",
    )
    .expect("metric creation failed")
});

pub static DOWNLOAD_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "larder_download_failures_total",
            "Total failed downloads by failure class",
        ),
        &["class"],
    )
    .expect("metric creation failed")
});

pub static DOWNLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "larder_download_duration_seconds",
            "Time spent transferring one file",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

// Queue metrics
pub static QUEUE_ITEMS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "larder_queue_items_total",
            "Total queue entries processed by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "larder_queue_depth",
        "Entries waiting in the download queue",
    )
    .expect("metric creation failed")
});

// Package metrics
pub static PACKAGE_OPERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "larder_package_operations_total",
            "Total package downloads by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(FILES_DOWNLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_DOWNLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FILES_NOT_MODIFIED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DOWNLOAD_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DOWNLOAD_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUEUE_ITEMS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUEUE_DEPTH.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PACKAGE_OPERATIONS.clone()))
            .expect("metric registration failed");
    });
}

/// Encode all registered metrics in the text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Helper to record a failed download by class.
pub fn record_download_failure(class: &str) {
    DOWNLOAD_FAILURES.with_label_values(&[class]).inc();
}

/// Helper to record a processed queue entry by outcome.
pub fn record_queue_item(outcome: &str) {
    QUEUE_ITEMS.with_label_values(&[outcome]).inc();
}

/// Helper to record a finished package download by outcome.
pub fn record_package_operation(outcome: &str) {
    PACKAGE_OPERATIONS.with_label_values(&[outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // This would panic if any metric creation failed
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_render_includes_registered_metrics() {
        register_metrics();
        record_queue_item("downloaded");
        let text = render().unwrap();
        assert!(text.contains("larder_queue_items_total"));
    }
}
