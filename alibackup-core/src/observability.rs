/*!
Logging and metrics setup.

Logging goes through `tracing`; [`init_observability`] installs the global
subscriber. With the `metrics` feature, provider calls are counted and timed
in a Prometheus registry that [`PluginMetrics::gather_metrics`] renders in the
text exposition format.
*/

#[cfg(feature = "metrics")]
use once_cell::sync::OnceCell;
#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::time::Instant;
use std::future::Future;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{ApiError, PluginError, Result};

/// Filter applied when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_DIRECTIVE: &str = "alibackup=info";

/// Remote service a call is made against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Oss,
    Ecs,
    Metadata,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Oss => "oss",
            Provider::Ecs => "ecs",
            Provider::Metadata => "metadata",
        }
    }
}

#[cfg(feature = "metrics")]
static METRICS: OnceCell<PluginMetrics> = OnceCell::new();

/// Prometheus metrics for provider calls
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PluginMetrics {
    pub requests_total: CounterVec,
    pub errors_total: CounterVec,
    pub latency_seconds: HistogramVec,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl PluginMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let labels = &["provider", "operation"];
        let metric_error = |name: &str, e: prometheus::Error| {
            PluginError::config(format!("failed to create metric {name}: {e}"))
        };

        let requests_total = CounterVec::new(
            Opts::new("alibackup_requests_total", "Provider requests issued"),
            labels,
        )
        .map_err(|e| metric_error("alibackup_requests_total", e))?;
        let errors_total = CounterVec::new(
            Opts::new("alibackup_errors_total", "Provider requests that failed"),
            labels,
        )
        .map_err(|e| metric_error("alibackup_errors_total", e))?;
        let latency_seconds = HistogramVec::new(
            HistogramOpts::new("alibackup_latency_seconds", "Provider request duration in seconds"),
            labels,
        )
        .map_err(|e| metric_error("alibackup_latency_seconds", e))?;

        registry
            .register(Box::new(requests_total.clone()))
            .map_err(|e| metric_error("alibackup_requests_total", e))?;
        registry
            .register(Box::new(errors_total.clone()))
            .map_err(|e| metric_error("alibackup_errors_total", e))?;
        registry
            .register(Box::new(latency_seconds.clone()))
            .map_err(|e| metric_error("alibackup_latency_seconds", e))?;

        Ok(Self {
            requests_total,
            errors_total,
            latency_seconds,
            registry,
        })
    }

    /// Get or initialize the process-wide metrics
    pub fn global() -> Result<&'static PluginMetrics> {
        METRICS.get_or_try_init(Self::new)
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PluginError::config(format!("failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| PluginError::config(format!("metrics are not valid UTF-8: {e}")))
    }
}

/// Times one provider call; a no-op without the `metrics` feature.
pub struct MetricsTimer {
    #[cfg(feature = "metrics")]
    state: Option<(&'static PluginMetrics, [&'static str; 2], Instant)>,
}

impl MetricsTimer {
    /// Count a request and start timing it
    #[cfg(feature = "metrics")]
    pub fn start(provider: Provider, operation: &'static str) -> Self {
        let labels = [provider.as_str(), operation];
        let state = PluginMetrics::global().ok().map(|metrics| {
            metrics.requests_total.with_label_values(&labels).inc();
            (metrics, labels, Instant::now())
        });
        Self { state }
    }

    #[cfg(not(feature = "metrics"))]
    pub fn start(_provider: Provider, _operation: &'static str) -> Self {
        Self {}
    }

    /// Record the latency, and an error when `failed`
    #[cfg(feature = "metrics")]
    pub fn finish(self, failed: bool) {
        let Some((metrics, labels, start)) = self.state else {
            return;
        };
        metrics
            .latency_seconds
            .with_label_values(&labels)
            .observe(start.elapsed().as_secs_f64());
        if failed {
            metrics.errors_total.with_label_values(&labels).inc();
        }
    }

    #[cfg(not(feature = "metrics"))]
    pub fn finish(self, _failed: bool) {}

    /// Finish according to the outcome of `result`
    pub fn observe<T, E>(self, result: &std::result::Result<T, E>) {
        self.finish(result.is_err());
    }
}

/// Run one provider call under a [`MetricsTimer`], wrapping a failure with
/// the operation and resource it concerned.
pub async fn observed<T, F>(
    provider: Provider,
    operation: &'static str,
    resource: &str,
    call: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, ApiError>>,
{
    tracing::debug!(provider = provider.as_str(), operation, resource, "Calling provider");
    let timer = MetricsTimer::start(provider, operation);
    let result = call.await;
    timer.observe(&result);
    result.map_err(|source| PluginError::provider(operation, resource, source))
}

/// Install the global tracing subscriber.
///
/// # Arguments
/// * `json` - Emit JSON lines instead of human-readable output
///
/// # Errors
/// Fails when a global subscriber is already installed.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    PluginMetrics::global()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));

    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let subscriber = TracingRegistry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    set_global_default(subscriber).map_err(|e| {
        PluginError::config(format!("failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("alibackup observability initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_without_registry_side_effects() {
        let timer = MetricsTimer::start(Provider::Ecs, "DescribeDisks");
        let result: std::result::Result<(), &str> = Err("boom");
        timer.observe(&result);
    }

    #[tokio::test]
    async fn test_observed_wraps_failures_with_context() {
        let ok = observed(Provider::Oss, "HeadObject", "bucket/key", async {
            Ok::<_, ApiError>(7)
        })
        .await
        .unwrap();
        assert_eq!(ok, 7);

        let err = observed(Provider::Ecs, "DeleteSnapshot", "s-123", async {
            Err::<(), _>(ApiError::new("gone").with_code("InvalidSnapshotId.NotFound"))
        })
        .await
        .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("DeleteSnapshot failed for s-123"));
    }

    #[test]
    fn test_provider_labels() {
        assert_eq!(Provider::Oss.as_str(), "oss");
        assert_eq!(Provider::Ecs.as_str(), "ecs");
        assert_eq!(Provider::Metadata.as_str(), "metadata");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        let timer = MetricsTimer::start(Provider::Oss, "PutObject");
        timer.finish(true);

        let text = PluginMetrics::global().unwrap().gather_metrics().unwrap();
        assert!(text.contains("alibackup_requests_total"));
        assert!(text.contains("alibackup_errors_total"));
        assert!(text.contains("operation=\"PutObject\""));
    }
}
