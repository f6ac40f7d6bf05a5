use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

use crate::Error;

#[derive(Clone)]
pub struct MicMetrics {
    pub passes: Counter,
    pub pass_failures: Family<ErrorLabels, Counter>,
    pub cloud_operations: Family<CloudOperationLabels, Counter>,
    pub assigned_identities: Gauge,
    pub pass_duration: Histogram,
}

impl Default for MicMetrics {
    fn default() -> Self {
        Self {
            passes: Counter::default(),
            pass_failures: Family::default(),
            cloud_operations: Family::default(),
            assigned_identities: Gauge::default(),
            pass_duration: Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter()),
        }
    }
}

impl MicMetrics {
    /// Creates the metrics and registers them in `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register_with_unit(
            "pass_duration",
            "Duration of reconciliation passes",
            Unit::Seconds,
            metrics.pass_duration.clone(),
        );
        registry.register("passes", "Number of reconciliation passes", metrics.passes.clone());
        registry.register(
            "pass_failures",
            "Number of passes aborted before any cloud operation",
            metrics.pass_failures.clone(),
        );
        registry.register(
            "cloud_operations",
            "Number of attach and detach operations by outcome",
            metrics.cloud_operations.clone(),
        );
        registry.register(
            "assigned_identities",
            "Assigned identities recorded after the last pass",
            metrics.assigned_identities.clone(),
        );
        metrics
    }

    pub fn count_failure(&self, e: &Error) {
        self.pass_failures
            .get_or_create(&ErrorLabels {
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_cloud_operation(&self, operation: &str, outcome: &str) {
        self.cloud_operations
            .get_or_create(&CloudOperationLabels {
                operation: operation.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn count_and_measure(&self) -> PassMeasurer {
        self.passes.inc();
        PassMeasurer {
            start: Instant::now(),
            metric: self.pass_duration.clone(),
        }
    }
}

pub struct PassMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for PassMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CloudOperationLabels {
    pub operation: String,
    pub outcome: String,
}
