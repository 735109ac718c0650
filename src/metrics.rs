//! Observability for migration runs
//!
//! With the `metrics` feature, counters and histograms are recorded through an
//! OpenTelemetry meter backed by a Prometheus registry; hosts scrape them with
//! [`TidemarkMetrics::encode`]. With the `tracing` feature, queries, transactions,
//! migration steps and version-gate waits are wrapped in spans.

#[cfg(feature = "metrics")]
pub use self::prometheus_metrics::{TidemarkMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider as _};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use std::time::Duration;

    pub static METRICS: Lazy<TidemarkMetrics> = Lazy::new(TidemarkMetrics::init);

    pub struct TidemarkMetrics {
        pub registry: prometheus::Registry,
        // Keeps the reader alive for as long as the instruments are used.
        _provider: SdkMeterProvider,
        pub queries_total: Counter<u64>,
        pub query_errors_total: Counter<u64>,
        pub query_duration: Histogram<f64>,
        pub steps_applied_total: Counter<u64>,
        pub steps_skipped_total: Counter<u64>,
        pub step_duration: Histogram<f64>,
        pub lock_contention_total: Counter<u64>,
        pub gate_polls_total: Counter<u64>,
    }

    impl TidemarkMetrics {
        pub fn init() -> Self {
            let registry = prometheus::Registry::new();
            let exporter = opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
                .expect("failed to build prometheus exporter");
            let provider = SdkMeterProvider::builder().with_reader(exporter).build();
            let meter = provider.meter("tidemark");

            let queries_total = meter
                .u64_counter("tidemark_queries_total")
                .with_description("Total statements executed by the migration engine")
                .build();

            let query_errors_total = meter
                .u64_counter("tidemark_query_errors_total")
                .with_description("Statements that returned an error")
                .build();

            let query_duration = meter
                .f64_histogram("tidemark_query_duration_seconds")
                .with_description("Duration of statements")
                .build();

            let steps_applied_total = meter
                .u64_counter("tidemark_steps_applied_total")
                .with_description("Migration steps applied and committed")
                .build();

            let steps_skipped_total = meter
                .u64_counter("tidemark_steps_skipped_total")
                .with_description("Migration steps found already finished in the ledger")
                .build();

            let step_duration = meter
                .f64_histogram("tidemark_step_duration_seconds")
                .with_description("Time from ledger insert to commit of an applied step")
                .build();

            let lock_contention_total = meter
                .u64_counter("tidemark_lock_contention_total")
                .with_description("Step attempts that found the ledger lock held elsewhere")
                .build();

            let gate_polls_total = meter
                .u64_counter("tidemark_gate_polls_total")
                .with_description("Ledger polls performed by the version gate")
                .build();

            Self {
                registry,
                _provider: provider,
                queries_total,
                query_errors_total,
                query_duration,
                steps_applied_total,
                steps_skipped_total,
                step_duration,
                lock_contention_total,
                gate_polls_total,
            }
        }

        pub fn record_query_duration(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_step_applied(&self, name: &str, elapsed: Duration) {
            let attributes = [KeyValue::new("migration", name.to_string())];
            self.steps_applied_total.add(1, &attributes);
            self.step_duration.record(elapsed.as_secs_f64(), &attributes);
        }

        pub fn record_step_skipped(&self) {
            self.steps_skipped_total.add(1, &[]);
        }

        pub fn record_lock_contention(&self) {
            self.lock_contention_total.add(1, &[]);
        }

        pub fn record_gate_poll(&self) {
            self.gate_polls_total.add(1, &[]);
        }

        /// Render every registered metric in the Prometheus text exposition format
        pub fn encode(&self) -> String {
            let encoder = prometheus::TextEncoder::new();
            encoder
                .encode_to_string(&self.registry.gather())
                .unwrap_or_else(|e| {
                    log::warn!("failed to encode metrics: {e}");
                    String::new()
                })
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::Span;

    const MAX_STATEMENT_LEN: usize = 120;

    fn statement_preview(query: &str) -> &str {
        let trimmed = query.trim();
        match trimmed.char_indices().nth(MAX_STATEMENT_LEN) {
            Some((idx, _)) => &trimmed[..idx],
            None => trimmed,
        }
    }

    pub fn execute_query_span(query: &str) -> Span {
        tracing::debug_span!("tidemark.query", db.statement = statement_preview(query))
    }

    pub fn acquire_connection_span() -> Span {
        tracing::debug_span!("tidemark.connect")
    }

    pub fn begin_transaction_span() -> Span {
        tracing::debug_span!("tidemark.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        tracing::debug_span!("tidemark.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        tracing::debug_span!("tidemark.transaction.rollback")
    }

    pub fn apply_step_span(ordinal: i64, name: &str) -> Span {
        tracing::info_span!("tidemark.migration.step", ordinal, step = name)
    }

    pub fn wait_for_span(target: i64) -> Span {
        tracing::info_span!("tidemark.migration.wait_for", target_ordinal = target)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_statement_preview_truncates_long_statements() {
            let long = format!("SELECT {}", "x".repeat(500));
            assert_eq!(statement_preview(&long).chars().count(), MAX_STATEMENT_LEN);
            assert_eq!(statement_preview("  SELECT 1  "), "SELECT 1");
        }
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::METRICS;
    use std::time::Duration;

    #[test]
    fn test_metrics_encode_includes_step_counters() {
        METRICS.record_step_applied("addcol", Duration::from_millis(5));
        METRICS.record_lock_contention();
        let text = METRICS.encode();
        assert!(text.contains("tidemark_steps_applied"), "missing counter in:\n{text}");
        assert!(text.contains("tidemark_lock_contention"), "missing counter in:\n{text}");
    }
}
