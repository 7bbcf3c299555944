//! Prometheus metrics for running matches.
//!
//! # Example
//!
//! ```rust,ignore
//! use kaos_match::metrics::MatchMetrics;
//!
//! let metrics = MatchMetrics::new()?;
//! metrics.matches_active.inc();
//!
//! // Prometheus text format
//! let output = metrics.gather()?;
//! ```

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::{MatchError, Result};

/// Match engine metrics over a private registry.
#[derive(Clone)]
pub struct MatchMetrics {
    registry: Registry,

    /// Matches currently running.
    pub matches_active: IntGauge,
    /// Matches created.
    pub matches_total: IntCounter,
    /// Loop invocations.
    pub ticks_total: IntCounter,
    /// Loop handler duration in seconds.
    pub tick_duration: Histogram,
    /// Broadcasts by delivery mode (immediate, deferred).
    pub broadcasts_total: IntCounterVec,
    /// Lifecycle calls that tore a match down, by call.
    pub handler_errors_total: IntCounterVec,
}

fn registration(e: prometheus::Error) -> MatchError {
    MatchError::Io(format!("metric registration failed: {}", e))
}

impl MatchMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let matches_active =
            IntGauge::new("kaos_match_active", "Matches currently running").map_err(registration)?;
        registry.register(Box::new(matches_active.clone())).map_err(registration)?;

        let matches_total =
            IntCounter::new("kaos_match_created_total", "Matches created").map_err(registration)?;
        registry.register(Box::new(matches_total.clone())).map_err(registration)?;

        let ticks_total = IntCounter::new("kaos_match_ticks_total", "Loop invocations").map_err(registration)?;
        registry.register(Box::new(ticks_total.clone())).map_err(registration)?;

        let tick_duration = Histogram::with_opts(
            HistogramOpts::new("kaos_match_tick_duration_seconds", "Loop handler duration")
                .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]),
        )
        .map_err(registration)?;
        registry.register(Box::new(tick_duration.clone())).map_err(registration)?;

        let broadcasts_total = IntCounterVec::new(
            Opts::new("kaos_match_broadcasts_total", "Broadcasts sent"),
            &["mode"],
        )
        .map_err(registration)?;
        registry.register(Box::new(broadcasts_total.clone())).map_err(registration)?;

        let handler_errors_total = IntCounterVec::new(
            Opts::new("kaos_match_handler_errors_total", "Fatal lifecycle call errors"),
            &["call"],
        )
        .map_err(registration)?;
        registry.register(Box::new(handler_errors_total.clone())).map_err(registration)?;

        Ok(Self {
            registry,
            matches_active,
            matches_total,
            ticks_total,
            tick_duration,
            broadcasts_total,
            handler_errors_total,
        })
    }

    /// Gather all metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MatchError::Io(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MatchError::Io(e.to_string()))
    }

    pub fn record_tick(&self, duration_secs: f64) {
        self.ticks_total.inc();
        self.tick_duration.observe(duration_secs);
    }

    pub fn record_broadcast(&self, deferred: bool) {
        let mode = if deferred { "deferred" } else { "immediate" };
        self.broadcasts_total.with_label_values(&[mode]).inc();
    }

    pub fn record_handler_error(&self, call: &str) {
        self.handler_errors_total.with_label_values(&[call]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = MatchMetrics::new().unwrap();
        metrics.matches_active.set(2);
        metrics.matches_total.inc();

        let output = metrics.gather().unwrap();
        assert!(output.contains("kaos_match_active 2"));
        assert!(output.contains("kaos_match_created_total 1"));
    }

    #[test]
    fn test_tick_and_broadcast_metrics() {
        let metrics = MatchMetrics::new().unwrap();
        metrics.record_tick(0.002);
        metrics.record_tick(0.004);
        metrics.record_broadcast(false);
        metrics.record_broadcast(true);
        metrics.record_handler_error("match_loop");

        let output = metrics.gather().unwrap();
        assert!(output.contains("kaos_match_ticks_total 2"));
        assert!(output.contains("kaos_match_tick_duration_seconds"));
        assert!(output.contains("mode=\"deferred\""));
        assert!(output.contains("call=\"match_loop\""));
    }
}
