//! Logging and metrics.
//!
//! Metrics go through the `metrics` facade; no exporter is installed here.
//! Whatever recorder the host process installs receives them.

use crate::config::ObservabilityConfig;
use mediator_core::Phase;
use metrics::{describe_counter, describe_histogram};
use std::time::Duration;

/// Calls dispatched, by phase and outcome
pub const CALLS_TOTAL: &str = "mediator_calls_total";
/// Call latency, by phase
pub const CALL_DURATION_SECONDS: &str = "mediator_call_duration_seconds";
/// Phases aborted, by phase
pub const PHASE_ABORTS_TOTAL: &str = "mediator_phase_aborts_total";
/// Specs excluded by their condition, by phase
pub const CONDITIONS_EXCLUDED_TOTAL: &str = "mediator_conditions_excluded_total";

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns `false` (and logs a
/// warning) when a subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));

    let installed = if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
    };

    if !installed {
        tracing::warn!("Tracing subscriber already installed, skipping re-initialization");
    }
    installed
}

/// Register descriptions for every engine metric.
pub fn describe_metrics() {
    describe_counter!(CALLS_TOTAL, "Total number of downstream calls, by phase and outcome");
    describe_histogram!(
        CALL_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Downstream call latency, by phase"
    );
    describe_counter!(PHASE_ABORTS_TOTAL, "Total number of aborted phases");
    describe_counter!(
        CONDITIONS_EXCLUDED_TOTAL,
        "Total number of requests excluded by a falsy condition"
    );
}

/// Outcome label of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcomeLabel {
    /// Status accepted
    Success,
    /// Status rejected
    HttpFailure,
    /// No response at all
    Transport,
}

impl CallOutcomeLabel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HttpFailure => "http_failure",
            Self::Transport => "transport",
        }
    }
}

/// Thin recorder over the `metrics` macros.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record one settled call.
    pub fn call(self, phase: Phase, outcome: CallOutcomeLabel, elapsed: Duration) {
        metrics::counter!(CALLS_TOTAL, "phase" => phase.as_str(), "outcome" => outcome.as_str()).increment(1);
        metrics::histogram!(CALL_DURATION_SECONDS, "phase" => phase.as_str()).record(elapsed.as_secs_f64());
    }

    /// Record a phase abort.
    pub fn phase_aborted(self, phase: Phase) {
        metrics::counter!(PHASE_ABORTS_TOTAL, "phase" => phase.as_str()).increment(1);
    }

    /// Record specs excluded by their condition.
    pub fn conditions_excluded(self, phase: Phase, count: usize) {
        if count > 0 {
            metrics::counter!(CONDITIONS_EXCLUDED_TOTAL, "phase" => phase.as_str()).increment(count as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_a_no_op() {
        describe_metrics();
        let metrics = EngineMetrics;
        metrics.call(Phase::Lookup, CallOutcomeLabel::Success, Duration::from_millis(5));
        metrics.phase_aborted(Phase::Response);
        metrics.conditions_excluded(Phase::Lookup, 2);
    }

    #[test]
    fn second_install_reports_false() {
        let config = ObservabilityConfig::default();
        let first = init_tracing(&config);
        assert!(!init_tracing(&config) || !first);
    }
}
