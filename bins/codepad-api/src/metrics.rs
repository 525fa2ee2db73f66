// Prometheus counters exposed on GET /metrics.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Submissions by outcome: accepted, rejected, unavailable
    pub static ref SUBMISSIONS: IntCounterVec = register(IntCounterVec::new(
        Opts::new("codepad_submissions_total", "Submissions received by outcome"),
        &["outcome"],
    ));

    /// Polls by observed job state, plus not_found and invalid
    pub static ref POLLS: IntCounterVec = register(IntCounterVec::new(
        Opts::new("codepad_polls_total", "Poll requests by observed job state"),
        &["state"],
    ));
}

fn register(collector: prometheus::Result<IntCounterVec>) -> IntCounterVec {
    let collector = collector.expect("metric definition is valid");
    REGISTRY
        .register(Box::new(collector.clone()))
        .expect("metric registered once");
    collector
}

pub fn record_submission(outcome: &str) {
    SUBMISSIONS.with_label_values(&[outcome]).inc();
}

pub fn record_poll(state: &str) {
    POLLS.with_label_values(&[state]).inc();
}

/// Render the registry in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        record_submission("accepted");
        record_poll("queued");

        let text = render().unwrap();
        assert!(text.contains("codepad_submissions_total{outcome=\"accepted\"}"));
        assert!(text.contains("codepad_polls_total{state=\"queued\"}"));
    }
}
