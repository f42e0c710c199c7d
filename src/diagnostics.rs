//! Where unexpected failures are reported, beyond the log.

use std::sync::Mutex;

/// Receives failures nobody anticipated, such as a parser panicking.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, source: &str, resource: &str, message: &str);
}

/// Default sink: an `error` event on the `crawldex::diagnostics` target.
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, source: &str, resource: &str, message: &str) {
        tracing::error!(target: "crawldex::diagnostics", source, resource, message, "unexpected failure");
    }
}

/// Keeps reports in memory; for tests and embedding hosts that poll.
#[derive(Default)]
pub struct CollectingDiagnostics {
    reports: Mutex<Vec<(String, String, String)>>,
}

impl CollectingDiagnostics {
    pub fn reports(&self) -> Vec<(String, String, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl DiagnosticsSink for CollectingDiagnostics {
    fn report(&self, source: &str, resource: &str, message: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((source.to_string(), resource.to_string(), message.to_string()));
    }
}
