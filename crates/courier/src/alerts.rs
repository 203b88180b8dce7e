//! Default alert sink

use courier_traits::{Alert, AlertSeverity, AlertSink};

/// Writes alerts to the tracing pipeline. Used when no operator hook is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait::async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => tracing::error!(
                severity = "CRITICAL",
                kind = ?alert.kind,
                context = ?alert.context,
                "ALERT: {}",
                alert.message
            ),
            AlertSeverity::Warning => tracing::warn!(
                kind = ?alert.kind,
                context = ?alert.context,
                "ALERT: {}",
                alert.message
            ),
        }
    }
}
