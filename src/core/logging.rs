// src/core/logging.rs
use std::sync::atomic::{AtomicU64, Ordering};

use super::timestamp::utc_ns_now;

// Global sequence number so interleaved component logs can be correlated
static LOG_SEQUENCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct LogContext {
    pub component: String,
    pub instance_id: String,
    pub session: Option<String>,
    pub sequence: u64,
    pub timestamp_ns: u64,
}

impl LogContext {
    pub fn new(component: &str, instance_id: &str) -> Self {
        Self {
            component: component.to_string(),
            instance_id: instance_id.to_string(),
            session: None,
            sequence: LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            timestamp_ns: utc_ns_now(),
        }
    }

    pub fn with_session(mut self, session: &str) -> Self {
        self.session = Some(session.to_string());
        self
    }

    pub fn format(&self, message: &str) -> String {
        let session_info = match &self.session {
            Some(session) => format!(" session={}", session),
            None => String::new(),
        };

        format!(
            "[seq={:06}][{}:{}{}] {}",
            self.sequence, self.component, self.instance_id, session_info, message
        )
    }
}

/// Uniform logging for pipeline components.
///
/// Implementors only supply a [`LogContext`]; level handling stays with the `log` facade.
pub trait ComponentLogger {
    fn log_context(&self) -> LogContext;

    fn debug(&self, message: &str) {
        log::debug!("{}", self.log_context().format(message));
    }

    fn info(&self, message: &str) {
        log::info!("{}", self.log_context().format(message));
    }

    fn warn(&self, message: &str) {
        log::warn!("{}", self.log_context().format(message));
    }

    fn error(&self, message: &str) {
        log::error!("{}", self.log_context().format(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context_creation() {
        let ctx = LogContext::new("Recorder", "rtsp://cam/stream");

        assert_eq!(ctx.component, "Recorder");
        assert_eq!(ctx.instance_id, "rtsp://cam/stream");
        assert!(ctx.sequence > 0);
        assert!(ctx.timestamp_ns > 0);
        assert!(ctx.session.is_none());
    }

    #[test]
    fn test_log_formatting() {
        let ctx = LogContext::new("Storer", "recordings");
        let formatted = ctx.format("sweep finished");

        assert!(formatted.contains("[Storer:recordings]"));
        assert!(formatted.contains("sweep finished"));

        let with_session = ctx.with_session("A1B2");
        assert!(with_session.format("x").contains("session=A1B2"));
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let a = LogContext::new("A", "1");
        let b = LogContext::new("B", "2");
        assert!(b.sequence > a.sequence);
    }
}
