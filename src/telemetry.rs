//! Per-operation success/failure reporting.
//!
//! The engine reports exactly once per top-level call, however many store
//! calls that call issued.

use crate::errors::{NavError, Operation};
use std::sync::Arc;
use tracing::{info, warn};

pub trait Telemetry: Send + Sync {
    fn report_success(&self, component: &str, operation: Operation);

    fn report_failure(&self, component: &str, operation: Operation, error: &NavError);
}

/// Emits one tracing event per reported operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn report_success(&self, component: &str, operation: Operation) {
        info!(component, operation = operation.as_str(), "operation succeeded");
    }

    fn report_failure(&self, component: &str, operation: Operation, error: &NavError) {
        warn!(component, operation = operation.as_str(), %error, "operation failed");
    }
}

/// Reports one operation at most once, for results that complete lazily.
///
/// A reporter dropped before any outcome was recorded counts as success:
/// the caller stopped consuming without an error.
pub(crate) struct OnceReporter {
    telemetry: Arc<dyn Telemetry>,
    component: &'static str,
    operation: Operation,
    reported: bool,
}

impl OnceReporter {
    pub(crate) fn new(
        telemetry: Arc<dyn Telemetry>,
        component: &'static str,
        operation: Operation,
    ) -> Self {
        Self {
            telemetry,
            component,
            operation,
            reported: false,
        }
    }

    pub(crate) fn success(&mut self) {
        if !std::mem::replace(&mut self.reported, true) {
            self.telemetry.report_success(self.component, self.operation);
        }
    }

    pub(crate) fn failure(&mut self, error: &NavError) {
        if !std::mem::replace(&mut self.reported, true) {
            self.telemetry
                .report_failure(self.component, self.operation, error);
        }
    }
}

impl Drop for OnceReporter {
    fn drop(&mut self) {
        self.success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTelemetry {
        events: Mutex<Vec<(Operation, bool)>>,
    }

    impl Telemetry for RecordingTelemetry {
        fn report_success(&self, _component: &str, operation: Operation) {
            self.events.lock().push((operation, true));
        }

        fn report_failure(&self, _component: &str, operation: Operation, _error: &NavError) {
            self.events.lock().push((operation, false));
        }
    }

    #[test]
    fn test_should_report_once_even_when_dropped() {
        let telemetry = Arc::new(RecordingTelemetry::default());
        {
            let mut reporter =
                OnceReporter::new(telemetry.clone(), "test", Operation::GetChildItems);
            reporter.failure(&NavError::NotFound { path: "b".into() });
            reporter.success();
        }
        {
            let _unfinished = OnceReporter::new(telemetry.clone(), "test", Operation::GetItem);
        }
        assert_eq!(
            *telemetry.events.lock(),
            vec![(Operation::GetChildItems, false), (Operation::GetItem, true)]
        );
    }
}
