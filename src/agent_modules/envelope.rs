use std::sync::Arc;
use tracing::{debug, warn};

use super::job::{CheckJob, CheckResult, now_ms};
use super::registry::CheckerRegistry;

pub const INVALID_CHECK_TYPE: &str = "Invalid check type";

/// Runs one attempt of a job through the checker registered for its type.
///
/// No timeout is imposed here; every checker bounds its own I/O.
#[derive(Clone)]
pub struct ExecutionEnvelope {
    registry: Arc<CheckerRegistry>,
}

impl ExecutionEnvelope {
    pub fn new(registry: Arc<CheckerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CheckerRegistry {
        &self.registry
    }

    /// An unregistered type yields a failed result flagged to bypass
    /// debounce; it is a configuration error, retrying cannot fix it.
    pub async fn invoke(&self, job: &mut CheckJob) -> CheckResult {
        match self.registry.resolve(&job.check_type) {
            Ok(checker) => {
                debug!(check_id = %job.id, check_type = %job.check_type, "Invoking checker.");
                checker.check(job).await
            }
            Err(e) => {
                warn!(check_id = %job.id, error = %e, "No checker registered for check type.");
                CheckResult::started_at(now_ms()).invalid(INVALID_CHECK_TYPE)
            }
        }
    }
}
