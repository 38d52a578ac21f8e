use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

use super::config::AgentConfig;
use super::envelope::ExecutionEnvelope;
use super::job::CheckJob;
use super::publisher::{PublishError, PublishOutcome, PublisherSettings, ResultPublisher};
use super::registry::CheckerRegistry;
use super::store::ChecklistStore;

/// Everything the engine components share, built once at startup.
pub struct AgentContext {
    config: RwLock<AgentConfig>,
    pub store: Arc<ChecklistStore>,
    pub envelope: ExecutionEnvelope,
    pub publisher: ResultPublisher,
    reporting: AtomicBool,
    last_cycle: AtomicI64,
}

impl AgentContext {
    pub fn new(
        config: AgentConfig,
        registry: CheckerRegistry,
        store: Arc<ChecklistStore>,
    ) -> Result<Self, PublishError> {
        let publisher = ResultPublisher::new(
            config.results_url(),
            config.check_id.clone(),
            config.check_token.clone(),
            PublisherSettings::default(),
        )?;
        Ok(Self::with_publisher(config, registry, store, publisher))
    }

    pub fn with_publisher(
        config: AgentConfig,
        registry: CheckerRegistry,
        store: Arc<ChecklistStore>,
        publisher: ResultPublisher,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            store,
            envelope: ExecutionEnvelope::new(Arc::new(registry)),
            publisher,
            reporting: AtomicBool::new(true),
            last_cycle: AtomicI64::new(0),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> AgentConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_config<R>(&self, f: impl FnOnce(&mut AgentConfig) -> R) -> R {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn check_id(&self) -> String {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check_id
            .clone()
    }

    pub fn reporting_enabled(&self) -> bool {
        self.reporting.load(Ordering::Acquire)
    }

    /// Stops heartbeats and result delivery for the rest of the process.
    pub fn disable_reporting(&self) {
        if self.reporting.swap(false, Ordering::AcqRel) {
            warn!("Reporting disabled; results will no longer be delivered.");
        }
    }

    pub fn mark_cycle(&self, at: i64) {
        self.last_cycle.store(at, Ordering::Release);
    }

    pub fn last_cycle(&self) -> i64 {
        self.last_cycle.load(Ordering::Acquire)
    }

    /// Ships a finalized job unless reporting has been switched off.
    pub async fn publish(&self, job: &CheckJob) -> PublishOutcome {
        if !self.reporting_enabled() {
            info!(check_id = %job.id, "Reporting disabled; result not delivered.");
            return PublishOutcome::Skipped;
        }
        self.publisher.publish(job).await
    }
}
