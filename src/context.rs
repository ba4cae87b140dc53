use std::sync::Arc;
use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::coordinator::{CoordinatorParts, JobCoordinator};
use crate::core::engine::SanitizationEngine;
use crate::core::events::EventBus;
use crate::core::hardware::HardwareAdapter;
use crate::core::ledger::CertificateLedger;
use crate::core::notifications;
use crate::core::progress::JobTracker;
use crate::core::registry::DeviceRegistry;
use crate::core::sanitizer::create_sanitizer;
use crate::core::sanitizer::simulated::FaultPlan;

/// Shared handles for every server surface.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub registry: DeviceRegistry,
    pub events: EventBus,
    pub engine: SanitizationEngine,
    pub ledger: CertificateLedger,
    pub coordinator: JobCoordinator,
    pub jobs: JobTracker,
    pub adapter: Arc<dyn HardwareAdapter>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        db: Connection,
        adapter: Arc<dyn HardwareAdapter>,
        faults: FaultPlan,
    ) -> Self {
        let registry = DeviceRegistry::new();
        let events = EventBus::new();
        let jobs = JobTracker::new();

        let sanitizer = create_sanitizer(config.effective_backend(), &config.ata_password, faults);
        let engine = SanitizationEngine::new(
            registry.clone(),
            events.clone(),
            sanitizer,
            config.progress_interval(),
        );
        let ledger = CertificateLedger::new(db.clone(), events.clone());
        let coordinator = JobCoordinator::new(CoordinatorParts {
            engine: engine.clone(),
            registry: registry.clone(),
            ledger: ledger.clone(),
            jobs: jobs.clone(),
            events: events.clone(),
            db: db.clone(),
            notifier: notifications::create_notifier(&config.notifications),
        });

        Self {
            config: Arc::new(config),
            db,
            registry,
            events,
            engine,
            ledger,
            coordinator,
            jobs,
            adapter,
        }
    }
}
