pub mod certificate;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod hardware;
pub mod ledger;
pub mod methods;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod sanitizer;
pub mod verifier;

pub use coordinator::{CancelReport, JobCoordinator};
pub use engine::{SanitizationEngine, WipeHandle};
pub use error::WipeError;
pub use events::{Event, EventBus};
pub use hardware::{BlockDevice, HardwareAdapter, HardwareEvent};
pub use ledger::CertificateLedger;
pub use methods::WipeMethod;
pub use models::{Certificate, Device, DeviceStatus, DeviceType, WipeJob};
pub use orchestrator::Orchestrator;
pub use progress::JobTracker;
pub use registry::DeviceRegistry;
