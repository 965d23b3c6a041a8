pub mod error;
pub mod orchestrator;
pub mod preload;
pub mod provider;
pub mod service;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use orchestrator::FallbackOrchestrator;
pub use preload::PreloadScheduler;
pub use service::{AcquireOutcome, ImageAcquisitionService};
