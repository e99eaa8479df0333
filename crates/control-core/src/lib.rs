//! Scheduling and coordination logic for the control-plane task queue:
//! the in-memory gateway/worker registry, the gateway HTTP client, and the
//! scheduler and stale-lock reaper background loops.

pub mod config;
pub mod gateway_client;
pub mod reaper;
pub mod registry;
pub mod scheduler;

pub use config::ControlConfig;
pub use gateway_client::{classify_response, ActionRequest, Classification, GatewayClient};
pub use reaper::{run_reaper, ReaperConfig};
pub use registry::{Gateway, RegisterGateway, RegisterWorker, Registry, SystemState, Worker};
pub use scheduler::{run_scheduler, SchedulerConfig};
