mod backend;
mod engine;
mod install;
mod loader;
mod proxy;
mod runner;
mod scheduler;

pub mod config;
pub mod error;
pub mod memory;
pub mod recorder;
pub mod sanitize;
pub mod store;

pub use backend::{Backend, BackendKind, BackendSet, EndpointKind};
pub use config::{IdleTimeout, LoaderConfig, RunnerConfig};
pub use engine::Mode;
pub use error::RunnerError;
pub use install::InstallState;
pub use loader::{Loader, Reservation, SlotInfo, SlotState};
pub use proxy::{GuardedBody, ProxyClient};
pub use runner::{Endpoint, RunnerKey};
pub use scheduler::{
    BackendDiskUsage, BackendStatus, DiskUsage, Scheduler, SchedulerBuilder, Ticket,
};
