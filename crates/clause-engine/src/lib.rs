//! Container lifecycle, interpreter access, and query execution.

pub mod bridge;
pub mod docker;
pub mod lifecycle;
pub mod mock;
pub mod monitor;
pub mod preflight;
pub mod status;
pub mod swish;

pub use bridge::{BridgeConfig, QueryBridge};
pub use docker::DockerCli;
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use monitor::HealthMonitor;
pub use status::StatusAggregator;
pub use swish::SwishClient;
