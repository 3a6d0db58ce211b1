//! HTTP listener plumbing: configuration, middleware, lifecycle, shutdown.

pub mod config;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::HttpConfig;
pub use module::HttpServer;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
