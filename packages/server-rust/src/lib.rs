//! Courier Server: operation dispatch behind HTTP and broker intakes, and the
//! gateway that forwards end-user calls to them.

pub mod broker;
pub mod config;
pub mod gateway;
pub mod intake;
pub mod network;
pub mod service;

pub use config::{BrokerConfig, ConfigError, GatewayConfig, Transport, WrapperConfig};
pub use gateway::{ExecuteError, Gateway, GatewayService};
pub use intake::{Intake, IntakeManager};
pub use service::{Dispatcher, Microservice, ServiceHost};
