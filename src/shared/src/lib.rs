//! Shared types and configuration for the Lattice gateway.
//!
//! Everything here is plain data: the behavioural components in the gateway
//! crate exchange these types across module boundaries and over the wire.

pub mod config;
pub mod types;

pub use config::{
    AuthConfig, ConfigError, GatewayConfig, InternalAuthConfig, ProxyConfig, RegistryConfig,
    SchedulerConfig, ServerConfig, StreamConfig,
};
pub use types::*;
