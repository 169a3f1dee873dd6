//! Service discovery: registry, per-service load balancing, and the
//! registration bridge.

pub mod bridge;
pub mod load_balancer;
pub mod registry;

pub use bridge::{MemoryRegistrationStore, RegistrationStore, ServiceBridge};
pub use load_balancer::LoadBalancer;
pub use registry::{RegistryAction, RegistryEvent, RegistryStatus, ServiceRegistry};
