//! Configuration types and loading
//!
//! The ingress reads a JSON file plus command-line overrides; the egress
//! is configured entirely from the environment so it can run under a
//! process supervisor or container with no filesystem dependencies.

mod loader;
mod types;

pub use loader::{load_egress_env, load_ingress_file};
pub use types::{EgressConfig, IngressConfig, RoutingMode};
