//! Control plane that serves HTTP routing to Envoy proxies.
//!
//! A [`RouteManager`] owns the route table and publishes a fresh snapshot
//! into a [`SnapshotCache`] after every change. A [`DiscoveryServer`] streams
//! the cached snapshots to proxies over the xDS gRPC services.

pub mod cache;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod pb;
pub mod route;
pub mod synth;

pub use cache::{MemoryCache, SnapshotCache};
pub use config::Settings;
pub use control::{DiscoveryServer, ServerOptions};
pub use error::{ManagerError, ServerError};
pub use route::{BackendRef, ManagerOptions, Match, Route, RouteManager, RouteTable, Rule};
