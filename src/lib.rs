//! BMP collector keeping the routes of the monitored routers in memory to
//! attach routing information to flows.

pub mod bmp;
pub mod config;
pub mod connection;
pub mod error;
pub mod intern;
pub mod message;
pub mod metrics;
pub mod peer;
pub mod provider;
pub mod rd;
mod remove;
pub mod rib;
mod session;
pub mod update;

pub use config::{BmpSettings, RibMode};
pub use error::{Error, Result};
pub use provider::{LookupResult, Provider, RoutingProvider};
