use crate::error::{Error, Result};
use crate::rd::{RdFilter, RouteDistinguisher};
use foundations::settings::{settings, Settings};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// How lookups reach the RIB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RibMode {
    /// Lookups take the read lock on the live RIB.
    #[default]
    Memory,
    /// Lookups read a periodically refreshed copy of the RIB without locking.
    Performance,
}

impl Settings for RibMode {}

impl Settings for RouteDistinguisher {}

/// BMP collector settings.
#[settings(impl_default = false)]
pub struct BmpSettings {
    /// Address the BMP listener binds to.
    pub listen: String,
    /// Accepted route distinguishers. Empty accepts all of them, `0` stands
    /// for routes without a distinguisher.
    pub rds: Vec<RouteDistinguisher>,
    /// Collect the origin AS of routes.
    pub collect_asns: bool,
    /// Collect the AS path of routes.
    pub collect_as_paths: bool,
    /// Collect standard and large communities of routes.
    pub collect_communities: bool,
    /// Seconds the routes of a disconnected peer are kept.
    pub keep_secs: u64,
    /// `memory` or `performance`.
    pub rib_mode: RibMode,
    /// Performance mode: copy the RIB after this many milliseconds without
    /// updates.
    pub rib_idle_update_delay_ms: u64,
    /// Performance mode: minimum milliseconds between two copies.
    pub rib_minimum_update_delay_ms: u64,
    /// Performance mode: maximum milliseconds a copy may lag behind.
    pub rib_maximum_update_delay_ms: u64,
    /// Maximum milliseconds the RIB stays locked by a single removal run.
    pub peer_removal_max_time_ms: u64,
    /// Milliseconds to sleep between two partial removal runs.
    pub peer_removal_sleep_interval_ms: u64,
    /// Capacity of the peer removal queue.
    pub peer_removal_max_queue: usize,
    /// Routes removed between two cancellation checks.
    pub peer_removal_batch_routes: usize,
}

impl Default for BmpSettings {
    fn default() -> Self {
        BmpSettings {
            listen: "0.0.0.0:10179".to_string(),
            rds: Vec::new(),
            collect_asns: true,
            collect_as_paths: true,
            collect_communities: true,
            keep_secs: 300,
            rib_mode: RibMode::Memory,
            rib_idle_update_delay_ms: 5_000,
            rib_minimum_update_delay_ms: 20_000,
            rib_maximum_update_delay_ms: 120_000,
            peer_removal_max_time_ms: 200,
            peer_removal_sleep_interval_ms: 500,
            peer_removal_max_queue: 10_000,
            peer_removal_batch_routes: 5_000,
        }
    }
}

/// Validated runtime view of [`BmpSettings`].
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub rds: RdFilter,
    pub collect_asns: bool,
    pub collect_as_paths: bool,
    pub collect_communities: bool,
    pub keep: Duration,
    pub rib_mode: RibMode,
    pub rib_idle_update_delay: Duration,
    pub rib_minimum_update_delay: Duration,
    pub rib_maximum_update_delay: Duration,
    pub peer_removal_max_time: Duration,
    pub peer_removal_sleep_interval: Duration,
    pub peer_removal_max_queue: usize,
    pub peer_removal_batch_routes: usize,
}

impl Config {
    pub fn collects_anything(&self) -> bool {
        self.collect_asns || self.collect_as_paths || self.collect_communities
    }
}

impl TryFrom<&BmpSettings> for Config {
    type Error = Error;

    fn try_from(s: &BmpSettings) -> Result<Config> {
        let listen = s
            .listen
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen address {:?}", s.listen)))?;
        if s.keep_secs < 1 {
            return Err(Error::Config("keep must be at least 1s".into()));
        }
        if s.peer_removal_max_time_ms < 10 {
            return Err(Error::Config(
                "peer removal max time must be at least 10ms".into(),
            ));
        }
        if s.peer_removal_sleep_interval_ms < 10 {
            return Err(Error::Config(
                "peer removal sleep interval must be at least 10ms".into(),
            ));
        }
        if s.peer_removal_max_queue < 1 || s.peer_removal_batch_routes < 1 {
            return Err(Error::Config(
                "peer removal queue and batch must not be empty".into(),
            ));
        }
        if s.rib_mode == RibMode::Performance {
            if s.rib_minimum_update_delay_ms > s.rib_maximum_update_delay_ms {
                return Err(Error::Config(
                    "minimum update delay exceeds maximum update delay".into(),
                ));
            }
            if s.rib_idle_update_delay_ms >= s.rib_maximum_update_delay_ms {
                return Err(Error::Config(
                    "idle update delay must be below maximum update delay".into(),
                ));
            }
        }

        Ok(Config {
            listen,
            rds: RdFilter::new(s.rds.clone()),
            collect_asns: s.collect_asns,
            collect_as_paths: s.collect_as_paths,
            collect_communities: s.collect_communities,
            keep: Duration::from_secs(s.keep_secs),
            rib_mode: s.rib_mode,
            rib_idle_update_delay: Duration::from_millis(s.rib_idle_update_delay_ms),
            rib_minimum_update_delay: Duration::from_millis(s.rib_minimum_update_delay_ms),
            rib_maximum_update_delay: Duration::from_millis(s.rib_maximum_update_delay_ms),
            peer_removal_max_time: Duration::from_millis(s.peer_removal_max_time_ms),
            peer_removal_sleep_interval: Duration::from_millis(s.peer_removal_sleep_interval_ms),
            peer_removal_max_queue: s.peer_removal_max_queue,
            peer_removal_batch_routes: s.peer_removal_batch_routes,
        })
    }
}
