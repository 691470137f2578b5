use crate::config::{BmpSettings, Config, RibMode};
use crate::error::{Error, Result};
use crate::metrics::bmp as metrics;
use crate::peer::PeerTable;
use crate::remove::{self, Removal};
use crate::rib::Rib;
use crate::session;
use arc_swap::ArcSwap;
use foundations::telemetry::log;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Routing information attached to an address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LookupResult {
    pub asn: u32,
    pub as_path: Vec<u32>,
    pub communities: Vec<u32>,
    pub large_communities: Vec<String>,
    /// Length of the matched prefix, in the address family of the looked up
    /// address.
    pub net_mask: u8,
    pub next_hop: Option<IpAddr>,
}

/// Answers routing lookups for the flow enrichment pipeline.
pub trait RoutingProvider: Send + Sync {
    /// Returns `None` when no route covers `ip`. Among the routes of the most
    /// specific prefix, the one going through `next_hop` is preferred.
    fn lookup(&self, ip: IpAddr, next_hop: Option<IpAddr>) -> Option<LookupResult>;
}

/// State mutated by sessions and the removal worker.
#[derive(Default)]
pub(crate) struct State {
    pub rib: Rib,
    pub peers: PeerTable,
}

pub(crate) struct Shared {
    pub config: Config,
    state: RwLock<State>,
    /// Read-only copy of the RIB used by lookups in performance mode.
    snapshot: ArcSwap<Rib>,
    rib_changed: Notify,
    stale_changed: Notify,
    removals: mpsc::Sender<Removal>,
    pub token: CancellationToken,
    tracker: TaskTracker,
    /// An exporter connected at least once.
    active: AtomicBool,
}

impl Shared {
    /// Runs `f` with the write lock held and records for how long it was held.
    pub fn with_write<T>(&self, reason: &'static str, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.write();
        let start = std::time::Instant::now();
        let out = f(&mut state);
        drop(state);
        metrics::locked_duration_seconds(reason).observe(start.elapsed().as_secs_f64());
        out
    }

    pub fn with_read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        f(&self.state.read())
    }

    /// Routes were added or removed.
    pub fn rib_updated(&self) {
        if self.config.rib_mode == RibMode::Performance {
            self.rib_changed.notify_one();
        }
    }

    /// A peer became stale or is no longer stale.
    pub fn stale_updated(&self) {
        self.stale_changed.notify_one();
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    fn copy_rib(&self, timer: &'static str) {
        log::debug!("copy live RIB to read-only version"; "timer" => timer);
        let start = std::time::Instant::now();
        let copy = self.with_read(|state| state.rib.clone());
        self.snapshot.store(Arc::new(copy));
        metrics::rib_copies_duration_seconds(timer).observe(start.elapsed().as_secs_f64());
    }

    /// Queues the removal of the stale peers whose deadline has passed.
    /// Returns false once the removal worker is gone.
    fn expire_stale_peers(&self) -> bool {
        let now = Instant::now();
        self.with_write("stale-peers", |state| {
            for (key, reference) in state.peers.expired(now) {
                let exporter = crate::metrics::exporter_label(&key.exporter);
                let removal = Removal {
                    key,
                    reference,
                    exporter: exporter.clone(),
                };
                match self.removals.try_send(removal) {
                    Ok(()) => {
                        state.peers.start_removal(&key);
                        log::info!("remove stale peer";
                            "exporter" => %exporter,
                            "peer" => %key.ip.to_canonical());
                    }
                    Err(TrySendError::Full(_)) => {
                        metrics::peer_removal_queue_full_total(&exporter).inc();
                        state
                            .peers
                            .postpone(&key, now + self.config.peer_removal_sleep_interval);
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            true
        })
    }
}

/// BMP collector answering lookups from the routes it receives.
pub struct Provider {
    shared: Arc<Shared>,
    removals: Mutex<Option<mpsc::Receiver<Removal>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Provider {
    pub fn new(settings: &BmpSettings) -> Result<Provider> {
        let config = Config::try_from(settings)?;
        let (tx, rx) = mpsc::channel(config.peer_removal_max_queue);
        Ok(Provider {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(State::default()),
                snapshot: ArcSwap::from_pointee(Rib::new()),
                rib_changed: Notify::new(),
                stale_changed: Notify::new(),
                removals: tx,
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                active: AtomicBool::new(false),
            }),
            removals: Mutex::new(Some(rx)),
            local_addr: Mutex::new(None),
        })
    }

    /// Binds the BMP listener and spawns the background tasks. Returns the
    /// address the listener is bound to.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.shared.config.listen).await?;
        let local_addr = listener.local_addr()?;
        let removals = self.removals.lock().take().ok_or(Error::AlreadyStarted)?;
        log::info!("starting BMP listener"; "listen" => %local_addr);

        let shared = &self.shared;
        shared.spawn(accept(shared.clone(), listener));
        shared.spawn(remove::run(shared.clone(), removals));
        shared.spawn(stale_timer(shared.clone()));
        if shared.config.rib_mode == RibMode::Performance {
            shared.spawn(snapshot_updater(shared.clone()));
        }
        *self.local_addr.lock() = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops every task and waits for them to finish.
    pub async fn stop(&self) {
        log::info!("stopping BMP listener");
        self.shared.token.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    /// Resolves once the provider is stopping, including on fatal errors.
    pub async fn stopping(&self) {
        self.shared.token.cancelled().await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Number of routes in the live RIB.
    pub fn routes(&self) -> usize {
        self.shared.with_read(|state| state.rib.len())
    }

    /// Number of known peers, stale ones included.
    pub fn peers(&self) -> usize {
        self.shared.with_read(|state| state.peers.len())
    }

    /// Routes in the copy used by lookups in performance mode.
    pub fn snapshot_routes(&self) -> usize {
        self.shared.snapshot.load().len()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl RoutingProvider for Provider {
    fn lookup(&self, ip: IpAddr, next_hop: Option<IpAddr>) -> Option<LookupResult> {
        let shared = &self.shared;
        if !shared.config.collects_anything() || !shared.active.load(Ordering::Relaxed) {
            return Some(LookupResult::default());
        }
        let ip6 = mapped(ip);
        let next_hop = next_hop.map(mapped);
        match shared.config.rib_mode {
            RibMode::Memory => shared.with_read(|state| lookup(&state.rib, ip, ip6, next_hop)),
            RibMode::Performance => lookup(&shared.snapshot.load(), ip, ip6, next_hop),
        }
    }
}

fn mapped(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    }
}

fn lookup(
    rib: &Rib,
    ip: IpAddr,
    ip6: Ipv6Addr,
    next_hop: Option<Ipv6Addr>,
) -> Option<LookupResult> {
    let (_, route) = rib.find_deepest_match(ip6, next_hop)?;
    let attributes = rib.attributes.get(route.attributes)?;
    let next_hop = rib
        .next_hops
        .get(route.next_hop)
        .filter(|nh| !nh.0.is_unspecified())
        .map(|nh| IpAddr::V6(nh.0).to_canonical());
    let net_mask = match ip {
        IpAddr::V4(_) => attributes.prefix_len.saturating_sub(96),
        IpAddr::V6(_) => attributes.prefix_len,
    };
    Some(LookupResult {
        asn: attributes.asn,
        as_path: attributes.as_path.clone(),
        communities: attributes.communities.clone(),
        large_communities: attributes
            .large_communities
            .iter()
            .map(ToString::to_string)
            .collect(),
        net_mask,
        next_hop,
    })
}

async fn accept(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = shared.token.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, exporter)) => {
                shared.active.store(true, Ordering::Relaxed);
                shared.spawn(session::run(shared.clone(), stream, exporter));
            }
            Err(err) => {
                log::warn!("cannot accept BMP connection"; "error" => %err);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Sleeps until the soonest stale deadline and queues the expired peers.
async fn stale_timer(shared: Arc<Shared>) {
    loop {
        let next = shared.with_read(|state| state.peers.next_deadline());
        let expiry = async {
            match next {
                Some(deadline) => sleep_until(deadline).await,
                None => future::pending().await,
            }
        };
        tokio::select! {
            _ = shared.token.cancelled() => return,
            _ = shared.stale_changed.notified() => continue,
            _ = expiry => {}
        }
        if !shared.expire_stale_peers() {
            return;
        }
    }
}

/// Refreshes the read-only RIB after updates: once no update happened for
/// the idle delay, no more often than the minimum delay and no later than the
/// maximum delay.
async fn snapshot_updater(shared: Arc<Shared>) {
    let config = &shared.config;
    let minimum = config.rib_minimum_update_delay;
    let maximum = config.rib_maximum_update_delay;
    let idle = config.rib_idle_update_delay;

    let start = Instant::now();
    let mut last_copy = start.checked_sub(minimum).unwrap_or(start);
    let mut next: Option<(Instant, &'static str)> = Some((start + maximum, "maximum"));
    loop {
        let timer = async {
            match next {
                Some((deadline, _)) => sleep_until(deadline).await,
                None => future::pending().await,
            }
        };
        tokio::select! {
            _ = shared.token.cancelled() => return,
            _ = shared.rib_changed.notified() => {
                let now = Instant::now();
                let delta = now - last_copy;
                if delta < minimum {
                    next = Some((now + (minimum - delta), "minimum"));
                } else if delta < maximum - idle {
                    next = Some((now + idle, "idle"));
                } else if delta >= maximum {
                    shared.copy_rib("maximum");
                    last_copy = now;
                    next = None;
                } else {
                    next = Some((now + (maximum - delta), "maximum"));
                }
            }
            _ = timer => {
                if let Some((_, timer)) = next.take() {
                    shared.copy_rib(timer);
                    last_copy = Instant::now();
                }
            }
        }
    }
}
