use crate::metrics::bmp as metrics;
use crate::peer::PeerKey;
use crate::provider::Shared;
use crate::rib::{FlushContext, PeerRef};
use foundations::telemetry::log;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

/// A stale peer whose routes have to be flushed.
#[derive(Debug, Clone)]
pub(crate) struct Removal {
    pub key: PeerKey,
    pub reference: PeerRef,
    pub exporter: Arc<String>,
}

/// Flushes the routes of removed peers, one peer at a time.
pub(crate) async fn run(shared: Arc<Shared>, mut removals: mpsc::Receiver<Removal>) {
    loop {
        let removal = tokio::select! {
            _ = shared.token.cancelled() => return,
            removal = removals.recv() => match removal {
                Some(removal) => removal,
                None => return,
            },
        };
        remove_peer(&shared, &removal).await;
    }
}

/// Flushes the routes of a peer by runs holding the write lock at most
/// `peer_removal_max_time`, sleeping between runs.
async fn remove_peer(shared: &Shared, removal: &Removal) {
    let config = &shared.config;
    let exporter = &removal.exporter;
    let mut total = 0;
    loop {
        let ctx = FlushContext {
            token: shared.token.clone(),
            deadline: Some(Instant::now() + config.peer_removal_max_time),
        };
        let outcome = shared.with_write("peer-removal", |state| {
            if !state.peers.is_removing(removal.reference) {
                return None;
            }
            let (removed, done) = state.rib.flush_peer_bounded(
                &ctx,
                removal.reference,
                config.peer_removal_batch_routes,
            );
            if done {
                state.peers.finish_removal(removal.reference);
            }
            Some((removed, done))
        });
        // Queued twice or already flushed.
        let Some((removed, done)) = outcome else {
            return;
        };

        total += removed;
        if removed > 0 {
            metrics::routes_total(exporter).dec_by(removed as i64);
            shared.rib_updated();
        }
        if done {
            metrics::peers_total(exporter).dec();
            metrics::peer_removal_done_total(exporter).inc();
            log::info!("peer removed";
                "exporter" => %exporter,
                "peer" => %removal.key.ip.to_canonical(),
                "routes" => total);
            return;
        }

        metrics::peer_removal_partial_total(exporter).inc();
        log::debug!("peer partially removed";
            "exporter" => %exporter,
            "peer" => %removal.key.ip.to_canonical(),
            "routes" => total);
        tokio::select! {
            _ = shared.token.cancelled() => return,
            _ = sleep(config.peer_removal_sleep_interval) => {}
        }
    }
}
