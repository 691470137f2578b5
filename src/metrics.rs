use foundations::telemetry::metrics::{metrics, Counter, Gauge, Histogram, HistogramBuilder};
use std::net::SocketAddr;
use std::sync::Arc;

#[metrics]
pub mod bmp {
    /// Number of opened connections.
    pub fn opened_connections_total(exporter: &Arc<String>) -> Counter;

    /// Number of closed connections.
    pub fn closed_connections_total(exporter: &Arc<String>) -> Counter;

    /// Number of peers up.
    pub fn peers_total(exporter: &Arc<String>) -> Gauge;

    /// Number of routes up.
    pub fn routes_total(exporter: &Arc<String>) -> Gauge;

    /// Number of ignored MP NLRI received.
    pub fn ignored_nlri_total(exporter: &Arc<String>, family: &Arc<String>) -> Counter;

    /// Number of BMP messages received.
    pub fn messages_received_total(
        exporter: &Arc<String>,
        message_type: &'static str,
    ) -> Counter;

    /// Number of fatal errors while processing BMP messages.
    pub fn errors_total(exporter: &Arc<String>, error: &'static str) -> Counter;

    /// Number of ignored BGP updates.
    pub fn ignored_updates_total(
        exporter: &Arc<String>,
        reason: &'static str,
        error: &'static str,
    ) -> Counter;

    /// Number of panics while processing BMP messages.
    pub fn panics_total(exporter: &Arc<String>) -> Counter;

    /// Duration during which the RIB is locked.
    #[ctor = HistogramBuilder {
        buckets: &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
    }]
    pub fn locked_duration_seconds(reason: &'static str) -> Histogram;

    /// Number of peers removed from the RIB.
    pub fn peer_removal_done_total(exporter: &Arc<String>) -> Counter;

    /// Number of peers partially removed from the RIB.
    pub fn peer_removal_partial_total(exporter: &Arc<String>) -> Counter;

    /// Number of times the removal queue was full.
    pub fn peer_removal_queue_full_total(exporter: &Arc<String>) -> Counter;

    /// Duration of RIB copies in performance mode.
    #[ctor = HistogramBuilder {
        buckets: &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0],
    }]
    pub fn rib_copies_duration_seconds(timer: &'static str) -> Histogram;
}

/// Label identifying an exporter in metrics and logs: its IP address, without
/// the port and with IPv4-mapped addresses unmapped.
pub fn exporter_label(exporter: &SocketAddr) -> Arc<String> {
    Arc::new(exporter.ip().to_canonical().to_string())
}
