use crate::bmp::{
    termination_reason, BmpBody, BmpFrame, BmpMsgType, InformationTlv, PeerDownNotification,
    PeerUpNotification, PerPeerHeader, INIT_TLV_SYS_NAME, TERM_TLV_REASON, TERM_TLV_STRING,
};
use crate::connection::BmpConn;
use crate::error::Error;
use crate::message::{negotiate_add_path, DecodeOptions, Message, UpdateMsg};
use crate::metrics::bmp as metrics;
use crate::peer::PeerKey;
use crate::provider::Shared;
use crate::update::apply_update;
use foundations::telemetry::log;
use octets::Octets;
use socket2::{SockRef, TcpKeepalive};
use std::any::Any;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Handles a BMP connection until it is closed. A panic while processing the
/// connection only closes this connection.
pub(crate) async fn run(shared: Arc<Shared>, stream: TcpStream, exporter: SocketAddr) {
    run_with(shared, stream, exporter, |mut session| async move {
        session.serve().await
    })
    .await
}

async fn run_with<F, Fut>(shared: Arc<Shared>, stream: TcpStream, exporter: SocketAddr, serve: F)
where
    F: FnOnce(Session) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let label = crate::metrics::exporter_label(&exporter);
    let conn = BmpConn::new(stream);
    if let Err(err) = configure(conn.stream()) {
        log::warn!("cannot set BMP socket options"; "exporter" => %label, "error" => %err);
    }
    connection_up(&label);

    let session = Session {
        shared: shared.clone(),
        exporter,
        label: label.clone(),
        conn,
    };
    if let Err(err) = tokio::spawn(serve(session)).await {
        if err.is_panic() {
            log::error!("panic while processing BMP connection";
                "exporter" => %label,
                "panic" => panic_message(err.into_panic()));
            metrics::panics_total(&label).inc();
        }
    }

    connection_down(&shared, exporter, &label);
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(60)))?;
    sock.set_linger(Some(Duration::ZERO))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

fn connection_up(label: &Arc<String>) {
    log::info!("new BMP connection"; "exporter" => %label);
    metrics::opened_connections_total(label).inc();
    // Create the series without resetting them: several connections can share
    // an exporter label.
    metrics::peers_total(label).inc_by(0);
    metrics::routes_total(label).inc_by(0);
}

/// Marks the peers of the exporter stale: their routes are kept for a while in
/// case the exporter comes back.
fn connection_down(shared: &Shared, exporter: SocketAddr, label: &Arc<String>) {
    let until = Instant::now() + shared.config.keep;
    let peers = shared.with_write("connection-down", |state| {
        state.peers.mark_exporter_stale(exporter, until)
    });
    if peers > 0 {
        shared.stale_updated();
    }
    metrics::closed_connections_total(label).inc();
    log::info!("BMP connection closed"; "exporter" => %label, "stale_peers" => peers);
}

struct Session {
    shared: Arc<Shared>,
    exporter: SocketAddr,
    label: Arc<String>,
    conn: BmpConn,
}

impl Session {
    async fn serve(&mut self) {
        loop {
            let frame = tokio::select! {
                _ = self.shared.token.cancelled() => return,
                frame = self.conn.read_frame() => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    let reason = match err {
                        Error::BmpHeader(_) => "cannot decode BMP header",
                        Error::NotInitiated => "first message not initiation",
                        _ if self.conn.reading_body() => "cannot read BMP body",
                        _ => "cannot read BMP header",
                    };
                    self.error(reason, &err);
                    return;
                }
            };
            if !self.handle(frame) {
                return;
            }
        }
    }

    fn error(&self, reason: &'static str, err: &Error) {
        metrics::errors_total(&self.label, reason).inc();
        log::info!("closing BMP connection";
            "exporter" => %self.label,
            "reason" => reason,
            "error" => %err);
    }

    /// Handles a BMP message. Returns false when the connection has to be
    /// closed.
    fn handle(&self, frame: BmpFrame) -> bool {
        metrics::messages_received_total(&self.label, frame.header.label()).inc();
        let kind = match frame.header.kind() {
            None | Some(BmpMsgType::StatisticsReport | BmpMsgType::RouteMirroring) => return true,
            Some(kind) => kind,
        };

        let mut buf = Octets::with_slice(&frame.body);
        let peer = if kind.has_peer_header() {
            match PerPeerHeader::decode(&mut buf) {
                Ok(header) => Some(header),
                Err(err) => {
                    self.error("cannot parse BMP peer header", &err);
                    return false;
                }
            }
        } else {
            None
        };
        let opts = match &peer {
            Some(header) => {
                let key = PeerKey::new(self.exporter, header);
                self.shared.with_read(|state| {
                    header.decode_options(state.peers.get(&key).map(|info| &info.options))
                })
            }
            None => DecodeOptions::default(),
        };

        let body = match BmpBody::decode(Some(kind), &mut buf, &opts) {
            Ok(body) => body,
            Err(err) if !err.is_fatal() => {
                self.ignore(&err);
                return true;
            }
            Err(err) => {
                self.error("cannot parse BMP body", &err);
                return false;
            }
        };

        match (body, peer) {
            (BmpBody::Initiation(tlvs), _) => {
                log::info!("BMP session initiated";
                    "exporter" => %self.label,
                    "sysname" => tlv_string(&tlvs, INIT_TLV_SYS_NAME).unwrap_or_default());
                true
            }
            (BmpBody::Termination(tlvs), _) => {
                let reason = termination(&tlvs);
                log::info!("termination message received";
                    "exporter" => %self.label,
                    "reason" => reason);
                false
            }
            (BmpBody::PeerUp(up), Some(header)) => self.peer_up(&header, &up),
            (BmpBody::PeerDown(down), Some(header)) => {
                self.peer_down(&header, &down);
                true
            }
            (BmpBody::RouteMonitoring(Message::Update(update)), Some(header)) => {
                self.route_monitoring(&header, &update)
            }
            _ => true,
        }
    }

    /// Counts an UPDATE skipped because of a recoverable error.
    fn ignore(&self, err: &Error) {
        if let Error::Update(err) = err {
            metrics::ignored_updates_total(&self.label, err.handling.as_str(), err.reason).inc();
            log::debug!("ignoring BGP update";
                "exporter" => %self.label,
                "handling" => %err.handling,
                "reason" => err.reason);
        }
    }

    /// Peer references are exhausted: nothing sensible can be done anymore.
    fn exhausted(&self, err: &Error) {
        log::error!("stopping BMP collector"; "exporter" => %self.label, "error" => %err);
        self.shared.token.cancel();
    }

    fn peer_up(&self, header: &PerPeerHeader, up: &PeerUpNotification) -> bool {
        let key = PeerKey::new(self.exporter, header);
        let options = DecodeOptions {
            add_path: Arc::new(negotiate_add_path(&up.sent_open, &up.received_open)),
            ..header.decode_options(None)
        };
        let add_path = options.add_path.len();
        match self
            .shared
            .with_write("peer-up", |state| state.peers.peer_up(key, options))
        {
            Ok(result) => {
                if result.added {
                    metrics::peers_total(&self.label).inc();
                    log::debug!("new peer";
                        "exporter" => %self.label,
                        "peer" => %key.ip.to_canonical(),
                        "add_path_families" => add_path);
                } else {
                    log::info!("received extra peer up";
                        "exporter" => %self.label,
                        "peer" => %key.ip.to_canonical());
                }
                if result.was_stale {
                    self.shared.stale_updated();
                }
                true
            }
            Err(err) => {
                self.exhausted(&err);
                false
            }
        }
    }

    fn peer_down(&self, header: &PerPeerHeader, down: &PeerDownNotification) {
        let key = PeerKey::new(self.exporter, header);
        let until = Instant::now() + self.shared.config.keep;
        let known = self
            .shared
            .with_write("peer-down", |state| state.peers.mark_stale(&key, until));
        if known {
            self.shared.stale_updated();
            log::info!("peer down";
                "exporter" => %self.label,
                "peer" => %key.ip.to_canonical(),
                "reason" => ?down.reason);
        } else {
            log::info!("received peer down without peer up";
                "exporter" => %self.label,
                "peer" => %key.ip.to_canonical());
        }
    }

    fn route_monitoring(&self, header: &PerPeerHeader, update: &UpdateMsg) -> bool {
        let key = PeerKey::new(self.exporter, header);
        let shared = &self.shared;
        let result = shared.with_write("route-monitoring", |state| {
            let (info, added) = state.peers.get_or_add(key)?;
            let reference = info.reference;
            let applied = apply_update(
                &mut state.rib,
                &shared.config,
                &self.label,
                &key,
                reference,
                update,
            );
            Ok::<_, Error>((added, applied))
        });
        match result {
            Ok((added, applied)) => {
                if added {
                    metrics::peers_total(&self.label).inc();
                    log::info!("received route monitoring without peer up";
                        "exporter" => %self.label,
                        "peer" => %key.ip.to_canonical());
                }
                if applied.added + applied.removed > 0 {
                    metrics::routes_total(&self.label).inc_by(applied.delta());
                    shared.rib_updated();
                }
                true
            }
            Err(err) => {
                self.exhausted(&err);
                false
            }
        }
    }
}

fn tlv_string(tlvs: &[InformationTlv], info_type: u16) -> Option<String> {
    tlvs.iter()
        .find(|tlv| tlv.info_type == info_type)
        .map(InformationTlv::as_string)
}

fn termination(tlvs: &[InformationTlv]) -> String {
    let reason = tlvs
        .iter()
        .find(|tlv| tlv.info_type == TERM_TLV_REASON && tlv.value.len() == 2)
        .map(|tlv| termination_reason(u16::from_be_bytes([tlv.value[0], tlv.value[1]])));
    match (reason, tlv_string(tlvs, TERM_TLV_STRING)) {
        (Some(reason), Some(text)) => format!("{reason}: {text}"),
        (Some(reason), None) => reason.to_string(),
        (None, Some(text)) => text,
        (None, None) => "unknown reason".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bmp::tests::{frame, peer_header};
    use crate::bmp::PEER_TYPE_GLOBAL;
    use crate::config::BmpSettings;
    use crate::message::tests::bgp_message;
    use crate::provider::Provider;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpSocket};

    fn tlv(info_type: u16, value: &[u8]) -> InformationTlv {
        InformationTlv {
            info_type,
            value: value.to_vec(),
        }
    }

    #[test]
    fn termination_reasons() {
        assert_eq!(termination(&[]), "unknown reason");
        assert_eq!(
            termination(&[tlv(TERM_TLV_REASON, &[0, 2])]),
            "out of resources"
        );
        assert_eq!(
            termination(&[tlv(TERM_TLV_STRING, b"bye"), tlv(TERM_TLV_REASON, &[0, 0])]),
            "session administratively closed: bye"
        );
        assert_eq!(termination(&[tlv(TERM_TLV_STRING, b"bye")]), "bye");
    }

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }

    async fn accept_from(
        listener: &TcpListener,
        source: Ipv4Addr,
    ) -> (TcpStream, TcpStream, SocketAddr) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(SocketAddr::new(source.into(), 0)).unwrap();
        let client = socket.connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, exporter) = listener.accept().await.unwrap();
        (client, stream, exporter)
    }

    fn announce_198_51_100() -> Vec<u8> {
        let mut attrs = vec![0x40, 1, 1, 0];
        attrs.extend_from_slice(&[0x40, 2, 6, 2, 1, 0, 0, 0xfd, 0xe9]);
        attrs.extend_from_slice(&[0x40, 3, 4, 192, 0, 2, 1]);
        let mut update = vec![0, 0];
        update.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        update.extend(attrs);
        update.extend_from_slice(&[24, 198, 51, 100]);

        let mut body = peer_header(PEER_TYPE_GLOBAL, 0, 0, &[192, 0, 2, 1], 65001);
        body.extend(bgp_message(2, &update));
        frame(0, &body)
    }

    #[tokio::test]
    async fn panic_only_closes_its_connection() {
        let provider = Provider::new(&BmpSettings::default()).unwrap();
        let shared = provider.shared().clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (_client, stream, exporter) =
            accept_from(&listener, Ipv4Addr::new(127, 0, 0, 30)).await;
        run_with(shared.clone(), stream, exporter, |_session| async move {
            panic!("corrupted session state");
        })
        .await;
        let label = crate::metrics::exporter_label(&exporter);
        assert_eq!(metrics::panics_total(&label).get(), 1);
        assert_eq!(metrics::closed_connections_total(&label).get(), 1);

        // Another exporter is still served.
        let (mut client, stream, exporter) =
            accept_from(&listener, Ipv4Addr::new(127, 0, 0, 31)).await;
        let session = tokio::spawn(run(shared.clone(), stream, exporter));
        let mut initiation = vec![0, 2, 0, 4];
        initiation.extend_from_slice(b"edge");
        client.write_all(&frame(4, &initiation)).await.unwrap();
        client.write_all(&announce_198_51_100()).await.unwrap();
        for _ in 0..500 {
            if provider.routes() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(provider.routes(), 1);
        assert_eq!(provider.peers(), 1);

        drop(client);
        session.await.unwrap();
        let label = crate::metrics::exporter_label(&exporter);
        assert_eq!(metrics::panics_total(&label).get(), 0);
        assert_eq!(metrics::closed_connections_total(&label).get(), 1);
    }
}
