//! Builders for the BMP and BGP messages sent by the end-to-end tests.
#![allow(dead_code)]

use bmp_rib::metrics::exporter_label;
use bmp_rib::{BmpSettings, Provider};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};

pub const BMP_INITIATION: u8 = 4;
pub const BMP_TERMINATION: u8 = 5;
pub const BMP_ROUTE_MONITORING: u8 = 0;
pub const BMP_STATISTICS_REPORT: u8 = 1;
pub const BMP_PEER_DOWN: u8 = 2;
pub const BMP_PEER_UP: u8 = 3;

pub fn bmp_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![3];
    out.extend_from_slice(&(6 + body.len() as u32).to_be_bytes());
    out.push(msg_type);
    out.extend_from_slice(body);
    out
}

/// A monitored BGP peer, seen from the exporter.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub peer_type: u8,
    pub distinguisher: u64,
    pub address: Ipv4Addr,
    pub asn: u32,
}

impl Peer {
    pub fn new(last: u8, asn: u32) -> Peer {
        Peer {
            peer_type: 0,
            distinguisher: 0,
            address: Ipv4Addr::new(192, 0, 2, last),
            asn,
        }
    }

    fn header(&self) -> Vec<u8> {
        let mut out = vec![self.peer_type, 0];
        out.extend_from_slice(&self.distinguisher.to_be_bytes());
        out.extend_from_slice(&[0; 12]);
        out.extend_from_slice(&self.address.octets());
        out.extend_from_slice(&self.asn.to_be_bytes());
        out.extend_from_slice(&self.address.octets());
        out.extend_from_slice(&[0; 8]);
        out
    }
}

pub fn initiation(sysname: &str) -> Vec<u8> {
    let mut body = vec![0, 2];
    body.extend_from_slice(&(sysname.len() as u16).to_be_bytes());
    body.extend_from_slice(sysname.as_bytes());
    bmp_message(BMP_INITIATION, &body)
}

pub fn termination() -> Vec<u8> {
    bmp_message(BMP_TERMINATION, &[0, 1, 0, 2, 0, 0])
}

/// Peer up whose OPEN messages carry the given capabilities: `sent` for the
/// monitored router, `received` for the peer.
pub fn peer_up(peer: &Peer, sent: &[u8], received: &[u8]) -> Vec<u8> {
    let mut body = peer.header();
    body.extend_from_slice(&[0; 12]);
    body.extend_from_slice(&[192, 0, 2, 254]);
    body.extend_from_slice(&179u16.to_be_bytes());
    body.extend_from_slice(&47000u16.to_be_bytes());
    body.extend(bgp_message(1, &open(65000, [192, 0, 2, 254], sent)));
    body.extend(bgp_message(1, &open(peer.asn, peer.address.octets(), received)));
    bmp_message(BMP_PEER_UP, &body)
}

pub fn peer_down(peer: &Peer) -> Vec<u8> {
    let mut body = peer.header();
    body.push(2);
    body.extend_from_slice(&[0, 0]);
    bmp_message(BMP_PEER_DOWN, &body)
}

pub fn route_monitoring(peer: &Peer, update: &[u8]) -> Vec<u8> {
    let mut body = peer.header();
    body.extend(bgp_message(2, update));
    bmp_message(BMP_ROUTE_MONITORING, &body)
}

pub fn statistics_report(peer: &Peer) -> Vec<u8> {
    let mut body = peer.header();
    body.extend_from_slice(&[0, 0, 0, 1, 0, 7, 0, 4, 0, 0, 0, 0]);
    bmp_message(BMP_STATISTICS_REPORT, &body)
}

pub fn bgp_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut msg = vec![0xff; 16];
    msg.extend_from_slice(&(19 + body.len() as u16).to_be_bytes());
    msg.push(msg_type);
    msg.extend_from_slice(body);
    msg
}

/// OPEN body with a 4-octet AS capability and the given extra capabilities.
pub fn open(asn: u32, bgp_id: [u8; 4], caps: &[u8]) -> Vec<u8> {
    let mut all = vec![65, 4];
    all.extend_from_slice(&asn.to_be_bytes());
    all.extend_from_slice(caps);

    let mut body = vec![4];
    let my_as = u16::try_from(asn).unwrap_or(23456);
    body.extend_from_slice(&my_as.to_be_bytes());
    body.extend_from_slice(&90u16.to_be_bytes());
    body.extend_from_slice(&bgp_id);
    body.push(all.len() as u8 + 2);
    body.push(2);
    body.push(all.len() as u8);
    body.extend(all);
    body
}

pub fn add_path_cap(afi: u16, safi: u8, mode: u8) -> Vec<u8> {
    let mut cap = vec![69, 4];
    cap.extend_from_slice(&afi.to_be_bytes());
    cap.push(safi);
    cap.push(mode);
    cap
}

/// Encodes a prefix of an NLRI field.
pub fn prefix(text: &str, path_id: Option<u32>) -> Vec<u8> {
    let net: ipnet::IpNet = text.parse().unwrap();
    let mut out = Vec::new();
    if let Some(path_id) = path_id {
        out.extend_from_slice(&path_id.to_be_bytes());
    }
    out.push(net.prefix_len());
    let octets = match net.addr() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&octets[..(net.prefix_len() as usize).div_ceil(8)]);
    out
}

pub fn attr(flags: u8, code: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![flags, code, value.len() as u8];
    out.extend_from_slice(value);
    out
}

/// ORIGIN, AS_PATH (one sequence of 4-octet ASNs) and COMMUNITIES.
pub fn base_attrs(as_path: &[u32], communities: &[u32]) -> Vec<u8> {
    let mut out = attr(0x40, 1, &[0]);
    let mut path = vec![2, as_path.len() as u8];
    for asn in as_path {
        path.extend_from_slice(&asn.to_be_bytes());
    }
    out.extend(attr(0x40, 2, &path));
    if !communities.is_empty() {
        let value: Vec<u8> = communities.iter().flat_map(|c| c.to_be_bytes()).collect();
        out.extend(attr(0xc0, 8, &value));
    }
    out
}

pub fn next_hop(ip: Ipv4Addr) -> Vec<u8> {
    attr(0x40, 3, &ip.octets())
}

pub fn mp_reach(afi: u16, safi: u8, next_hop: &[u8], nlri: &[u8]) -> Vec<u8> {
    let mut value = afi.to_be_bytes().to_vec();
    value.push(safi);
    value.push(next_hop.len() as u8);
    value.extend_from_slice(next_hop);
    value.push(0);
    value.extend_from_slice(nlri);
    attr(0x80, 14, &value)
}

pub fn update(withdrawn: &[u8], attrs: &[u8], nlri: &[u8]) -> Vec<u8> {
    let mut body = (withdrawn.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(withdrawn);
    body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    body.extend_from_slice(attrs);
    body.extend_from_slice(nlri);
    body
}

/// Announces IPv4 prefixes from `as_path` through `nh`.
pub fn announce(prefixes: &[&str], as_path: &[u32], nh: Ipv4Addr) -> Vec<u8> {
    let mut attrs = base_attrs(as_path, &[]);
    attrs.extend(next_hop(nh));
    let nlri: Vec<u8> = prefixes.iter().flat_map(|p| prefix(p, None)).collect();
    update(&[], &attrs, &nlri)
}

pub fn withdraw(prefixes: &[&str]) -> Vec<u8> {
    let withdrawn: Vec<u8> = prefixes.iter().flat_map(|p| prefix(p, None)).collect();
    update(&withdrawn, &[], &[])
}

pub async fn start(settings: BmpSettings) -> Provider {
    let provider = Provider::new(&BmpSettings {
        listen: "127.0.0.1:0".into(),
        ..settings
    })
    .unwrap();
    provider.start().await.unwrap();
    provider
}

/// An exporter connecting from its own loopback address, so that metrics of
/// different tests do not mix.
pub struct Exporter {
    pub stream: TcpStream,
    pub label: Arc<String>,
}

impl Exporter {
    pub async fn connect(provider: &Provider, source: Ipv4Addr) -> Exporter {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(SocketAddr::new(source.into(), 0)).unwrap();
        let stream = socket.connect(provider.local_addr().unwrap()).await.unwrap();
        let label = exporter_label(&stream.local_addr().unwrap());
        Exporter { stream, label }
    }

    pub async fn send(&mut self, messages: &[Vec<u8>]) {
        for message in messages {
            self.stream.write_all(message).await.unwrap();
        }
        self.stream.flush().await.unwrap();
    }
}

/// Polls `condition` until it holds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
