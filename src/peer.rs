use crate::bmp::PerPeerHeader;
use crate::error::{Error, Result};
use crate::message::DecodeOptions;
use crate::rd::RouteDistinguisher;
use crate::rib::PeerRef;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::time::Instant;

/// A BGP session as seen through BMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub exporter: SocketAddr,
    pub ip: Ipv6Addr,
    pub peer_type: u8,
    pub distinguisher: RouteDistinguisher,
    pub asn: u32,
    pub bgp_id: Ipv4Addr,
}

impl PeerKey {
    pub fn new(exporter: SocketAddr, header: &PerPeerHeader) -> PeerKey {
        PeerKey {
            exporter,
            ip: header.address,
            peer_type: header.peer_type,
            distinguisher: header.distinguisher,
            asn: header.asn,
            bgp_id: header.bgp_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub reference: PeerRef,
    /// Routes are kept until this instant, `None` while the peer is up.
    pub stale_until: Option<Instant>,
    /// How BGP messages of this peer are decoded.
    pub options: DecodeOptions,
}

/// Peers known to the collector, plus the references of removed peers whose
/// routes are still being flushed.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerKey, PeerInfo>,
    removing: HashMap<PeerRef, PeerKey>,
    last_reference: PeerRef,
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable::default()
    }

    pub fn get(&self, key: &PeerKey) -> Option<&PeerInfo> {
        self.peers.get(key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerKey, &PeerInfo)> {
        self.peers.iter()
    }

    /// Returns the peer, adding it when unknown. The boolean tells whether
    /// the peer was added.
    pub fn get_or_add(&mut self, key: PeerKey) -> Result<(&mut PeerInfo, bool)> {
        match self.peers.entry(key) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(entry) => {
                self.last_reference = self
                    .last_reference
                    .checked_add(1)
                    .ok_or(Error::PeerReferenceExhausted)?;
                let info = entry.insert(PeerInfo {
                    reference: self.last_reference,
                    stale_until: None,
                    options: DecodeOptions::default(),
                });
                Ok((info, true))
            }
        }
    }

    /// Peer up: the peer is created or no longer stale, and its decoding
    /// options are replaced.
    pub fn peer_up(&mut self, key: PeerKey, options: DecodeOptions) -> Result<PeerUp> {
        let (info, added) = self.get_or_add(key)?;
        let was_stale = info.stale_until.take().is_some();
        info.options = options;
        Ok(PeerUp {
            reference: info.reference,
            added,
            was_stale,
        })
    }

    /// Marks one peer stale. Returns false for unknown peers.
    pub fn mark_stale(&mut self, key: &PeerKey, until: Instant) -> bool {
        match self.peers.get_mut(key) {
            Some(info) => {
                info.stale_until = Some(until);
                true
            }
            None => false,
        }
    }

    /// Marks every peer of an exporter stale. Returns how many peers there
    /// were.
    pub fn mark_exporter_stale(&mut self, exporter: SocketAddr, until: Instant) -> usize {
        let mut count = 0;
        for (key, info) in self.peers.iter_mut() {
            if key.exporter == exporter {
                info.stale_until = Some(until);
                count += 1;
            }
        }
        count
    }

    /// Soonest instant a stale peer expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.peers.values().filter_map(|info| info.stale_until).min()
    }

    /// Stale peers whose deadline is not after `now`.
    pub fn expired(&self, now: Instant) -> Vec<(PeerKey, PeerRef)> {
        self.peers
            .iter()
            .filter(|(_, info)| info.stale_until.is_some_and(|until| until <= now))
            .map(|(key, info)| (*key, info.reference))
            .collect()
    }

    /// Pushes back the deadline of a stale peer.
    pub fn postpone(&mut self, key: &PeerKey, until: Instant) {
        if let Some(info) = self.peers.get_mut(key) {
            if info.stale_until.is_some() {
                info.stale_until = Some(until);
            }
        }
    }

    /// Forgets a peer whose routes are about to be flushed. A peer coming back
    /// afterwards gets a new reference.
    pub fn start_removal(&mut self, key: &PeerKey) -> Option<PeerRef> {
        let info = self.peers.remove(key)?;
        self.removing.insert(info.reference, *key);
        Some(info.reference)
    }

    pub fn is_removing(&self, reference: PeerRef) -> bool {
        self.removing.contains_key(&reference)
    }

    /// All the routes of a removed peer are gone.
    pub fn finish_removal(&mut self, reference: PeerRef) -> Option<PeerKey> {
        self.removing.remove(&reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerUp {
    pub reference: PeerRef,
    pub added: bool,
    pub was_stale: bool,
}
