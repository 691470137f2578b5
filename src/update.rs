use crate::bmp::PEER_TYPE_L3VPN;
use crate::config::Config;
use crate::message::{Cidr, Family, UpdateMsg};
use crate::metrics::bmp as metrics;
use crate::peer::PeerKey;
use crate::rd::RouteDistinguisher;
use crate::rib::{rib_prefix, NextHop, Nlri, PeerRef, Rib, RouteAttributes};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;

/// Routes added and removed by an UPDATE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub added: usize,
    pub removed: usize,
}

impl Applied {
    pub fn delta(&self) -> i64 {
        self.added as i64 - self.removed as i64
    }
}

fn mapped(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    }
}

/// Attributes shared by every route of an UPDATE.
fn route_attributes(config: &Config, key: &PeerKey, update: &UpdateMsg) -> RouteAttributes {
    let attrs = &update.path_attributes;
    let mut rta = RouteAttributes::default();
    if config.collect_asns || config.collect_as_paths {
        rta.as_path = attrs.flat_as_path();
    }
    if config.collect_communities {
        rta.communities = attrs.communities.clone();
        rta.large_communities = attrs.large_communities.clone();
    }
    // Without AS path, the peer is the origin.
    if config.collect_asns {
        rta.asn = rta.as_path.last().copied().unwrap_or(key.asn);
    }
    if !config.collect_as_paths {
        rta.as_path = Vec::new();
    }
    rta
}

struct Applier<'a> {
    rib: &'a mut Rib,
    peer: PeerRef,
    next_hop: NextHop,
    attributes: RouteAttributes,
    applied: Applied,
}

impl Applier<'_> {
    fn announce(&mut self, family: Family, rd: RouteDistinguisher, cidr: &Cidr) {
        let prefix = rib_prefix(cidr.prefix);
        let nlri = Nlri {
            family,
            path_id: cidr.path_id,
            rd,
        };
        let attributes = RouteAttributes {
            prefix_len: prefix.prefix_len(),
            ..self.attributes.clone()
        };
        self.applied.added += self.rib.add(prefix, self.peer, nlri, self.next_hop, attributes);
    }

    fn withdraw(&mut self, family: Family, rd: RouteDistinguisher, cidr: &Cidr) {
        let nlri = Nlri {
            family,
            path_id: cidr.path_id,
            rd,
        };
        self.applied.removed += self.rib.remove(rib_prefix(cidr.prefix), self.peer, &nlri);
    }
}

/// Applies an UPDATE received from a peer to the RIB.
pub fn apply_update(
    rib: &mut Rib,
    config: &Config,
    exporter: &Arc<String>,
    key: &PeerKey,
    peer: PeerRef,
    update: &UpdateMsg,
) -> Applied {
    let l3vpn = key.peer_type == PEER_TYPE_L3VPN;
    if l3vpn && !config.rds.is_accepted(key.distinguisher) {
        return Applied::default();
    }

    let attrs = &update.path_attributes;
    let mut applier = Applier {
        rib,
        peer,
        next_hop: NextHop(
            attrs
                .next_hop
                .map(|nh| nh.to_ipv6_mapped())
                .unwrap_or(Ipv6Addr::UNSPECIFIED),
        ),
        attributes: route_attributes(config, key, update),
        applied: Applied::default(),
    };

    // Regular NLRI and withdrawn routes
    if l3vpn || config.rds.is_accepted(RouteDistinguisher::default()) {
        for cidr in &update.nlri {
            applier.announce(Family::IPV4_UNICAST, key.distinguisher, cidr);
        }
        for cidr in &update.withdrawn_routes {
            applier.withdraw(Family::IPV4_UNICAST, key.distinguisher, cidr);
        }
    }

    // MP reach and unreach NLRI
    let accepted = |cidr: &Cidr| {
        let rd = cidr.rd.unwrap_or(key.distinguisher);
        (l3vpn || config.rds.is_accepted(rd)).then_some(rd)
    };
    if let Some(reach) = &attrs.mp_reach {
        if reach.family.is_supported() {
            if let Some(next_hop) = reach.next_hop {
                applier.next_hop = NextHop(mapped(next_hop));
            }
            for cidr in &reach.nlri {
                if let Some(rd) = accepted(cidr) {
                    applier.announce(reach.family, rd, cidr);
                }
            }
        } else {
            metrics::ignored_nlri_total(exporter, &Arc::new(reach.family.to_string())).inc();
        }
    }
    if let Some(unreach) = &attrs.mp_unreach {
        if unreach.family.is_supported() {
            for cidr in &unreach.withdrawn_routes {
                if let Some(rd) = accepted(cidr) {
                    applier.withdraw(unreach.family, rd, cidr);
                }
            }
        } else {
            metrics::ignored_nlri_total(exporter, &Arc::new(unreach.family.to_string())).inc();
        }
    }

    applier.applied
}
