use crate::intern::{Pool, Reference};
use crate::message::{Family, LargeCommunity};
use crate::rd::RouteDistinguisher;
use ipnet::Ipv6Net;
use prefix_trie::PrefixMap;
use std::net::Ipv6Addr;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Reference of a peer inside routes. Never zero.
pub type PeerRef = u32;

/// Next hop of a route. IPv4 next hops are IPv4-mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NextHop(pub Ipv6Addr);

/// What identifies a route at a given prefix, besides its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nlri {
    pub family: Family,
    pub path_id: u32,
    pub rd: RouteDistinguisher,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RouteAttributes {
    pub asn: u32,
    pub as_path: Vec<u32>,
    pub communities: Vec<u32>,
    pub large_communities: Vec<LargeCommunity>,
    /// Length of the prefix as stored in the RIB, IPv4 lengths included 96.
    pub prefix_len: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub peer: PeerRef,
    pub nlri: Reference<Nlri>,
    pub next_hop: Reference<NextHop>,
    pub attributes: Reference<RouteAttributes>,
}

impl Route {
    fn same_key(&self, other: &Route) -> bool {
        self.peer == other.peer && self.nlri == other.nlri
    }
}

/// Cancellation for [`Rib::flush_peer_bounded`]. The walk stops at the first
/// batch boundary after the token is cancelled or the deadline has passed.
#[derive(Debug, Clone, Default)]
pub struct FlushContext {
    pub token: CancellationToken,
    pub deadline: Option<Instant>,
}

impl FlushContext {
    pub fn with_deadline(deadline: Instant) -> FlushContext {
        FlushContext {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled()
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Routes of every peer, keyed by prefix. IPv4 prefixes are stored as
/// IPv4-mapped IPv6 prefixes. A prefix holds at most one route per
/// (peer, NLRI) and never an empty list.
#[derive(Clone, Default)]
pub struct Rib {
    tree: PrefixMap<Ipv6Net, Vec<Route>>,
    pub next_hops: Pool<NextHop>,
    pub nlris: Pool<Nlri>,
    pub attributes: Pool<RouteAttributes>,
}

impl Rib {
    pub fn new() -> Rib {
        Rib::default()
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.tree.iter().map(|(_, routes)| routes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.iter().next().is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ipv6Net, &Route)> {
        self.tree
            .iter()
            .flat_map(|(prefix, routes)| routes.iter().map(move |route| (prefix, route)))
    }

    fn release(&mut self, route: &Route) {
        release(&mut self.nlris, &mut self.next_hops, &mut self.attributes, route);
    }

    /// Inserts a route whose references are already held. A route with the
    /// same peer and NLRI is replaced and its references released. Returns 1
    /// when a route was added, 0 when one was replaced.
    pub fn add_prefix(&mut self, prefix: Ipv6Net, route: Route) -> usize {
        let replaced = match self.tree.get_mut(&prefix) {
            Some(routes) => match routes.iter_mut().find(|r| r.same_key(&route)) {
                Some(existing) => Some(std::mem::replace(existing, route)),
                None => {
                    routes.push(route);
                    None
                }
            },
            None => {
                self.tree.insert(prefix, vec![route]);
                None
            }
        };
        match replaced {
            Some(old) => {
                self.release(&old);
                0
            }
            None => 1,
        }
    }

    /// Interns the route components and inserts the route.
    pub fn add(
        &mut self,
        prefix: Ipv6Net,
        peer: PeerRef,
        nlri: Nlri,
        next_hop: NextHop,
        attributes: RouteAttributes,
    ) -> usize {
        let route = Route {
            peer,
            nlri: self.nlris.put(nlri),
            next_hop: self.next_hops.put(next_hop),
            attributes: self.attributes.put(attributes),
        };
        self.add_prefix(prefix, route)
    }

    /// Removes the route of `peer` for `nlri` at exactly `prefix`. Returns the
    /// number of removed routes.
    pub fn remove_prefix(
        &mut self,
        prefix: Ipv6Net,
        peer: PeerRef,
        nlri: Reference<Nlri>,
    ) -> usize {
        let Some(routes) = self.tree.get_mut(&prefix) else {
            return 0;
        };
        let Some(idx) = routes.iter().position(|r| r.peer == peer && r.nlri == nlri) else {
            return 0;
        };
        let old = routes.swap_remove(idx);
        if routes.is_empty() {
            self.tree.remove(&prefix);
        }
        self.release(&old);
        1
    }

    /// Removes a route given its NLRI value. Unknown NLRI match nothing.
    pub fn remove(&mut self, prefix: Ipv6Net, peer: PeerRef, nlri: &Nlri) -> usize {
        match self.nlris.reference(nlri) {
            Some(nlri) => self.remove_prefix(prefix, peer, nlri),
            None => 0,
        }
    }

    /// Removes every route of `peer`.
    pub fn flush_peer(&mut self, peer: PeerRef) -> usize {
        let (removed, _) = self.flush_peer_bounded(&FlushContext::default(), peer, usize::MAX);
        removed
    }

    /// Removes the routes of `peer`, checking `ctx` every `batch_size`
    /// removals. Returns the number of removed routes and whether the walk
    /// went through the whole RIB. At least one batch is removed per call.
    pub fn flush_peer_bounded(
        &mut self,
        ctx: &FlushContext,
        peer: PeerRef,
        batch_size: usize,
    ) -> (usize, bool) {
        let batch_size = batch_size.max(1);
        let Rib {
            tree,
            next_hops,
            nlris,
            attributes,
        } = self;

        let mut removed = 0;
        let mut emptied = Vec::new();
        let mut completed = true;
        'walk: for (prefix, routes) in tree.iter_mut() {
            let mut idx = 0;
            while idx < routes.len() {
                if routes[idx].peer != peer {
                    idx += 1;
                    continue;
                }
                let old = routes.swap_remove(idx);
                release(nlris, next_hops, attributes, &old);
                removed += 1;
                if removed % batch_size == 0 {
                    std::thread::yield_now();
                    if ctx.is_done() {
                        if routes.is_empty() {
                            emptied.push(*prefix);
                        }
                        completed = false;
                        break 'walk;
                    }
                }
            }
            if routes.is_empty() {
                emptied.push(*prefix);
            }
        }
        for prefix in emptied {
            tree.remove(&prefix);
        }
        (removed, completed)
    }

    /// Longest prefix match. Among the routes of the most specific prefix,
    /// the one using `next_hop` is preferred, the first one otherwise.
    /// Returns the matched prefix length with the route.
    pub fn find_deepest_match(
        &self,
        ip: Ipv6Addr,
        next_hop: Option<Ipv6Addr>,
    ) -> Option<(u8, &Route)> {
        let host = Ipv6Net::new(ip, 128).ok()?;
        let (prefix, routes) = self.tree.get_lpm(&host)?;
        let hinted = next_hop.and_then(|nh| self.next_hops.reference(&NextHop(nh)));
        let route = hinted
            .and_then(|nh| routes.iter().find(|r| r.next_hop == nh))
            .or_else(|| routes.first())?;
        Some((prefix.prefix_len(), route))
    }
}

fn release(
    nlris: &mut Pool<Nlri>,
    next_hops: &mut Pool<NextHop>,
    attributes: &mut Pool<RouteAttributes>,
    route: &Route,
) {
    nlris.take(route.nlri);
    next_hops.take(route.next_hop);
    attributes.take(route.attributes);
}

/// Maps a prefix to the key used in the RIB.
pub fn rib_prefix(prefix: ipnet::IpNet) -> Ipv6Net {
    match prefix {
        ipnet::IpNet::V4(net) => {
            // The length is at most 32, so this cannot fail.
            Ipv6Net::new(net.addr().to_ipv6_mapped(), net.prefix_len() + 96).unwrap_or_default()
        }
        ipnet::IpNet::V6(net) => net,
    }
}
