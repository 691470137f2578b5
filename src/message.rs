use crate::error::{
    Error, ErrorHandling, MsgHeaderErrorSubcode, OpenMsgErrorSubcode, Result, UpdateError,
    UpdateMsgErrorSubcode,
};
use crate::rd::RouteDistinguisher;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use num_enum::TryFromPrimitive;
use octets::Octets;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/*
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                                                               |
    +                                                               +
    |                                                               |
    +                                                               +
    |                           Marker                              |
    +                                                               +
    |                                                               |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |          Length               |      Type     |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
pub struct MessageHeader {
    pub length: u16,
    pub msg_type: MsgType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MsgType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

const MARKER_LEN: usize = 16;
const MARKER: [u8; MARKER_LEN] = [0xff; MARKER_LEN];
pub const HEADER_LEN: usize = 19;
const MIN_OPEN_LEN: usize = 29;
const MIN_UPDATE_LEN: usize = 23;
const KEEPALIVE_LEN: usize = 19;
const MIN_NOTIFICATION_LEN: usize = 21;

const AS_TRANS: u32 = 23456;

impl MessageHeader {
    pub fn decode(buf: &mut Octets<'_>) -> Result<MessageHeader> {
        let marker = buf.get_bytes(MARKER_LEN)?;
        if marker.buf() != MARKER {
            return Error::err_header(MsgHeaderErrorSubcode::ConnectionNotSync);
        }
        let length = buf.get_u16()?;
        let msg_type = MsgType::try_from(buf.get_u8()?)
            .or_else(|_| Error::err_header(MsgHeaderErrorSubcode::BadMessageType))?;
        let too_short = match msg_type {
            MsgType::Open => (length as usize) < MIN_OPEN_LEN,
            MsgType::Update => (length as usize) < MIN_UPDATE_LEN,
            MsgType::Notification => (length as usize) < MIN_NOTIFICATION_LEN,
            MsgType::Keepalive => length as usize != KEEPALIVE_LEN,
            MsgType::RouteRefresh => (length as usize) < HEADER_LEN + 4,
        };
        if too_short {
            return Error::err_header(MsgHeaderErrorSubcode::BadMessageLength);
        }
        Ok(MessageHeader { length, msg_type })
    }
}

/*
    0       7      15      23      31
    +-------+-------+-------+-------+
    |      AFI      | Res.  | SAFI  |
    +-------+-------+-------+-------+
*/
/// Address family of a route, as an AFI/SAFI pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Family {
    pub afi: u16,
    pub safi: u8,
}

impl Family {
    pub const IPV4_UNICAST: Family = Family::new(1, 1);
    pub const IPV6_UNICAST: Family = Family::new(2, 1);
    pub const IPV4_LABELED_UNICAST: Family = Family::new(1, 4);
    pub const IPV6_LABELED_UNICAST: Family = Family::new(2, 4);
    pub const IPV4_VPN: Family = Family::new(1, 128);
    pub const IPV6_VPN: Family = Family::new(2, 128);
    pub const EVPN: Family = Family::new(25, 70);

    pub const fn new(afi: u16, safi: u8) -> Family {
        Family { afi, safi }
    }

    /// Families whose NLRI end up in the RIB.
    pub fn is_supported(&self) -> bool {
        matches!(
            *self,
            Family::IPV4_UNICAST
                | Family::IPV6_UNICAST
                | Family::IPV4_LABELED_UNICAST
                | Family::IPV6_LABELED_UNICAST
                | Family::IPV4_VPN
                | Family::IPV6_VPN
                | Family::EVPN
        )
    }

    pub fn decode(buf: &mut Octets<'_>) -> Result<Family> {
        let afi = buf.get_u16()?;
        buf.skip(1)?; // Reserved
        let safi = buf.get_u8()?;
        Ok(Family { afi, safi })
    }
}

impl Family {
    /// Well-known name of the family, `None` when the pair is not assigned.
    pub fn name(&self) -> Option<&'static str> {
        Some(match (self.afi, self.safi) {
            (1, 1) => "ipv4-unicast",
            (2, 1) => "ipv6-unicast",
            (1, 2) => "ipv4-multicast",
            (2, 2) => "ipv6-multicast",
            (1, 4) => "ipv4-labelled-unicast",
            (2, 4) => "ipv6-labelled-unicast",
            (1, 7) => "ipv4-encap",
            (2, 7) => "ipv6-encap",
            (1, 128) => "l3vpn-ipv4-unicast",
            (2, 128) => "l3vpn-ipv6-unicast",
            (1, 129) => "l3vpn-ipv4-multicast",
            (2, 129) => "l3vpn-ipv6-multicast",
            (1, 132) => "rtc",
            (1, 133) => "ipv4-flowspec",
            (2, 133) => "ipv6-flowspec",
            (1, 134) => "l3vpn-ipv4-flowspec",
            (2, 134) => "l3vpn-ipv6-flowspec",
            (25, 65) => "l2vpn-vpls",
            (25, 70) => "l2vpn-evpn",
            (25, 134) => "l2vpn-flowspec",
            (16388, 71) => "ls",
            _ => return None,
        })
    }

    fn check_known(&self) -> Result<()> {
        match self.name() {
            Some(_) => Ok(()),
            None => Error::err_update(
                UpdateMsgErrorSubcode::OptionalAttributeError,
                ErrorHandling::AfiSafiDisable,
                "unknown route family",
            ),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "afi-{}-safi-{}", self.afi, self.safi),
        }
    }
}

// RFC 7911 Advertisement of Multiple Paths in BGP
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum AddPathMode {
    Receive = 1,
    Send = 2,
    Both = 3,
}

impl AddPathMode {
    pub fn can_send(&self) -> bool {
        matches!(self, AddPathMode::Send | AddPathMode::Both)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, AddPathMode::Receive | AddPathMode::Both)
    }
}

/*
    +------------------------------------------------+
    | Address Family Identifier (2 octets)           |
    +------------------------------------------------+
    | Subsequent Address Family Identifier (1 octet) |
    +------------------------------------------------+
    | Send/Receive (1 octet)                         |
    +------------------------------------------------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddPathCap {
    pub family: Family,
    pub mode: AddPathMode,
}

/// Capabilities found in the optional parameters of an OPEN message.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub multiprotocol: Vec<Family>,
    pub four_octet_as: Option<u32>,
    pub add_path: Vec<AddPathCap>,
}

impl Capabilities {
    /*
        +------------------------------+
        | Capability Code (1 octet)    |
        +------------------------------+
        | Capability Length (1 octet)  |
        +------------------------------+
        | Capability Value (variable)  |
        ~                              ~
        +------------------------------+
    */
    fn decode(&mut self, buf: &mut Octets<'_>) -> Result<()> {
        while buf.cap() > 0 {
            let code = buf.get_u8()?;
            let mut value = buf.get_bytes_with_u8_length()?;
            //[Capability Codes](https://www.iana.org/assignments/capability-codes/capability-codes.xhtml)
            match code {
                1 => {
                    if value.cap() != 4 {
                        return Error::err_open(OpenMsgErrorSubcode::UnSupportedCapability);
                    }
                    self.multiprotocol.push(Family::decode(&mut value)?);
                }
                65 => {
                    if value.cap() != 4 {
                        return Error::err_open(OpenMsgErrorSubcode::UnSupportedCapability);
                    }
                    self.four_octet_as = Some(value.get_u32()?);
                }
                69 => {
                    if value.cap() % 4 != 0 {
                        return Error::err_open(OpenMsgErrorSubcode::UnSupportedCapability);
                    }
                    while value.cap() > 0 {
                        let family = Family::new(value.get_u16()?, value.get_u8()?);
                        // Unknown modes are ignored rather than rejected.
                        if let Ok(mode) = AddPathMode::try_from(value.get_u8()?) {
                            self.add_path.push(AddPathCap { family, mode });
                        }
                    }
                }
                _ => (),
            }
        }
        Ok(())
    }

    fn add_path_mode(&self, family: Family) -> Option<AddPathMode> {
        self.add_path
            .iter()
            .rev()
            .find(|cap| cap.family == family)
            .map(|cap| cap.mode)
    }
}

/*
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+
    |    Version    |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |     My Autonomous System      |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |           Hold Time           |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                         BGP Identifier                        |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |Non-Ext OP Len.|Non-Ext OP Type|  Extended Opt. Parm. Length   | //RFC 9072
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                                                               |
    |             Optional Parameters (variable)                    |
    |                                                               |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone)]
pub struct OpenMsg {
    pub version: u8,
    /// 4-octet AS when advertised, the 2-octet field otherwise.
    pub as_number: u32,
    pub hold_time: u16,
    pub bgp_identifier: Ipv4Addr,
    pub capabilities: Capabilities,
}

impl OpenMsg {
    pub fn decode(buf: &mut Octets<'_>) -> Result<OpenMsg> {
        let version = buf.get_u8()?;
        if version != 4 {
            return Error::err_open(OpenMsgErrorSubcode::UnsupportedVersionNumber);
        }
        let my_as = buf.get_u16()?;
        let hold_time = buf.get_u16()?;
        //RFC 4271: The Hold Time MUST be either zero or at least three seconds.
        if hold_time != 0 && hold_time < 3 {
            return Error::err_open(OpenMsgErrorSubcode::UnacceptableHoldTime);
        }
        let bgp_identifier = Ipv4Addr::from(buf.get_u32()?);

        let non_ext_op_len = buf.get_u8()?;
        // RFC 9072: 255 in both the length and the first type octet announces
        // a 2-octet length and 2-octet parameter lengths.
        let ext_opt_param = non_ext_op_len == 255 && buf.peek_u8()? == 255;
        let mut opt_params = if ext_opt_param {
            buf.skip(1)?;
            buf.get_bytes_with_u16_length()?
        } else {
            buf.get_bytes(non_ext_op_len as usize)?
        };

        let mut capabilities = Capabilities::default();
        while opt_params.cap() > 0 {
            let param_type = opt_params.get_u8()?;
            let mut param = if ext_opt_param {
                opt_params.get_bytes_with_u16_length()?
            } else {
                opt_params.get_bytes_with_u8_length()?
            };
            match param_type {
                2 => capabilities.decode(&mut param)?,
                // Authentication (deprecated) and unknown parameters are skipped.
                _ => (),
            }
        }

        let as_number = capabilities.four_octet_as.unwrap_or(my_as as u32);
        Ok(OpenMsg {
            version,
            as_number,
            hold_time,
            bgp_identifier,
            capabilities,
        })
    }
}

/// Add-path families and AS size negotiated for a peer.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// AS numbers are 4 octets wide.
    pub four_octet_as: bool,
    /// Families whose NLRI carry a path identifier.
    pub add_path: Arc<HashSet<Family>>,
}

impl DecodeOptions {
    pub fn add_path(&self, family: Family) -> bool {
        self.add_path.contains(&family)
    }
}

/// Families for which NLRI received from a peer carry path identifiers. The
/// peer must announce it can send them (received OPEN) and the monitored
/// router that it can receive them (sent OPEN).
pub fn negotiate_add_path(sent: &OpenMsg, received: &OpenMsg) -> HashSet<Family> {
    sent.capabilities
        .add_path
        .iter()
        .filter(|local| local.mode.can_receive())
        .filter(|local| {
            received
                .capabilities
                .add_path_mode(local.family)
                .is_some_and(|remote| remote.can_send())
        })
        .map(|local| local.family)
        .collect()
}

/*
    +---------------------------+
    |   Length (1 octet)        |
    +---------------------------+
    |   Prefix (variable)       |
    +---------------------------+
*/
/// A prefix from an NLRI field with what identifies it besides the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub prefix: IpNet,
    pub path_id: u32,
    pub rd: Option<RouteDistinguisher>,
}

fn ipv4_prefix(length: u8, octets: &[u8]) -> Result<Ipv4Net> {
    let mut addr = [0u8; 4];
    let used = octets.len().min(4);
    addr[..used].copy_from_slice(&octets[..used]);
    Ipv4Net::new(Ipv4Addr::from(addr), length)
        .map(|net| net.trunc())
        .map_err(|_| Error::BufferTooShort)
}

fn ipv6_prefix(length: u8, octets: &[u8]) -> Result<Ipv6Net> {
    let mut addr = [0u8; 16];
    let used = octets.len().min(16);
    addr[..used].copy_from_slice(&octets[..used]);
    Ipv6Net::new(Ipv6Addr::from(addr), length)
        .map(|net| net.trunc())
        .map_err(|_| Error::BufferTooShort)
}

fn ip_prefix(afi: u16, length: u8, octets: &[u8]) -> Result<IpNet> {
    match afi {
        1 => Ok(IpNet::V4(ipv4_prefix(length, octets)?)),
        _ => Ok(IpNet::V6(ipv6_prefix(length, octets)?)),
    }
}

fn max_prefix_len(afi: u16) -> u16 {
    if afi == 1 {
        32
    } else {
        128
    }
}

/*
    RFC 8277 Labeled NLRI, RFC 4364 VPN NLRI
    +---------------------------+
    |   Length (1 octet)        |
    +---------------------------+
    |   Label (3 octets)        |
    +---------------------------+
    .............................
    +---------------------------+
    |   Route Distinguisher     |  (VPN only)
    +---------------------------+
    |   Prefix (variable)       |
    +---------------------------+
*/
fn decode_labeled(
    buf: &mut Octets<'_>,
    family: Family,
    vpn: bool,
) -> Result<(IpNet, Option<RouteDistinguisher>)> {
    let mut bits = buf.get_u8()? as u16;
    loop {
        if bits < 24 {
            return Err(Error::BufferTooShort);
        }
        let label = buf.get_bytes(3)?;
        let label = label.buf();
        bits -= 24;
        let bottom_of_stack = label[2] & 0x01 != 0;
        let withdrawn = label == [0x80, 0x00, 0x00] || label == [0x00, 0x00, 0x00];
        if bottom_of_stack || withdrawn {
            break;
        }
    }
    let rd = if vpn {
        if bits < 64 {
            return Err(Error::BufferTooShort);
        }
        bits -= 64;
        Some(RouteDistinguisher::from_wire(buf.get_bytes(8)?.buf()))
    } else {
        None
    };
    if bits > max_prefix_len(family.afi) {
        return Err(Error::BufferTooShort);
    }
    let octets = buf.get_bytes((bits as usize + 7) / 8)?;
    Ok((ip_prefix(family.afi, bits as u8, octets.buf())?, rd))
}

/*
    RFC 9136 EVPN IP Prefix route (route type 5)
    +---------------------------------------+
    |      RD   (8 octets)                  |
    +---------------------------------------+
    |Ethernet Segment Identifier (10 octets)|
    +---------------------------------------+
    |  Ethernet Tag ID (4 octets)           |
    +---------------------------------------+
    |  IP Prefix Length (1 octet, 0 to 32)  |
    +---------------------------------------+
    |  IP Prefix (4 or 16 octets)           |
    +---------------------------------------+
    |  GW IP Address (4 or 16 octets)       |
    +---------------------------------------+
    |  MPLS Label (3 octets)                |
    +---------------------------------------+
*/
fn decode_evpn(buf: &mut Octets<'_>) -> Result<Option<(IpNet, RouteDistinguisher)>> {
    let route_type = buf.get_u8()?;
    let mut route = buf.get_bytes_with_u8_length()?;
    if route_type != 5 {
        return Ok(None);
    }
    let afi = match route.cap() {
        34 => 1,
        58 => 2,
        _ => return Err(Error::BufferTooShort),
    };
    let rd = RouteDistinguisher::from_wire(route.get_bytes(8)?.buf());
    route.skip(10 + 4)?;
    let length = route.get_u8()?;
    if length as u16 > max_prefix_len(afi) {
        return Err(Error::BufferTooShort);
    }
    let octets = route.get_bytes(if afi == 1 { 4 } else { 16 })?;
    Ok(Some((ip_prefix(afi, length, octets.buf())?, rd)))
}

impl Cidr {
    /// Decodes one NLRI entry. `None` is returned for entries that carry no
    /// IP prefix, like EVPN routes other than IP prefix routes.
    pub fn decode(buf: &mut Octets<'_>, family: Family, add_path: bool) -> Result<Option<Cidr>> {
        let path_id = if add_path { buf.get_u32()? } else { 0 };
        let (prefix, rd) = match family {
            Family::IPV4_UNICAST | Family::IPV6_UNICAST => {
                let length = buf.get_u8()?;
                if length as u16 > max_prefix_len(family.afi) {
                    return Err(Error::BufferTooShort);
                }
                let octets = buf.get_bytes((length as usize + 7) / 8)?;
                (ip_prefix(family.afi, length, octets.buf())?, None)
            }
            Family::IPV4_LABELED_UNICAST | Family::IPV6_LABELED_UNICAST => {
                decode_labeled(buf, family, false)?
            }
            Family::IPV4_VPN | Family::IPV6_VPN => decode_labeled(buf, family, true)?,
            Family::EVPN => match decode_evpn(buf)? {
                Some((prefix, rd)) => (prefix, Some(rd)),
                None => return Ok(None),
            },
            _ => return Err(Error::BufferTooShort),
        };
        Ok(Some(Cidr {
            prefix,
            path_id,
            rd,
        }))
    }

    /// Decodes a whole NLRI field.
    pub fn decode_all(buf: &mut Octets<'_>, family: Family, add_path: bool) -> Result<Vec<Cidr>> {
        let mut prefixes = Vec::new();
        while buf.cap() > 0 {
            if let Some(cidr) = Cidr::decode(buf, family, add_path)? {
                prefixes.push(cidr);
            }
        }
        Ok(prefixes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathAttributeFlags {
    pub optional: bool,
    pub transitive: bool,
    pub partial: bool,
    pub extended_length: bool,
}

impl From<u8> for PathAttributeFlags {
    fn from(flags: u8) -> PathAttributeFlags {
        PathAttributeFlags {
            optional: flags & 0b10000000 != 0,
            transitive: flags & 0b01000000 != 0,
            partial: flags & 0b00100000 != 0,
            extended_length: flags & 0b00010000 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Origin {
    Igp = 0,
    Egp = 1,
    Incomplete = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum AsPathSegmentType {
    AsSet = 1,
    AsSequence = 2,
    AsConfedSequence = 3,
    AsConfedSet = 4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsPathSegment {
    pub segment_type: AsPathSegmentType,
    pub segment_value: Vec<u32>,
}

impl AsPathSegment {
    /*
        +-----------------+-----------------+-------------------------+
        | Segment type    | Segment length  | Segment value (ASNs)    |
        | (1 octet)       | (1 octet)       | (2 or 4 octets each)    |
        +-----------------+-----------------+-------------------------+
    */
    pub fn decode_path(buf: &mut Octets<'_>, four_octets: bool) -> Result<Vec<AsPathSegment>> {
        let mut segments = Vec::new();
        while buf.cap() > 0 {
            let segment_type = AsPathSegmentType::try_from(buf.get_u8()?)
                .map_err(|_| Error::BufferTooShort)?;
            let segment_length = buf.get_u8()?;
            if segment_length == 0 {
                return Err(Error::BufferTooShort);
            }
            let mut segment_value = Vec::with_capacity(segment_length as usize);
            for _ in 0..segment_length {
                segment_value.push(if four_octets {
                    buf.get_u32()?
                } else {
                    buf.get_u16()? as u32
                });
            }
            segments.push(AsPathSegment {
                segment_type,
                segment_value,
            });
        }
        Ok(segments)
    }
}

/// Flattens an AS path into a list of ASNs. Sequences are kept whole, sets
/// are reduced to their first ASN.
pub fn flatten_as_path(segments: &[AsPathSegment]) -> Vec<u32> {
    let mut path = Vec::new();
    for segment in segments {
        match segment.segment_type {
            AsPathSegmentType::AsSequence | AsPathSegmentType::AsConfedSequence => {
                path.extend_from_slice(&segment.segment_value)
            }
            AsPathSegmentType::AsSet | AsPathSegmentType::AsConfedSet => {
                path.extend(segment.segment_value.first())
            }
        }
    }
    path
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregator {
    pub as_num: u32,
    pub ip_addr: Ipv4Addr,
}

// RFC 8092 BGP Large Communities Attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LargeCommunity {
    pub global_admin: u32,
    pub local_data1: u32,
    pub local_data2: u32,
}

impl fmt::Display for LargeCommunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.global_admin, self.local_data1, self.local_data2
        )
    }
}

/*
    RFC 4760 MP_REACH_NLRI
    +---------------------------------------------------------+
    | Address Family Identifier (2 octets)                    |
    +---------------------------------------------------------+
    | Subsequent Address Family Identifier (1 octet)          |
    +---------------------------------------------------------+
    | Length of Next Hop Network Address (1 octet)            |
    +---------------------------------------------------------+
    | Network Address of Next Hop (variable)                  |
    +---------------------------------------------------------+
    | Reserved (1 octet)                                      |
    +---------------------------------------------------------+
    | Network Layer Reachability Information (variable)       |
    +---------------------------------------------------------+
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpReachNlri {
    pub family: Family,
    pub next_hop: Option<IpAddr>,
    /// Empty for families that are not supported.
    pub nlri: Vec<Cidr>,
}

fn decode_mp_next_hop(family: Family, octets: &[u8]) -> Result<IpAddr> {
    let vpn = family == Family::IPV4_VPN || family == Family::IPV6_VPN;
    let octets = match (vpn, octets.len()) {
        (false, 4 | 16 | 32) => octets,
        (true, 12 | 24 | 48) => &octets[8..],
        _ => return Err(Error::BufferTooShort),
    };
    Ok(match octets.len() {
        4 => IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])),
        // With a link-local address, keep the global one.
        _ => {
            let mut addr = [0u8; 16];
            addr.copy_from_slice(&octets[..16]);
            IpAddr::V6(Ipv6Addr::from(addr))
        }
    })
}

impl MpReachNlri {
    pub fn decode(buf: &mut Octets<'_>, opts: &DecodeOptions) -> Result<MpReachNlri> {
        let family = Family::new(buf.get_u16()?, buf.get_u8()?);
        family.check_known()?;
        let next_hop = buf.get_bytes_with_u8_length()?;
        buf.skip(1)?; // Reserved
        if !family.is_supported() {
            buf.skip(buf.cap())?;
            return Ok(MpReachNlri {
                family,
                next_hop: None,
                nlri: Vec::new(),
            });
        }
        let next_hop = decode_mp_next_hop(family, next_hop.buf())?;
        let nlri = Cidr::decode_all(buf, family, opts.add_path(family))?;
        Ok(MpReachNlri {
            family,
            next_hop: Some(next_hop),
            nlri,
        })
    }
}

/*
    RFC 4760 MP_UNREACH_NLRI
    +---------------------------------------------------------+
    | Address Family Identifier (2 octets)                    |
    +---------------------------------------------------------+
    | Subsequent Address Family Identifier (1 octet)          |
    +---------------------------------------------------------+
    | Withdrawn Routes (variable)                             |
    +---------------------------------------------------------+
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpUnreachNlri {
    pub family: Family,
    /// Empty for families that are not supported.
    pub withdrawn_routes: Vec<Cidr>,
}

impl MpUnreachNlri {
    pub fn decode(buf: &mut Octets<'_>, opts: &DecodeOptions) -> Result<MpUnreachNlri> {
        let family = Family::new(buf.get_u16()?, buf.get_u8()?);
        family.check_known()?;
        if !family.is_supported() {
            buf.skip(buf.cap())?;
            return Ok(MpUnreachNlri {
                family,
                withdrawn_routes: Vec::new(),
            });
        }
        let withdrawn_routes = Cidr::decode_all(buf, family, opts.add_path(family))?;
        Ok(MpUnreachNlri {
            family,
            withdrawn_routes,
        })
    }
}

/// Path attributes of an UPDATE message. Attributes without use for a
/// collector are skipped.
#[derive(Debug, Clone, Default)]
pub struct PathAttributes {
    pub origin: Option<Origin>,
    pub as_path: Option<Vec<AsPathSegment>>,
    pub next_hop: Option<Ipv4Addr>,
    pub multi_exit_disc: Option<u32>,
    pub local_pref: Option<u32>,
    pub atomic_aggregate: bool,
    pub aggregator: Option<Aggregator>,
    pub communities: Vec<u32>,
    pub as4_path: Option<Vec<AsPathSegment>>,
    pub large_communities: Vec<LargeCommunity>,
    pub mp_reach: Option<MpReachNlri>,
    pub mp_unreach: Option<MpUnreachNlri>,
}

impl PathAttributes {
    /// Flattened AS path, with the AS4_PATH merged in when the AS path was
    /// received with 2-octet ASNs (RFC 6793).
    pub fn flat_as_path(&self) -> Vec<u32> {
        let path = self
            .as_path
            .as_deref()
            .map(flatten_as_path)
            .unwrap_or_default();
        let Some(as4_path) = self.as4_path.as_deref().map(flatten_as_path) else {
            return path;
        };
        if as4_path.len() > path.len() || !path.contains(&AS_TRANS) {
            return path;
        }
        let mut merged = path[..path.len() - as4_path.len()].to_vec();
        merged.extend_from_slice(&as4_path);
        merged
    }

    /*
        0                   1
        0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
        |  Attr. Flags  |Attr. Type Code|
        +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    */
    pub fn decode(buf: &mut Octets<'_>, opts: &DecodeOptions) -> Result<PathAttributes> {
        let mut attrs = PathAttributes::default();
        while buf.cap() > 0 {
            let attr_flags = PathAttributeFlags::from(buf.get_u8()?);
            let attr_type_code = buf.get_u8()?;
            let attr_len = if attr_flags.extended_length {
                buf.get_u16()?
            } else {
                buf.get_u8()?.into()
            };
            let mut value = buf.get_bytes(attr_len as usize).or_else(|_| {
                Error::err_update(
                    UpdateMsgErrorSubcode::AttributeLengthError,
                    ErrorHandling::SessionReset,
                    "attribute length overrun",
                )
            })?;
            attrs
                .decode_value(attr_type_code, &mut value, opts)
                .map_err(|err| match err {
                    // A short read inside an attribute is malformed content.
                    Error::BufferTooShort => malformed_attribute(attr_type_code),
                    err => err,
                })?;
        }
        Ok(attrs)
    }

    fn decode_value(
        &mut self,
        attr_type_code: u8,
        buf: &mut Octets<'_>,
        opts: &DecodeOptions,
    ) -> Result<()> {
        let attr_len = buf.cap();
        match attr_type_code {
            1 => {
                if attr_len != 1 {
                    return Err(Error::BufferTooShort);
                }
                self.origin = Some(Origin::try_from(buf.get_u8()?).or_else(|_| {
                    Error::err_update(
                        UpdateMsgErrorSubcode::InvalidOriginAttribute,
                        ErrorHandling::TreatAsWithdraw,
                        "invalid origin",
                    )
                })?);
            }
            2 => self.as_path = Some(AsPathSegment::decode_path(buf, opts.four_octet_as)?),
            3 => {
                if attr_len != 4 {
                    return Err(Error::BufferTooShort);
                }
                self.next_hop = Some(Ipv4Addr::from(buf.get_u32()?));
            }
            4 | 5 => {
                if attr_len != 4 {
                    return Err(Error::BufferTooShort);
                }
                let value = buf.get_u32()?;
                if attr_type_code == 4 {
                    self.multi_exit_disc = Some(value);
                } else {
                    self.local_pref = Some(value);
                }
            }
            6 => {
                if attr_len != 0 {
                    return Err(Error::BufferTooShort);
                }
                self.atomic_aggregate = true;
            }
            7 => {
                let as_num = match attr_len {
                    6 => buf.get_u16()? as u32,
                    8 => buf.get_u32()?,
                    _ => return Err(Error::BufferTooShort),
                };
                let ip_addr = Ipv4Addr::from(buf.get_u32()?);
                self.aggregator = Some(Aggregator { as_num, ip_addr });
            }
            8 => {
                if attr_len % 4 != 0 {
                    return Err(Error::BufferTooShort);
                }
                while buf.cap() > 0 {
                    self.communities.push(buf.get_u32()?);
                }
            }
            14 => {
                if self.mp_reach.is_some() {
                    return Error::err_update(
                        UpdateMsgErrorSubcode::MalformedAttributeList,
                        ErrorHandling::SessionReset,
                        "duplicate MP_REACH_NLRI",
                    );
                }
                self.mp_reach = Some(MpReachNlri::decode(buf, opts)?);
            }
            15 => {
                if self.mp_unreach.is_some() {
                    return Error::err_update(
                        UpdateMsgErrorSubcode::MalformedAttributeList,
                        ErrorHandling::SessionReset,
                        "duplicate MP_UNREACH_NLRI",
                    );
                }
                self.mp_unreach = Some(MpUnreachNlri::decode(buf, opts)?);
            }
            17 => self.as4_path = Some(AsPathSegment::decode_path(buf, true)?),
            32 => {
                if attr_len % 12 != 0 {
                    return Err(Error::BufferTooShort);
                }
                while buf.cap() > 0 {
                    self.large_communities.push(LargeCommunity {
                        global_admin: buf.get_u32()?,
                        local_data1: buf.get_u32()?,
                        local_data2: buf.get_u32()?,
                    });
                }
            }
            _ => (),
        }
        Ok(())
    }
}

// RFC 7606 error handling for each attribute.
fn malformed_attribute(attr_type_code: u8) -> Error {
    let (subcode, handling, reason) = match attr_type_code {
        1 => (
            UpdateMsgErrorSubcode::AttributeLengthError,
            ErrorHandling::TreatAsWithdraw,
            "malformed origin",
        ),
        2 => (
            UpdateMsgErrorSubcode::MalformedAsPath,
            ErrorHandling::TreatAsWithdraw,
            "malformed AS path",
        ),
        3 => (
            UpdateMsgErrorSubcode::InvalidNextHopAttribute,
            ErrorHandling::TreatAsWithdraw,
            "malformed next hop",
        ),
        4 => (
            UpdateMsgErrorSubcode::AttributeLengthError,
            ErrorHandling::TreatAsWithdraw,
            "malformed multi-exit discriminator",
        ),
        5 => (
            UpdateMsgErrorSubcode::AttributeLengthError,
            ErrorHandling::TreatAsWithdraw,
            "malformed local preference",
        ),
        6 => (
            UpdateMsgErrorSubcode::AttributeLengthError,
            ErrorHandling::AttributeDiscard,
            "malformed atomic aggregate",
        ),
        7 => (
            UpdateMsgErrorSubcode::AttributeLengthError,
            ErrorHandling::AttributeDiscard,
            "malformed aggregator",
        ),
        8 => (
            UpdateMsgErrorSubcode::OptionalAttributeError,
            ErrorHandling::TreatAsWithdraw,
            "malformed communities",
        ),
        14 => (
            UpdateMsgErrorSubcode::OptionalAttributeError,
            ErrorHandling::AfiSafiDisable,
            "malformed MP_REACH_NLRI",
        ),
        15 => (
            UpdateMsgErrorSubcode::OptionalAttributeError,
            ErrorHandling::AfiSafiDisable,
            "malformed MP_UNREACH_NLRI",
        ),
        17 => (
            UpdateMsgErrorSubcode::MalformedAsPath,
            ErrorHandling::AttributeDiscard,
            "malformed AS4 path",
        ),
        32 => (
            UpdateMsgErrorSubcode::OptionalAttributeError,
            ErrorHandling::TreatAsWithdraw,
            "malformed large communities",
        ),
        _ => (
            UpdateMsgErrorSubcode::MalformedAttributeList,
            ErrorHandling::SessionReset,
            "malformed attribute",
        ),
    };
    Error::Update(UpdateError::new(subcode, handling, reason))
}

/*
    +-----------------------------------------------------+
    |   Withdrawn Routes Length (2 octets)                |
    +-----------------------------------------------------+
    |   Withdrawn Routes (variable)                       |
    +-----------------------------------------------------+
    |   Total Path Attribute Length (2 octets)            |
    +-----------------------------------------------------+
    |   Path Attributes (variable)                        |
    +-----------------------------------------------------+
    |   Network Layer Reachability Information (variable) |
    +-----------------------------------------------------+
*/
#[derive(Debug, Clone, Default)]
pub struct UpdateMsg {
    pub withdrawn_routes: Vec<Cidr>,
    pub path_attributes: PathAttributes,
    pub nlri: Vec<Cidr>,
}

impl UpdateMsg {
    pub fn decode(buf: &mut Octets<'_>, opts: &DecodeOptions) -> Result<UpdateMsg> {
        let add_path = opts.add_path(Family::IPV4_UNICAST);
        let invalid_network = |_| {
            Error::Update(UpdateError::new(
                UpdateMsgErrorSubcode::InvalidNetworkField,
                ErrorHandling::SessionReset,
                "invalid network field",
            ))
        };

        let mut withdrawn_routes_buf = buf.get_bytes_with_u16_length().or_else(|_| {
            Error::err_update(
                UpdateMsgErrorSubcode::MalformedAttributeList,
                ErrorHandling::SessionReset,
                "withdrawn routes length overrun",
            )
        })?;
        let withdrawn_routes =
            Cidr::decode_all(&mut withdrawn_routes_buf, Family::IPV4_UNICAST, add_path)
                .map_err(invalid_network)?;

        let mut path_attributes_buf = buf.get_bytes_with_u16_length().or_else(|_| {
            Error::err_update(
                UpdateMsgErrorSubcode::MalformedAttributeList,
                ErrorHandling::SessionReset,
                "path attributes length overrun",
            )
        })?;
        let path_attributes = PathAttributes::decode(&mut path_attributes_buf, opts)?;

        let nlri = Cidr::decode_all(buf, Family::IPV4_UNICAST, add_path).map_err(invalid_network)?;
        if !nlri.is_empty() && path_attributes.next_hop.is_none() {
            return Error::err_update(
                UpdateMsgErrorSubcode::MissingWellKnownAttribute,
                ErrorHandling::TreatAsWithdraw,
                "missing next hop",
            );
        }

        Ok(UpdateMsg {
            withdrawn_routes,
            path_attributes,
            nlri,
        })
    }
}

/*
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    | Error code    | Error subcode |   Data (variable)             |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone)]
pub struct NotificationMsg {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

impl NotificationMsg {
    pub fn decode(buf: &mut Octets<'_>) -> Result<NotificationMsg> {
        Ok(NotificationMsg {
            error_code: buf.get_u8()?,
            error_subcode: buf.get_u8()?,
            data: buf.get_bytes(buf.cap())?.to_vec(),
        })
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Open(OpenMsg),
    Update(UpdateMsg),
    Notification(NotificationMsg),
    Keepalive,
    RouteRefresh,
}

impl Message {
    /// Decodes one complete BGP message, header included.
    pub fn decode(buf: &mut Octets<'_>, opts: &DecodeOptions) -> Result<Message> {
        let header = MessageHeader::decode(buf)?;
        let mut body = buf.get_bytes(header.length as usize - HEADER_LEN)?;
        match header.msg_type {
            MsgType::Open => Ok(Message::Open(OpenMsg::decode(&mut body)?)),
            MsgType::Update => Ok(Message::Update(UpdateMsg::decode(&mut body, opts)?)),
            MsgType::Notification => Ok(Message::Notification(NotificationMsg::decode(&mut body)?)),
            MsgType::Keepalive => Ok(Message::Keepalive),
            MsgType::RouteRefresh => Ok(Message::RouteRefresh),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Wraps a BGP message body into a full message.
    pub(crate) fn bgp_message(msg_type: u8, body: &[u8]) -> Vec<u8> {
        let mut msg = vec![0xff; 16];
        msg.extend_from_slice(&((HEADER_LEN + body.len()) as u16).to_be_bytes());
        msg.push(msg_type);
        msg.extend_from_slice(body);
        msg
    }

    pub(crate) fn open_body(asn: u16, bgp_id: [u8; 4], caps: &[u8]) -> Vec<u8> {
        let mut body = vec![4];
        body.extend_from_slice(&asn.to_be_bytes());
        body.extend_from_slice(&90u16.to_be_bytes());
        body.extend_from_slice(&bgp_id);
        if caps.is_empty() {
            body.push(0);
        } else {
            body.push(caps.len() as u8 + 2);
            body.push(2);
            body.push(caps.len() as u8);
            body.extend_from_slice(caps);
        }
        body
    }

    pub(crate) fn add_path_cap(afi: u16, safi: u8, mode: u8) -> Vec<u8> {
        let mut cap = vec![69, 4];
        cap.extend_from_slice(&afi.to_be_bytes());
        cap.push(safi);
        cap.push(mode);
        cap
    }

    fn attr(flags: u8, code: u8, value: &[u8]) -> Vec<u8> {
        let mut out = vec![flags, code, value.len() as u8];
        out.extend_from_slice(value);
        out
    }

    fn update_body(withdrawn: &[u8], attrs: &[u8], nlri: &[u8]) -> Vec<u8> {
        let mut body = (withdrawn.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(withdrawn);
        body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        body.extend_from_slice(attrs);
        body.extend_from_slice(nlri);
        body
    }

    fn decode_update(body: &[u8], opts: &DecodeOptions) -> Result<UpdateMsg> {
        let msg = bgp_message(2, body);
        match Message::decode(&mut Octets::with_slice(&msg), opts)? {
            Message::Update(update) => Ok(update),
            other => panic!("unexpected message {other:?}"),
        }
    }

    fn four_octets() -> DecodeOptions {
        DecodeOptions {
            four_octet_as: true,
            ..Default::default()
        }
    }

    #[test]
    fn header_errors() {
        let mut msg = bgp_message(4, &[]);
        msg[0] = 0;
        assert!(matches!(
            Message::decode(&mut Octets::with_slice(&msg), &DecodeOptions::default()),
            Err(Error::MsgHeader(MsgHeaderErrorSubcode::ConnectionNotSync))
        ));
        let msg = bgp_message(9, &[]);
        assert!(matches!(
            Message::decode(&mut Octets::with_slice(&msg), &DecodeOptions::default()),
            Err(Error::MsgHeader(MsgHeaderErrorSubcode::BadMessageType))
        ));
        let msg = bgp_message(4, &[0]);
        assert!(matches!(
            Message::decode(&mut Octets::with_slice(&msg), &DecodeOptions::default()),
            Err(Error::MsgHeader(MsgHeaderErrorSubcode::BadMessageLength))
        ));
    }

    #[test]
    fn open_capabilities() {
        let mut caps = vec![1, 4, 0, 2, 0, 1]; // MP IPv6 unicast
        caps.extend_from_slice(&[65, 4, 0, 3, 0x0d, 0x40]); // AS 200000
        caps.extend_from_slice(&add_path_cap(1, 1, 3));
        caps.extend_from_slice(&[70, 0]); // Enhanced route refresh
        let msg = bgp_message(1, &open_body(23456, [192, 0, 2, 1], &caps));
        let Message::Open(open) =
            Message::decode(&mut Octets::with_slice(&msg), &DecodeOptions::default()).unwrap()
        else {
            panic!("not an open message");
        };
        assert_eq!(open.as_number, 200000);
        assert_eq!(open.bgp_identifier, Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(open.capabilities.multiprotocol, vec![Family::IPV6_UNICAST]);
        assert_eq!(
            open.capabilities.add_path,
            vec![AddPathCap {
                family: Family::IPV4_UNICAST,
                mode: AddPathMode::Both
            }]
        );
    }

    #[test]
    fn open_extended_parameters() {
        // RFC 9072 layout: 255, 255, extended length, then 2-octet lengths.
        let caps = add_path_cap(2, 1, 2);
        let mut body = vec![4, 0xfd, 0xe8, 0, 90, 10, 0, 0, 1];
        let ext_len = 3 + caps.len() as u16;
        body.extend_from_slice(&[255, 255]);
        body.extend_from_slice(&ext_len.to_be_bytes());
        body.push(2);
        body.extend_from_slice(&(caps.len() as u16).to_be_bytes());
        body.extend_from_slice(&caps);
        let msg = bgp_message(1, &body);
        let Message::Open(open) =
            Message::decode(&mut Octets::with_slice(&msg), &DecodeOptions::default()).unwrap()
        else {
            panic!("not an open message");
        };
        assert_eq!(open.as_number, 65000);
        assert_eq!(
            open.capabilities.add_path,
            vec![AddPathCap {
                family: Family::IPV6_UNICAST,
                mode: AddPathMode::Send
            }]
        );
    }

    #[test]
    fn add_path_negotiation() {
        let open = |caps: Vec<u8>| {
            OpenMsg::decode(&mut Octets::with_slice(&open_body(65000, [1, 1, 1, 1], &caps)))
                .unwrap()
        };
        let mut sent_caps = add_path_cap(1, 1, 1);
        sent_caps.extend(add_path_cap(2, 1, 3));
        sent_caps.extend(add_path_cap(1, 128, 2));
        let sent = open(sent_caps);
        let mut received_caps = add_path_cap(1, 1, 2);
        received_caps.extend(add_path_cap(2, 1, 1));
        received_caps.extend(add_path_cap(1, 128, 3));
        let received = open(received_caps);

        let negotiated = negotiate_add_path(&sent, &received);
        assert_eq!(negotiated, HashSet::from([Family::IPV4_UNICAST]));
    }

    #[test]
    fn update_ipv4() {
        let mut attrs = attr(0x40, 1, &[0]);
        attrs.extend(attr(
            0x40,
            2,
            &[2, 3, 0, 0, 0xfd, 0xe8, 0, 0, 0xfd, 0xe9, 0, 0, 0xfd, 0xea],
        ));
        attrs.extend(attr(0x40, 3, &[192, 0, 2, 1]));
        attrs.extend(attr(0xc0, 8, &[0xfd, 0xe8, 0, 100, 0xfd, 0xe8, 0, 200]));
        attrs.extend(attr(0xc0, 32, &[0, 0, 0xfd, 0xe8, 0, 0, 0, 1, 0, 0, 0, 2]));
        let nlri = [24, 198, 51, 100, 32, 203, 0, 113, 7];
        let withdrawn = [16, 10, 1];
        let update =
            decode_update(&update_body(&withdrawn, &attrs, &nlri), &four_octets()).unwrap();

        assert_eq!(
            update.nlri.iter().map(|c| c.prefix).collect::<Vec<_>>(),
            vec![
                "198.51.100.0/24".parse::<IpNet>().unwrap(),
                "203.0.113.7/32".parse().unwrap()
            ]
        );
        assert_eq!(
            update.withdrawn_routes[0].prefix,
            "10.1.0.0/16".parse::<IpNet>().unwrap()
        );
        let attrs = &update.path_attributes;
        assert_eq!(attrs.origin, Some(Origin::Igp));
        assert_eq!(attrs.next_hop, Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(attrs.flat_as_path(), vec![65000, 65001, 65002]);
        assert_eq!(attrs.communities, vec![0xfde80064, 0xfde800c8]);
        assert_eq!(attrs.large_communities[0].to_string(), "65000:1:2");
    }

    #[test]
    fn as_path_flattening() {
        let segments = vec![
            AsPathSegment {
                segment_type: AsPathSegmentType::AsConfedSequence,
                segment_value: vec![65010, 65011],
            },
            AsPathSegment {
                segment_type: AsPathSegmentType::AsSequence,
                segment_value: vec![64496, 64497],
            },
            AsPathSegment {
                segment_type: AsPathSegmentType::AsSet,
                segment_value: vec![64500, 64501, 64502],
            },
        ];
        assert_eq!(
            flatten_as_path(&segments),
            vec![65010, 65011, 64496, 64497, 64500]
        );
    }

    #[test]
    fn as4_path_merge() {
        let mut attrs = attr(0x40, 2, &[2, 3, 0xfd, 0xe8, 0x5b, 0xa0, 0x5b, 0xa0]);
        attrs.extend(attr(0xc0, 17, &[2, 2, 0, 3, 0x0d, 0x40, 0, 3, 0x0d, 0x41]));
        attrs.extend(attr(0x40, 3, &[192, 0, 2, 1]));
        let update = decode_update(
            &update_body(&[], &attrs, &[24, 198, 51, 100]),
            &DecodeOptions::default(),
        )
        .unwrap();
        assert_eq!(
            update.path_attributes.flat_as_path(),
            vec![65000, 200000, 200001]
        );
    }

    #[test]
    fn rfc7606_classes() {
        let cases: Vec<(Vec<u8>, ErrorHandling)> = vec![
            (attr(0x40, 1, &[7]), ErrorHandling::TreatAsWithdraw),
            (attr(0x40, 2, &[2, 2, 0, 0, 0xfd]), ErrorHandling::TreatAsWithdraw),
            (attr(0x40, 3, &[1, 2, 3]), ErrorHandling::TreatAsWithdraw),
            (attr(0xc0, 8, &[1, 2, 3]), ErrorHandling::TreatAsWithdraw),
            (attr(0xc0, 7, &[1, 2, 3]), ErrorHandling::AttributeDiscard),
            (attr(0x80, 14, &[0, 2, 1, 5, 1]), ErrorHandling::AfiSafiDisable),
            (vec![0x40, 1, 10, 0], ErrorHandling::SessionReset),
        ];
        for (attrs, handling) in cases {
            match decode_update(&update_body(&[], &attrs, &[]), &four_octets()) {
                Err(Error::Update(UpdateError { handling: got, .. })) => {
                    assert_eq!(got, handling, "decoding {attrs:?}")
                }
                other => panic!("unexpected result {other:?} for {attrs:?}"),
            }
        }
    }

    #[test]
    fn mp_reach_families() {
        // IPv6 unicast with a global and a link-local next hop.
        let mut reach = vec![0, 2, 1, 32];
        reach.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        reach.extend_from_slice(&"fe80::1".parse::<Ipv6Addr>().unwrap().octets());
        reach.push(0);
        reach.extend_from_slice(&[48, 0x20, 0x01, 0x0d, 0xb8, 0, 1]);
        let mut attrs = attr(0x80, 14, &reach);

        // VPNv4 withdrawal with an RD of 65000:100.
        let mut unreach = vec![0, 1, 128];
        unreach.push(24 + 64 + 24);
        unreach.extend_from_slice(&[0x80, 0, 0]);
        unreach.extend_from_slice(&[0, 0, 0xfd, 0xe8, 0, 0, 0, 100]);
        unreach.extend_from_slice(&[10, 0, 0]);
        attrs.extend(attr(0x80, 15, &unreach));

        let update = decode_update(&update_body(&[], &attrs, &[]), &four_octets()).unwrap();
        let reach = update.path_attributes.mp_reach.unwrap();
        assert_eq!(reach.family, Family::IPV6_UNICAST);
        assert_eq!(reach.next_hop, Some("2001:db8::1".parse().unwrap()));
        assert_eq!(
            reach.nlri[0].prefix,
            "2001:db8:1::/48".parse::<IpNet>().unwrap()
        );

        let unreach = update.path_attributes.mp_unreach.unwrap();
        assert_eq!(unreach.family, Family::IPV4_VPN);
        assert_eq!(
            unreach.withdrawn_routes[0].prefix,
            "10.0.0.0/24".parse::<IpNet>().unwrap()
        );
        assert_eq!(
            unreach.withdrawn_routes[0].rd.map(|rd| rd.to_string()),
            Some("65000:100".to_string())
        );
    }

    #[test]
    fn labeled_and_evpn() {
        let labeled = [24 + 22, 0, 0x10, 0x01, 192, 0, 8];
        let cidr = Cidr::decode(
            &mut Octets::with_slice(&labeled),
            Family::IPV4_LABELED_UNICAST,
            false,
        )
        .unwrap()
        .unwrap();
        assert_eq!(cidr.prefix, "192.0.8.0/22".parse::<IpNet>().unwrap());

        let mut evpn = vec![5, 34];
        evpn.extend_from_slice(&[0, 1, 192, 0, 2, 1, 0, 5]); // RD 192.0.2.1:5
        evpn.extend_from_slice(&[0; 10]); // ESI
        evpn.extend_from_slice(&[0; 4]); // Ethernet tag
        evpn.push(24);
        evpn.extend_from_slice(&[198, 51, 100, 0]);
        evpn.extend_from_slice(&[0; 4]); // Gateway
        evpn.extend_from_slice(&[0, 0, 0x11]); // Label
        let cidr = Cidr::decode(&mut Octets::with_slice(&evpn), Family::EVPN, false)
            .unwrap()
            .unwrap();
        assert_eq!(cidr.prefix, "198.51.100.0/24".parse::<IpNet>().unwrap());
        assert_eq!(cidr.rd.unwrap().to_string(), "192.0.2.1:5");

        // MAC/IP advertisement routes carry no prefix.
        let mac_ip = [2, 3, 0, 0, 0];
        assert_eq!(
            Cidr::decode(&mut Octets::with_slice(&mac_ip), Family::EVPN, false).unwrap(),
            None
        );
    }

    #[test]
    fn add_path_nlri() {
        let opts = DecodeOptions {
            four_octet_as: true,
            add_path: Arc::new(HashSet::from([Family::IPV4_UNICAST])),
        };
        let attrs = attr(0x40, 3, &[192, 0, 2, 1]);
        let nlri = [0, 0, 0, 1, 24, 198, 51, 100, 0, 0, 0, 2, 24, 198, 51, 100];
        let update = decode_update(&update_body(&[], &attrs, &nlri), &opts).unwrap();
        assert_eq!(
            update.nlri.iter().map(|c| c.path_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn unsupported_family_is_skipped() {
        let mut reach = vec![0, 1, 133, 0, 0];
        reach.extend_from_slice(&[5, 1, 24, 10, 0, 0]);
        let attrs = attr(0x80, 14, &reach);
        let update = decode_update(&update_body(&[], &attrs, &[]), &four_octets()).unwrap();
        let reach = update.path_attributes.mp_reach.unwrap();
        assert_eq!(reach.family.to_string(), "ipv4-flowspec");
        assert!(reach.nlri.is_empty());
        assert!(!reach.family.is_supported());
    }

    #[test]
    fn unknown_family_disables_afi_safi() {
        let attrs = attr(0x80, 15, &[0, 57, 65, 24, 10, 0, 0]);
        match decode_update(&update_body(&[], &attrs, &[]), &four_octets()) {
            Err(Error::Update(err)) => {
                assert_eq!(err.handling, ErrorHandling::AfiSafiDisable);
                assert_eq!(err.reason, "unknown route family");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(Family::new(57, 65).to_string(), "afi-57-safi-65");
        assert_eq!(Family::new(25, 65).to_string(), "l2vpn-vpls");
    }
}
