use crate::error::{BmpHeaderErrorSubcode, Error, Result};
use crate::message::{DecodeOptions, Message, NotificationMsg, OpenMsg};
use crate::rd::RouteDistinguisher;
use bytes::{Buf, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use octets::Octets;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio_util::codec::Decoder;

pub const BMP_VERSION: u8 = 3;
pub const COMMON_HEADER_LEN: usize = 6;
pub const PER_PEER_HEADER_LEN: usize = 42;
/// Largest BMP message accepted from an exporter. A peer up carrying two
/// extended OPEN messages stays well below this.
pub const MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum BmpMsgType {
    RouteMonitoring = 0,
    StatisticsReport = 1,
    PeerDownNotification = 2,
    PeerUpNotification = 3,
    Initiation = 4,
    Termination = 5,
    RouteMirroring = 6,
}

impl BmpMsgType {
    /// Whether a per-peer header follows the common header.
    pub fn has_peer_header(&self) -> bool {
        !matches!(self, BmpMsgType::Initiation | BmpMsgType::Termination)
    }
}

/*
    RFC 7854 Common Header
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+
    |    Version    |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                        Message Length                         |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |   Msg. Type   |
    +---------------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BmpHeader {
    pub version: u8,
    pub length: u32,
    pub msg_type: u8,
}

impl BmpHeader {
    pub fn decode(buf: &mut Octets<'_>) -> Result<BmpHeader> {
        let version = buf.get_u8()?;
        if version != BMP_VERSION {
            return Error::err_bmp(BmpHeaderErrorSubcode::UnsupportedVersion);
        }
        let length = buf.get_u32()?;
        if (length as usize) < COMMON_HEADER_LEN || length as usize > MAX_MESSAGE_LEN {
            return Error::err_bmp(BmpHeaderErrorSubcode::BadMessageLength);
        }
        let msg_type = buf.get_u8()?;
        Ok(BmpHeader {
            version,
            length,
            msg_type,
        })
    }

    /// `None` for message types this collector does not know about.
    pub fn kind(&self) -> Option<BmpMsgType> {
        BmpMsgType::try_from(self.msg_type).ok()
    }

    /// Label used when counting received messages.
    pub fn label(&self) -> &'static str {
        match self.kind() {
            Some(BmpMsgType::RouteMonitoring) => "route-monitoring",
            Some(BmpMsgType::StatisticsReport) => "statistics-report",
            Some(BmpMsgType::PeerDownNotification) => "peer-down-notification",
            Some(BmpMsgType::PeerUpNotification) => "peer-up-notification",
            Some(BmpMsgType::Initiation) => "initiation",
            Some(BmpMsgType::Termination) => "termination",
            Some(BmpMsgType::RouteMirroring) => "route-mirroring",
            None => "unknown",
        }
    }
}

/// A complete BMP message: its common header and the rest of the message.
#[derive(Debug, Clone)]
pub struct BmpFrame {
    pub header: BmpHeader,
    pub body: Bytes,
}

/// Splits a byte stream into BMP messages. The first message of the stream
/// must be an initiation: this is checked as soon as its header is read.
#[derive(Debug, Default)]
pub struct BmpCodec {
    header: Option<BmpHeader>,
    initiated: bool,
}

impl BmpCodec {
    /// A common header was read and its body is still incomplete.
    pub fn reading_body(&self) -> bool {
        self.header.is_some()
    }
}

impl Decoder for BmpCodec {
    type Item = BmpFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BmpFrame>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if src.len() < COMMON_HEADER_LEN {
                    return Ok(None);
                }
                let header =
                    BmpHeader::decode(&mut Octets::with_slice(&src[..COMMON_HEADER_LEN]))?;
                if !self.initiated {
                    if header.kind() != Some(BmpMsgType::Initiation) {
                        return Err(Error::NotInitiated);
                    }
                    self.initiated = true;
                }
                src.advance(COMMON_HEADER_LEN);
                self.header = Some(header);
                header
            }
        };
        let body_len = header.length as usize - COMMON_HEADER_LEN;
        if src.len() < body_len {
            return Ok(None);
        }
        self.header = None;
        Ok(Some(BmpFrame {
            header,
            body: src.split_to(body_len).freeze(),
        }))
    }
}

pub const PEER_TYPE_GLOBAL: u8 = 0;
pub const PEER_TYPE_L3VPN: u8 = 1;
pub const PEER_TYPE_LOCAL: u8 = 2;
pub const PEER_TYPE_LOC_RIB: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags(u8);

impl PeerFlags {
    /// V flag: the peer address is an IPv6 address.
    pub fn is_ipv6(&self) -> bool {
        self.0 & 0x80 != 0
    }

    /// L flag: routes are post-policy.
    pub fn is_post_policy(&self) -> bool {
        self.0 & 0x40 != 0
    }

    /// A flag: AS paths use the legacy 2-octet format.
    pub fn is_legacy_as_path(&self) -> bool {
        self.0 & 0x20 != 0
    }
}

/*
    RFC 7854 Per-Peer Header
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |   Peer Type   |  Peer Flags   |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |         Peer Distinguisher (present based on peer type)       |
    |                                                               |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                 Peer Address (16 bytes)                       |
    ~                                                               ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                           Peer AS                             |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                         Peer BGP ID                           |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                    Timestamp (seconds)                        |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                  Timestamp (microseconds)                     |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerPeerHeader {
    pub peer_type: u8,
    pub flags: PeerFlags,
    pub distinguisher: RouteDistinguisher,
    /// IPv4 peers are stored as IPv4-mapped addresses.
    pub address: Ipv6Addr,
    pub asn: u32,
    pub bgp_id: Ipv4Addr,
    pub timestamp_secs: u32,
    pub timestamp_micros: u32,
}

impl PerPeerHeader {
    pub fn decode(buf: &mut Octets<'_>) -> Result<PerPeerHeader> {
        if buf.cap() < PER_PEER_HEADER_LEN {
            return Error::err_bmp(BmpHeaderErrorSubcode::BadPeerHeader);
        }
        let peer_type = buf.get_u8()?;
        let flags = PeerFlags(buf.get_u8()?);
        let distinguisher = RouteDistinguisher::new(buf.get_u64()?);
        let raw = buf.get_bytes(16)?;
        let raw = raw.buf();
        let address = if flags.is_ipv6() {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Ipv6Addr::from(octets)
        } else {
            Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]).to_ipv6_mapped()
        };
        Ok(PerPeerHeader {
            peer_type,
            flags,
            distinguisher,
            address,
            asn: buf.get_u32()?,
            bgp_id: Ipv4Addr::from(buf.get_u32()?),
            timestamp_secs: buf.get_u32()?,
            timestamp_micros: buf.get_u32()?,
        })
    }

    /// Options to decode BGP messages sent by this peer, given the add-path
    /// families negotiated when it came up.
    pub fn decode_options(&self, negotiated: Option<&DecodeOptions>) -> DecodeOptions {
        DecodeOptions {
            four_octet_as: !self.flags.is_legacy_as_path(),
            add_path: negotiated.map(|opts| opts.add_path.clone()).unwrap_or_default(),
        }
    }
}

/*
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |          Information Type     |       Information Length      |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                 Information (variable)                        |
    ~                                                               ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformationTlv {
    pub info_type: u16,
    pub value: Vec<u8>,
}

pub const INIT_TLV_STRING: u16 = 0;
pub const INIT_TLV_SYS_DESCR: u16 = 1;
pub const INIT_TLV_SYS_NAME: u16 = 2;

pub const TERM_TLV_STRING: u16 = 0;
pub const TERM_TLV_REASON: u16 = 1;

impl InformationTlv {
    pub fn decode_all(buf: &mut Octets<'_>) -> Result<Vec<InformationTlv>> {
        let mut tlvs = Vec::new();
        while buf.cap() > 0 {
            let info_type = buf.get_u16()?;
            let value = buf.get_bytes_with_u16_length()?.to_vec();
            tlvs.push(InformationTlv { info_type, value });
        }
        Ok(tlvs)
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Reason carried by the reason TLV of a termination message.
pub fn termination_reason(code: u16) -> &'static str {
    match code {
        0 => "session administratively closed",
        1 => "unspecified reason",
        2 => "out of resources",
        3 => "redundant connection",
        4 => "session permanently administratively closed",
        _ => "unknown reason",
    }
}

/*
    RFC 7854 Peer Up Notification
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                 Local Address (16 bytes)                      |
    ~                                                               ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |         Local Port            |        Remote Port            |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                    Sent OPEN Message                          |
    ~                                                               ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                  Received OPEN Message                        |
    ~                                                               ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                 Information (variable)                        |
    ~                                                               ~
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
*/
#[derive(Debug, Clone)]
pub struct PeerUpNotification {
    pub local_address: Ipv6Addr,
    pub local_port: u16,
    pub remote_port: u16,
    pub sent_open: OpenMsg,
    pub received_open: OpenMsg,
    pub information: Vec<InformationTlv>,
}

fn decode_open(buf: &mut Octets<'_>) -> Result<OpenMsg> {
    match Message::decode(buf, &DecodeOptions::default())? {
        Message::Open(open) => Ok(open),
        _ => Error::err_bmp(BmpHeaderErrorSubcode::UnexpectedBgpMessage),
    }
}

impl PeerUpNotification {
    pub fn decode(buf: &mut Octets<'_>) -> Result<PeerUpNotification> {
        let mut local_address = [0u8; 16];
        local_address.copy_from_slice(buf.get_bytes(16)?.buf());
        Ok(PeerUpNotification {
            local_address: Ipv6Addr::from(local_address),
            local_port: buf.get_u16()?,
            remote_port: buf.get_u16()?,
            sent_open: decode_open(buf)?,
            received_open: decode_open(buf)?,
            information: InformationTlv::decode_all(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum PeerDownReason {
    LocalNotification = 1,
    LocalNoNotification = 2,
    RemoteNotification = 3,
    RemoteNoNotification = 4,
    PeerDeconfigured = 5,
    LocalSystemClosed = 6,
}

#[derive(Debug, Clone)]
pub struct PeerDownNotification {
    pub reason: Option<PeerDownReason>,
    pub notification: Option<NotificationMsg>,
}

impl PeerDownNotification {
    pub fn decode(buf: &mut Octets<'_>) -> Result<PeerDownNotification> {
        let reason = PeerDownReason::try_from(buf.get_u8()?).ok();
        let notification = match reason {
            Some(PeerDownReason::LocalNotification | PeerDownReason::RemoteNotification) => {
                match Message::decode(buf, &DecodeOptions::default())? {
                    Message::Notification(notification) => Some(notification),
                    _ => return Error::err_bmp(BmpHeaderErrorSubcode::UnexpectedBgpMessage),
                }
            }
            // FSM event code, TLVs or nothing at all.
            _ => None,
        };
        Ok(PeerDownNotification {
            reason,
            notification,
        })
    }
}

/// Body of a BMP message, after the per-peer header when there is one.
#[derive(Debug, Clone)]
pub enum BmpBody {
    Initiation(Vec<InformationTlv>),
    Termination(Vec<InformationTlv>),
    PeerUp(PeerUpNotification),
    PeerDown(PeerDownNotification),
    RouteMonitoring(Message),
    /// Statistics reports, route mirroring and unknown messages.
    Ignored,
}

impl BmpBody {
    pub fn decode(
        kind: Option<BmpMsgType>,
        buf: &mut Octets<'_>,
        opts: &DecodeOptions,
    ) -> Result<BmpBody> {
        Ok(match kind {
            Some(BmpMsgType::Initiation) => BmpBody::Initiation(InformationTlv::decode_all(buf)?),
            Some(BmpMsgType::Termination) => {
                BmpBody::Termination(InformationTlv::decode_all(buf)?)
            }
            Some(BmpMsgType::PeerUpNotification) => {
                BmpBody::PeerUp(PeerUpNotification::decode(buf)?)
            }
            Some(BmpMsgType::PeerDownNotification) => {
                BmpBody::PeerDown(PeerDownNotification::decode(buf)?)
            }
            Some(BmpMsgType::RouteMonitoring) => {
                BmpBody::RouteMonitoring(Message::decode(buf, opts)?)
            }
            _ => BmpBody::Ignored,
        })
    }
}
