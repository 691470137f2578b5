use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/*
    RFC 4364 Route Distinguisher
    0                   1                   2                   3
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |             Type              |                               |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               +
    |                          Value (6 octets)                     |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

    Type 0: Administrator = 2-octet ASN,   Assigned Number = 4 octets
    Type 1: Administrator = IPv4 address,  Assigned Number = 2 octets
    Type 2: Administrator = 4-octet ASN,   Assigned Number = 2 octets
*/
/// A route distinguisher kept in its 8-octet wire form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RouteDistinguisher(u64);

impl RouteDistinguisher {
    /// Stands for a distinguisher that could not be read from the wire. It is
    /// the wire type 65535 with a zero value, and no parsed distinguisher uses
    /// type 65535.
    pub const ERROR: RouteDistinguisher = RouteDistinguisher(65535 << 48);

    pub const fn new(raw: u64) -> RouteDistinguisher {
        RouteDistinguisher(raw)
    }

    /// Builds a distinguisher from its wire encoding. Anything but 8 octets
    /// yields [`RouteDistinguisher::ERROR`].
    pub fn from_wire(buf: &[u8]) -> RouteDistinguisher {
        match <[u8; 8]>::try_from(buf) {
            Ok(octets) => RouteDistinguisher(u64::from_be_bytes(octets)),
            Err(_) => RouteDistinguisher::ERROR,
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn rd_type(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    fn value(&self) -> u64 {
        self.0 & 0xffff_ffff_ffff
    }
}

impl From<u64> for RouteDistinguisher {
    fn from(raw: u64) -> Self {
        RouteDistinguisher(raw)
    }
}

impl FromStr for RouteDistinguisher {
    type Err = Error;

    /// Accepts `ASN:index`, `IPv4:index`, `type:admin:index` and a bare
    /// 64-bit integer. ASNs that fit in 2 octets produce a type 0
    /// distinguisher unless type 2 is requested explicitly.
    fn from_str(text: &str) -> Result<RouteDistinguisher> {
        let elems: Vec<&str> = text.split(':').collect();
        let (rd_type, admin, index) = match elems[..] {
            [raw] => {
                let raw = raw
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidRouteDistinguisher("not a 64-bit number"))?;
                if raw >> 48 > 2 {
                    return Err(Error::InvalidRouteDistinguisher("unknown type"));
                }
                return Ok(RouteDistinguisher(raw));
            }
            [rd_type, admin, index] => match rd_type.parse::<u8>() {
                Ok(t @ 0..=2) => (Some(t), admin, index),
                _ => return Err(Error::InvalidRouteDistinguisher("unknown type")),
            },
            [admin, index] => (None, admin, index),
            _ => return Err(Error::InvalidRouteDistinguisher("too many fields")),
        };

        if rd_type == Some(1) || (rd_type.is_none() && admin.contains('.')) {
            let ip = admin
                .parse::<Ipv4Addr>()
                .map_err(|_| Error::InvalidRouteDistinguisher("bad IPv4 administrator"))?;
            let index = index
                .parse::<u16>()
                .map_err(|_| Error::InvalidRouteDistinguisher("bad IPv4 assigned number"))?;
            return Ok(RouteDistinguisher(
                1 << 48 | (u32::from(ip) as u64) << 16 | index as u64,
            ));
        }

        let asn = admin
            .parse::<u32>()
            .map_err(|_| Error::InvalidRouteDistinguisher("bad ASN administrator"))?;
        let index = index
            .parse::<u32>()
            .map_err(|_| Error::InvalidRouteDistinguisher("bad ASN assigned number"))?;
        match rd_type {
            Some(0) if asn > 65535 => Err(Error::InvalidRouteDistinguisher(
                "type 0 needs a 2-octet ASN",
            )),
            Some(0) | None if asn <= 65535 => {
                Ok(RouteDistinguisher((asn as u64) << 32 | index as u64))
            }
            _ if index > 65535 => Err(Error::InvalidRouteDistinguisher(
                "type 2 needs a 2-octet assigned number",
            )),
            _ => Ok(RouteDistinguisher(
                2 << 48 | (asn as u64) << 16 | index as u64,
            )),
        }
    }
}

impl fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value();
        match self.rd_type() {
            0 => write!(f, "{}:{}", (value >> 32) & 0xffff, value & 0xffff_ffff),
            1 => write!(
                f,
                "{}:{}",
                Ipv4Addr::from((value >> 16) as u32),
                value & 0xffff
            ),
            2 => {
                let asn = (value >> 16) & 0xffff_ffff;
                if asn <= 65535 {
                    write!(f, "2:{}:{}", asn, value & 0xffff)
                } else {
                    write!(f, "{}:{}", asn, value & 0xffff)
                }
            }
            _ => Ok(()),
        }
    }
}

impl TryFrom<String> for RouteDistinguisher {
    type Error = Error;

    fn try_from(text: String) -> Result<RouteDistinguisher> {
        text.parse()
    }
}

impl From<RouteDistinguisher> for String {
    fn from(rd: RouteDistinguisher) -> String {
        rd.to_string()
    }
}

/// Set of accepted distinguishers. An empty set accepts everything; `0`
/// stands for routes without a distinguisher.
#[derive(Debug, Clone, Default)]
pub struct RdFilter {
    accepted: Vec<RouteDistinguisher>,
}

impl RdFilter {
    pub fn new(accepted: Vec<RouteDistinguisher>) -> RdFilter {
        RdFilter { accepted }
    }

    pub fn is_accepted(&self, rd: RouteDistinguisher) -> bool {
        self.accepted.is_empty() || self.accepted.contains(&rd)
    }
}
