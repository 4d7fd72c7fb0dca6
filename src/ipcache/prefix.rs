//! Network prefixes in canonical form

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::{Error, Result};

/// An IPv4 or IPv6 address block (address + mask length).
///
/// Always canonical: bits beyond the mask are zero, so `10.1.2.3/8` and
/// `10.0.0.0/8` are the same prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

impl Prefix {
    /// Create a prefix, zeroing host bits. Fails if `len` exceeds the
    /// address family's width.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self> {
        let max = max_len(&addr);
        if len > max {
            return Err(Error::invalid_prefix(
                format!("{}/{}", addr, len),
                format!("mask length exceeds {}", max),
            ));
        }
        Ok(Self {
            addr: mask(addr, len),
            len,
        })
    }

    /// Single-address prefix (/32 or /128)
    pub fn host(addr: IpAddr) -> Self {
        Self {
            len: max_len(&addr),
            addr,
        }
    }

    /// Network address
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Mask length in bits
    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Whether this prefix covers exactly one address
    pub fn is_host(&self) -> bool {
        self.len == max_len(&self.addr)
    }

    /// Whether `ip` falls inside this prefix
    pub fn contains(&self, ip: IpAddr) -> bool {
        ip.is_ipv4() == self.addr.is_ipv4() && mask(ip, self.len) == self.addr
    }
}

fn max_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let masked = if len == 0 {
                0
            } else {
                bits & (u32::MAX << (32 - u32::from(len)))
            };
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let masked = if len == 0 {
                0
            } else {
                bits & (u128::MAX << (128 - u32::from(len)))
            };
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl FromStr for Prefix {
    type Err = Error;

    /// Parse `addr/len`, or a bare address as a host prefix
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr
                    .parse()
                    .map_err(|e| Error::invalid_prefix(s, format!("bad address: {}", e)))?;
                let len: u8 = len
                    .parse()
                    .map_err(|e| Error::invalid_prefix(s, format!("bad mask length: {}", e)))?;
                Self::new(addr, len)
            }
            None => s
                .parse::<IpAddr>()
                .map(Self::host)
                .map_err(|e| Error::invalid_prefix(s, format!("bad address: {}", e))),
        }
    }
}

impl From<IpAddr> for Prefix {
    fn from(addr: IpAddr) -> Self {
        Self::host(addr)
    }
}
