//! CIDR parsing and deterministic address allocation inside a tunnel subnet.
//!
//! The server always claims the first usable address (base + 1). Clients are
//! numbered from 1 and receive base + 1 + counter, skipping the network and
//! broadcast addresses on IPv4.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// A parsed subnet in `addr/prefix` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    base: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(base: IpAddr, prefix: u8) -> Result<Self> {
        let max = match base {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(Error::InvalidSubnet(format!("/{prefix} exceeds /{max}")));
        }
        // Normalize to the network base so arithmetic starts from a known point.
        let base = match base {
            IpAddr::V4(v4) => {
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
        };
        Ok(Self { base, prefix })
    }

    pub fn base(&self) -> IpAddr {
        self.base
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.base, IpAddr::V4(_))
    }

    /// Total addresses covered by the subnet, saturating at `u128::MAX`.
    pub fn total_addresses(&self) -> u128 {
        let bits = match self.base {
            IpAddr::V4(_) => 32 - self.prefix as u32,
            IpAddr::V6(_) => 128 - self.prefix as u32,
        };
        1u128.checked_shl(bits).unwrap_or(u128::MAX)
    }

    /// Whether `addr` falls inside this subnet.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.base, addr) {
            (IpAddr::V4(base), IpAddr::V4(a)) => {
                let mask = if self.prefix == 0 { 0 } else { u32::MAX << (32 - self.prefix) };
                u32::from(a) & mask == u32::from(base)
            }
            (IpAddr::V6(base), IpAddr::V6(a)) => {
                let mask = if self.prefix == 0 { 0 } else { u128::MAX << (128 - self.prefix) };
                u128::from(a) & mask == u128::from(base)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidSubnet(format!("missing prefix in {s:?}")))?;
        let base: IpAddr = addr
            .parse()
            .map_err(|_| Error::InvalidSubnet(format!("bad address in {s:?}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| Error::InvalidSubnet(format!("bad prefix in {s:?}")))?;
        Self::new(base, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

/// First usable address of the subnet: base + 1 (IPv6: low 64 bits + 1).
pub fn server_ip(subnet: &Cidr) -> IpAddr {
    match subnet.base {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4).wrapping_add(1))),
        IpAddr::V6(v6) => {
            let raw = u128::from(v6);
            let high = raw & (!0u128 << 64);
            let low = (raw as u64).wrapping_add(1);
            IpAddr::V6(Ipv6Addr::from(high | low as u128))
        }
    }
}

/// Deterministic client address: base + 1 + counter, for counter >= 1.
///
/// IPv4 refuses counters that would land on or past the broadcast address.
pub fn client_ip(subnet: &Cidr, counter: u32) -> Result<IpAddr> {
    if counter == 0 {
        return Err(Error::ClientCounterOutOfRange);
    }
    match subnet.base {
        IpAddr::V4(v4) => {
            let total = subnet.total_addresses();
            // Reserve the network address, the server address and broadcast.
            if u128::from(counter) >= total.saturating_sub(2) {
                return Err(Error::ClientCounterOutOfRange);
            }
            let base = u32::from(v4);
            let addr = base
                .checked_add(1)
                .and_then(|a| a.checked_add(counter))
                .ok_or(Error::ClientCounterOutOfRange)?;
            let offset = u128::from(addr - base);
            if offset == 0 || offset == total - 1 {
                return Err(Error::AddressIsNetworkOrBroadcast);
            }
            Ok(IpAddr::V4(Ipv4Addr::from(addr)))
        }
        IpAddr::V6(v6) => {
            let raw = u128::from(v6);
            let high = raw & (!0u128 << 64);
            let low = (raw as u64)
                .checked_add(u64::from(counter) + 1)
                .ok_or(Error::ClientCounterOutOfRange)?;
            Ok(IpAddr::V6(Ipv6Addr::from(high | low as u128)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_normalize() -> Result<()> {
        let cidr: Cidr = "10.0.1.7/24".parse()?;
        assert_eq!(cidr.base(), "10.0.1.0".parse::<IpAddr>().unwrap());
        assert_eq!(cidr.prefix(), 24);
        assert_eq!(cidr.total_addresses(), 256);
        Ok(())
    }

    #[test]
    fn rejects_malformed() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("banana/24".parse::<Cidr>().is_err());
    }

    #[test]
    fn server_takes_first_usable() -> Result<()> {
        let v4: Cidr = "192.168.1.0/24".parse()?;
        assert_eq!(server_ip(&v4), "192.168.1.1".parse::<IpAddr>().unwrap());
        let v6: Cidr = "2001:db8::/32".parse()?;
        assert_eq!(server_ip(&v6), "2001:db8::1".parse::<IpAddr>().unwrap());
        Ok(())
    }

    #[test]
    fn client_allocation_is_deterministic() -> Result<()> {
        let subnet: Cidr = "10.0.0.0/24".parse()?;
        assert_eq!(client_ip(&subnet, 1)?, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(client_ip(&subnet, 1)?, client_ip(&subnet, 1)?);
        assert_eq!(client_ip(&subnet, 5)?, "10.0.0.6".parse::<IpAddr>().unwrap());
        Ok(())
    }

    #[test]
    fn tiny_subnet_exhausts() -> Result<()> {
        let subnet: Cidr = "10.0.0.0/30".parse()?;
        // base .0, server .1, single client .2, broadcast .3
        assert_eq!(client_ip(&subnet, 1)?, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert!(matches!(
            client_ip(&subnet, 2),
            Err(Error::ClientCounterOutOfRange)
        ));
        Ok(())
    }

    #[test]
    fn counter_zero_rejected() {
        let subnet: Cidr = "10.0.0.0/24".parse().unwrap();
        assert!(client_ip(&subnet, 0).is_err());
    }

    #[test]
    fn ipv6_increments_low_bits() -> Result<()> {
        let subnet: Cidr = "2001:db8::/64".parse()?;
        assert_eq!(
            client_ip(&subnet, 3)?,
            "2001:db8::4".parse::<IpAddr>().unwrap()
        );
        Ok(())
    }

    #[test]
    fn contains_checks_prefix() -> Result<()> {
        let subnet: Cidr = "10.1.0.0/16".parse()?;
        assert!(subnet.contains("10.1.200.7".parse().unwrap()));
        assert!(!subnet.contains("10.2.0.1".parse().unwrap()));
        assert!(!subnet.contains("2001:db8::1".parse().unwrap()));
        Ok(())
    }
}
