//! Borrowed view over the fixed part of an IP header.
//!
//! Only the fields the dataplane routes on are exposed: version, addresses
//! and the transport protocol number. Option parsing is out of scope.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

pub const IPV4_MIN_HEADER: usize = 20;
pub const IPV6_FIXED_HEADER: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Version nibble of the first byte; anything but 4 or 6 is refused.
pub fn version(packet: &[u8]) -> Result<IpVersion> {
    let first = *packet.first().ok_or(Error::TooShort)?;
    match first >> 4 {
        4 => Ok(IpVersion::V4),
        6 => Ok(IpVersion::V6),
        v => Err(Error::InvalidIpVersion(v)),
    }
}

fn check_v4(packet: &[u8]) -> Result<()> {
    if packet.len() < IPV4_MIN_HEADER {
        return Err(Error::TooShort);
    }
    // IHL is in 32-bit words; anything below 5 cannot hold the fixed header.
    if (packet[0] & 0x0f) < 5 {
        return Err(Error::BadIhl);
    }
    Ok(())
}

fn check_v6(packet: &[u8]) -> Result<()> {
    if packet.len() < IPV6_FIXED_HEADER {
        return Err(Error::TooShort);
    }
    Ok(())
}

/// Source address of the packet.
pub fn source(packet: &[u8]) -> Result<IpAddr> {
    match version(packet)? {
        IpVersion::V4 => {
            check_v4(packet)?;
            let octets: [u8; 4] = packet[12..16].try_into().map_err(|_| Error::TooShort)?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        IpVersion::V6 => {
            check_v6(packet)?;
            let octets: [u8; 16] = packet[8..24].try_into().map_err(|_| Error::TooShort)?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

/// Destination address of the packet.
pub fn destination(packet: &[u8]) -> Result<IpAddr> {
    match version(packet)? {
        IpVersion::V4 => {
            check_v4(packet)?;
            let octets: [u8; 4] = packet[16..20].try_into().map_err(|_| Error::TooShort)?;
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        IpVersion::V6 => {
            check_v6(packet)?;
            let octets: [u8; 16] = packet[24..40].try_into().map_err(|_| Error::TooShort)?;
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

/// Transport protocol number (IPv4 protocol field / IPv6 next-header).
pub fn protocol(packet: &[u8]) -> Result<u8> {
    match version(packet)? {
        IpVersion::V4 => {
            check_v4(packet)?;
            Ok(packet[9])
        }
        IpVersion::V6 => {
            check_v6(packet)?;
            Ok(packet[6])
        }
    }
}
