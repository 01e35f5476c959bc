//! Tunnel addressing: CIDR math for interface address allocation and a
//! minimal IP header view used to route decrypted packets.

mod cidr;
mod header;

pub use cidr::{client_ip, server_ip, Cidr};
pub use header::{destination, protocol, source, version, IpVersion};
