//! Flow and protocol keys
//!
//! Both keys are 64-bit xxhash values. The flow key must be identical for
//! the two directions of a connection, so each endpoint is hashed on its
//! own and the halves are combined with a commutative add.

use xxhash_rust::xxh64::xxh64;

use crate::flow::{FlowCommon, Proto};

/// Hash an IP address to 64 bits so IPv4 and IPv6 share one width.
pub fn hash_addr(addr: &[u8]) -> u64 {
    xxh64(addr, 0)
}

fn hash_endpoint(port: u16, addr: u64) -> u64 {
    let mut buf = [0u8; 10];
    buf[..2].copy_from_slice(&port.to_le_bytes());
    buf[2..].copy_from_slice(&addr.to_le_bytes());
    xxh64(&buf, 0)
}

/// Symmetric flow key: `H(src endpoint) + proto + H(dst endpoint)`.
pub fn flow_key(src_ip: u64, dst_ip: u64, proto: Proto, src_port: u16, dst_port: u16) -> u64 {
    hash_endpoint(src_port, src_ip)
        .wrapping_add(proto as u8 as u64)
        .wrapping_add(hash_endpoint(dst_port, dst_ip))
}

/// Key identifying an application protocol (transport protocol + server port).
pub fn protocol_key(server_port: u16, proto: Proto) -> u64 {
    let mut buf = [0u8; 3];
    buf[..2].copy_from_slice(&server_port.to_le_bytes());
    buf[2] = proto as u8;
    xxh64(&buf, 0)
}

/// Application protocol identity used to partition metric state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    pub proto: Proto,
    pub port: u16,
    pub key: u64,
}

impl Protocol {
    pub fn of_flow(common: &FlowCommon) -> Self {
        Self {
            proto: common.proto,
            port: common.server_port,
            key: protocol_key(common.server_port, common.proto),
        }
    }

    /// Stable label used in export file names, e.g. `tcp_443`.
    pub fn label(&self) -> String {
        format!("{}_{}", self.proto, self.port)
    }
}
