//! Flow data model
//!
//! Flows are bidirectional TCP or UDP connections keyed by a symmetric
//! 64-bit key. Client/server roles are fixed by the first packet that
//! creates the flow and never swapped afterwards.

use serde::{Deserialize, Serialize};

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Proto {
    Udp = 0,
    Tcp = 1,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TCP flags relevant for flow construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub fin: bool,
}

impl TcpFlags {
    pub fn is_pure_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn any(&self) -> bool {
        self.syn || self.ack || self.rst || self.fin
    }
}

/// Fully decoded per-packet record produced by the parser workers.
///
/// `packet_idx` is 1-based and dense; an index of 0 marks an empty
/// ring-buffer slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketInformation {
    pub packet_idx: u64,
    pub timestamp: i64,
    pub flow_key: u64,
    pub src_ip: u64,
    pub dst_ip: u64,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_length: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub has_tcp: bool,
    pub has_udp: bool,
}

/// Per-flow packet record. Field order keeps the struct densely packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub timestamp: i64,
    pub packet_idx: u64,
    pub payload_length: u16,
    pub from_client: bool,
}

/// TCP header fields kept alongside each [`Packet`] of a TCP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpPacketMeta {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

/// Idle timeouts applied while building flows, all in nanoseconds of
/// capture time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlowTimeouts {
    pub tcp: i64,
    pub tcp_fin: i64,
    pub tcp_rst: i64,
    pub udp: i64,
}

impl Default for FlowTimeouts {
    fn default() -> Self {
        const SECOND: i64 = 1_000_000_000;
        Self {
            tcp: 300 * SECOND,
            tcp_fin: 2 * SECOND,
            tcp_rst: SECOND,
            udp: 300 * SECOND,
        }
    }
}

/// Fields shared between TCP and UDP flows.
#[derive(Debug, Clone)]
pub struct FlowCommon {
    pub flow_key: u64,
    /// Absolute capture time after which the flow counts as idle.
    pub timeout: i64,
    pub cluster_index: i32,
    pub client_addr: u64,
    pub server_addr: u64,
    pub client_port: u16,
    pub server_port: u16,
    pub proto: Proto,
    pub packets: Vec<Packet>,
}

impl FlowCommon {
    fn new(flow_key: u64, proto: Proto) -> Self {
        Self {
            flow_key,
            timeout: 0,
            cluster_index: 0,
            client_addr: 0,
            server_addr: 0,
            client_port: 0,
            server_port: 0,
            proto,
            packets: Vec::new(),
        }
    }

    fn push_packet(&mut self, info: &PacketInformation) {
        self.packets.push(Packet {
            timestamp: info.timestamp,
            packet_idx: info.packet_idx,
            payload_length: info.payload_length,
            from_client: self.client_addr == info.src_ip && self.client_port == info.src_port,
        });
    }

    fn assign_client(&mut self, info: &PacketInformation) {
        self.client_addr = info.src_ip;
        self.client_port = info.src_port;
        self.server_addr = info.dst_ip;
        self.server_port = info.dst_port;
    }

    fn assign_server(&mut self, info: &PacketInformation) {
        self.client_addr = info.dst_ip;
        self.client_port = info.dst_port;
        self.server_addr = info.src_ip;
        self.server_port = info.src_port;
    }

    /// Port-based role heuristic shared by TCP (as fallback) and UDP:
    /// a well-known or registered source port below the destination port
    /// marks the sender as the server.
    fn sender_is_server_by_port(info: &PacketInformation) -> bool {
        info.src_port <= 49151 && info.src_port < info.dst_port
    }

    pub fn start(&self) -> i64 {
        self.packets.first().map(|p| p.timestamp).unwrap_or(0)
    }

    pub fn end(&self) -> i64 {
        self.packets.last().map(|p| p.timestamp).unwrap_or(0)
    }
}

/// A TCP flow with per-packet header metadata kept in a parallel array.
#[derive(Debug, Clone)]
pub struct TcpFlow {
    pub common: FlowCommon,
    pub tcp_packets: Vec<TcpPacketMeta>,
    /// Index of the RST packet, -1 when none was seen.
    pub rst_index: i32,
    /// Index of the first FIN packet, -1 when none was seen.
    pub first_fin_index: i32,
}

impl TcpFlow {
    pub fn new(info: &PacketInformation, timeouts: &FlowTimeouts) -> Self {
        let mut flow = Self {
            common: FlowCommon::new(info.flow_key, Proto::Tcp),
            tcp_packets: Vec::new(),
            rst_index: -1,
            first_fin_index: -1,
        };
        flow.set_client_server(info);
        flow.add_packet(info, timeouts);
        flow
    }

    /// Deterministic and symmetric role assignment: handshake packets
    /// decide directly, otherwise the port heuristic applies, otherwise
    /// the first sender is the client.
    fn set_client_server(&mut self, info: &PacketInformation) {
        if info.flags.syn && !info.flags.ack {
            self.common.assign_client(info);
        } else if info.flags.syn && info.flags.ack {
            self.common.assign_server(info);
        } else if FlowCommon::sender_is_server_by_port(info) {
            self.common.assign_server(info);
        } else {
            self.common.assign_client(info);
        }
    }

    pub fn add_packet(&mut self, info: &PacketInformation, timeouts: &FlowTimeouts) {
        self.common.push_packet(info);
        self.tcp_packets.push(TcpPacketMeta {
            seq: info.seq,
            ack: info.ack,
            flags: info.flags,
        });
        if info.flags.rst {
            self.rst_index = (self.common.packets.len() - 1) as i32;
            self.common.timeout = info.timestamp + timeouts.tcp_rst;
        } else if info.flags.fin && self.first_fin_index == -1 {
            self.first_fin_index = (self.common.packets.len() - 1) as i32;
            self.common.timeout = info.timestamp + timeouts.tcp_fin;
        } else {
            self.common.timeout = info.timestamp + timeouts.tcp;
        }
    }

    /// Whether teardown was observed (FIN or RST).
    pub fn is_terminated(&self) -> bool {
        self.first_fin_index >= 0 || self.rst_index >= 0
    }
}

/// A UDP flow. No header metadata beyond the shared packet records.
#[derive(Debug, Clone)]
pub struct UdpFlow {
    pub common: FlowCommon,
}

impl UdpFlow {
    pub fn new(info: &PacketInformation, timeouts: &FlowTimeouts) -> Self {
        let mut flow = Self {
            common: FlowCommon::new(info.flow_key, Proto::Udp),
        };
        if FlowCommon::sender_is_server_by_port(info) {
            flow.common.assign_server(info);
        } else {
            flow.common.assign_client(info);
        }
        flow.add_packet(info, timeouts);
        flow
    }

    pub fn add_packet(&mut self, info: &PacketInformation, timeouts: &FlowTimeouts) {
        self.common.push_packet(info);
        self.common.timeout = info.timestamp + timeouts.udp;
    }
}
