//! Request/response identification
//!
//! Walks a flushed flow and splits it into alternating runs of client
//! packets (requests) and server packets (responses). For TCP flows where
//! the server direction was not captured, the server payload can be
//! reconstructed from the ACK-number progression of the client.

use std::sync::Arc;

use crate::flow::{Packet, TcpFlags, TcpFlow, TcpPacketMeta, UdpFlow};
use crate::key::Protocol;

use super::counters::{SumCounter, UnivariateCounter};

/// Maximal plausible ACK advance: max receive window times the largest
/// TCP window scale factor (2^14). Bigger deltas are out-of-order ACKs.
pub const MAX_WINDOW: u32 = 65535 * 16384;

#[derive(Debug, Default, Clone)]
pub struct RequestResponse {
    pub requests: Vec<Packet>,
    pub responses: Vec<Packet>,
    pub cluster_index: i32,
}

impl RequestResponse {
    pub fn request_size(&self) -> i64 {
        self.requests.iter().map(|p| p.payload_length as i64).sum()
    }

    pub fn response_size(&self) -> i64 {
        self.responses.iter().map(|p| p.payload_length as i64).sum()
    }
}

/// Counters fed while reconstructing: transfer speed and synthetic packet
/// sizes, both log-bucketed.
pub struct ReconstructionStats {
    pub speed: UnivariateCounter,
    pub size: UnivariateCounter,
}

impl ReconstructionStats {
    pub fn new() -> Self {
        Self {
            speed: UnivariateCounter::new("reconstructed_packets_speed", 1, true),
            size: UnivariateCounter::new("reconstructed_packets_size", 1, true),
        }
    }

    fn record(&self, protocol: &Protocol, speed: i64, size: i64) {
        self.speed.add(protocol, 0, &[speed]);
        self.size.add(protocol, 0, &[size]);
    }
}

impl Default for ReconstructionStats {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReqResIdentifier {
    drop_unidirectional: bool,
    reconstruct_tcp_response: bool,
    stats: Option<Arc<ReconstructionStats>>,
    num_reconstructed: SumCounter,
}

impl ReqResIdentifier {
    pub fn new(
        drop_unidirectional: bool,
        reconstruct_tcp_response: bool,
        stats: Option<Arc<ReconstructionStats>>,
    ) -> Self {
        Self {
            drop_unidirectional,
            reconstruct_tcp_response,
            stats,
            num_reconstructed: SumCounter::new(),
        }
    }

    pub fn num_reconstructed(&self) -> i64 {
        self.num_reconstructed.total()
    }

    /// Identify request/response pairs of a TCP flow. Returns the pairs
    /// and whether the flow must be dropped entirely.
    pub fn on_tcp_flush(
        &self,
        protocol: &Protocol,
        flow: &mut TcpFlow,
    ) -> (Vec<RequestResponse>, bool) {
        let (has_request, mut has_response) = direction_presence(&flow.common.packets);

        if self.reconstruct_tcp_response && !has_response {
            if self.reconstruct_flow(protocol, flow) > 0 {
                has_response = true;
            }
        }

        if self.drop_unidirectional && (!has_request || !has_response) {
            return (Vec::new(), true);
        }

        (
            pair_packets(&flow.common.packets, Some(&flow.tcp_packets)),
            false,
        )
    }

    /// UDP variant: no reconstruction, no control-packet skip.
    pub fn on_udp_flush(
        &self,
        _protocol: &Protocol,
        flow: &mut UdpFlow,
    ) -> (Vec<RequestResponse>, bool) {
        let (has_request, has_response) = direction_presence(&flow.common.packets);
        if self.drop_unidirectional && (!has_request || !has_response) {
            return (Vec::new(), true);
        }
        (pair_packets(&flow.common.packets, None), false)
    }

    /// Infer server->client payload from the client's ACK progression and
    /// splice synthetic packets into the flow. Returns how many packets
    /// were synthesized.
    fn reconstruct_flow(&self, protocol: &Protocol, flow: &mut TcpFlow) -> usize {
        struct Synthetic {
            seq: u32,
            ack: u32,
            size: u16,
            /// Position in the merged packet sequence.
            index: usize,
        }

        let mut last_ack = 0u32;
        let mut last_ack_ts = 0i64;
        let mut initialized = false;
        let mut synthetic: Vec<Synthetic> = Vec::new();

        for (i, tcp) in flow.tcp_packets.iter().enumerate() {
            if !tcp.flags.ack {
                continue;
            }
            if !initialized {
                last_ack = tcp.ack;
                last_ack_ts = flow.common.packets[i].timestamp;
                initialized = true;
                continue;
            }

            // Wrapping subtraction handles ACK wraparound at 2^32.
            let mut transferred = tcp.ack.wrapping_sub(last_ack);
            if transferred > MAX_WINDOW {
                continue;
            }
            if transferred == 0 {
                continue;
            }

            let now = flow.common.packets[i].timestamp;
            if let Some(stats) = &self.stats {
                let micros = ((now - last_ack_ts) / 1_000).max(1);
                // Multiply before dividing to keep integer precision.
                let speed = (transferred as i64 * 1_000_000) / micros;
                stats.record(protocol, speed, transferred as i64);
            }
            last_ack_ts = now;

            // Split into packets of at most u16::MAX payload bytes.
            while transferred > 0 {
                let size = transferred.min(u32::from(u16::MAX));
                synthetic.push(Synthetic {
                    seq: tcp.ack.wrapping_sub(size),
                    ack: tcp.seq,
                    size: size as u16,
                    index: i + synthetic.len(),
                });
                transferred -= size;
            }
            last_ack = tcp.ack;
        }

        if synthetic.is_empty() {
            return 0;
        }

        // Rebuild both sequences as one merged array instead of repeated
        // mid-vector inserts.
        let total = flow.common.packets.len() + synthetic.len();
        let mut packets = Vec::with_capacity(total);
        let mut tcp_packets = Vec::with_capacity(total);
        let mut idx_new = 0;
        let mut idx_old = 0;
        for i in 0..total {
            if idx_new < synthetic.len() && i == synthetic[idx_new].index {
                let s = &synthetic[idx_new];
                packets.push(Packet {
                    // Strictly before the ACK that implied this payload.
                    timestamp: flow.common.packets[idx_old].timestamp - 1,
                    packet_idx: 0,
                    payload_length: s.size,
                    from_client: false,
                });
                tcp_packets.push(TcpPacketMeta {
                    seq: s.seq,
                    ack: s.ack,
                    flags: TcpFlags::default(),
                });
                idx_new += 1;
            } else {
                packets.push(flow.common.packets[idx_old]);
                tcp_packets.push(flow.tcp_packets[idx_old]);
                idx_old += 1;
            }
        }
        flow.common.packets = packets;
        flow.tcp_packets = tcp_packets;

        self.num_reconstructed.add(protocol, synthetic.len() as i64);
        synthetic.len()
    }
}

/// Gaps between the first request packets of consecutive pairs.
pub fn inter_request_times(req_res: &[RequestResponse]) -> Vec<i64> {
    req_res
        .windows(2)
        .map(|pair| pair[1].requests[0].timestamp - pair[0].requests[0].timestamp)
        .collect()
}

fn direction_presence(packets: &[Packet]) -> (bool, bool) {
    let mut has_request = false;
    let mut has_response = false;
    for packet in packets {
        if packet.from_client {
            has_request = true;
        } else {
            has_response = true;
        }
        if has_request && has_response {
            break;
        }
    }
    (has_request, has_response)
}

/// A packet that carries no payload and any control flag is handshake,
/// teardown or a bare ACK and does not delimit request/response runs.
fn is_tcp_control_packet(packet: &Packet, tcp: &TcpPacketMeta) -> bool {
    packet.payload_length == 0 && tcp.flags.any()
}

fn pair_packets(packets: &[Packet], tcp_packets: Option<&[TcpPacketMeta]>) -> Vec<RequestResponse> {
    let mut pairs: Vec<RequestResponse> = Vec::new();
    let mut last_was_request = false;

    for (i, packet) in packets.iter().enumerate() {
        if let Some(tcp) = tcp_packets {
            if is_tcp_control_packet(packet, &tcp[i]) {
                continue;
            }
        }
        if packet.from_client {
            if !last_was_request {
                pairs.push(RequestResponse::default());
            }
            pairs.last_mut().unwrap().requests.push(*packet);
            last_was_request = true;
        } else {
            // A response before any request means the capture started
            // mid-flow; there is no pair to attach it to.
            if pairs.is_empty() {
                continue;
            }
            last_was_request = false;
            pairs.last_mut().unwrap().responses.push(*packet);
        }
    }

    pairs
}
