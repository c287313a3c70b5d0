//! Frame decoding
//!
//! Turns raw frame bytes into a [`PacketInformation`] record. Decoding is
//! attempted IP-first (captures without a link layer), then rooted at an
//! Ethernet header. Packets that fail both decodes still produce a record
//! so the sorting ring buffer advances past their index; they simply carry
//! neither `has_tcp` nor `has_udp`.

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

use crate::flow::{PacketInformation, Proto, TcpFlags};
use crate::key;

/// Decode one frame into a packet record.
pub fn decode_frame(data: &[u8], packet_idx: u64, timestamp: i64) -> PacketInformation {
    let mut info = PacketInformation {
        packet_idx,
        timestamp,
        ..Default::default()
    };

    let sliced = match slice_packet(data) {
        Some(s) => s,
        None => return info,
    };

    let ip_payload_len = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            info.src_ip = key::hash_addr(&header.source_addr().octets());
            info.dst_ip = key::hash_addr(&header.destination_addr().octets());
            header
                .total_len()
                .saturating_sub(u16::from(header.ihl()) * 4)
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            info.src_ip = key::hash_addr(&header.source_addr().octets());
            info.dst_ip = key::hash_addr(&header.destination_addr().octets());
            header.payload_length()
        }
        _ => return info,
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            info.has_tcp = true;
            info.src_port = tcp.source_port();
            info.dst_port = tcp.destination_port();
            info.seq = tcp.sequence_number();
            info.ack = tcp.acknowledgment_number();
            info.flags = TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                rst: tcp.rst(),
                fin: tcp.fin(),
            };
            info.payload_length = ip_payload_len.saturating_sub(u16::from(tcp.data_offset()) * 4);
            info.flow_key = key::flow_key(
                info.src_ip,
                info.dst_ip,
                Proto::Tcp,
                info.src_port,
                info.dst_port,
            );
        }
        Some(TransportSlice::Udp(udp)) => {
            info.has_udp = true;
            info.src_port = udp.source_port();
            info.dst_port = udp.destination_port();
            info.payload_length = udp.length();
            info.flow_key = key::flow_key(
                info.src_ip,
                info.dst_ip,
                Proto::Udp,
                info.src_port,
                info.dst_port,
            );
        }
        _ => {}
    }

    info
}

fn slice_packet(data: &[u8]) -> Option<SlicedPacket<'_>> {
    // Raw IP first: a full decode must reach the transport layer,
    // otherwise the version nibble may have matched Ethernet MAC bytes.
    if let Ok(sliced) = SlicedPacket::from_ip(data) {
        if sliced.net.is_some() && sliced.transport.is_some() {
            return Some(sliced);
        }
    }
    match SlicedPacket::from_ethernet(data) {
        Ok(sliced) if sliced.net.is_some() => Some(sliced),
        _ => None,
    }
}
