//! A single flow-pool shard
//!
//! Each shard owns a TCP and a UDP flow table behind separate locks. Adds
//! arrive as batches over a bounded channel and one consumer thread per
//! protocol holds the table lock for a whole batch to amortize locking.
//! Packet timestamps drive the shard clock; timeouts are evaluated in
//! capture time, never wall time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use super::PoolConfig;
use crate::flow::{PacketInformation, TcpFlow, UdpFlow};
use crate::metrics::SinkRegistry;

const ADD_CHANNEL_SIZE: usize = 400;
const ADD_BATCH_SIZE: usize = 512;

struct ShardTable<F> {
    flows: Arc<Mutex<HashMap<u64, F>>>,
    /// Timestamp of the last packet this shard consumed for the protocol.
    current_time: Arc<AtomicI64>,
    pending: Mutex<Vec<PacketInformation>>,
    tx: Mutex<Option<Sender<Vec<PacketInformation>>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<F> ShardTable<F> {
    fn new() -> (Self, Receiver<Vec<PacketInformation>>) {
        let (tx, rx) = bounded(ADD_CHANNEL_SIZE);
        let table = Self {
            flows: Arc::new(Mutex::new(HashMap::new())),
            current_time: Arc::new(AtomicI64::new(0)),
            pending: Mutex::new(Vec::with_capacity(ADD_BATCH_SIZE)),
            tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(None),
        };
        (table, rx)
    }

    fn push(&self, info: &PacketInformation) {
        let mut pending = self.pending.lock();
        pending.push(*info);
        if pending.len() >= ADD_BATCH_SIZE {
            let batch = std::mem::replace(&mut *pending, Vec::with_capacity(ADD_BATCH_SIZE));
            drop(pending);
            if let Some(tx) = self.tx.lock().as_ref() {
                let _ = tx.send(batch);
            }
        }
    }

    /// Send the buffered remainder, close the channel and wait for the
    /// consumer to drain.
    fn close(&self) {
        let remainder = std::mem::take(&mut *self.pending.lock());
        if let Some(tx) = self.tx.lock().take() {
            if !remainder.is_empty() {
                let _ = tx.send(remainder);
            }
        }
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
    }

    fn stats(&self) -> (usize, usize)
    where
        F: PacketCount,
    {
        let flows = self.flows.lock();
        let packets = flows.values().map(PacketCount::packet_count).sum();
        (flows.len(), packets)
    }
}

trait PacketCount {
    fn packet_count(&self) -> usize;
}

impl PacketCount for TcpFlow {
    fn packet_count(&self) -> usize {
        self.common.packets.len()
    }
}

impl PacketCount for UdpFlow {
    fn packet_count(&self) -> usize {
        self.common.packets.len()
    }
}

pub(super) struct PoolShard {
    config: Arc<PoolConfig>,
    sinks: Arc<SinkRegistry>,
    tcp: ShardTable<TcpFlow>,
    udp: ShardTable<UdpFlow>,
}

impl PoolShard {
    pub(super) fn new(config: Arc<PoolConfig>, sinks: Arc<SinkRegistry>) -> Self {
        let (tcp, tcp_rx) = ShardTable::new();
        let (udp, udp_rx) = ShardTable::new();
        let shard = Self {
            config,
            sinks,
            tcp,
            udp,
        };

        let flows = Arc::clone(&shard.tcp.flows);
        let clock = Arc::clone(&shard.tcp.current_time);
        let config = Arc::clone(&shard.config);
        let sinks = Arc::clone(&shard.sinks);
        *shard.tcp.consumer.lock() = Some(std::thread::spawn(move || {
            consume_tcp(tcp_rx, flows, clock, config, sinks);
        }));

        let flows = Arc::clone(&shard.udp.flows);
        let clock = Arc::clone(&shard.udp.current_time);
        let config = Arc::clone(&shard.config);
        let sinks = Arc::clone(&shard.sinks);
        *shard.udp.consumer.lock() = Some(std::thread::spawn(move || {
            consume_udp(udp_rx, flows, clock, config, sinks);
        }));

        shard
    }

    pub(super) fn add_tcp(&self, info: &PacketInformation) {
        self.tcp.push(info);
    }

    pub(super) fn add_udp(&self, info: &PacketInformation) {
        self.udp.push(info);
    }

    /// Returns `(flushed, total)` for the TCP table.
    pub(super) fn flush_tcp(&self, force: bool) -> (u64, u64) {
        let now = self.tcp.current_time.load(Ordering::Relaxed);
        let mut flows = self.tcp.flows.lock();
        let total = flows.len() as u64;
        let mut flushed = 0;
        flows.retain(|_, flow| {
            if force || now > flow.common.timeout {
                emit_tcp(flow, &self.config, &self.sinks);
                flushed += 1;
                false
            } else {
                true
            }
        });
        (flushed, total)
    }

    /// Returns `(flushed, total)` for the UDP table.
    pub(super) fn flush_udp(&self, force: bool) -> (u64, u64) {
        let now = self.udp.current_time.load(Ordering::Relaxed);
        let mut flows = self.udp.flows.lock();
        let total = flows.len() as u64;
        let mut flushed = 0;
        flows.retain(|_, flow| {
            if force || now > flow.common.timeout {
                emit_udp(flow, &self.config, &self.sinks);
                flushed += 1;
                false
            } else {
                true
            }
        });
        (flushed, total)
    }

    pub(super) fn close(&self) {
        self.tcp.close();
        self.udp.close();
    }

    pub(super) fn tcp_stats(&self) -> (usize, usize) {
        self.tcp.stats()
    }

    pub(super) fn udp_stats(&self) -> (usize, usize) {
        self.udp.stats()
    }
}

/// Hand a flushed TCP flow to the sinks unless the flush-time filters
/// discard it: server port outside the allowlist, or an incomplete
/// capture when only flows starting with a pure SYN are wanted.
fn emit_tcp(flow: &mut TcpFlow, config: &PoolConfig, sinks: &SinkRegistry) {
    if !config.tcp_filter.allows(flow.common.server_port) {
        return;
    }
    if config.tcp_drop_incomplete && !flow.tcp_packets[0].flags.is_pure_syn() {
        return;
    }
    sinks.on_tcp_flush(flow);
}

fn emit_udp(flow: &mut UdpFlow, config: &PoolConfig, sinks: &SinkRegistry) {
    if !config.udp_filter.allows(flow.common.server_port) {
        return;
    }
    sinks.on_udp_flush(flow);
}

fn consume_tcp(
    rx: Receiver<Vec<PacketInformation>>,
    flows: Arc<Mutex<HashMap<u64, TcpFlow>>>,
    clock: Arc<AtomicI64>,
    config: Arc<PoolConfig>,
    sinks: Arc<SinkRegistry>,
) {
    for batch in rx {
        let mut flows = flows.lock();
        for info in &batch {
            if info.packet_idx == 0 {
                continue;
            }
            if !config.tcp_filter.allows(info.src_port) && !config.tcp_filter.allows(info.dst_port)
            {
                continue;
            }
            clock.store(info.timestamp, Ordering::Relaxed);

            let mut exists = flows.contains_key(&info.flow_key);
            if exists {
                // A timed-out flow ends here, except that an RST still
                // belongs to the old flow (teardown after idling).
                let timed_out =
                    !info.flags.rst && info.timestamp > flows[&info.flow_key].common.timeout;
                if timed_out {
                    let mut flow = flows.remove(&info.flow_key).unwrap();
                    emit_tcp(&mut flow, &config, &sinks);
                    exists = false;
                } else if info.flags.syn && flows[&info.flow_key].is_terminated() {
                    // New handshake on a torn-down 5-tuple: force out the
                    // old flow first.
                    let mut flow = flows.remove(&info.flow_key).unwrap();
                    emit_tcp(&mut flow, &config, &sinks);
                    exists = false;
                }
            }

            if exists {
                flows
                    .get_mut(&info.flow_key)
                    .unwrap()
                    .add_packet(info, &config.timeouts);
            } else {
                flows.insert(info.flow_key, TcpFlow::new(info, &config.timeouts));
            }
        }
    }
}

fn consume_udp(
    rx: Receiver<Vec<PacketInformation>>,
    flows: Arc<Mutex<HashMap<u64, UdpFlow>>>,
    clock: Arc<AtomicI64>,
    config: Arc<PoolConfig>,
    sinks: Arc<SinkRegistry>,
) {
    for batch in rx {
        let mut flows = flows.lock();
        for info in &batch {
            if info.packet_idx == 0 {
                continue;
            }
            if !config.udp_filter.allows(info.src_port) && !config.udp_filter.allows(info.dst_port)
            {
                continue;
            }
            clock.store(info.timestamp, Ordering::Relaxed);

            let mut exists = flows.contains_key(&info.flow_key);
            if exists && info.timestamp > flows[&info.flow_key].common.timeout {
                let mut flow = flows.remove(&info.flow_key).unwrap();
                emit_udp(&mut flow, &config, &sinks);
                exists = false;
            }

            if exists {
                flows
                    .get_mut(&info.flow_key)
                    .unwrap()
                    .add_packet(info, &config.timeouts);
            } else {
                flows.insert(info.flow_key, UdpFlow::new(info, &config.timeouts));
            }
        }
    }
}
