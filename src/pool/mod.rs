//! Flow pools
//!
//! Front-end over 64 shards, each owning the flows whose key satisfies
//! `flow_key mod 64 == shard index`. Adds are batched per shard and
//! handed to per-protocol consumer threads; a bulk flush walks all shard
//! tables in parallel.

mod shard;

use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::info;

use crate::flow::{FlowTimeouts, PacketInformation};
use crate::metrics::{MetricSink, SinkRegistry};
use shard::PoolShard;

/// Number of flow shards. Shard ownership is part of the data layout, so
/// this is fixed rather than configurable.
pub const NUM_SHARDS: usize = 64;

/// Per-port allowlist for one transport protocol.
#[derive(Clone)]
pub struct PortFilter(Arc<[bool; 65536]>);

impl PortFilter {
    pub fn from_ports(ports: &[u16]) -> Self {
        let mut table = Box::new([false; 65536]);
        for &port in ports {
            table[port as usize] = true;
        }
        Self(Arc::from(table))
    }

    /// Allow every port.
    pub fn all() -> Self {
        Self(Arc::from(Box::new([true; 65536])))
    }

    pub fn allows(&self, port: u16) -> bool {
        self.0[port as usize]
    }
}

impl std::fmt::Debug for PortFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.0.iter().filter(|allowed| **allowed).count();
        write!(f, "PortFilter({count} ports)")
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub tcp_filter: PortFilter,
    pub udp_filter: PortFilter,
    /// Drop TCP flows whose first packet is not a pure SYN.
    pub tcp_drop_incomplete: bool,
    pub timeouts: FlowTimeouts,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tcp_filter: PortFilter::all(),
            udp_filter: PortFilter::all(),
            tcp_drop_incomplete: false,
            timeouts: FlowTimeouts::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlushCounters {
    pub tcp_flushed: u64,
    pub tcp_count: u64,
    pub udp_flushed: u64,
    pub udp_count: u64,
}

pub struct FlowPools {
    shards: Vec<PoolShard>,
    sinks: Arc<SinkRegistry>,
}

impl FlowPools {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let sinks = Arc::new(SinkRegistry::new());
        let shards = (0..NUM_SHARDS)
            .map(|_| PoolShard::new(Arc::clone(&config), Arc::clone(&sinks)))
            .collect();
        Arc::new(Self { shards, sinks })
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Register a sink invoked for every flushed flow. Sinks registered
    /// after packets started flowing only see later flushes.
    pub fn register_metric(&self, sink: Arc<dyn MetricSink>) {
        self.sinks.register(sink);
    }

    fn shard(&self, flow_key: u64) -> &PoolShard {
        &self.shards[(flow_key % NUM_SHARDS as u64) as usize]
    }

    pub fn add_tcp_packet(&self, info: &PacketInformation) {
        self.shard(info.flow_key).add_tcp(info);
    }

    pub fn add_udp_packet(&self, info: &PacketInformation) {
        self.shard(info.flow_key).add_udp(info);
    }

    /// Flush timed-out flows from every shard; with `force`, flush all.
    pub fn flush(&self, force: bool) -> FlushCounters {
        let counters = Mutex::new(FlushCounters::default());
        self.shards.par_iter().for_each(|shard| {
            let (tcp_flushed, tcp_count) = shard.flush_tcp(force);
            let (udp_flushed, udp_count) = shard.flush_udp(force);
            let mut c = counters.lock();
            c.tcp_flushed += tcp_flushed;
            c.tcp_count += tcp_count;
            c.udp_flushed += udp_flushed;
            c.udp_count += udp_count;
        });
        let counters = counters.into_inner();
        info!(
            "{} / {} TCP flows flushed",
            counters.tcp_flushed, counters.tcp_count
        );
        info!(
            "{} / {} UDP flows flushed",
            counters.udp_flushed, counters.udp_count
        );
        counters
    }

    /// Drain the add queues, stop the consumer threads and force-flush
    /// everything that is left.
    pub fn close(&self) {
        for shard in &self.shards {
            shard.close();
        }
        self.flush(true);
    }

    pub fn print_statistics(&self) {
        let mut tcp_flows = 0usize;
        let mut tcp_packets = 0usize;
        let mut udp_flows = 0usize;
        let mut udp_packets = 0usize;
        for shard in &self.shards {
            let (flows, packets) = shard.tcp_stats();
            tcp_flows += flows;
            tcp_packets += packets;
            let (flows, packets) = shard.udp_stats();
            udp_flows += flows;
            udp_packets += packets;
        }
        info!("Number of TCP flows in pool:   {tcp_flows}");
        info!("Number of TCP packets in pool: {tcp_packets}");
        info!("Number of UDP flows in pool:   {udp_flows}");
        info!("Number of UDP packets in pool: {udp_packets}");
    }
}
