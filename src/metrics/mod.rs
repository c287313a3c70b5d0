//! Metric sinks
//!
//! Flushed flows leave the pool through [`MetricSink`] implementations.
//! Sinks are invoked concurrently from shard consumer threads and must
//! synchronize internally. A sink receives the flow mutably because the
//! request/response identifier may rebuild the packet sequences in place.

pub mod aggregate;
pub mod counters;
pub mod flow_export;
pub mod reqres;
pub mod session;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::flow::{TcpFlow, UdpFlow};

pub trait MetricSink: Send + Sync {
    fn on_tcp_flush(&self, flow: &mut TcpFlow);
    fn on_udp_flush(&self, flow: &mut UdpFlow);
}

/// Shared list of registered sinks, read by every shard on flush.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: RwLock<Vec<Arc<dyn MetricSink>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn MetricSink>) {
        self.sinks.write().push(sink);
    }

    pub fn on_tcp_flush(&self, flow: &mut TcpFlow) {
        for sink in self.sinks.read().iter() {
            sink.on_tcp_flush(flow);
        }
    }

    pub fn on_udp_flush(&self, flow: &mut UdpFlow) {
        for sink in self.sinks.read().iter() {
            sink.on_udp_flush(flow);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }
}
