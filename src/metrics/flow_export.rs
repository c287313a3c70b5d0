//! Per-flow export mode
//!
//! Instead of aggregating, every flushed flow is reduced to one summary
//! record and handed over a bounded channel to a background writer that
//! appends JSON lines. Closing the sink drains the channel and waits for
//! the writer to finish.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::JoinHandle;

use anyhow::Context;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::flow::{FlowCommon, TcpFlow, UdpFlow};
use crate::key::Protocol;

use super::reqres::{ReqResIdentifier, RequestResponse};
use super::MetricSink;

pub const FLOW_METRICS_FILE: &str = "flow_metrics.jsonl";

#[derive(Debug, Clone)]
pub struct FlowExportConfig {
    pub export_dir: PathBuf,
    /// Also compute request/response pair sizes per flow.
    pub compute_rr_pairs: bool,
    /// How many serialized summaries may queue before flushes block.
    pub buffer_size: usize,
}

#[derive(Debug, Serialize)]
struct RrPairSummary {
    request_size: i64,
    response_size: i64,
}

#[derive(Debug, Serialize)]
struct FlowSummary {
    protocol: &'static str,
    port_client: u16,
    port_server: u16,
    address_client: u64,
    address_server: u64,
    start: i64,
    end: i64,
    duration: i64,
    packets: u32,
    packets_client: u32,
    packets_server: u32,
    size: u64,
    size_client: u64,
    size_server: u64,
    bytes_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    rr_pairs: Option<Vec<RrPairSummary>>,
}

fn summarize(common: &FlowCommon, pairs: Option<&[RequestResponse]>) -> FlowSummary {
    let mut packets_client = 0u32;
    let mut packets_server = 0u32;
    let mut size_client = 0u64;
    let mut size_server = 0u64;
    for packet in &common.packets {
        if packet.from_client {
            packets_client += 1;
            size_client += packet.payload_length as u64;
        } else {
            packets_server += 1;
            size_server += packet.payload_length as u64;
        }
    }
    let start = common.start();
    let end = common.end();
    let duration = end - start;
    let size = size_client + size_server;
    let bytes_per_second = if duration > 0 {
        size as f64 * 1e9 / duration as f64
    } else {
        0.0
    };

    FlowSummary {
        protocol: common.proto.as_str(),
        port_client: common.client_port,
        port_server: common.server_port,
        address_client: common.client_addr,
        address_server: common.server_addr,
        start,
        end,
        duration,
        packets: packets_client + packets_server,
        packets_client,
        packets_server,
        size,
        size_client,
        size_server,
        bytes_per_second,
        rr_pairs: pairs.map(|pairs| {
            pairs
                .iter()
                .map(|pair| RrPairSummary {
                    request_size: pair.request_size(),
                    response_size: pair.response_size(),
                })
                .collect()
        }),
    }
}

pub struct FlowExportMetric {
    reqres: Option<ReqResIdentifier>,
    tx: Mutex<Option<Sender<FlowSummary>>>,
    writer: Mutex<Option<JoinHandle<u64>>>,
}

impl FlowExportMetric {
    pub fn new(config: FlowExportConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.export_dir)
            .with_context(|| format!("creating {}", config.export_dir.display()))?;
        let path = config.export_dir.join(FLOW_METRICS_FILE);
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;

        let (tx, rx) = bounded::<FlowSummary>(config.buffer_size.max(1));
        let writer = std::thread::spawn(move || {
            let mut out = BufWriter::new(file);
            let mut written = 0u64;
            for summary in rx {
                match serde_json::to_string(&summary) {
                    Ok(line) => {
                        if let Err(e) = out.write_all(line.as_bytes()).and_then(|_| out.write_all(b"\n")) {
                            error!("writing flow summary: {e}");
                            continue;
                        }
                        written += 1;
                    }
                    Err(e) => error!("serializing flow summary: {e}"),
                }
            }
            if let Err(e) = out.flush() {
                error!("flushing flow summaries: {e}");
            }
            written
        });

        Ok(Self {
            reqres: config
                .compute_rr_pairs
                .then(|| ReqResIdentifier::new(false, false, None)),
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    fn export(&self, summary: FlowSummary) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(summary);
        }
    }

    /// Drain buffered summaries and wait for the writer thread.
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.writer.lock().take() {
            match handle.join() {
                Ok(written) => info!("exported {written} flow summaries"),
                Err(_) => error!("flow export writer panicked"),
            }
        }
    }
}

impl MetricSink for FlowExportMetric {
    fn on_tcp_flush(&self, flow: &mut TcpFlow) {
        let summary = match &self.reqres {
            Some(reqres) => {
                let protocol = Protocol::of_flow(&flow.common);
                let (pairs, drop_flow) = reqres.on_tcp_flush(&protocol, flow);
                if drop_flow {
                    return;
                }
                summarize(&flow.common, Some(&pairs))
            }
            None => summarize(&flow.common, None),
        };
        self.export(summary);
    }

    fn on_udp_flush(&self, flow: &mut UdpFlow) {
        let summary = match &self.reqres {
            Some(reqres) => {
                let protocol = Protocol::of_flow(&flow.common);
                let (pairs, drop_flow) = reqres.on_udp_flush(&protocol, flow);
                if drop_flow {
                    return;
                }
                summarize(&flow.common, Some(&pairs))
            }
            None => summarize(&flow.common, None),
        };
        self.export(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowTimeouts, PacketInformation, TcpFlags};

    fn make_flow() -> TcpFlow {
        let timeouts = FlowTimeouts::default();
        let syn = PacketInformation {
            packet_idx: 1,
            timestamp: 1_000_000_000,
            src_ip: 1,
            dst_ip: 2,
            src_port: 50_000,
            dst_port: 80,
            flags: TcpFlags { syn: true, ..Default::default() },
            has_tcp: true,
            ..Default::default()
        };
        let mut flow = TcpFlow::new(&syn, &timeouts);
        let request = PacketInformation {
            packet_idx: 2,
            timestamp: 2_000_000_000,
            payload_length: 100,
            flags: TcpFlags { ack: true, ..Default::default() },
            ..syn
        };
        flow.add_packet(&request, &timeouts);
        let response = PacketInformation {
            packet_idx: 3,
            timestamp: 3_000_000_000,
            src_ip: 2,
            dst_ip: 1,
            src_port: 80,
            dst_port: 50_000,
            payload_length: 300,
            flags: TcpFlags { ack: true, ..Default::default() },
            ..syn
        };
        flow.add_packet(&response, &timeouts);
        flow
    }

    #[test]
    fn summary_counts_directions() {
        let flow = make_flow();
        let summary = summarize(&flow.common, None);
        assert_eq!(summary.packets, 3);
        assert_eq!(summary.packets_client, 2);
        assert_eq!(summary.packets_server, 1);
        assert_eq!(summary.size_client, 100);
        assert_eq!(summary.size_server, 300);
        assert_eq!(summary.duration, 2_000_000_000);
        assert!((summary.bytes_per_second - 200.0).abs() < 1e-9);
        assert!(summary.rr_pairs.is_none());
    }

    #[test]
    fn writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let metric = FlowExportMetric::new(FlowExportConfig {
            export_dir: dir.path().to_path_buf(),
            compute_rr_pairs: true,
            buffer_size: 16,
        })
        .unwrap();

        let mut flow = make_flow();
        metric.on_tcp_flush(&mut flow);
        let mut flow = make_flow();
        metric.on_tcp_flush(&mut flow);
        metric.close();

        let raw = std::fs::read_to_string(dir.path().join(FLOW_METRICS_FILE)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["protocol"], "tcp");
        assert_eq!(record["port_server"], 80);
        assert_eq!(record["rr_pairs"][0]["request_size"], 100);
        assert_eq!(record["rr_pairs"][0]["response_size"], 300);
    }
}
