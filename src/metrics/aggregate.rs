//! Aggregate metric mode
//!
//! The default sink: identifies request/response pairs, feeds the session
//! identifier and accumulates integer counters per protocol and cluster.
//! Session-level counters run during the final force flush, once all
//! sessions are complete.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::info;

use crate::cluster::ClusterCollector;
use crate::flow::{TcpFlow, UdpFlow};
use crate::key::Protocol;

use super::counters::{BivariateCounter, SumCounter, UnivariateCounter};
use super::reqres::{inter_request_times, ReconstructionStats, ReqResIdentifier, RequestResponse};
use super::session::{SessionIdentifier, SessionMetric, UserSessions};
use super::MetricSink;

#[derive(Debug, Clone)]
pub struct AggregateConfig {
    /// Maximal gap between flows of one session, nanoseconds.
    pub session_timeout: i64,
    /// Where to persist cluster summary records; `None` disables collection.
    pub info_dir: Option<PathBuf>,
    pub drop_unidirectional: bool,
    pub reconstruct_tcp_response: bool,
    /// Also aggregate speed/size statistics of reconstructed packets.
    pub reconstruction_statistics: bool,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            session_timeout: 600 * 1_000_000_000,
            info_dir: None,
            drop_unidirectional: false,
            reconstruct_tcp_response: false,
            reconstruction_statistics: false,
        }
    }
}

struct NumSessionsMetric(UnivariateCounter);

impl SessionMetric for NumSessionsMetric {
    fn on_flush(&self, protocol: &Protocol, _user_addr: u64, user: &UserSessions) {
        self.0
            .add(protocol, user.user_cluster_index, &[user.sessions.len() as i64]);
    }
}

struct InterSessionsMetric(UnivariateCounter);

impl SessionMetric for InterSessionsMetric {
    fn on_flush(&self, protocol: &Protocol, _user_addr: u64, user: &UserSessions) {
        let gaps = user.inter_session_times();
        if !gaps.is_empty() {
            self.0.add(protocol, user.user_cluster_index, &gaps);
        }
    }
}

struct NumFlowsMetric(UnivariateCounter);

impl SessionMetric for NumFlowsMetric {
    fn on_flush(&self, protocol: &Protocol, _user_addr: u64, user: &UserSessions) {
        for session in &user.sessions {
            self.0
                .add(protocol, session.cluster_index, &[session.flows.len() as i64]);
        }
    }
}

struct InterFlowsMetric(UnivariateCounter);

impl SessionMetric for InterFlowsMetric {
    fn on_flush(&self, protocol: &Protocol, _user_addr: u64, user: &UserSessions) {
        for session in &user.sessions {
            let gaps = session.inter_flow_times();
            if !gaps.is_empty() {
                self.0.add(protocol, session.cluster_index, &gaps);
            }
        }
    }
}

struct NumServersMetric(BivariateCounter);

impl SessionMetric for NumServersMetric {
    fn on_flush(&self, protocol: &Protocol, _user_addr: u64, user: &UserSessions) {
        for session in &user.sessions {
            self.0.add(
                protocol,
                session.cluster_index,
                &[[session.flows.len() as i64, session.num_servers()]],
            );
        }
    }
}

pub struct AggregateMetric {
    reqres: ReqResIdentifier,
    sessions: SessionIdentifier,
    cluster: Arc<ClusterCollector>,
    reconstruction_stats: Option<Arc<ReconstructionStats>>,

    num_packets: SumCounter,
    num_flows_total: SumCounter,
    request_size: BivariateCounter,
    response_size: BivariateCounter,
    inter_request: BivariateCounter,
    num_rr_pairs: UnivariateCounter,

    num_sessions: Arc<NumSessionsMetric>,
    inter_sessions: Arc<InterSessionsMetric>,
    num_session_flows: Arc<NumFlowsMetric>,
    inter_flows: Arc<InterFlowsMetric>,
    num_servers: Arc<NumServersMetric>,
}

impl AggregateMetric {
    pub fn new(config: AggregateConfig) -> Self {
        let cluster = Arc::new(ClusterCollector::new(config.info_dir.clone()));
        let reconstruction_stats = config
            .reconstruction_statistics
            .then(|| Arc::new(ReconstructionStats::new()));
        let reqres = ReqResIdentifier::new(
            config.drop_unidirectional,
            config.reconstruct_tcp_response,
            reconstruction_stats.clone(),
        );

        let num_sessions = Arc::new(NumSessionsMetric(UnivariateCounter::new(
            "num_sessions",
            1,
            false,
        )));
        let inter_sessions = Arc::new(InterSessionsMetric(UnivariateCounter::new(
            "inter_session_times",
            1,
            true,
        )));
        let num_session_flows =
            Arc::new(NumFlowsMetric(UnivariateCounter::new("num_flows", 1, false)));
        let inter_flows = Arc::new(InterFlowsMetric(UnivariateCounter::new(
            "inter_flow_times",
            1,
            true,
        )));
        let num_servers =
            Arc::new(NumServersMetric(BivariateCounter::new("num_servers", 1, false)));

        let mut sessions = SessionIdentifier::new(config.session_timeout, Arc::clone(&cluster));
        sessions.register_session_metric(num_sessions.clone());
        sessions.register_session_metric(inter_sessions.clone());
        sessions.register_session_metric(num_session_flows.clone());
        sessions.register_session_metric(inter_flows.clone());
        sessions.register_session_metric(num_servers.clone());

        Self {
            reqres,
            sessions,
            cluster,
            reconstruction_stats,
            num_packets: SumCounter::new(),
            num_flows_total: SumCounter::new(),
            request_size: BivariateCounter::new("request_size", 1, true),
            response_size: BivariateCounter::new("response_size", 1, true),
            inter_request: BivariateCounter::new("inter_request_times", 1, true),
            num_rr_pairs: UnivariateCounter::new("num_rr_pairs", 1, false),
            num_sessions,
            inter_sessions,
            num_session_flows,
            inter_flows,
            num_servers,
        }
    }

    fn record_flow(&self, protocol: &Protocol, cluster_index: i32, num_packets: usize, pairs: &[RequestResponse]) {
        self.num_packets.add(protocol, num_packets as i64);
        self.num_flows_total.add(protocol, 1);

        for (i, pair) in pairs.iter().enumerate() {
            let position = i as i64 + 1;
            self.request_size
                .add(protocol, pair.cluster_index, &[[position, pair.request_size()]]);
            self.response_size
                .add(protocol, pair.cluster_index, &[[position, pair.response_size()]]);
        }
        self.num_rr_pairs
            .add(protocol, cluster_index, &[pairs.len() as i64]);

        let gaps = inter_request_times(pairs);
        if !gaps.is_empty() {
            let tuples: Vec<[i64; 2]> = gaps
                .iter()
                .enumerate()
                .map(|(i, &gap)| [i as i64 + 1, gap])
                .collect();
            self.inter_request.add(protocol, cluster_index, &tuples);
        }
    }

    /// Flush all remaining sessions to the session metrics and persist
    /// the collected cluster records. Call once, after the pool closed.
    pub fn force_flush(&self) -> anyhow::Result<()> {
        self.sessions.force_flush();
        self.cluster
            .persist_all()
            .context("persisting cluster summary records")
    }

    /// Write all counters as one JSON document.
    pub fn export(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut document = json!({
            "num_packets": self.num_packets.export(),
            "num_flows": self.num_flows_total.export(),
            "request_size": self.request_size.export(),
            "response_size": self.response_size.export(),
            "inter_request_times": self.inter_request.export(),
            "num_rr_pairs": self.num_rr_pairs.export(),
            "num_sessions": self.num_sessions.0.export(),
            "inter_session_times": self.inter_sessions.0.export(),
            "num_session_flows": self.num_session_flows.0.export(),
            "inter_flow_times": self.inter_flows.0.export(),
            "num_servers": self.num_servers.0.export(),
        });
        if let Some(stats) = &self.reconstruction_stats {
            document["reconstructed_packets_speed"] = json!(stats.speed.export());
            document["reconstructed_packets_size"] = json!(stats.size.export());
        }

        let path = dir.join("metrics.json");
        let file = fs::File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer(std::io::BufWriter::new(file), &document)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("exported aggregate metrics to {}", path.display());
        Ok(())
    }

    pub fn print_statistics(&self) {
        info!("total packets in flushed flows: {}", self.num_packets.total());
        info!("total flows analyzed:           {}", self.num_flows_total.total());
        info!(
            "protocols observed:             {}",
            self.num_rr_pairs.protocols().len()
        );
        info!(
            "reconstructed packets:          {}",
            self.reqres.num_reconstructed()
        );
    }
}

impl MetricSink for AggregateMetric {
    fn on_tcp_flush(&self, flow: &mut TcpFlow) {
        let protocol = Protocol::of_flow(&flow.common);
        let (mut pairs, drop_flow) = self.reqres.on_tcp_flush(&protocol, flow);
        if drop_flow {
            return;
        }

        self.cluster
            .collect_and_set_flow_cluster_index(&mut flow.common, &pairs);
        self.cluster
            .collect_and_set_rrp_cluster_index(&flow.common, &mut pairs);

        self.record_flow(
            &protocol,
            flow.common.cluster_index,
            flow.common.packets.len(),
            &pairs,
        );
        self.sessions.on_flush(&flow.common);
    }

    fn on_udp_flush(&self, flow: &mut UdpFlow) {
        let protocol = Protocol::of_flow(&flow.common);
        let (mut pairs, drop_flow) = self.reqres.on_udp_flush(&protocol, flow);
        if drop_flow {
            return;
        }

        self.cluster
            .collect_and_set_flow_cluster_index(&mut flow.common, &pairs);
        self.cluster
            .collect_and_set_rrp_cluster_index(&flow.common, &mut pairs);

        self.record_flow(
            &protocol,
            flow.common.cluster_index,
            flow.common.packets.len(),
            &pairs,
        );
        self.sessions.on_flush(&flow.common);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowTimeouts, PacketInformation, TcpFlags};

    fn tcp_flow_with_pair(client_addr: u64, start_ts: i64) -> TcpFlow {
        let timeouts = FlowTimeouts::default();
        let base = PacketInformation {
            packet_idx: 1,
            timestamp: start_ts,
            src_ip: client_addr,
            dst_ip: 99,
            src_port: 50_000,
            dst_port: 80,
            flags: TcpFlags { syn: true, ..Default::default() },
            has_tcp: true,
            ..Default::default()
        };
        let mut flow = TcpFlow::new(&base, &timeouts);
        let request = PacketInformation {
            packet_idx: 2,
            timestamp: start_ts + 1_000,
            payload_length: 120,
            flags: TcpFlags { ack: true, ..Default::default() },
            ..base
        };
        flow.add_packet(&request, &timeouts);
        let response = PacketInformation {
            packet_idx: 3,
            timestamp: start_ts + 2_000,
            src_ip: 99,
            dst_ip: client_addr,
            src_port: 80,
            dst_port: 50_000,
            payload_length: 480,
            flags: TcpFlags { ack: true, ..Default::default() },
            ..base
        };
        flow.add_packet(&response, &timeouts);
        flow
    }

    #[test]
    fn tcp_flush_records_pair_sizes() {
        let metric = AggregateMetric::new(AggregateConfig::default());
        let mut flow = tcp_flow_with_pair(1, 0);
        metric.on_tcp_flush(&mut flow);

        assert_eq!(flow.common.cluster_index, 0);
        let export = metric.num_rr_pairs.export();
        assert_eq!(export["tcp_80"][&0], vec![[1, 1]]);
        assert_eq!(metric.num_packets.total(), 3);
    }

    #[test]
    fn force_flush_runs_session_metrics() {
        let metric = AggregateMetric::new(AggregateConfig::default());
        // Two flows from the same client, close together in time.
        let mut flow = tcp_flow_with_pair(1, 0);
        metric.on_tcp_flush(&mut flow);
        let mut flow = tcp_flow_with_pair(1, 10_000);
        metric.on_tcp_flush(&mut flow);

        metric.force_flush().unwrap();
        let export = metric.num_sessions.0.export();
        // One user with a single merged session.
        assert_eq!(export["tcp_80"][&0], vec![[1, 1]]);
        let flows_export = metric.num_session_flows.0.export();
        assert_eq!(flows_export["tcp_80"][&0], vec![[2, 1]]);
    }

    #[test]
    fn export_writes_json_document() {
        let dir = tempfile::tempdir().unwrap();
        let metric = AggregateMetric::new(AggregateConfig::default());
        let mut flow = tcp_flow_with_pair(1, 0);
        metric.on_tcp_flush(&mut flow);
        metric.force_flush().unwrap();
        metric.export(dir.path()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("metrics.json")).unwrap();
        let document: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(document["num_packets"]["tcp_80"].is_number());
        assert!(document["request_size"]["tcp_80"].is_object());
        assert!(document.get("reconstructed_packets_speed").is_none());
    }

    #[test]
    fn dropped_flow_leaves_no_trace() {
        let metric = AggregateMetric::new(AggregateConfig {
            drop_unidirectional: true,
            ..Default::default()
        });
        // Client-only flow, reconstruction disabled.
        let timeouts = FlowTimeouts::default();
        let info = PacketInformation {
            packet_idx: 1,
            timestamp: 0,
            src_ip: 1,
            dst_ip: 99,
            src_port: 50_000,
            dst_port: 80,
            payload_length: 10,
            flags: TcpFlags { ack: true, ..Default::default() },
            has_tcp: true,
            ..Default::default()
        };
        let mut flow = TcpFlow::new(&info, &timeouts);
        metric.on_tcp_flush(&mut flow);

        assert_eq!(metric.num_packets.total(), 0);
        metric.force_flush().unwrap();
        assert!(metric.num_sessions.0.export().is_empty());
    }
}
