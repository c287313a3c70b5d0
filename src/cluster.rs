//! Cluster collection
//!
//! Collects per-protocol summary records of request/response pairs,
//! flows, sessions and users for the external clustering trainer, and
//! assigns cluster indices to the analyzed entities. Model loading and
//! prediction live outside this crate; without a loaded model every
//! entity gets [`DEFAULT_CLUSTER_INDEX`].

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::flow::FlowCommon;
use crate::key::Protocol;
use crate::metrics::counters::Distribution;
use crate::metrics::reqres::RequestResponse;
use crate::metrics::session::{Session, UserSessions};
use crate::records;

/// Used whenever no clustering model is loaded.
pub const DEFAULT_CLUSTER_INDEX: i32 = 0;

const RECORD_CHUNK_SIZE: usize = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrpRecord {
    pub request_size: i64,
    pub response_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub server_addr: u64,
    pub num_rrp: i64,
    pub inter_request: Distribution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_addr: u64,
    pub num_servers: i64,
    pub num_flows: i64,
    pub inter_flow: Distribution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub client_addr: u64,
    pub num_sessions: i64,
    pub inter_session: Distribution,
}

struct Store<T> {
    by_protocol: Mutex<HashMap<u64, (Protocol, Vec<T>)>>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            by_protocol: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> Store<T> {
    fn push(&self, protocol: &Protocol, record: T) {
        let mut map = self.by_protocol.lock();
        map.entry(protocol.key)
            .or_insert_with(|| (*protocol, Vec::new()))
            .1
            .push(record);
    }

    fn drain(&self) -> Vec<(Protocol, Vec<T>)> {
        self.by_protocol.lock().drain().map(|(_, v)| v).collect()
    }
}

pub struct ClusterCollector {
    collect: bool,
    info_dir: Option<PathBuf>,
    rrps: Store<RrpRecord>,
    flows: Store<FlowRecord>,
    sessions: Store<SessionRecord>,
    users: Store<UserRecord>,
}

impl ClusterCollector {
    pub fn new(info_dir: Option<PathBuf>) -> Self {
        Self {
            collect: info_dir.is_some(),
            info_dir,
            rrps: Store::default(),
            flows: Store::default(),
            sessions: Store::default(),
            users: Store::default(),
        }
    }

    /// Collector that neither stores records nor has models: every
    /// cluster index becomes the default.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn collect_and_set_rrp_cluster_index(
        &self,
        flow: &FlowCommon,
        req_res: &mut [RequestResponse],
    ) {
        for pair in req_res.iter_mut() {
            pair.cluster_index = DEFAULT_CLUSTER_INDEX;
        }
        if !self.collect {
            return;
        }
        let protocol = Protocol::of_flow(flow);
        for pair in req_res.iter() {
            self.rrps.push(
                &protocol,
                RrpRecord {
                    request_size: pair.request_size(),
                    response_size: pair.response_size(),
                },
            );
        }
    }

    pub fn collect_and_set_flow_cluster_index(
        &self,
        flow: &mut FlowCommon,
        req_res: &[RequestResponse],
    ) {
        flow.cluster_index = DEFAULT_CLUSTER_INDEX;
        if !self.collect {
            return;
        }
        let protocol = Protocol::of_flow(flow);
        self.flows.push(
            &protocol,
            FlowRecord {
                server_addr: flow.server_addr,
                num_rrp: req_res.len() as i64,
                inter_request: Distribution::of(&crate::metrics::reqres::inter_request_times(
                    req_res,
                )),
            },
        );
    }

    pub fn collect_and_set_session_cluster_index(
        &self,
        session: &mut Session,
        client_addr: u64,
        protocol: &Protocol,
    ) {
        session.cluster_index = DEFAULT_CLUSTER_INDEX;
        if !self.collect {
            return;
        }
        self.sessions.push(
            protocol,
            SessionRecord {
                client_addr,
                num_servers: session.num_servers(),
                num_flows: session.flows.len() as i64,
                inter_flow: Distribution::of(&session.inter_flow_times()),
            },
        );
    }

    pub fn collect_and_set_user_cluster_index(
        &self,
        user: &mut UserSessions,
        client_addr: u64,
        protocol: &Protocol,
    ) {
        user.user_cluster_index = DEFAULT_CLUSTER_INDEX;
        if !self.collect {
            return;
        }
        self.users.push(
            protocol,
            UserRecord {
                client_addr,
                num_sessions: user.sessions.len() as i64,
                inter_session: Distribution::of(&user.inter_session_times()),
            },
        );
    }

    /// Persist all collected records under the info directory, one file
    /// per protocol and entity kind, then clear the stores.
    pub fn persist_all(&self) -> anyhow::Result<()> {
        let dir = match &self.info_dir {
            Some(dir) => dir.clone(),
            None => return Ok(()),
        };

        persist_kind(&dir.join("rrp"), self.rrps.drain())?;
        persist_kind(&dir.join("flow"), self.flows.drain())?;
        persist_kind(&dir.join("session"), self.sessions.drain())?;
        persist_kind(&dir.join("user"), self.users.drain())?;
        Ok(())
    }
}

fn persist_kind<T: Serialize>(
    dir: &std::path::Path,
    stores: Vec<(Protocol, Vec<T>)>,
) -> anyhow::Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for (protocol, records) in stores {
        let path = dir.join(format!("{}.data", protocol.label()));
        records::write_records(&path, &records, RECORD_CHUNK_SIZE)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Packet, Proto};
    use crate::key;
    use crate::metrics::session::SessionFlow;

    fn common() -> FlowCommon {
        FlowCommon {
            flow_key: 7,
            timeout: 0,
            cluster_index: 99,
            client_addr: 1,
            server_addr: 2,
            client_port: 50_000,
            server_port: 80,
            proto: Proto::Tcp,
            packets: Vec::new(),
        }
    }

    fn pair(ts: i64, req: u16, res: u16) -> RequestResponse {
        RequestResponse {
            requests: vec![Packet {
                timestamp: ts,
                packet_idx: 1,
                payload_length: req,
                from_client: true,
            }],
            responses: vec![Packet {
                timestamp: ts + 10,
                packet_idx: 2,
                payload_length: res,
                from_client: false,
            }],
            cluster_index: 5,
        }
    }

    #[test]
    fn disabled_collector_assigns_default_index() {
        let collector = ClusterCollector::disabled();
        let mut flow = common();
        let mut pairs = vec![pair(0, 10, 20)];
        collector.collect_and_set_rrp_cluster_index(&flow, &mut pairs);
        collector.collect_and_set_flow_cluster_index(&mut flow, &pairs);

        assert_eq!(flow.cluster_index, DEFAULT_CLUSTER_INDEX);
        assert_eq!(pairs[0].cluster_index, DEFAULT_CLUSTER_INDEX);
    }

    #[test]
    fn collects_and_persists_records_per_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ClusterCollector::new(Some(dir.path().to_path_buf()));

        let mut flow = common();
        let mut pairs = vec![pair(0, 10, 20), pair(1_000, 30, 40)];
        collector.collect_and_set_rrp_cluster_index(&flow, &mut pairs);
        collector.collect_and_set_flow_cluster_index(&mut flow, &pairs);

        let protocol = Protocol {
            proto: Proto::Tcp,
            port: 80,
            key: key::protocol_key(80, Proto::Tcp),
        };
        let mut session = Session {
            start: 0,
            end: 100,
            cluster_index: 7,
            flows: vec![
                SessionFlow { start: 0, end: 50, server_addr: 2, cluster_index: 0 },
                SessionFlow { start: 60, end: 100, server_addr: 3, cluster_index: 0 },
            ],
        };
        collector.collect_and_set_session_cluster_index(&mut session, 1, &protocol);
        let mut user = UserSessions {
            sessions: vec![session],
            user_cluster_index: 9,
        };
        collector.collect_and_set_user_cluster_index(&mut user, 1, &protocol);
        assert_eq!(user.user_cluster_index, DEFAULT_CLUSTER_INDEX);

        collector.persist_all().unwrap();

        let rrps: Vec<RrpRecord> =
            records::read_records(&dir.path().join("rrp").join("tcp_80.data")).unwrap();
        assert_eq!(rrps.len(), 2);
        assert_eq!(rrps[0].request_size, 10);
        assert_eq!(rrps[1].response_size, 40);

        let flows: Vec<FlowRecord> =
            records::read_records(&dir.path().join("flow").join("tcp_80.data")).unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].num_rrp, 2);
        assert!((flows[0].inter_request.mean - 1_000.0).abs() < 1e-9);

        let sessions: Vec<SessionRecord> =
            records::read_records(&dir.path().join("session").join("tcp_80.data")).unwrap();
        assert_eq!(sessions[0].num_servers, 2);
        assert_eq!(sessions[0].num_flows, 2);

        let users: Vec<UserRecord> =
            records::read_records(&dir.path().join("user").join("tcp_80.data")).unwrap();
        assert_eq!(users[0].num_sessions, 1);
    }
}
