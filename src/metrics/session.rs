//! Session identification
//!
//! Flushed flows are clustered into sessions per `(protocol, client)`.
//! Shards flush independently, so flows arrive in arbitrary order; each
//! user keeps an ordered list of sessions and every insert either joins a
//! covering session, extends its predecessor, or starts a new session and
//! then merges forward as long as neighbors are within the session
//! timeout. There is deliberately no backward merge: predecessor
//! extension at insert time is the only backward-looking step.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::cluster::ClusterCollector;
use crate::flow::FlowCommon;
use crate::key::Protocol;

/// Summary of one flushed flow kept inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFlow {
    pub start: i64,
    pub end: i64,
    pub server_addr: u64,
    pub cluster_index: i32,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub start: i64,
    pub end: i64,
    pub cluster_index: i32,
    pub flows: Vec<SessionFlow>,
}

impl Session {
    fn new(flow: SessionFlow) -> Self {
        Self {
            start: flow.start,
            end: flow.end,
            cluster_index: 0,
            flows: vec![flow],
        }
    }

    pub fn num_servers(&self) -> i64 {
        let mut servers: Vec<u64> = self.flows.iter().map(|f| f.server_addr).collect();
        servers.sort_unstable();
        servers.dedup();
        servers.len() as i64
    }

    /// Gaps between consecutive flow starts, in insertion order.
    pub fn inter_flow_times(&self) -> Vec<i64> {
        self.flows
            .windows(2)
            .map(|pair| pair[1].start - pair[0].start)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct UserSessions {
    pub sessions: Vec<Session>,
    pub user_cluster_index: i32,
}

impl UserSessions {
    /// Gaps between the end of one session and the start of the next.
    pub fn inter_session_times(&self) -> Vec<i64> {
        self.sessions
            .windows(2)
            .map(|pair| pair[1].start - pair[0].end)
            .collect()
    }
}

struct ProtocolSessions {
    protocol: Protocol,
    users: Mutex<HashMap<u64, Arc<Mutex<UserSessions>>>>,
}

/// Metrics evaluated per user once all sessions are final.
pub trait SessionMetric: Send + Sync {
    fn on_flush(&self, protocol: &Protocol, user_addr: u64, user: &UserSessions);
}

pub struct SessionIdentifier {
    by_protocol: Mutex<HashMap<u64, Arc<ProtocolSessions>>>,
    session_timeout: i64,
    cluster: Arc<ClusterCollector>,
    session_metrics: Vec<Arc<dyn SessionMetric>>,
}

impl SessionIdentifier {
    pub fn new(session_timeout: i64, cluster: Arc<ClusterCollector>) -> Self {
        Self {
            by_protocol: Mutex::new(HashMap::new()),
            session_timeout,
            cluster,
            session_metrics: Vec::new(),
        }
    }

    pub fn register_session_metric(&mut self, metric: Arc<dyn SessionMetric>) {
        self.session_metrics.push(metric);
    }

    /// Insert one flushed flow into its user's session list.
    pub fn on_flush(&self, flow: &FlowCommon) {
        let protocol = Protocol::of_flow(flow);
        let flow_start = flow.start();
        let flow_end = flow.end();
        let session_flow = SessionFlow {
            start: flow_start,
            end: flow_end,
            server_addr: flow.server_addr,
            cluster_index: flow.cluster_index,
        };

        let protocol_sessions = {
            let mut by_protocol = self.by_protocol.lock();
            Arc::clone(by_protocol.entry(protocol.key).or_insert_with(|| {
                Arc::new(ProtocolSessions {
                    protocol,
                    users: Mutex::new(HashMap::new()),
                })
            }))
        };

        let user = {
            let mut users = protocol_sessions.users.lock();
            Arc::clone(
                users
                    .entry(flow.client_addr)
                    .or_insert_with(|| Arc::new(Mutex::new(UserSessions::default()))),
            )
        };

        let mut user = user.lock();
        self.insert_flow(&mut user, session_flow);
    }

    fn insert_flow(&self, user: &mut UserSessions, flow: SessionFlow) {
        let sessions = &mut user.sessions;
        // First session starting after this flow.
        let idx = sessions.partition_point(|s| s.start <= flow.start);

        let mut merge_idx = idx;
        if idx > 0 {
            let prev = &mut sessions[idx - 1];
            if prev.end >= flow.end {
                // Covered entirely by the previous session.
                prev.flows.push(flow);
                return;
            } else if flow.start - prev.end <= self.session_timeout {
                prev.flows.push(flow);
                prev.end = flow.end;
                merge_idx = idx - 1;
            } else {
                sessions.insert(idx, Session::new(flow));
            }
        } else {
            sessions.insert(0, Session::new(flow));
            merge_idx = 0;
        }

        // Forward merge: absorb followers that are now within reach.
        while merge_idx + 1 < sessions.len()
            && sessions[merge_idx + 1].start - sessions[merge_idx].end <= self.session_timeout
        {
            let next = sessions.remove(merge_idx + 1);
            let current = &mut sessions[merge_idx];
            current.end = current.end.max(next.end);
            current.flows.extend(next.flows);
        }
    }

    /// Sort each session's flows, run the cluster hooks and feed every
    /// registered session metric, then clear all state. Flows were
    /// appended in arrival order, so the sort happens once here rather
    /// than on every insert.
    pub fn force_flush(&self) {
        let by_protocol = std::mem::take(&mut *self.by_protocol.lock());

        by_protocol.par_iter().for_each(|(_, protocol_sessions)| {
            let protocol = protocol_sessions.protocol;
            let users = protocol_sessions.users.lock();
            debug!(
                protocol = %protocol.label(),
                users = users.len(),
                "flushing sessions"
            );

            users.par_iter().for_each(|(&user_addr, user)| {
                let mut user = user.lock();
                for session in &mut user.sessions {
                    session.flows.sort_by_key(|f| f.start);
                    self.cluster
                        .collect_and_set_session_cluster_index(session, user_addr, &protocol);
                }
                self.cluster
                    .collect_and_set_user_cluster_index(&mut user, user_addr, &protocol);
            });

            for metric in &self.session_metrics {
                users.par_iter().for_each(|(&user_addr, user)| {
                    let user = user.lock();
                    metric.on_flush(&protocol, user_addr, &user);
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Packet, Proto};

    const TIMEOUT: i64 = 600;

    fn identifier() -> SessionIdentifier {
        SessionIdentifier::new(TIMEOUT, Arc::new(ClusterCollector::disabled()))
    }

    fn flow(start: i64, end: i64) -> SessionFlow {
        SessionFlow {
            start,
            end,
            server_addr: 99,
            cluster_index: 0,
        }
    }

    fn insert(si: &SessionIdentifier, user: &mut UserSessions, f: SessionFlow) {
        si.insert_flow(user, f);
    }

    fn assert_sorted_and_separated(user: &UserSessions) {
        for pair in user.sessions.windows(2) {
            assert!(pair[0].start <= pair[1].start);
            assert!(pair[1].start - pair[0].end > TIMEOUT);
        }
    }

    #[test]
    fn flows_within_timeout_merge_into_one_session() {
        let si = identifier();
        let mut user = UserSessions::default();
        insert(&si, &mut user, flow(0, 100));
        insert(&si, &mut user, flow(200, 300));
        insert(&si, &mut user, flow(TIMEOUT + 400, TIMEOUT + 500));

        assert_eq!(user.sessions.len(), 2);
        assert_eq!(user.sessions[0].start, 0);
        assert_eq!(user.sessions[0].end, 300);
        assert_eq!(user.sessions[0].flows.len(), 2);
        assert_eq!(user.sessions[1].flows.len(), 1);
        assert_sorted_and_separated(&user);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let flows = [flow(0, 100), flow(200, 300), flow(TIMEOUT + 400, TIMEOUT + 500)];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let si = identifier();
            let mut user = UserSessions::default();
            for &i in &order {
                insert(&si, &mut user, flows[i]);
            }
            assert_eq!(user.sessions.len(), 2, "order {order:?}");
            assert_eq!(user.sessions[0].flows.len(), 2, "order {order:?}");
            assert_sorted_and_separated(&user);
        }
    }

    #[test]
    fn covered_flow_joins_previous_session() {
        let si = identifier();
        let mut user = UserSessions::default();
        insert(&si, &mut user, flow(0, 1_000));
        insert(&si, &mut user, flow(100, 200));

        assert_eq!(user.sessions.len(), 1);
        assert_eq!(user.sessions[0].end, 1_000);
        assert_eq!(user.sessions[0].flows.len(), 2);
    }

    #[test]
    fn bridging_flow_merges_forward() {
        let si = identifier();
        let mut user = UserSessions::default();
        // Two sessions too far apart to merge.
        insert(&si, &mut user, flow(0, 100));
        insert(&si, &mut user, flow(2_000, 2_100));
        assert_eq!(user.sessions.len(), 2);

        // A flow in between bridges both.
        insert(&si, &mut user, flow(500, 1_500));
        assert_eq!(user.sessions.len(), 1);
        assert_eq!(user.sessions[0].start, 0);
        assert_eq!(user.sessions[0].end, 2_100);
        assert_eq!(user.sessions[0].flows.len(), 3);
    }

    #[test]
    fn merge_keeps_maximum_end() {
        let si = identifier();
        let mut user = UserSessions::default();
        insert(&si, &mut user, flow(1_000, 5_000));
        // Starts before, ends within timeout of the next session's start.
        insert(&si, &mut user, flow(0, 900));
        assert_eq!(user.sessions.len(), 1);
        assert_eq!(user.sessions[0].end, 5_000);
    }

    #[test]
    fn earliest_flow_inserts_at_front() {
        let si = identifier();
        let mut user = UserSessions::default();
        insert(&si, &mut user, flow(10_000, 10_100));
        insert(&si, &mut user, flow(0, 100));
        assert_eq!(user.sessions.len(), 2);
        assert_eq!(user.sessions[0].start, 0);
        assert_sorted_and_separated(&user);
    }

    #[test]
    fn random_inserts_stay_sorted() {
        let si = identifier();
        let mut user = UserSessions::default();
        // Deterministic pseudo-random schedule.
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let start = (seed % 1_000_000) as i64;
            insert(&si, &mut user, flow(start, start + 50));
            for pair in user.sessions.windows(2) {
                assert!(pair[0].start <= pair[1].start);
            }
        }
        assert_sorted_and_separated(&user);
    }

    #[test]
    fn force_flush_sorts_flows_and_feeds_metrics() {
        struct Collecting {
            seen: Mutex<Vec<(u64, usize)>>,
        }
        impl SessionMetric for Collecting {
            fn on_flush(&self, _protocol: &Protocol, user_addr: u64, user: &UserSessions) {
                for session in &user.sessions {
                    for pair in session.flows.windows(2) {
                        assert!(pair[0].start <= pair[1].start);
                    }
                }
                self.seen.lock().push((user_addr, user.sessions.len()));
            }
        }

        let metric = Arc::new(Collecting {
            seen: Mutex::new(Vec::new()),
        });
        let mut si = identifier();
        si.register_session_metric(metric.clone());

        let mut common = FlowCommon {
            flow_key: 1,
            timeout: 0,
            cluster_index: 0,
            client_addr: 42,
            server_addr: 99,
            client_port: 50_000,
            server_port: 80,
            proto: Proto::Tcp,
            packets: Vec::new(),
        };
        // Two flows arriving newest-first.
        common.packets = vec![
            Packet { timestamp: 200, packet_idx: 3, payload_length: 1, from_client: true },
            Packet { timestamp: 250, packet_idx: 4, payload_length: 1, from_client: true },
        ];
        si.on_flush(&common);
        common.packets = vec![
            Packet { timestamp: 0, packet_idx: 1, payload_length: 1, from_client: true },
            Packet { timestamp: 50, packet_idx: 2, payload_length: 1, from_client: true },
        ];
        si.on_flush(&common);

        si.force_flush();
        let seen = metric.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (42, 1));

        // State is cleared afterwards.
        si.force_flush();
        assert_eq!(metric.seen.lock().len(), 1);
    }
}
