//! Integer counter aggregators
//!
//! Small value→count maps partitioned by protocol and cluster index.
//! Values can be bucketed to a resolution or onto a log scale before
//! counting to bound memory on long-tailed distributions.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::Serialize;

use crate::key::Protocol;

const LOG_SCALE_FACTOR: f64 = 0.005;

/// Bucket a value onto a coarse log10 scale.
pub fn scale_to_log(value: i64) -> i64 {
    if value == 0 {
        return 0;
    }
    let negative = value < 0;
    let magnitude = value.unsigned_abs() as f64;
    let log = magnitude.log10();
    let bucketed = LOG_SCALE_FACTOR * (log / LOG_SCALE_FACTOR).floor();
    let scaled = 10f64.powf(bucketed).ceil() as i64;
    if negative {
        -scaled
    } else {
        scaled
    }
}

fn scale(value: i64, resolution: i64, log_scale: bool) -> i64 {
    let value = if log_scale { scale_to_log(value) } else { value };
    if resolution > 1 {
        value - value.rem_euclid(resolution)
    } else {
        value
    }
}

struct ProtocolEntry<V> {
    protocol: Protocol,
    clusters: HashMap<i32, V>,
}

/// Per-protocol, per-cluster `value -> count` map.
pub struct UnivariateCounter {
    name: &'static str,
    resolution: i64,
    log_scale: bool,
    data: RwLock<HashMap<u64, ProtocolEntry<BTreeMap<i64, u64>>>>,
}

impl UnivariateCounter {
    pub fn new(name: &'static str, resolution: i64, log_scale: bool) -> Self {
        Self {
            name,
            resolution,
            log_scale,
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, protocol: &Protocol, cluster: i32, values: &[i64]) {
        let mut data = self.data.write();
        let entry = data.entry(protocol.key).or_insert_with(|| ProtocolEntry {
            protocol: *protocol,
            clusters: HashMap::new(),
        });
        let counts = entry.clusters.entry(cluster).or_default();
        for &value in values {
            *counts
                .entry(scale(value, self.resolution, self.log_scale))
                .or_insert(0) += 1;
        }
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        self.data.read().values().map(|e| e.protocol).collect()
    }

    /// Exported as `cluster -> [[value, count], ...]` per protocol.
    pub fn export(&self) -> HashMap<String, HashMap<i32, Vec<[i64; 2]>>> {
        let data = self.data.read();
        data.values()
            .map(|entry| {
                let clusters = entry
                    .clusters
                    .iter()
                    .map(|(cluster, counts)| {
                        let tuples = counts.iter().map(|(&v, &c)| [v, c as i64]).collect();
                        (*cluster, tuples)
                    })
                    .collect();
                (entry.protocol.label(), clusters)
            })
            .collect()
    }

    pub fn total_count(&self) -> u64 {
        self.data
            .read()
            .values()
            .flat_map(|e| e.clusters.values())
            .flat_map(|counts| counts.values())
            .sum()
    }
}

/// Per-protocol, per-cluster `(x, y) -> count` map for paired values,
/// e.g. (pair index, size).
pub struct BivariateCounter {
    name: &'static str,
    resolution: i64,
    log_scale_y: bool,
    data: RwLock<HashMap<u64, ProtocolEntry<BTreeMap<(i64, i64), u64>>>>,
}

impl BivariateCounter {
    pub fn new(name: &'static str, resolution: i64, log_scale_y: bool) -> Self {
        Self {
            name,
            resolution,
            log_scale_y,
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, protocol: &Protocol, cluster: i32, pairs: &[[i64; 2]]) {
        let mut data = self.data.write();
        let entry = data.entry(protocol.key).or_insert_with(|| ProtocolEntry {
            protocol: *protocol,
            clusters: HashMap::new(),
        });
        let counts = entry.clusters.entry(cluster).or_default();
        for pair in pairs {
            let key = (pair[0], scale(pair[1], self.resolution, self.log_scale_y));
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    pub fn export(&self) -> HashMap<String, HashMap<i32, Vec<[i64; 3]>>> {
        let data = self.data.read();
        data.values()
            .map(|entry| {
                let clusters = entry
                    .clusters
                    .iter()
                    .map(|(cluster, counts)| {
                        let tuples = counts
                            .iter()
                            .map(|(&(x, y), &c)| [x, y, c as i64])
                            .collect();
                        (*cluster, tuples)
                    })
                    .collect();
                (entry.protocol.label(), clusters)
            })
            .collect()
    }
}

/// Simple per-protocol running sum.
#[derive(Default)]
pub struct SumCounter {
    data: RwLock<HashMap<u64, (Protocol, i64)>>,
}

impl SumCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, protocol: &Protocol, value: i64) {
        let mut data = self.data.write();
        data.entry(protocol.key).or_insert((*protocol, 0)).1 += value;
    }

    pub fn get(&self, protocol: &Protocol) -> i64 {
        self.data
            .read()
            .get(&protocol.key)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.data.read().values().map(|(_, v)| *v).sum()
    }

    pub fn export(&self) -> HashMap<String, i64> {
        self.data
            .read()
            .values()
            .map(|(protocol, value)| (protocol.label(), *value))
            .collect()
    }
}

/// Mean / min / max / standard deviation of a series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct Distribution {
    pub mean: f64,
    pub min: i64,
    pub max: i64,
    pub std_dev: f64,
}

impl Distribution {
    pub fn of(values: &[i64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let min = *values.iter().min().unwrap();
        let max = *values.iter().max().unwrap();
        let sum: i64 = values.iter().sum();
        let mean = sum as f64 / values.len() as f64;
        let variance = values
            .iter()
            .map(|&v| {
                let diff = v as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / values.len() as f64;
        Self {
            mean,
            min,
            max,
            std_dev: variance.sqrt(),
        }
    }
}
