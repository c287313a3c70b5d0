//! Analyzer configuration

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::flow::FlowTimeouts;
use crate::parser::ParserConfig;

const SECOND: i64 = 1_000_000_000;

/// Everything the pipeline needs beyond the pool and parser knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub parser: ParserConfig,
    pub timeouts: FlowTimeouts,
    /// Maximal gap between two flows of one session, nanoseconds.
    pub session_timeout: i64,
    /// Periodic non-forced pool flush interval in capture time, nanoseconds.
    pub flush_rate: i64,
    /// Stop after this many packets.
    pub packet_stop: u64,
    pub tcp_drop_incomplete: bool,
    pub drop_unidirectional: bool,
    pub reconstruct_tcp_response: bool,
    pub reconstruction_statistics: bool,
    /// Per-flow metric mode instead of aggregate metrics.
    pub flow_metrics: bool,
    /// Compute request/response pair sizes in per-flow mode.
    pub flow_rr_pairs: bool,
    /// Buffered flow summaries before the export writer blocks producers.
    pub export_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parser: ParserConfig::default(),
            timeouts: FlowTimeouts::default(),
            session_timeout: 600 * SECOND,
            flush_rate: 40 * SECOND,
            packet_stop: 10_000_000_000,
            tcp_drop_incomplete: false,
            drop_unidirectional: false,
            reconstruct_tcp_response: false,
            reconstruction_statistics: false,
            flow_metrics: true,
            flow_rr_pairs: false,
            export_buffer_size: 1_000_000,
        }
    }
}

/// Expand a port list such as `0-1023,8080,8443` into individual ports.
pub fn expand_port_list(spec: &str) -> anyhow::Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start
                .trim()
                .parse()
                .with_context(|| format!("invalid port range start in {part:?}"))?;
            let end: u16 = end
                .trim()
                .parse()
                .with_context(|| format!("invalid port range end in {part:?}"))?;
            if start > end {
                bail!("port range {part:?} is reversed");
            }
            ports.extend(start..=end);
        } else {
            ports.push(
                part.parse()
                    .with_context(|| format!("invalid port in {part:?}"))?,
            );
        }
    }
    Ok(ports)
}
