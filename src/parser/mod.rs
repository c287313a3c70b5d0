//! Parser pool
//!
//! Decoding runs on N worker threads fed over C shared channels, so any
//! worker can pick up any batch. Capture order is restored afterwards by
//! the sorting ring buffer: workers deposit records at `idx mod R` and a
//! single flusher walks the cursor and feeds the flow pools in strict
//! index order.

pub mod decode;
pub mod ring;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::pool::FlowPools;
use ring::SortRing;

const PARSER_CHANNEL_SIZE: usize = 40_000;
const FRAME_BATCH_SIZE: usize = 1_600;
const WAKE_CHANNEL_SIZE: usize = 200;
/// Each parser posts a flusher wake every this many batches, and once
/// more when its channel closes.
const WAKE_EVERY_BATCHES: u64 = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Number of slots in the sorting ring buffer.
    pub ring_size: u64,
    /// Number of parser worker threads.
    pub num_parsers: usize,
    /// Number of channels feeding the workers; clamped to `num_parsers`.
    /// Fewer channels than workers balances load, at some contention cost.
    pub num_channels: usize,
    /// Sampling rate in percent. Sampling is deterministic by flow key so
    /// a flow is either fully kept or fully dropped.
    pub sampling_rate: f64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            ring_size: 32_000_000,
            num_parsers: 16,
            num_channels: 8,
            sampling_rate: 100.0,
        }
    }
}

/// One raw frame as handed over by the packet source.
pub struct FrameData {
    pub data: Vec<u8>,
    pub packet_idx: u64,
    pub timestamp: i64,
}

pub struct ParserPool {
    batch: Vec<FrameData>,
    channels: Vec<Sender<Vec<FrameData>>>,
    next_channel: usize,
    wake_tx: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
    /// Frames that decoded to neither TCP nor UDP (malformed or other
    /// protocols); they still advance the ring cursor.
    undecoded: Arc<AtomicU64>,
}

impl ParserPool {
    pub fn new(pools: Arc<FlowPools>, config: &ParserConfig) -> Self {
        let num_parsers = config.num_parsers.max(1);
        let num_channels = config.num_channels.clamp(1, num_parsers);
        let ring = Arc::new(SortRing::new(config.ring_size));
        let num_shards = pools.num_shards() as u64;
        let modulo = sampling_modulo(config.sampling_rate, num_shards);

        let (wake_tx, wake_rx) = bounded(WAKE_CHANNEL_SIZE);
        let mut channels = Vec::with_capacity(num_channels);
        let mut receivers = Vec::with_capacity(num_channels);
        for _ in 0..num_channels {
            let (tx, rx) = bounded(PARSER_CHANNEL_SIZE);
            channels.push(tx);
            receivers.push(rx);
        }

        let undecoded = Arc::new(AtomicU64::new(0));
        let workers = (0..num_parsers)
            .map(|index| {
                let rx = receivers[index % num_channels].clone();
                let ring = Arc::clone(&ring);
                let wake = wake_tx.clone();
                let undecoded = Arc::clone(&undecoded);
                std::thread::spawn(move || {
                    parse_worker(index, rx, ring, wake, modulo, num_shards, undecoded)
                })
            })
            .collect();

        let flusher = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || flush_loop(wake_rx, ring, pools))
        };

        Self {
            batch: Vec::with_capacity(FRAME_BATCH_SIZE),
            channels,
            next_channel: 0,
            wake_tx: Some(wake_tx),
            workers,
            flusher: Some(flusher),
            undecoded,
        }
    }

    /// Queue a raw frame for decoding. Blocks when the target channel is
    /// full, which back-pressures the packet source.
    pub fn parse_packet(&mut self, data: Vec<u8>, packet_idx: u64, timestamp: i64) {
        self.batch.push(FrameData {
            data,
            packet_idx,
            timestamp,
        });
        if self.batch.len() == FRAME_BATCH_SIZE {
            let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(FRAME_BATCH_SIZE));
            let channel = self.next_channel;
            self.next_channel = (self.next_channel + 1) % self.channels.len();
            let _ = self.channels[channel].send(batch);
        }
    }

    /// Flush the partial batch, wait for the workers, then wake the
    /// flusher one last time and wait for the ring to drain.
    pub fn close(mut self) {
        let batch = std::mem::take(&mut self.batch);
        if !batch.is_empty() {
            let _ = self.channels[0].send(batch);
        }
        self.channels.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(wake) = self.wake_tx.take() {
            let _ = wake.send(());
        }
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.join();
        }
        let undecoded = self.undecoded.load(Ordering::Relaxed);
        if undecoded > 0 {
            info!("{undecoded} frames carried no TCP/UDP transport");
        }
    }
}

fn sampling_modulo(rate: f64, num_shards: u64) -> u64 {
    // Guard the 100% case explicitly so float rounding cannot drop packets.
    if rate >= 100.0 {
        1
    } else {
        (num_shards as f64 * (100.0 / rate)) as u64
    }
}

fn parse_worker(
    index: usize,
    rx: Receiver<Vec<FrameData>>,
    ring: Arc<SortRing>,
    wake: Sender<()>,
    sampling_modulo: u64,
    num_shards: u64,
    undecoded: Arc<AtomicU64>,
) {
    let mut batches = 0u64;
    for batch in rx {
        for frame in &batch {
            if frame.packet_idx == 0 {
                continue;
            }
            let mut info = decode::decode_frame(&frame.data, frame.packet_idx, frame.timestamp);
            if !info.has_tcp && !info.has_udp {
                undecoded.fetch_add(1, Ordering::Relaxed);
            }
            while !ring.has_room(info.packet_idx) {
                warn!(
                    parser = index,
                    "sorting ring buffer full, sleeping 1s; increase the ring size or flow shard throughput"
                );
                let _ = wake.try_send(());
                std::thread::sleep(Duration::from_secs(1));
            }
            // Dropped samples still occupy their slot so the cursor advances.
            if info.flow_key % sampling_modulo > num_shards {
                info.has_tcp = false;
                info.has_udp = false;
            }
            ring.write(info);
        }
        batches += 1;
        if batches % WAKE_EVERY_BATCHES == 0 {
            let _ = wake.try_send(());
        }
    }
    let _ = wake.try_send(());
}

fn flush_loop(wake_rx: Receiver<()>, ring: Arc<SortRing>, pools: Arc<FlowPools>) {
    while wake_rx.recv().is_ok() {
        ring.drain(|info| {
            if info.has_tcp {
                pools.add_tcp_packet(info);
            } else if info.has_udp {
                pools.add_udp_packet(info);
            }
        });
    }
}
