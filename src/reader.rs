//! Packet sources and the reader loop
//!
//! The reader pulls raw frames from a capture file or a live interface,
//! assigns the dense 1-based packet index, forwards frames to the parser
//! pool, and triggers a periodic non-forced pool flush in capture time to
//! bound memory.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use bzip2::read::BzDecoder;
use flate2::read::MultiGzDecoder;
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use tracing::{error, info};

use crate::parser::ParserPool;
use crate::pool::FlowPools;
use std::sync::Arc;

/// Anything that yields raw frames with capture timestamps (nanoseconds).
pub trait PacketSource {
    fn read_packet(&mut self) -> anyhow::Result<Option<(Vec<u8>, i64)>>;
}

enum FileFormat {
    Pcap(PcapReader<Box<dyn Read + Send>>),
    PcapNg(PcapNgReader<Box<dyn Read + Send>>),
}

/// Offline source over a pcap or pcapng file, transparently
/// decompressing gzip and bzip2 containers.
pub struct FileSource {
    format: FileFormat,
}

impl FileSource {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let reader = open_decompressed(path)?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let format = if name.contains(".pcapng") {
            FileFormat::PcapNg(
                PcapNgReader::new(reader)
                    .with_context(|| format!("opening pcapng {}", path.display()))?,
            )
        } else {
            FileFormat::Pcap(
                PcapReader::new(reader)
                    .with_context(|| format!("opening pcap {}", path.display()))?,
            )
        };
        Ok(Self { format })
    }
}

impl PacketSource for FileSource {
    fn read_packet(&mut self) -> anyhow::Result<Option<(Vec<u8>, i64)>> {
        match &mut self.format {
            FileFormat::Pcap(reader) => match reader.next_packet() {
                Some(Ok(packet)) => Ok(Some((
                    packet.data.into_owned(),
                    packet.timestamp.as_nanos() as i64,
                ))),
                Some(Err(e)) => Err(e).context("reading pcap packet"),
                None => Ok(None),
            },
            FileFormat::PcapNg(reader) => loop {
                match reader.next_block() {
                    Some(Ok(Block::EnhancedPacket(packet))) => {
                        return Ok(Some((
                            packet.data.into_owned(),
                            packet.timestamp.as_nanos() as i64,
                        )));
                    }
                    // Interface descriptions, statistics and the like.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e).context("reading pcapng block"),
                    None => return Ok(None),
                }
            },
        }
    }
}

fn open_decompressed(path: &Path) -> anyhow::Result<Box<dyn Read + Send>> {
    let mut magic = [0u8; 3];
    let mut probe =
        File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let read = probe.read(&mut magic)?;
    drop(probe);

    let file = BufReader::new(File::open(path)?);
    Ok(match &magic[..read] {
        [0x1f, 0x8b, ..] => Box::new(MultiGzDecoder::new(file)),
        [0x42, 0x5a, 0x68] => Box::new(BzDecoder::new(file)),
        _ => Box::new(file),
    })
}

/// Live capture from an interface.
pub struct LiveSource {
    capture: pcap::Capture<pcap::Active>,
}

impl LiveSource {
    pub fn open(interface: &str) -> anyhow::Result<Self> {
        let capture = pcap::Capture::from_device(interface)
            .with_context(|| format!("opening device {interface}"))?
            .promisc(true)
            .snaplen(152_200)
            .open()
            .with_context(|| format!("activating capture on {interface}"))?;
        Ok(Self { capture })
    }
}

impl PacketSource for LiveSource {
    fn read_packet(&mut self) -> anyhow::Result<Option<(Vec<u8>, i64)>> {
        match self.capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let nanos = ts.tv_sec as i64 * 1_000_000_000 + ts.tv_usec as i64 * 1_000;
                Ok(Some((packet.data.to_vec(), nanos)))
            }
            Err(pcap::Error::NoMorePackets) => Ok(None),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(e).context("reading live packet"),
        }
    }
}

/// All capture files under `input` (or `input` itself), sorted by name.
pub fn collect_capture_files(input: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        bail!("input path {} does not exist", input.display());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(input)
        .with_context(|| format!("listing {}", input.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.contains(".pcap"))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Drives one or more sources into the parser pool.
pub struct PacketReader {
    pub packet_idx: u64,
    pub first_packet_timestamp: i64,
    pub last_packet_timestamp: i64,
    flush_at: i64,
    pools: Arc<FlowPools>,
}

impl PacketReader {
    pub fn new(pools: Arc<FlowPools>) -> Self {
        Self {
            packet_idx: 0,
            first_packet_timestamp: 0,
            last_packet_timestamp: 0,
            flush_at: 0,
            pools,
        }
    }

    /// Read until the source ends or `packet_stop` packets were consumed
    /// in total. Every `flush_rate` nanoseconds of capture time the pools
    /// get a non-forced flush. Returns whether the packet limit was hit.
    pub fn read(
        &mut self,
        source: &mut dyn PacketSource,
        parser: &mut ParserPool,
        packet_stop: u64,
        flush_rate: i64,
    ) -> bool {
        while self.packet_idx < packet_stop {
            let (data, timestamp) = match source.read_packet() {
                Ok(Some(frame)) => frame,
                Ok(None) => return false,
                Err(e) => {
                    // A broken source ends here; the pipeline keeps the
                    // packets parsed so far.
                    error!("packet source failed: {e:#}");
                    return false;
                }
            };

            self.last_packet_timestamp = timestamp;
            if self.packet_idx == 0 {
                self.first_packet_timestamp = timestamp;
                self.flush_at = timestamp + flush_rate;
            }
            self.packet_idx += 1;
            parser.parse_packet(data, self.packet_idx, timestamp);

            if timestamp > self.flush_at {
                self.flush_at = timestamp + flush_rate;
                info!("periodic flush at packet {}", self.packet_idx);
                self.pools.flush(false);
            }
        }
        true
    }
}
