//! Command-line surface and run wiring

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::info;

use crate::config::{expand_port_list, Config};
use crate::flow::FlowTimeouts;
use crate::metrics::aggregate::{AggregateConfig, AggregateMetric};
use crate::metrics::flow_export::{FlowExportConfig, FlowExportMetric};
use crate::parser::{ParserConfig, ParserPool};
use crate::pool::{FlowPools, PoolConfig, PortFilter};
use crate::reader::{collect_capture_files, FileSource, LiveSource, PacketReader};

#[derive(Parser, Debug)]
#[command(name = "flowscope")]
#[command(author, version, about = "Offline and live network-flow analyzer")]
pub struct Cli {
    /// Path to a pcap/pcapng file (optionally .gz/.bz2) or a directory of
    /// capture files (not in combination with --interface)
    #[arg(short = 'i', long = "input", conflicts_with = "interface")]
    pub input: Option<PathBuf>,

    /// Interface name to capture packets from (not in combination with -i)
    #[arg(long)]
    pub interface: Option<String>,

    /// Directory for exported metric files (default: `metrics` next to the input)
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Compute per-flow metrics instead of aggregate metrics
    #[arg(long = "flow", default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    pub flow: bool,

    /// Compute request/response pair sizes in per-flow mode
    #[arg(long = "flowRRPs")]
    pub flow_rr_pairs: bool,

    /// Filter TCP ports, e.g. 0-1023,8080,8443
    #[arg(long = "tcpFilter", default_value = "0-65535")]
    pub tcp_filter: String,

    /// Filter UDP ports, e.g. 0-1023,8080,8443
    #[arg(long = "udpFilter", default_value = "0-65535")]
    pub udp_filter: String,

    /// Drop all TCP flows that do not start with a SYN packet
    #[arg(long = "tcpDropIncomplete")]
    pub tcp_drop_incomplete: bool,

    /// Drop all unidirectional flows (after reconstruction, if enabled)
    #[arg(long = "dropUnidirectional")]
    pub drop_unidirectional: bool,

    /// Reconstruct the server->client direction of unidirectional TCP
    /// flows from the client's ACK progression
    #[arg(long = "tcpReconstructResponse")]
    pub tcp_reconstruct_response: bool,

    /// Aggregate size and speed statistics about reconstructed packets
    #[arg(long = "statisticTCPReconstruction")]
    pub statistic_tcp_reconstruction: bool,

    /// TCP timeout after an idle period
    #[arg(long = "tcpTimeout", default_value = "5m", value_parser = humantime::parse_duration)]
    pub tcp_timeout: Duration,

    /// TCP timeout after a FIN was seen
    #[arg(long = "tcpFinTimeout", default_value = "2s", value_parser = humantime::parse_duration)]
    pub tcp_fin_timeout: Duration,

    /// TCP timeout after a RST was seen
    #[arg(long = "tcpRstTimeout", default_value = "1s", value_parser = humantime::parse_duration)]
    pub tcp_rst_timeout: Duration,

    /// UDP timeout after an idle period
    #[arg(long = "udpTimeout", default_value = "5m", value_parser = humantime::parse_duration)]
    pub udp_timeout: Duration,

    /// Session timeout: maximal gap between flows of one session
    #[arg(long = "sessionTimeout", default_value = "10m", value_parser = humantime::parse_duration)]
    pub session_timeout: Duration,

    /// Periodic pool flush interval in capture time
    #[arg(long = "flushRate", default_value = "40s", value_parser = humantime::parse_duration)]
    pub flush_rate: Duration,

    /// Sampling rate in percent
    #[arg(long, default_value_t = 100.0)]
    pub sampling: f64,

    /// Stop after this many packets
    #[arg(long = "packetStop", default_value_t = 10_000_000_000)]
    pub packet_stop: u64,

    /// Store per-protocol flow/session/user summary records here for the
    /// clustering trainer
    #[arg(long = "infoDirectory")]
    pub info_directory: Option<PathBuf>,

    /// Number of slots in the sorting ring buffer
    #[arg(long = "sortingRingBufferSize", default_value_t = 32_000_000)]
    pub sorting_ring_buffer_size: u64,

    /// Number of parser worker threads
    #[arg(long = "numParsers", default_value_t = 16)]
    pub num_parsers: usize,

    /// Number of channels feeding the parser workers
    #[arg(long = "numParserChannels", default_value_t = 8)]
    pub num_parser_channels: usize,

    /// Buffered flow summaries before the export writer blocks
    #[arg(long = "exportBufferSize", default_value_t = 1_000_000)]
    pub export_buffer_size: usize,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    fn to_config(&self) -> Result<Config> {
        if !(self.sampling > 0.0 && self.sampling <= 100.0) {
            bail!("sampling rate must be in (0, 100], got {}", self.sampling);
        }
        Ok(Config {
            parser: ParserConfig {
                ring_size: self.sorting_ring_buffer_size,
                num_parsers: self.num_parsers,
                num_channels: self.num_parser_channels,
                sampling_rate: self.sampling,
            },
            timeouts: FlowTimeouts {
                tcp: self.tcp_timeout.as_nanos() as i64,
                tcp_fin: self.tcp_fin_timeout.as_nanos() as i64,
                tcp_rst: self.tcp_rst_timeout.as_nanos() as i64,
                udp: self.udp_timeout.as_nanos() as i64,
            },
            session_timeout: self.session_timeout.as_nanos() as i64,
            flush_rate: self.flush_rate.as_nanos() as i64,
            packet_stop: self.packet_stop,
            tcp_drop_incomplete: self.tcp_drop_incomplete,
            drop_unidirectional: self.drop_unidirectional,
            reconstruct_tcp_response: self.tcp_reconstruct_response,
            reconstruction_statistics: self.statistic_tcp_reconstruction,
            flow_metrics: self.flow,
            flow_rr_pairs: self.flow_rr_pairs,
            export_buffer_size: self.export_buffer_size,
        })
    }

    fn export_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.export {
            return Ok(dir.clone());
        }
        match &self.input {
            Some(input) if input.is_file() => Ok(input
                .parent()
                .unwrap_or_else(|| std::path::Path::new("."))
                .join("metrics")),
            Some(input) => Ok(input.join("metrics")),
            None => bail!("--export is required when capturing from an interface"),
        }
    }
}

pub fn run(cli: Cli) -> Result<()> {
    if cli.input.is_none() && cli.interface.is_none() {
        bail!("specify an input path via -i or an interface via --interface");
    }
    let config = cli.to_config()?;
    let export_dir = cli.export_dir()?;
    std::fs::create_dir_all(&export_dir)
        .with_context(|| format!("creating export directory {}", export_dir.display()))?;
    if let Some(info_dir) = &cli.info_directory {
        std::fs::create_dir_all(info_dir)
            .with_context(|| format!("creating info directory {}", info_dir.display()))?;
    }

    let start = Instant::now();

    let pools = FlowPools::new(PoolConfig {
        tcp_filter: PortFilter::from_ports(
            &expand_port_list(&cli.tcp_filter).context("parsing --tcpFilter")?,
        ),
        udp_filter: PortFilter::from_ports(
            &expand_port_list(&cli.udp_filter).context("parsing --udpFilter")?,
        ),
        tcp_drop_incomplete: config.tcp_drop_incomplete,
        timeouts: config.timeouts,
    });
    let mut parser = ParserPool::new(Arc::clone(&pools), &config.parser);

    let mut aggregate = None;
    let mut flow_export = None;
    if config.flow_metrics {
        let metric = Arc::new(
            FlowExportMetric::new(FlowExportConfig {
                export_dir: export_dir.clone(),
                compute_rr_pairs: config.flow_rr_pairs,
                buffer_size: config.export_buffer_size,
            })
            .context("setting up flow export")?,
        );
        pools.register_metric(metric.clone());
        flow_export = Some(metric);
    } else {
        let metric = Arc::new(AggregateMetric::new(AggregateConfig {
            session_timeout: config.session_timeout,
            info_dir: cli.info_directory.clone(),
            drop_unidirectional: config.drop_unidirectional,
            reconstruct_tcp_response: config.reconstruct_tcp_response,
            reconstruction_statistics: config.reconstruction_statistics,
        }));
        pools.register_metric(metric.clone());
        aggregate = Some(metric);
    }

    let mut reader = PacketReader::new(Arc::clone(&pools));
    if let Some(input) = &cli.input {
        let files = collect_capture_files(input)?;
        if files.is_empty() {
            bail!("no capture files found under {}", input.display());
        }
        for file in files {
            info!("reading {}", file.display());
            info!("already read {} packets", reader.packet_idx);
            let mut source =
                FileSource::open(&file).with_context(|| format!("opening {}", file.display()))?;
            let stop_reached =
                reader.read(&mut source, &mut parser, config.packet_stop, config.flush_rate);
            if stop_reached {
                break;
            }
        }
    } else if let Some(interface) = &cli.interface {
        let mut source = LiveSource::open(interface)?;
        reader.read(&mut source, &mut parser, config.packet_stop, config.flush_rate);
    }

    let analyzed =
        (reader.last_packet_timestamp - reader.first_packet_timestamp) as f64 / 1e9;
    info!("analyzed {analyzed:.2} seconds of traffic");

    parser.close();
    info!("decoded {} packets", reader.packet_idx);
    info!("parsing completed after {:.2?}", start.elapsed());
    pools.print_statistics();

    pools.close();
    info!("pool closed after {:.2?}", start.elapsed());

    if let Some(metric) = aggregate {
        metric.force_flush()?;
        info!("sessions flushed after {:.2?}", start.elapsed());
        metric.print_statistics();
        metric.export(&export_dir)?;
        info!("export finished after {:.2?}", start.elapsed());
    }
    if let Some(metric) = flow_export {
        metric.close();
    }

    Ok(())
}
