//! Capture Source: opens a live interface or offline pcap file, applies a
//! BPF filter, and decodes each captured frame into a [`TcpSegment`]. Runs
//! the blocking `pcap` read loop on a dedicated blocking task, the same way
//! the teacher isolates blocking I/O (`rt_updater::check_blocking`,
//! `control_api`'s `spawn_blocking` call) from the async runtime.

use std::net::IpAddr;
use std::path::Path;

use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use pcap::{Active, Capture, Linktype, Offline};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::assembler::{NetworkFlow, TcpSegment, TransportFlow};

/// Failures opening a capture source are fatal at startup (spec §4.1).
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("opening capture source '{source_name}': {cause}")]
    Open {
        source_name: String,
        #[source]
        cause: pcap::Error,
    },
    #[error("compiling BPF filter '{bpf}': {cause}")]
    Bpf {
        bpf: String,
        #[source]
        cause: pcap::Error,
    },
}

/// Capacity of the channel carrying decoded segments out of the blocking
/// capture task into the assembler's task.
const SEGMENT_CHANNEL_CAPACITY: usize = 4096;

/// A successfully opened, filtered capture source, ready to be driven.
/// Splitting open from drive lets callers surface open/BPF failures as
/// fatal startup errors before any packet processing begins (spec §4.1).
pub struct CaptureHandle(AnyCapture);

enum AnyCapture {
    Live(Capture<Active>),
    File(Capture<Offline>),
}

impl AnyCapture {
    fn next_packet(&mut self) -> Result<(std::time::SystemTime, Vec<u8>), pcap::Error> {
        let packet = match self {
            AnyCapture::Live(c) => c.next_packet()?,
            AnyCapture::File(c) => c.next_packet()?,
        };
        let secs = packet.header.ts.tv_sec as i64;
        let micros = packet.header.ts.tv_usec as u32;
        let ts = std::time::UNIX_EPOCH
            + std::time::Duration::from_secs(secs.max(0) as u64)
            + std::time::Duration::from_micros(u64::from(micros));
        Ok((ts, packet.data.to_vec()))
    }

    fn datalink(&self) -> Linktype {
        match self {
            AnyCapture::Live(c) => c.get_datalink(),
            AnyCapture::File(c) => c.get_datalink(),
        }
    }
}

/// Open a live interface or, if `source_name` names an existing file, an
/// offline capture; compile and install `bpf` on it.
pub fn open(source_name: &str, bpf: &str) -> Result<CaptureHandle, CaptureError> {
    let mut capture = if Path::new(source_name).is_file() {
        let cap = Capture::from_file(source_name).map_err(|cause| CaptureError::Open {
            source_name: source_name.to_owned(),
            cause,
        })?;
        AnyCapture::File(cap)
    } else {
        let cap = Capture::from_device(source_name)
            .map_err(|cause| CaptureError::Open {
                source_name: source_name.to_owned(),
                cause,
            })?
            .promisc(true)
            .snaplen(65535)
            .timeout(1000)
            .open()
            .map_err(|cause| CaptureError::Open {
                source_name: source_name.to_owned(),
                cause,
            })?;
        AnyCapture::Live(cap)
    };

    match &mut capture {
        AnyCapture::Live(c) => c.filter(bpf, true).map_err(|cause| CaptureError::Bpf {
            bpf: bpf.to_owned(),
            cause,
        })?,
        AnyCapture::File(c) => c.filter(bpf, true).map_err(|cause| CaptureError::Bpf {
            bpf: bpf.to_owned(),
            cause,
        })?,
    }

    Ok(CaptureHandle(capture))
}

/// Decode one captured frame into a [`TcpSegment`], skipping non-TCP or
/// malformed frames rather than treating them as errors (spec §4.1: only
/// capture-open/BPF failures are fatal).
fn decode(datalink: Linktype, ts: std::time::SystemTime, data: &[u8]) -> Option<TcpSegment> {
    // BSD loopback frames carry a 4-byte address-family header instead of
    // an Ethernet header.
    let ip_bytes = if datalink == Linktype::NULL || datalink == Linktype::LOOP {
        data.get(4..)?
    } else {
        data
    };

    let sliced = if datalink == Linktype::ETHERNET {
        SlicedPacket::from_ethernet(data).ok()?
    } else {
        SlicedPacket::from_ip(ip_bytes).ok()?
    };

    let (src, dst) = match sliced.ip? {
        InternetSlice::Ipv4(ip) => (
            IpAddr::V4(ip.header().source_addr()),
            IpAddr::V4(ip.header().destination_addr()),
        ),
        InternetSlice::Ipv6(ip) => (
            IpAddr::V6(ip.header().source_addr()),
            IpAddr::V6(ip.header().destination_addr()),
        ),
    };

    let TransportSlice::Tcp(tcp) = sliced.transport? else {
        return None;
    };

    Some(TcpSegment {
        timestamp: ts,
        network: NetworkFlow { src, dst },
        transport: TransportFlow {
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
        },
        seq: tcp.sequence_number(),
        payload: sliced.payload.to_vec(),
        fin: tcp.fin(),
    })
}

/// Run one already-opened capture source to completion (live: until the
/// process shuts down or the interface errors; offline: until the file is
/// exhausted), decoding and forwarding every TCP segment to `tx`.
pub async fn drive(handle: CaptureHandle, source_name: String, tx: mpsc::Sender<TcpSegment>) {
    let mut capture = handle.0;
    let datalink = capture.datalink();

    let result = tokio::task::spawn_blocking(move || loop {
        match capture.next_packet() {
            Ok((ts, data)) => {
                if let Some(segment) = decode(datalink, ts, &data) {
                    if tx.blocking_send(segment).is_err() {
                        debug!(source = %source_name, "segment channel closed, stopping capture");
                        return;
                    }
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => {
                debug!(source = %source_name, "offline capture exhausted");
                return;
            }
            Err(e) => {
                warn!(source = %source_name, error = %e, "capture read error, stopping");
                return;
            }
        }
    })
    .await;

    if result.is_err() {
        warn!("capture blocking task panicked");
    }
}

/// Capacity exported for `run.rs` to size the channel it hands to
/// [`run_capture`].
pub const fn segment_channel_capacity() -> usize {
    SEGMENT_CHANNEL_CAPACITY
}
