//! Wires the Capture Source, Assembler, Flow Dispatcher, Body Handler,
//! Replay Engine, and Metrics Sink into one running pipeline per configured
//! interface, and drives graceful shutdown (spec §2's data-flow diagram,
//! §5's concurrency model). This is the crate's `main.rs`-equivalent
//! orchestration, split out into a library function the way the teacher's
//! `forwarder`/`receiver` binaries keep `main.rs` a thin CLI shim over a
//! `run()` in the lib.

use std::path::Path;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::assembler::{Assembler, FlowKey, TcpSegment, IDLE_FLUSH_AGE};
use crate::body;
use crate::capture::{self, CaptureError};
use crate::cli::Cli;
use crate::config::{self, Config, ConfigError};
use crate::flow::{self, flow_channel, Direction, MessageSink, ParsedMessage};
use crate::message::{Headers, MessageHead};
use crate::replay::ReplayEngine;

/// Interval between idle-flush ticks (spec §4.1: "every minute").
const FLUSH_TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// Run the full pipeline to completion: load configuration, open every
/// capture source, and drive them until each returns end-of-stream (process
/// shutdown for live interfaces, file exhaustion for an offline capture).
pub async fn run(cli: Cli) -> Result<(), RunError> {
    let config = config::load_config(Path::new(&cli.conf), &cli.ifaces, cli.bpf.as_deref())?;
    info!(ifaces = ?config.ifaces, bpf = %config.bpf, relays = config.relays.len(), "starting httpcap");

    if let Some(addr) = cli.pprof.clone() {
        tokio::spawn(async move {
            if let Err(e) = crate::debugsrv::serve(&addr).await {
                warn!(error = %e, "debug server exited");
            }
        });
    }

    let sink = std::sync::Arc::new(PipelineSink::new(&config, cli.print_body));

    // Every (interface, BPF) pair opens its own capture source before any
    // packet processing begins, so a fatal open/BPF-compile error surfaces
    // before the pipeline starts driving packets (spec §4.1, §7).
    let mut opened = Vec::with_capacity(config.ifaces.len());
    for iface in &config.ifaces {
        opened.push((iface.clone(), capture::open(iface, &config.bpf)?));
    }

    let mut tasks = Vec::with_capacity(opened.len());
    for (iface, handle) in opened {
        let sink = sink.clone();
        let verbose = cli.verbose;
        tasks.push(tokio::spawn(async move {
            run_capture_source(handle, iface, sink, verbose).await;
        }));
    }

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "capture source task panicked");
        }
    }

    info!("all capture sources exhausted, shutting down");
    Ok(())
}

/// Drive one opened capture source: decode segments onto a channel, hand
/// them to a per-source Assembler, dispatch Flow Workers, and tick an idle
/// flush timer, until the source ends. On return, every flow has been
/// flushed and every worker has drained to end-of-stream (spec §5's
/// cancellation contract).
async fn run_capture_source(
    handle: capture::CaptureHandle,
    source_name: String,
    sink: std::sync::Arc<PipelineSink>,
    verbose: bool,
) {
    let (seg_tx, mut seg_rx) = mpsc::channel(capture::segment_channel_capacity());
    let capture_task = tokio::spawn(capture::drive(handle, source_name.clone(), seg_tx));

    let mut assembler = Assembler::new();
    let mut flush_tick = tokio::time::interval(FLUSH_TICK_INTERVAL);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the first real flush
    // happens a full interval after startup.
    flush_tick.tick().await;

    loop {
        tokio::select! {
            segment = seg_rx.recv() => {
                match segment {
                    Some(segment) => dispatch(&mut assembler, segment, &sink, &source_name, verbose),
                    None => break,
                }
            }
            _ = flush_tick.tick() => {
                assembler.flush_older_than(Instant::now() - IDLE_FLUSH_AGE);
            }
        }
    }

    assembler.flush_all();
    let _ = capture_task.await;
    info!(source = %source_name, "capture source finished");
}

/// Hand one decoded segment to the Assembler, spawning a Flow Worker the
/// first time a flow key is seen (spec §4.2's Flow Dispatcher).
fn dispatch(
    assembler: &mut Assembler,
    segment: TcpSegment,
    sink: &std::sync::Arc<PipelineSink>,
    source_name: &str,
    verbose: bool,
) {
    let key = segment.flow_key();
    if verbose {
        tracing::debug!(source = source_name, flow = %key, seq = segment.seq, len = segment.payload.len(), fin = segment.fin, "packet");
    }
    if !assembler.has_flow(&key) {
        let (tx, rx) = flow_channel();
        assembler.register(key, tx);
        let sink = sink.clone();
        tokio::spawn(async move {
            flow::run_flow_worker(key, rx, sink).await;
        });
    }
    assembler.submit(segment);
}

/// The Body Handler's logging responsibility (spec §4.4 step 4), plus
/// routing parsed requests to the Replay Engine and Metrics Sink (spec §2's
/// data-flow diagram).
struct PipelineSink {
    replay: ReplayEngine,
    metrics_keys: Vec<String>,
    print_body: bool,
    has_relays: bool,
}

impl PipelineSink {
    fn new(config: &Config, print_body: bool) -> Self {
        PipelineSink {
            replay: ReplayEngine::new(config),
            metrics_keys: config.metrics_keys.clone(),
            print_body,
            has_relays: !config.relays.is_empty(),
        }
    }
}

impl MessageSink for PipelineSink {
    fn should_materialize(&self, direction: Direction) -> bool {
        match direction {
            // Request bodies are materialized unconditionally whenever at
            // least one replay rule is configured to see them (spec §4.4).
            Direction::Request => self.has_relays,
            // Response bodies are gated purely by the `--print-body` flag.
            Direction::Response => self.print_body,
        }
    }

    async fn on_message(&self, key: FlowKey, message: ParsedMessage) {
        log_message_summary(key, &message).await;

        if let MessageHead::Request { method, .. } = &message.head {
            if !self.metrics_keys.is_empty() {
                crate::metrics::record(&self.metrics_keys, method);
            }
            let matched = self.replay.handle(&message).await;
            if matched > 0 {
                tracing::debug!(flow = %key, matched, "replay rules matched");
            }
        }
    }
}

/// Log the message summary spec §4.4 step 4 asks for: the request/status
/// line, each header once, each multipart form field once (requests only),
/// and the body either as text or a size-only placeholder.
async fn log_message_summary(key: FlowKey, message: &ParsedMessage) {
    let headers = message.head.headers();
    let header_list: Vec<String> = headers.iter().map(|(n, v)| format!("{n}: {v}")).collect();

    let body_display = match &message.body.content {
        Some(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_owned(),
            Err(_) => format!("<{} bytes binary>", bytes.len()),
        },
        None => format!("<{} bytes, not materialized>", message.body.decoded_len),
    };

    info!(
        flow = %key,
        line = %message.head.summary_line(),
        headers = ?header_list,
        body_len = message.body.decoded_len,
        body = %body_display,
        "http message"
    );

    if message.head.is_request() {
        if let Some(content) = &message.body.content {
            if let Some(boundary) = multipart_boundary(headers) {
                let fields = body::parse_multipart(content, &boundary).await;
                for field in &fields {
                    info!(flow = %key, name = ?field.name, file_name = ?field.file_name, bytes = field.byte_len, "form field");
                }
            }
        }
    }
}

/// Extract the `boundary=` parameter from a `multipart/form-data`
/// `Content-Type` header, if present.
fn multipart_boundary(headers: &Headers) -> Option<String> {
    let content_type = headers.get("Content-Type")?;
    if !content_type.to_ascii_lowercase().starts_with("multipart/form-data") {
        return None;
    }
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("boundary=").map(|b| b.trim_matches('"').to_owned()))
}
