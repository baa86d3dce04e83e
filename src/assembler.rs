//! TCP flow reassembly.
//!
//! Indexes arbitrary TCP segments by (network flow, transport flow), orders
//! them by sequence number, and materializes each half-duplex flow as an
//! append-only byte stream handed to a per-flow worker. Ported in spirit
//! from `original_source/main.go`'s `tcpassembly.Assembler`/`FlushOlderThan`
//! usage, restructured the way the teacher shapes a stateful, shared
//! resource (`storage::journal::Journal`): a plain struct owning a map,
//! driven from the single packet-reading task so no internal locking is
//! needed.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::flow::{FlowChunk, FlowSender};

/// Default global reorder-buffer budget across all flows (spec §4.1).
pub const DEFAULT_MEMORY_BUDGET: usize = 32 * 1024 * 1024;

/// Idle threshold after which a flow is closed by the periodic flush tick.
pub const IDLE_FLUSH_AGE: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Flow identity
// ---------------------------------------------------------------------------

/// One endpoint of a TCP connection's network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// One endpoint of a TCP connection's transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportFlow {
    pub src_port: u16,
    pub dst_port: u16,
}

/// Identifies one direction of one TCP connection. Two `FlowKey`s with
/// src/dst swapped describe the two directions of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub network: NetworkFlow,
    pub transport: TransportFlow,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.network.src, self.transport.src_port, self.network.dst, self.transport.dst_port
        )
    }
}

/// An immutable, captured TCP segment. Owned by the capture source; consumed
/// by the assembler.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub timestamp: std::time::SystemTime,
    pub network: NetworkFlow,
    pub transport: TransportFlow,
    pub seq: u32,
    pub payload: Vec<u8>,
    pub fin: bool,
}

impl TcpSegment {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            network: self.network,
            transport: self.transport,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-flow state
// ---------------------------------------------------------------------------

struct FlowState {
    /// Out-of-order bytes, keyed by the sequence number they start at.
    reorder: BTreeMap<u32, Vec<u8>>,
    /// Next sequence number the flow expects to deliver in-order.
    next_seq: Option<u32>,
    last_activity: Instant,
    eof: bool,
    tx: FlowSender,
    /// Total bytes currently buffered in `reorder`, for the global budget.
    buffered_bytes: usize,
}

/// Reassembles arbitrary incoming segments into ordered per-flow byte
/// streams. Runs entirely on the packet-reading task; never blocks it
/// (`submit` only performs non-blocking channel sends).
pub struct Assembler {
    flows: HashMap<FlowKey, FlowState>,
    memory_budget: usize,
    memory_used: usize,
}

/// Outcome of handing a segment to the assembler.
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new flow worker should be spawned for this key, reading from `rx`.
    NewFlow,
    /// The segment was appended to (or buffered for) an existing flow.
    Existing,
    /// The segment was a duplicate of already-delivered bytes and ignored.
    Duplicate,
}

impl Assembler {
    pub fn new() -> Self {
        Self::with_memory_budget(DEFAULT_MEMORY_BUDGET)
    }

    pub fn with_memory_budget(memory_budget: usize) -> Self {
        Assembler {
            flows: HashMap::new(),
            memory_budget,
            memory_used: 0,
        }
    }

    /// True when `key` currently has an active flow state (used by the
    /// dispatcher to decide whether to spawn a new worker).
    pub fn has_flow(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    /// Register a brand-new flow, to be fed by subsequent `submit` calls.
    pub fn register(&mut self, key: FlowKey, tx: FlowSender) {
        self.flows.insert(
            key,
            FlowState {
                reorder: BTreeMap::new(),
                next_seq: None,
                last_activity: Instant::now(),
                eof: false,
                tx,
                buffered_bytes: 0,
            },
        );
    }

    /// Submit a segment for a flow that has already been `register`ed.
    /// Returns `Duplicate` if every byte in the segment was already
    /// delivered; otherwise appends in-order bytes to the flow's writer and
    /// buffers any out-of-order remainder, enforcing the global memory
    /// budget by dropping the oldest bytes of the offending flow and
    /// closing it with a discontinuity when the budget is exceeded.
    pub fn submit(&mut self, segment: TcpSegment) -> SubmitOutcome {
        let key = segment.flow_key();
        let Some(state) = self.flows.get_mut(&key) else {
            return SubmitOutcome::Existing;
        };

        state.last_activity = Instant::now();

        if state.next_seq.is_none() {
            state.next_seq = Some(segment.seq);
        }
        let next = state.next_seq.unwrap();

        if segment.payload.is_empty() && !segment.fin {
            return SubmitOutcome::Duplicate;
        }

        // Fully-duplicate segment: entirely before the in-order cursor.
        let end = segment.seq.wrapping_add(segment.payload.len() as u32);
        if !segment.payload.is_empty() && seq_lt(end, next.wrapping_add(1)) {
            return SubmitOutcome::Duplicate;
        }

        if segment.seq == next {
            let mut delivered = segment.payload;
            let mut cursor = next.wrapping_add(delivered.len() as u32);
            Self::flush_ready_locked(&mut state.reorder, &mut state.buffered_bytes, &mut delivered, &mut cursor);
            state.next_seq = Some(cursor);
            if !delivered.is_empty() {
                Self::deliver(state, FlowChunk::Data(delivered.into()));
            }
        } else if seq_lt(next, segment.seq) {
            let len = segment.payload.len();
            state.buffered_bytes += len;
            self.memory_used += len;
            state.reorder.insert(segment.seq, segment.payload);

            if self.memory_used > self.memory_budget {
                warn!(flow = %key, "reassembly memory budget exceeded, resetting flow");
                self.memory_used -= state.buffered_bytes;
                let mut st = self.flows.remove(&key).unwrap();
                Self::deliver(&mut st, FlowChunk::Discontinuity);
                return SubmitOutcome::Existing;
            }
        } else {
            // seq < next but not a pure duplicate: partial overlap, drop.
            return SubmitOutcome::Duplicate;
        }

        if segment.fin {
            let state = self.flows.get_mut(&key).unwrap();
            state.eof = true;
            self.memory_used -= state.buffered_bytes;
            let mut st = self.flows.remove(&key).unwrap();
            Self::deliver(&mut st, FlowChunk::Eof);
        }

        SubmitOutcome::Existing
    }

    fn flush_ready_locked(
        reorder: &mut BTreeMap<u32, Vec<u8>>,
        buffered_bytes: &mut usize,
        delivered: &mut Vec<u8>,
        cursor: &mut u32,
    ) {
        while let Some((&seq, _)) = reorder.iter().next() {
            if seq != *cursor {
                break;
            }
            let chunk = reorder.remove(&seq).unwrap();
            *buffered_bytes -= chunk.len();
            *cursor = cursor.wrapping_add(chunk.len() as u32);
            delivered.extend_from_slice(&chunk);
        }
    }

    fn deliver(state: &mut FlowState, chunk: FlowChunk) {
        // Non-blocking: a full channel means the consumer is behind. Per
        // spec §4.1 the packet thread must never block, so we drop the
        // chunk and mark the flow lossy by logging; the worker will simply
        // see a gap (future reads already account for discontinuities).
        if state.tx.try_send(chunk).is_err() {
            debug!("flow writer channel full or closed, dropping chunk");
        }
    }

    /// Close every flow whose last activity predates `cutoff`.
    pub fn flush_older_than(&mut self, cutoff: Instant) {
        let stale: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, st)| st.last_activity < cutoff)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(mut st) = self.flows.remove(&key) {
                self.memory_used -= st.buffered_bytes;
                Self::deliver(&mut st, FlowChunk::Eof);
            }
        }
    }

    /// Close every flow, idempotently (safe to call on an empty assembler).
    pub fn flush_all(&mut self) {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in keys {
            if let Some(mut st) = self.flows.remove(&key) {
                self.memory_used -= st.buffered_bytes;
                Self::deliver(&mut st, FlowChunk::Eof);
            }
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// True if `a` precedes `b` under TCP sequence-number wraparound comparison.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn key(port: u16) -> FlowKey {
        FlowKey {
            network: NetworkFlow {
                src: "127.0.0.1".parse().unwrap(),
                dst: "127.0.0.1".parse().unwrap(),
            },
            transport: TransportFlow {
                src_port: port,
                dst_port: 80,
            },
        }
    }

    fn segment(port: u16, seq: u32, payload: &[u8], fin: bool) -> TcpSegment {
        TcpSegment {
            timestamp: std::time::SystemTime::now(),
            network: key(port).network,
            transport: key(port).transport,
            seq,
            payload: payload.to_vec(),
            fin,
        }
    }

    #[test]
    fn in_order_segments_deliver_immediately() {
        let mut asm = Assembler::new();
        let (tx, mut rx) = mpsc::channel(8);
        let k = key(1);
        asm.register(k, tx);
        asm.submit(segment(1, 0, b"hello ", false));
        asm.submit(segment(1, 6, b"world", false));

        match rx.try_recv().unwrap() {
            FlowChunk::Data(b) => assert_eq!(&b[..], b"hello "),
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv().unwrap() {
            FlowChunk::Data(b) => assert_eq!(&b[..], b"world"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_of_order_segment_is_buffered_then_flushed_in_order() {
        let mut asm = Assembler::new();
        let (tx, mut rx) = mpsc::channel(8);
        let k = key(2);
        asm.register(k, tx);
        asm.submit(segment(2, 6, b"world", false));
        asm.submit(segment(2, 0, b"hello ", false));

        match rx.try_recv().unwrap() {
            FlowChunk::Data(b) => assert_eq!(&b[..], b"hello world"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_segment_is_discarded() {
        let mut asm = Assembler::new();
        let (tx, mut rx) = mpsc::channel(8);
        let k = key(3);
        asm.register(k, tx);
        asm.submit(segment(3, 0, b"hello", false));
        let outcome = asm.submit(segment(3, 0, b"hello", false));
        assert_eq!(outcome, SubmitOutcome::Duplicate);
        // Only the first delivery should be observed.
        assert!(matches!(rx.try_recv(), Ok(FlowChunk::Data(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fin_closes_the_flow() {
        let mut asm = Assembler::new();
        let (tx, mut rx) = mpsc::channel(8);
        let k = key(4);
        asm.register(k, tx);
        asm.submit(segment(4, 0, b"bye", true));
        let _ = rx.try_recv(); // data
        match rx.try_recv().unwrap() {
            FlowChunk::Eof => {}
            other => panic!("expected Eof, got {other:?}"),
        }
        assert!(!asm.has_flow(&k));
    }

    #[test]
    fn flush_older_than_closes_idle_flows() {
        let mut asm = Assembler::new();
        let (tx, mut rx) = mpsc::channel(8);
        let k = key(5);
        asm.register(k, tx);
        asm.submit(segment(5, 0, b"x", false));
        let _ = rx.try_recv();

        asm.flush_older_than(Instant::now() + Duration::from_millis(1));
        assert!(!asm.has_flow(&k));
        match rx.try_recv().unwrap() {
            FlowChunk::Eof => {}
            other => panic!("expected Eof, got {other:?}"),
        }
    }
}
