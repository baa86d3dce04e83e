//! `httpcap`: a passive HTTP traffic observer.
//!
//! Captures TCP segments from a live interface or an offline capture file,
//! reassembles each half-duplex flow into an ordered byte stream, decodes
//! the stream as HTTP/1.x messages, logs a structured summary of each
//! message, and replays matching requests to configured targets.

pub mod assembler;
pub mod body;
pub mod capture;
pub mod cli;
pub mod config;
pub mod debugsrv;
pub mod flow;
pub mod iface;
pub mod message;
pub mod message_reader;
pub mod metrics;
pub mod replay;
pub mod run;
