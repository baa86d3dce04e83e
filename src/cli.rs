//! Command-line argument parsing.
//!
//! The collaborator contract described by the core: a list of interfaces
//! (or a single offline capture file), a BPF expression, a configuration
//! path, a `print-body` flag, and an optional pprof/debug bind address.

use clap::Parser;

/// Passively observe HTTP traffic on one or more interfaces (or a capture file).
#[derive(Debug, Parser)]
#[command(name = "httpcap", version, about)]
pub struct Cli {
    /// Interface name to capture on, or a path to an offline capture file.
    /// Repeat to capture on multiple interfaces. Overrides `ifaces` in the
    /// config file when given.
    #[arg(short = 'i', long = "iface")]
    pub ifaces: Vec<String>,

    /// BPF filter expression. Overrides the config file's derived filter
    /// when given.
    #[arg(long)]
    pub bpf: Option<String>,

    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "conf", default_value = "conf.yml")]
    pub conf: String,

    /// Materialize and log textual response bodies.
    #[arg(long = "print-body")]
    pub print_body: bool,

    /// Bind address for the debug/pprof HTTP endpoint, e.g. `127.0.0.1:6060`.
    /// Omit to disable the endpoint.
    #[arg(long = "pprof")]
    pub pprof: Option<String>,

    /// Log every captured packet in detail.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
