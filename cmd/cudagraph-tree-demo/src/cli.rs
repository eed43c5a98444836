//! Command-line options for the demo binary.
//!
//! Grounded on `cmd/ethrex/cli.rs`'s `Options` struct, scaled down to the
//! handful of knobs this demo actually has.

use clap::Parser;
use tracing::Level;

#[derive(Parser, Debug)]
#[command(name = "cudagraph-tree-demo", author, version, about = "Exercises the cudagraph-tree dispatcher against an in-memory fake backend")]
pub struct Options {
    /// Tracing verbosity, e.g. "info", "debug", "trace".
    #[arg(long, default_value = "info", env = "CUDAGRAPH_TREE_LOG")]
    pub log_level: String,

    /// Device index passed to every `TreeManager` call. Purely nominal
    /// against the fake backend, which has no real multi-device notion.
    #[arg(long, default_value_t = 0)]
    pub device: usize,

    /// Number of times to invoke the installed function.
    #[arg(long, default_value_t = 5)]
    pub calls: usize,

    /// Skip the warmup pass (`TreeConfig::skip_warmup`), recording on the
    /// very first call instead of the second.
    #[arg(long)]
    pub skip_warmup: bool,

    /// Enable the debug-mode pool-consistency check after every checkpoint.
    #[arg(long)]
    pub debug_trees: bool,
}

impl Options {
    pub fn tracing_level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }
}
