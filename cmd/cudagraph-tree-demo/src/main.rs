//! Demo binary: installs a trivial function against the in-memory fake
//! backend and calls it a few times, logging which dispatch path each call
//! took (warmup, record, or replay).
//!
//! There is no real GPU work here — `cudagraph-tree-cuda` is a separate,
//! optionally-compiled crate behind the `cuda` feature gate, and pulling it
//! in would require a CUDA toolkit and driver on the machine running this
//! demo. This binary only exercises the dispatcher's control flow.

mod cli;

use clap::Parser;
use cudagraph_tree::config::TreeConfig;
use cudagraph_tree::testing::FakeBackend;
use rustc_hash::FxHashSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::Options;

/// fmt + EnvFilter only — no file appender, no reload handle. Good enough
/// for a demo binary; `cmd/ethrex/initializers.rs::init_tracing` is the
/// fuller version this is simplified from.
fn init_tracing(opts: &Options) {
    let filter = EnvFilter::builder().with_default_directive(opts.tracing_level().into()).from_env_lossy();
    let subscriber = tracing_subscriber::registry().with(fmt::layer()).with(filter);
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn main() {
    let opts = Options::parse();
    init_tracing(&opts);

    let backend = FakeBackend::new();
    let inputs_backend = backend.clone();
    let model_backend = backend.clone();
    let config = TreeConfig { debug_trees: opts.debug_trees, skip_warmup: opts.skip_warmup, ..TreeConfig::default() };

    // Stands in for `f(x) = x + 1`: no real compute happens against the fake
    // backend, just a fresh pool-owned allocation representing the output.
    let model: cudagraph_tree::Model<FakeBackend> = Box::new(move |_inputs| vec![model_backend.fresh_tensor(0)]);

    let example = vec![Some(backend.fresh_tensor(opts.device))];
    let callable = cudagraph_tree::install(backend, opts.device, config, model, &example, FxHashSet::default()).expect("install failed");

    for i in 0..opts.calls {
        let input = vec![Some(inputs_backend.fresh_tensor(opts.device))];
        match callable.call(input) {
            Ok(out) => tracing::info!(call = i, outputs = out.len(), "call complete"),
            Err(err) => {
                tracing::error!(call = i, error = %err, "call failed");
                break;
            }
        }
    }

    tracing::info!(calls = opts.calls, "demo run complete");
}
