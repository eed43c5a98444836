//! Environment-driven configuration for the tree manager.
//!
//! All fields are lightweight — no external dependencies beyond std — and
//! every field defaults to debug checks off, warmup not skipped.

use std::env;

/// Configuration for one `TreeManager`.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Enables pool-vs-live-set cross-checks after every path transition.
    /// Overridden by `CUDAGRAPH_TREE_DEBUG_TREES`.
    pub debug_trees: bool,
    /// Suppresses the first-call warmup, recording immediately instead.
    /// Overridden by `CUDAGRAPH_TREE_SKIP_WARMUP`.
    pub skip_warmup: bool,
    /// Soft cap on the number of distinct root `FunctionId`s retained for
    /// metrics/debug reporting purposes; does not bound dispatch behavior.
    /// Overridden by `CUDAGRAPH_TREE_MAX_TRACKED_ROOTS`.
    pub max_tracked_roots: usize,
}

impl TreeConfig {
    /// Build a config from defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = env::var("CUDAGRAPH_TREE_DEBUG_TREES") {
            config.debug_trees = parse_bool(&v, config.debug_trees);
        }
        if let Ok(v) = env::var("CUDAGRAPH_TREE_SKIP_WARMUP") {
            config.skip_warmup = parse_bool(&v, config.skip_warmup);
        }
        if let Ok(v) = env::var("CUDAGRAPH_TREE_MAX_TRACKED_ROOTS") {
            if let Ok(n) = v.parse() {
                config.max_tracked_roots = n;
            }
        }
        config
    }
}

fn parse_bool(raw: &str, default: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            debug_trees: false,
            skip_warmup: false,
            max_tracked_roots: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_warmup_enabled_and_debug_disabled() {
        let config = TreeConfig::default();
        assert!(!config.debug_trees);
        assert!(!config.skip_warmup);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("1", false));
        assert!(parse_bool("true", false));
        assert!(parse_bool("YES", false));
        assert!(!parse_bool("0", true));
        assert!(!parse_bool("false", true));
        assert!(parse_bool("garbage", true));
    }
}
