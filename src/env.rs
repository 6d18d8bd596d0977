//! Environment overrides for benchmark settings.
//!
//! These functions read `COLLBENCH_*` variables. They return `None` if the
//! variable is not set or does not parse, so a malformed value falls back to
//! the built-in default instead of failing the launch.
//!
//! # Environment Variables
//!
//! | Function | Variable | Description |
//! |----------|----------|-------------|
//! | `timeout()` | `COLLBENCH_TIMEOUT` | Trial-loop budget in seconds |
//! | `warmup()` | `COLLBENCH_WARMUP` | Untimed warm-up invocations |
//! | `max_trials()` | `COLLBENCH_MAX_TRIALS` | Cap on recorded trials |
//! | `output()` | `COLLBENCH_OUTPUT` | Output record destination |
//! | `min_bytes()` | `COLLBENCH_MIN_BYTES` | Lower bound of the size envelope |
//! | `max_bytes()` | `COLLBENCH_MAX_BYTES` | Upper bound of the size envelope |

use std::env;
use std::path::PathBuf;

/// Get the trial-loop budget in seconds.
pub fn timeout() -> Option<f64> {
    env::var("COLLBENCH_TIMEOUT")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|t: &f64| t.is_finite() && *t >= 0.0)
}

/// Get the number of warm-up invocations.
pub fn warmup() -> Option<usize> {
    env::var("COLLBENCH_WARMUP").ok().and_then(|s| s.trim().parse().ok())
}

/// Get the maximum number of recorded trials.
pub fn max_trials() -> Option<u64> {
    env::var("COLLBENCH_MAX_TRIALS")
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Get the output record destination.
pub fn output() -> Option<PathBuf> {
    env::var_os("COLLBENCH_OUTPUT")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// Get the smallest allowed non-empty message buffer in bytes.
pub fn min_bytes() -> Option<u64> {
    env::var("COLLBENCH_MIN_BYTES")
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Get the largest allowed message buffer in bytes.
pub fn max_bytes() -> Option<u64> {
    env::var("COLLBENCH_MAX_BYTES")
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
