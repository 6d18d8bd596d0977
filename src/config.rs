//! Settings for one benchmark run.

use std::path::PathBuf;

use crate::collective::Collective;
use crate::datatype::ElementKind;
use crate::env;
use crate::persist::RecordFormat;
use crate::plan::{Envelope, SizeSpec};
use crate::trial::LoopConfig;

/// Messages source used when none is given.
pub const DEFAULT_MESSAGES: &str = "default_messages.txt";

/// Output record used when none is given.
pub const DEFAULT_OUTPUT: &str = "default_output.txt";

/// Default trial-loop budget in seconds.
pub const DEFAULT_TIMEOUT: f64 = 10.0;

/// Everything a run needs besides the communicator.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    /// Operation under test
    pub collective: Collective,
    /// Where message sizes come from
    pub sizes: SizeSpec,
    /// Element type of the message buffers
    pub element: ElementKind,
    /// Allowed buffer size range
    pub envelope: Envelope,
    /// Budget, warm-up and trial cap
    pub trials: LoopConfig,
    /// Record destination; `None` skips persisting
    pub output: Option<PathBuf>,
    /// Layout of the persisted rows
    pub format: RecordFormat,
    /// Print summary tables on the coordinator
    pub verbose: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            collective: Collective::default(),
            sizes: SizeSpec::Row(PathBuf::from(DEFAULT_MESSAGES)),
            element: ElementKind::default(),
            envelope: Envelope::default(),
            trials: LoopConfig {
                budget: DEFAULT_TIMEOUT,
                warmup: 0,
                max_trials: None,
            },
            output: Some(PathBuf::from(DEFAULT_OUTPUT)),
            format: RecordFormat::default(),
            verbose: false,
        }
    }
}

/// Values taken from `COLLBENCH_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    /// `COLLBENCH_TIMEOUT`
    pub timeout: Option<f64>,
    /// `COLLBENCH_WARMUP`
    pub warmup: Option<usize>,
    /// `COLLBENCH_MAX_TRIALS`
    pub max_trials: Option<u64>,
    /// `COLLBENCH_OUTPUT`
    pub output: Option<PathBuf>,
    /// `COLLBENCH_MIN_BYTES`
    pub min_bytes: Option<u64>,
    /// `COLLBENCH_MAX_BYTES`
    pub max_bytes: Option<u64>,
}

impl EnvOverrides {
    /// Read the overrides from the process environment.
    pub fn from_env() -> Self {
        EnvOverrides {
            timeout: env::timeout(),
            warmup: env::warmup(),
            max_trials: env::max_trials(),
            output: env::output(),
            min_bytes: env::min_bytes(),
            max_bytes: env::max_bytes(),
        }
    }
}

impl BenchConfig {
    /// Replace defaults with whatever the environment sets.
    ///
    /// Apply before command-line flags so that flags win.
    pub fn with_env_overrides(mut self, overrides: &EnvOverrides) -> Self {
        if let Some(timeout) = overrides.timeout {
            self.trials.budget = timeout;
        }
        if let Some(warmup) = overrides.warmup {
            self.trials.warmup = warmup;
        }
        if let Some(cap) = overrides.max_trials {
            self.trials.max_trials = Some(cap);
        }
        if let Some(output) = &overrides.output {
            self.output = Some(output.clone());
        }
        if let Some(min) = overrides.min_bytes {
            self.envelope.min_bytes = min;
        }
        if let Some(max) = overrides.max_bytes {
            self.envelope.max_bytes = max;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_original_tools() {
        let config = BenchConfig::default();
        assert_eq!(config.trials.budget, 10.0);
        assert_eq!(config.trials.warmup, 0);
        assert_eq!(config.trials.max_trials, None);
        assert_eq!(config.output, Some(PathBuf::from("default_output.txt")));
        assert_eq!(config.sizes, SizeSpec::Row(PathBuf::from("default_messages.txt")));
        assert!(!config.verbose);
    }

    #[test]
    fn overrides_replace_only_what_is_set() {
        let overrides = EnvOverrides {
            timeout: Some(1.5),
            min_bytes: Some(8),
            max_bytes: Some(4096),
            ..EnvOverrides::default()
        };
        let config = BenchConfig::default().with_env_overrides(&overrides);
        assert_eq!(config.trials.budget, 1.5);
        assert_eq!(config.envelope.min_bytes, 8);
        assert_eq!(config.envelope.max_bytes, 4096);
        assert_eq!(config.trials.warmup, 0);
        assert_eq!(config.output, Some(PathBuf::from(DEFAULT_OUTPUT)));
    }
}
