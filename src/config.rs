use std::path::PathBuf;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Args;

/// Generous enough for a 1 GiB format under valgrind on a slow CI box.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Run-wide options shared by every case.
#[derive(Args, Debug, Clone)]
pub struct HarnessArgs {
    /// Utility under test (defaults to `bcachefs` on PATH)
    #[arg(long, global = true, env = "BCACHEFS_BIN")]
    pub binary: Option<PathBuf>,
    /// Run every invocation under valgrind
    #[arg(
        long,
        global = true,
        env = "BCACHEFS_TEST_USE_VALGRIND",
        value_parser = BoolishValueParser::new()
    )]
    pub valgrind: bool,
    /// Valgrind suppression file
    #[arg(long, global = true, env = "BCACHEFS_TEST_SUPPRESSIONS")]
    pub suppressions: Option<PathBuf>,
    /// Per-invocation wall clock limit, in seconds
    #[arg(long, global = true, env = "BCACHEFS_TEST_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,
    /// Directory that holds every fixture of this run
    #[arg(long, global = true, env = "BCACHEFS_TEST_SCRATCH")]
    pub scratch: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub binary: Option<PathBuf>,
    pub valgrind: bool,
    pub suppressions: Option<PathBuf>,
    pub timeout: Duration,
    pub scratch: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            binary: None,
            valgrind: false,
            suppressions: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            scratch: std::env::temp_dir(),
        }
    }
}

impl From<HarnessArgs> for HarnessConfig {
    fn from(args: HarnessArgs) -> Self {
        Self {
            binary: args.binary,
            valgrind: args.valgrind,
            suppressions: args.suppressions,
            timeout: Duration::from_secs(args.timeout.max(1)),
            scratch: args.scratch.unwrap_or_else(std::env::temp_dir),
        }
    }
}
