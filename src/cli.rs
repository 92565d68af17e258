//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::Parser;

use crate::eval::EvalConfig;
use crate::logging::{parse_level, LogConfig};
use crate::memory::MemorySize;
use crate::worker::WorkerConfig;

/// drvstream - stream the leaf derivations of a Nix expression forest as
/// newline-delimited JSON.
#[derive(Parser, Debug)]
#[command(name = "drvstream")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Nix file to evaluate, or a flake URI with an optional #fragment
    /// when --flake is given.
    #[arg(value_name = "EXPR")]
    pub expr: String,

    /// Number of evaluation workers.
    #[arg(long, value_name = "N", default_value_t = 1,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub workers: u64,

    /// Maximum worker resident set size in KiB; a worker crossing it is
    /// recycled.
    #[arg(long, value_name = "KIB", default_value_t = 4 * 1024 * 1024)]
    pub max_memory_size: u64,

    /// Write one indirect GC root per emitted derivation into this
    /// directory.
    #[arg(long, value_name = "DIR")]
    pub gc_roots_dir: Option<PathBuf>,

    /// Treat the expression reference as a flake URI.
    #[arg(long)]
    pub flake: bool,

    /// Include the derivation meta field in the output.
    #[arg(long)]
    pub meta: bool,

    /// Allow access to the ambient environment during evaluation.
    #[arg(long)]
    pub impure: bool,

    /// Include an evaluator backtrace in error reports.
    #[arg(long)]
    pub show_trace: bool,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "DRVSTREAM_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "DRVSTREAM_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Run as a worker subprocess. Internal.
    #[arg(long, hide = true)]
    pub internal_worker: bool,
}

impl Cli {
    pub fn eval_config(&self) -> EvalConfig {
        EvalConfig {
            expr: self.expr.clone(),
            flake: self.flake,
            impure: self.impure,
            show_trace: self.show_trace,
            want_meta: self.meta,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            eval: self.eval_config(),
            max_memory: MemorySize::from_kib(self.max_memory_size),
            gc_roots_dir: self.gc_roots_dir.clone(),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::default();
        if let Some(level) = self.log_level.as_deref().and_then(parse_level) {
            config = config.with_level(level);
        }
        if let Some(format) = self.log_format.as_deref().and_then(|f| f.parse().ok()) {
            config = config.with_format(format);
        }
        config.with_env_overrides()
    }
}
