//! Worker subprocess spawning.
//!
//! Workers are fresh invocations of this binary with the hidden
//! `--internal-worker` flag, talking over piped stdin/stdout. Spawning by
//! executable rather than fork keeps the evaluator's address space out of
//! the coordinator entirely and sidesteps fork-from-threads hazards.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use std::io::{BufRead, BufReader};

use super::proc::Proc;
use crate::error::{DrvStreamError, Result};
use crate::eval::EvalConfig;
use crate::memory::MemorySize;

/// Counter for unique worker IDs (stderr relay threads, cache dirs).
static WORKER_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Everything a worker needs to know, passed back through its own CLI.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub eval: EvalConfig,
    /// Max resident set size before the worker requests a restart.
    pub max_memory: MemorySize,
    pub gc_roots_dir: Option<std::path::PathBuf>,
}

static PARENT_INIT: Once = Once::new();

/// One-time parent setup before the first spawn.
///
/// `GC_DONT_GC` disables the evaluator's conservative collector in all
/// children: recycling whole processes is the collection strategy here.
/// `NIX_PATH` is dropped so evaluations cannot grow undeclared inputs.
fn init_parent() {
    PARENT_INIT.call_once(|| {
        // SAFETY: called before any worker or collector thread exists; the
        // supervisor is single-threaded at first spawn.
        unsafe {
            std::env::set_var("GC_DONT_GC", "1");
            std::env::remove_var("NIX_PATH");
        }
    });
}

/// Spawn one worker subprocess and wrap it in a [`Proc`].
pub fn spawn_worker(config: &WorkerConfig) -> Result<Proc> {
    init_parent();

    let exe = std::env::current_exe()
        .map_err(|e| DrvStreamError::Worker(format!("failed to locate own executable: {}", e)))?;
    let worker_id = WORKER_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut cmd = Command::new(&exe);
    cmd.arg("--internal-worker");
    cmd.arg(&config.eval.expr);
    cmd.args(["--max-memory-size", &config.max_memory.as_kib().to_string()]);
    if config.eval.flake {
        cmd.arg("--flake");
    }
    if config.eval.impure {
        cmd.arg("--impure");
    }
    if config.eval.show_trace {
        cmd.arg("--show-trace");
    }
    if config.eval.want_meta {
        cmd.arg("--meta");
    }
    if let Some(dir) = &config.gc_roots_dir {
        cmd.arg("--gc-roots-dir").arg(dir);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    cmd.env("GC_DONT_GC", "1");
    cmd.env_remove("NIX_PATH");

    // Each worker gets its own evaluator cache so concurrent workers do
    // not contend on one cache database.
    let cache_dir = std::env::temp_dir().join(format!(
        "drvstream-{}-w{}",
        std::process::id(),
        worker_id
    ));
    if std::fs::create_dir_all(&cache_dir).is_ok() {
        cmd.env("XDG_CACHE_HOME", &cache_dir);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| DrvStreamError::Worker(format!("failed to spawn worker: {}", e)))?;

    if let Some(stderr) = child.stderr.take() {
        std::thread::Builder::new()
            .name(format!("worker-{}-stderr", worker_id))
            .spawn(move || relay_worker_stderr(worker_id, stderr))
            .ok();
    }

    tracing::debug!(worker_id, pid = child.id(), "spawned worker");
    Proc::from_child(child)
}

/// Relay worker stderr through tracing. Evaluator noise is demoted to
/// debug; real errors surface as warnings.
fn relay_worker_stderr(worker_id: usize, stderr: std::process::ChildStderr) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let lower = line.to_lowercase();
        if lower.starts_with("trace:") {
            tracing::trace!(worker_id, "{}", line);
        } else if lower.contains("warning:") {
            tracing::debug!(worker_id, "{}", line);
        } else if lower.contains("error:") {
            tracing::warn!(worker_id, "{}", line);
        } else {
            tracing::debug!(worker_id, "{}", line);
        }
    }
}

/// Stack size for collector threads (64 MiB). Collectors recurse through
/// nested response handling and share the thread that re-walks results.
pub const COLLECTOR_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Spawn a collector thread with a large stack.
pub fn spawn_collector_thread<F, T>(name: &str, f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(COLLECTOR_STACK_SIZE)
        .spawn(f)
        .expect("failed to spawn collector thread")
}
