//! Worker subprocess entry point.
//!
//! Runs when the binary is invoked with `--internal-worker`. The worker
//! reads request frames from stdin, walks the requested paths with the
//! evaluator, and writes response frames to stdout. It retires itself once
//! its maximum resident set size crosses the configured threshold; the
//! collector spawns a replacement.

use tracing::{debug, error, info};

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::spawn::WorkerConfig;
use crate::error::Result;
use crate::eval::{filter_ansi, Evaluator};
use crate::job::JobEvalResult;
use crate::memory;
use crate::msg::{ChildrenFrame, CollectMsg, DrvFrame, ErrorFrame, WorkJob, WorkMsg};

/// Run the worker. Returns the process exit code.
pub fn run_worker_main(config: &WorkerConfig) -> i32 {
    // Pipe errors surface as io::Error, not a signal.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // SAFETY: descriptors 0 and 1 are the request/response pipes wired up
    // by the spawning collector.
    let stdin = unsafe { PipeFd::from_raw(0) };
    let stdout = unsafe { PipeFd::from_raw(1) };
    let mut reader = LineReader::new(stdin);
    let mut writer = LineWriter::new(stdout);

    match worker_loop(config, &mut reader, &mut writer) {
        Ok(()) => 0,
        Err(e) => {
            // Fatal failure: report it on the protocol channel, then ask
            // for a replacement.
            error!("worker failed: {}", e);
            let frame = ErrorFrame::new(filter_ansi(&e.to_string()));
            let _ = writer.write_line(&WorkMsg::Error(frame).to_frame());
            let _ = writer.write_line(&WorkMsg::Restart.to_frame());
            1
        }
    }
}

fn worker_loop(
    config: &WorkerConfig,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> Result<()> {
    let evaluator = Evaluator::open(config.eval.clone())?;
    let threshold = config.max_memory;

    loop {
        writer.write_line(&WorkMsg::Next.to_frame())?;

        let request = match reader.read_line()? {
            Some(line) => CollectMsg::parse(line)?,
            // Collector closed the pipe; that is a shutdown request too.
            None => break,
        };
        let path = match request {
            CollectMsg::Exit => break,
            CollectMsg::Do(path) => path,
        };
        debug!(%path, "evaluating");

        match serve_job(&evaluator, config, &path, writer) {
            Ok(()) => writer.write_line(&WorkJob::Done.to_frame())?,
            Err(e) if e.is_per_path() => {
                // The path failed; the frame replaces `done` and the run
                // goes on. Keep the message in the local log as well.
                let detail = filter_ansi(&e.to_string());
                error!(%path, "{}", detail);
                let frame = ErrorFrame::at(detail, path);
                writer.write_line(&WorkJob::Error(frame).to_frame())?;
            }
            Err(e) => return Err(e),
        }

        let rss = memory::max_rss();
        if rss > threshold {
            info!(%rss, %threshold, "memory threshold exceeded, retiring");
            break;
        }
    }

    // The collector interprets this as "spawn a fresh worker if there is
    // more to do". It may already have stopped listening.
    let _ = writer.write_line(&WorkMsg::Restart.to_frame());
    Ok(())
}

/// Walk one path and stream the frames its evaluation produces. A null
/// node streams nothing.
fn serve_job(
    evaluator: &Evaluator,
    config: &WorkerConfig,
    path: &crate::accessor::AccessorPath,
    writer: &mut LineWriter,
) -> Result<()> {
    let job = match evaluator.walk(path)? {
        Some(job) => job,
        None => return Ok(()),
    };

    for result in job.eval(config.gc_roots_dir.as_deref())? {
        let frame = match result {
            JobEvalResult::Drv(drv) => WorkJob::Drv(DrvFrame {
                drv,
                path: path.clone(),
            }),
            JobEvalResult::Children(children) => WorkJob::Children(ChildrenFrame {
                path: path.clone(),
                children,
            }),
        };
        writer.write_line(&frame.to_frame())?;
    }
    Ok(())
}
