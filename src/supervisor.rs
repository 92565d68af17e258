//! Run supervision: bootstrap the root, fan out collectors, join them.

use std::sync::Arc;

use tracing::{debug, info};

use crate::accessor::AccessorPath;
use crate::cli::Cli;
use crate::collect::{run_collector, Shared};
use crate::error::{DrvStreamError, Result};
use crate::msg::{CollectMsg, WorkJob, WorkMsg};
use crate::worker::{spawn_collector_thread, spawn_worker, Proc};

/// Evaluate the whole forest and stream the leaves to stdout.
pub fn run(cli: &Cli) -> Result<()> {
    if cli.expr.is_empty() {
        return Err(DrvStreamError::Usage("no expression specified".into()));
    }

    let config = cli.worker_config();
    let shared = Arc::new(Shared::new(Box::new(std::io::stdout())));

    bootstrap(&shared, || spawn_worker(&config))?;

    let workers = cli.workers as usize;
    info!(workers, "starting collectors");

    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers {
        let shared = Arc::clone(&shared);
        let config = config.clone();
        handles.push(spawn_collector_thread(&format!("collector-{}", i), move || {
            if let Err(e) = run_collector(&shared, || spawn_worker(&config)) {
                shared.record_error(e);
            }
        }));
    }

    for handle in handles {
        handle
            .join()
            .map_err(|_| DrvStreamError::Worker("collector thread panicked".into()))?;
    }

    match shared.take_error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Evaluate the root node in a one-shot worker and seed the ready set with
/// its children. A root that is itself a leaf is printed directly; a root
/// that fails to evaluate fails the run.
///
/// Keeping this in a worker process means the supervisor itself never
/// touches the evaluator, so it cannot start fetches that would later
/// deadlock under the collector threads.
fn bootstrap<F>(shared: &Shared, spawn: F) -> Result<()>
where
    F: Fn() -> Result<Proc>,
{
    debug!("evaluating top level");
    let mut proc = spawn()?;

    let line = proc.recv_line()?.ok_or_else(|| {
        DrvStreamError::Protocol("bootstrap worker closed the pipe before reporting in".into())
    })?;
    match WorkMsg::parse(&line)? {
        WorkMsg::Next => {}
        WorkMsg::Restart => {
            return Err(DrvStreamError::Worker(
                "bootstrap worker retired before evaluating".into(),
            ));
        }
        WorkMsg::Error(e) => return Err(DrvStreamError::Worker(e.error)),
    }

    proc.send(&CollectMsg::Do(AccessorPath::root()))?;

    loop {
        let line = proc.recv_line()?.ok_or_else(|| {
            DrvStreamError::Protocol("bootstrap worker hung up mid-evaluation".into())
        })?;
        if line == "restart" {
            return Err(DrvStreamError::Worker(
                "bootstrap worker retired mid-evaluation".into(),
            ));
        }

        match WorkJob::parse(&line)? {
            WorkJob::Drv(_) => shared.emit_line(&line)?,
            WorkJob::Children(frame) => {
                let root = AccessorPath::root();
                shared.seed(frame.children.into_iter().map(|c| root.child(c)));
            }
            WorkJob::Done => break,
            WorkJob::Error(e) => return Err(DrvStreamError::Eval(e.error)),
        }
    }

    let _ = proc.send(&CollectMsg::Exit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::process::{Command, Stdio};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct TestSink(Arc<Mutex<Vec<u8>>>);

    impl TestSink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for TestSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn scripted_worker(script: &str) -> Result<Proc> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn scripted worker");
        Proc::from_child(child)
    }

    fn shared_with_sink() -> (Shared, TestSink) {
        let sink = TestSink::default();
        (Shared::new(Box::new(sink.clone())), sink)
    }

    #[test]
    fn bootstrap_seeds_children_as_singleton_paths() {
        let (shared, sink) = shared_with_sink();
        let script = concat!(
            "echo next\nread req\n",
            "echo '{\"path\":[],\"children\":[\"a\",\"b\"]}'\n",
            "echo done\nread req\nexit 0\n",
        );
        bootstrap(&shared, || scripted_worker(script)).unwrap();

        assert_eq!(sink.contents(), "");
        // Both children are ready to dispatch.
        assert_eq!(shared.todo_paths(), vec![r#"["a"]"#, r#"["b"]"#]);
    }

    #[test]
    fn bootstrap_prints_a_root_leaf() {
        let (shared, sink) = shared_with_sink();
        let drv = r#"{"name":"root","system":"x86_64-linux","drvPath":"/nix/store/xxx-root.drv","outputs":{},"path":[]}"#;
        let script = format!(
            "echo next\nread req\necho '{}'\necho done\nread req\nexit 0\n",
            drv
        );
        bootstrap(&shared, move || scripted_worker(&script)).unwrap();

        assert_eq!(sink.contents(), format!("{}\n", drv));
        assert!(shared.todo_paths().is_empty());
    }

    #[test]
    fn bootstrap_null_root_seeds_nothing() {
        let (shared, sink) = shared_with_sink();
        let script = "echo next\nread req\necho done\nread req\nexit 0\n";
        bootstrap(&shared, || scripted_worker(script)).unwrap();
        assert_eq!(sink.contents(), "");
        assert!(shared.todo_paths().is_empty());
    }

    #[test]
    fn bootstrap_error_fails_the_run() {
        let (shared, _sink) = shared_with_sink();
        let script = concat!(
            "echo next\nread req\n",
            "echo '{\"error\":\"boom at the root\",\"path\":[]}'\n",
            "read req\nexit 0\n",
        );
        let err = bootstrap(&shared, || scripted_worker(script)).unwrap_err();
        match err {
            DrvStreamError::Eval(msg) => assert!(msg.contains("boom at the root")),
            other => panic!("expected eval error, got {:?}", other),
        }
    }

    #[test]
    fn bootstrap_init_failure_fails_the_run() {
        let (shared, _sink) = shared_with_sink();
        let script = "echo '{\"error\":\"cannot open store\"}'\necho restart\nexit 1\n";
        let err = bootstrap(&shared, || scripted_worker(script)).unwrap_err();
        assert!(matches!(err, DrvStreamError::Worker(_)));
    }

    #[test]
    fn bootstrap_then_collect_drains_the_forest() {
        let (shared, sink) = shared_with_sink();
        let script = concat!(
            "echo next\nread req\n",
            "echo '{\"path\":[],\"children\":[\"a\"]}'\n",
            "echo done\nread req\nexit 0\n",
        );
        bootstrap(&shared, || scripted_worker(script)).unwrap();

        let drv = r#"{"name":"a","system":"x86_64-linux","drvPath":"/nix/store/aaa-a.drv","outputs":{},"path":["a"]}"#;
        let serve = format!(
            "echo next\nread req\necho '{}'\necho done\necho next\nread req\nexit 0\n",
            drv
        );
        run_collector(&shared, move || scripted_worker(&serve)).unwrap();

        assert_eq!(sink.contents(), format!("{}\n", drv));
        assert!(shared.todo_paths().is_empty());
        assert!(shared.take_error().is_none());
    }
}
