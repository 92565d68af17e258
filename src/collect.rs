//! Collector threads and the shared scheduler state.
//!
//! One collector thread drives one worker process at a time. It leases a
//! path from the shared ready set, ships it as a `do` frame, and ingests
//! the streamed responses: leaf derivations go to the output sink,
//! discovered children go back into the ready set, and `done` releases the
//! lease. Workers that report `restart` are replaced transparently.
//!
//! The tuple (todo, active, exc) lives behind a single mutex paired with a
//! condition variable. Frames are composed under the lock but written
//! after it is released; the lock is held across output writes so lines
//! from concurrent collectors never interleave.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::debug;

use crate::accessor::AccessorPath;
use crate::error::{DrvStreamError, Result};
use crate::msg::{CollectMsg, WorkJob, WorkMsg};
use crate::worker::Proc;

/// Scheduler state shared by every collector.
struct SchedState {
    /// Ready-to-dispatch paths.
    todo: BTreeSet<AccessorPath>,
    /// Paths currently leased to some worker.
    active: BTreeSet<AccessorPath>,
    /// First fatal error observed by any collector.
    exc: Option<DrvStreamError>,
    /// Where result lines go. Writes happen under the state lock.
    sink: Box<dyn Write + Send>,
}

/// The shared scheduler: state plus the wakeup condition variable.
pub struct Shared {
    state: Mutex<SchedState>,
    wakeup: Condvar,
}

impl Shared {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(SchedState {
                todo: BTreeSet::new(),
                active: BTreeSet::new(),
                exc: None,
                sink,
            }),
            wakeup: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler lock poisoned")
    }

    /// Seed the ready set with initial paths.
    pub fn seed(&self, paths: impl IntoIterator<Item = AccessorPath>) {
        let mut state = self.lock();
        state.todo.extend(paths);
        self.wakeup.notify_all();
    }

    /// Write one complete result line. The lock spans the write so output
    /// lines cannot interleave.
    pub fn emit_line(&self, line: &str) -> Result<()> {
        let mut state = self.lock();
        state.sink.write_all(line.as_bytes())?;
        state.sink.write_all(b"\n")?;
        state.sink.flush()?;
        Ok(())
    }

    /// Record the first fatal error and wake every collector so they can
    /// wind down.
    pub fn record_error(&self, error: DrvStreamError) {
        let mut state = self.lock();
        if state.exc.is_none() {
            state.exc = Some(error);
        }
        self.wakeup.notify_all();
    }

    /// Take the recorded fatal error, if any.
    pub fn take_error(&self) -> Option<DrvStreamError> {
        self.lock().exc.take()
    }

    /// The ready set in JSON text form, for assertions.
    #[cfg(test)]
    pub(crate) fn todo_paths(&self) -> Vec<String> {
        self.lock().todo.iter().map(|p| p.to_json()).collect()
    }
}

/// Drive one collector to completion: runs until the queue drains or a
/// fatal error is recorded. `spawn` produces a fresh worker process on
/// demand.
pub fn run_collector<F>(shared: &Shared, spawn: F) -> Result<()>
where
    F: Fn() -> Result<Proc>,
{
    let mut proc: Option<Proc> = None;

    loop {
        // Await a worker that is ready for a job.
        if proc.is_none() {
            proc = Some(spawn()?);
        }
        let worker = proc.as_mut().expect("worker just attached");

        let line = worker.recv_line()?.ok_or_else(|| {
            DrvStreamError::Protocol("worker closed the pipe before reporting in".into())
        })?;
        match WorkMsg::parse(&line)? {
            WorkMsg::Restart => {
                // Memory threshold reached; replace the process.
                debug!(pid = worker.pid().as_raw(), "worker retired");
                proc = None;
                continue;
            }
            WorkMsg::Next => {}
            WorkMsg::Error(e) => return Err(DrvStreamError::Worker(e.error)),
        }

        // Await a job.
        let path = match lease(shared) {
            Some(path) => path,
            None => {
                // Drained or failing: release the worker and leave.
                let _ = worker.send(&CollectMsg::Exit);
                return Ok(());
            }
        };
        worker.send(&CollectMsg::Do(path.clone()))?;

        // Await the streamed responses for this path.
        if !ingest_responses(shared, worker, &path)? {
            proc = None;
        }
    }
}

/// Pop one path from `todo` into `active`, waiting while other collectors
/// may still discover children. `None` means the run is over for this
/// collector: everything is drained, or a fatal error is recorded.
fn lease(shared: &Shared) -> Option<AccessorPath> {
    let mut state = shared.lock();
    loop {
        if state.exc.is_some() || (state.todo.is_empty() && state.active.is_empty()) {
            return None;
        }
        if let Some(path) = state.todo.pop_first() {
            state.active.insert(path.clone());
            return Some(path);
        }
        state = shared
            .wakeup
            .wait(state)
            .expect("scheduler lock poisoned");
    }
}

/// Read response frames for `path` until it is resolved. Returns whether
/// the worker is still usable.
fn ingest_responses(shared: &Shared, worker: &mut Proc, path: &AccessorPath) -> Result<bool> {
    loop {
        let line = worker.recv_line()?.ok_or_else(|| {
            DrvStreamError::Protocol(format!("worker hung up mid-response for {}", path))
        })?;

        // A worker may die of memory pressure while responses are
        // outstanding; hand the lease back so a successor re-walks it.
        if line == "restart" {
            let mut state = shared.lock();
            state.active.remove(path);
            state.todo.insert(path.clone());
            drop(state);
            shared.wakeup.notify_all();
            return Ok(false);
        }

        match WorkJob::parse(&line)? {
            WorkJob::Drv(_) => {
                // A leaf: the frame is already the output line.
                shared.emit_line(&line)?;
            }
            WorkJob::Children(frame) => {
                // Expansion is not terminal: the lease stays until `done`,
                // so children are enqueued before the path resolves.
                let mut state = shared.lock();
                for child in frame.children {
                    state.todo.insert(path.child(child));
                }
                drop(state);
                shared.wakeup.notify_all();
            }
            WorkJob::Done => {
                let mut state = shared.lock();
                state.active.remove(path);
                drop(state);
                shared.wakeup.notify_all();
                return Ok(true);
            }
            WorkJob::Error(_) => {
                // A per-path failure replaces `done`: record it in the
                // output stream and resolve the path.
                shared.emit_line(&line)?;
                let mut state = shared.lock();
                state.active.remove(path);
                drop(state);
                shared.wakeup.notify_all();
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    /// An output sink tests can read back.
    #[derive(Clone, Default)]
    struct TestSink(Arc<StdMutex<Vec<u8>>>);

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

    fn shared_with_sink() -> (Arc<Shared>, TestSink) {
        let sink = TestSink::default();
        (Arc::new(Shared::new(Box::new(sink.clone()))), sink)
    }

    /// A scripted worker: a shell process playing the worker's side of the
    /// protocol over real pipes.
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

    fn path(s: &str) -> AccessorPath {
        AccessorPath::parse(s).unwrap()
    }

    const DRV_A: &str = r#"{"name":"a","system":"x86_64-linux","drvPath":"/nix/store/aaa-a.drv","outputs":{"out":"/nix/store/aaa-a"},"path":["a"]}"#;

    #[test]
    fn leaf_path_is_emitted_and_resolved() {
        let (shared, sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#)]);

        let script = format!(
            "echo next\nread req\necho '{}'\necho done\necho next\nread req\nexit 0\n",
            DRV_A
        );
        run_collector(&shared, move || scripted_worker(&script)).unwrap();

        assert_eq!(sink.contents(), format!("{}\n", DRV_A));
        let state = shared.lock();
        assert!(state.todo.is_empty());
        assert!(state.active.is_empty());
        assert!(state.exc.is_none());
    }

    #[test]
    fn children_are_expanded_and_walked() {
        let (shared, sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#)]);

        let drv_ab = r#"{"name":"b","system":"x86_64-linux","drvPath":"/nix/store/bbb-b.drv","outputs":{"out":"/nix/store/bbb-b"},"path":["a","b"]}"#;
        let script = format!(
            concat!(
                "echo next\nread req\n",
                "echo '{{\"path\":[\"a\"],\"children\":[\"b\"]}}'\necho done\n",
                "echo next\nread req\n",
                "echo '{drv}'\necho done\n",
                "echo next\nread req\nexit 0\n",
            ),
            drv = drv_ab
        );
        run_collector(&shared, move || scripted_worker(&script)).unwrap();

        assert_eq!(sink.contents(), format!("{}\n", drv_ab));
        let state = shared.lock();
        assert!(state.todo.is_empty());
        assert!(state.active.is_empty());
    }

    #[test]
    fn restart_between_jobs_respawns_the_worker() {
        let (shared, sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#)]);

        let spawned = Arc::new(AtomicUsize::new(0));
        let spawned_clone = spawned.clone();
        let serve = format!(
            "echo next\nread req\necho '{}'\necho done\necho next\nread req\nexit 0\n",
            DRV_A
        );
        run_collector(&shared, move || {
            match spawned_clone.fetch_add(1, Ordering::SeqCst) {
                0 => scripted_worker("echo restart\nexit 0\n"),
                _ => scripted_worker(&serve),
            }
        })
        .unwrap();

        assert_eq!(spawned.load(Ordering::SeqCst), 2);
        assert_eq!(sink.contents(), format!("{}\n", DRV_A));
    }

    #[test]
    fn restart_mid_response_requeues_the_path() {
        let (shared, sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#)]);

        let spawned = Arc::new(AtomicUsize::new(0));
        let spawned_clone = spawned.clone();
        let serve = format!(
            "echo next\nread req\necho '{}'\necho done\necho next\nread req\nexit 0\n",
            DRV_A
        );
        run_collector(&shared, move || {
            match spawned_clone.fetch_add(1, Ordering::SeqCst) {
                // Dies after accepting the job, before any response.
                0 => scripted_worker("echo next\nread req\necho restart\nexit 0\n"),
                _ => scripted_worker(&serve),
            }
        })
        .unwrap();

        // The path was handed back and served by the successor.
        assert_eq!(sink.contents(), format!("{}\n", DRV_A));
        let state = shared.lock();
        assert!(state.todo.is_empty());
        assert!(state.active.is_empty());
    }

    #[test]
    fn per_path_error_goes_to_output_and_run_continues() {
        let (shared, sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#), path(r#"["b"]"#)]);

        let drv_b = r#"{"name":"b","system":"x86_64-linux","drvPath":"/nix/store/bbb-b.drv","outputs":{"out":"/nix/store/bbb-b"},"path":["b"]}"#;
        // First job (["a"], sorted first) errors; second serves a leaf.
        let script = format!(
            concat!(
                "echo next\nread req\n",
                "echo '{{\"error\":\"boom\",\"path\":[\"a\"]}}'\n",
                "echo next\nread req\n",
                "echo '{drv}'\necho done\n",
                "echo next\nread req\nexit 0\n",
            ),
            drv = drv_b
        );
        run_collector(&shared, move || scripted_worker(&script)).unwrap();

        let output = sink.contents();
        assert!(output.contains("boom"));
        assert!(output.contains(r#""path":["a"]"#));
        assert!(output.contains(r#""drvPath":"/nix/store/bbb-b.drv""#));
        let state = shared.lock();
        assert!(state.todo.is_empty());
        assert!(state.active.is_empty());
        assert!(state.exc.is_none());
    }

    #[test]
    fn initialization_error_is_fatal() {
        let (shared, _sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#)]);

        let err = run_collector(&shared, || {
            scripted_worker("echo '{\"error\":\"cannot open store\"}'\necho restart\nexit 1\n")
        })
        .unwrap_err();
        match err {
            DrvStreamError::Worker(msg) => assert!(msg.contains("cannot open store")),
            other => panic!("expected worker error, got {:?}", other),
        }
    }

    #[test]
    fn garbage_frame_is_a_protocol_error() {
        let (shared, _sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#)]);

        let err = run_collector(&shared, || scripted_worker("echo banana\nexit 0\n"))
            .unwrap_err();
        assert!(matches!(err, DrvStreamError::Protocol(_)));
    }

    #[test]
    fn eof_mid_response_is_a_protocol_error() {
        let (shared, _sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#)]);

        let err = run_collector(&shared, || {
            scripted_worker("echo next\nread req\nexit 0\n")
        })
        .unwrap_err();
        assert!(matches!(err, DrvStreamError::Protocol(_)));
    }

    #[test]
    fn empty_queue_releases_the_worker_immediately() {
        let (shared, sink) = shared_with_sink();
        let spawned = Arc::new(AtomicUsize::new(0));
        let spawned_clone = spawned.clone();

        // An empty ready set still spawns one worker (it must report in
        // before the collector can check the queue), which is then told to
        // exit.
        run_collector(&shared, move || {
            spawned_clone.fetch_add(1, Ordering::SeqCst);
            scripted_worker("echo next\nread req\nexit 0\n")
        })
        .unwrap();

        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(sink.contents(), "");
    }

    #[test]
    fn recorded_error_drains_other_collectors() {
        let (shared, _sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#)]);
        shared.record_error(DrvStreamError::Protocol("gone wrong elsewhere".into()));

        // With exc set, the collector tells its worker to exit right away.
        run_collector(&shared, || {
            scripted_worker("echo next\nread req\nexit 0\n")
        })
        .unwrap();

        assert!(shared.take_error().is_some());
    }

    #[test]
    fn two_collectors_share_one_queue() {
        let (shared, sink) = shared_with_sink();
        shared.seed([path(r#"["a"]"#), path(r#"["b"]"#)]);

        // Each worker serves however many paths it is handed, until told
        // to exit.
        let script = r#"
while true; do
  echo next
  read req || exit 0
  case "$req" in
    exit) exit 0 ;;
    "do "*)
      p=${req#do }
      name=$(echo "$p" | tr -d '[]"')
      echo "{\"name\":\"$name\",\"system\":\"x86_64-linux\",\"drvPath\":\"/nix/store/xxx-$name.drv\",\"outputs\":{},\"path\":$p}"
      echo done
      ;;
  esac
done
"#;

        std::thread::scope(|scope| {
            for _ in 0..2 {
                let shared = &shared;
                scope.spawn(move || run_collector(shared, || scripted_worker(script)).unwrap());
            }
        });

        let output = sink.contents();
        assert_eq!(output.lines().count(), 2);
        assert!(output.contains(r#""path":["a"]"#));
        assert!(output.contains(r#""path":["b"]"#));
        let state = shared.lock();
        assert!(state.todo.is_empty());
        assert!(state.active.is_empty());
    }
}
