//! Handle for a worker subprocess and its pipe pair.

use std::os::unix::io::OwnedFd;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::ipc::{LineReader, LineWriter, PipeFd};
use crate::error::{DrvStreamError, Result};
use crate::msg::CollectMsg;

/// A worker process with its request/response channels.
pub struct Proc {
    pid: Pid,
    writer: LineWriter,
    reader: LineReader,
    reaped: bool,
}

impl Proc {
    /// Wrap an already-connected pipe pair. `requests` is written to the
    /// worker, `responses` is read from it.
    pub fn new(pid: Pid, requests: PipeFd, responses: PipeFd) -> Self {
        Self {
            pid,
            writer: LineWriter::new(requests),
            reader: LineReader::new(responses),
            reaped: false,
        }
    }

    /// Take ownership of a spawned child's stdin/stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DrvStreamError::Worker("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DrvStreamError::Worker("child stdout not captured".into()))?;

        Ok(Self::new(
            pid,
            PipeFd::new(OwnedFd::from(stdin)),
            PipeFd::new(OwnedFd::from(stdout)),
        ))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Ship one request frame.
    pub fn send(&mut self, msg: &CollectMsg) -> Result<()> {
        self.writer
            .write_line(&msg.to_frame())
            .map_err(|e| DrvStreamError::Worker(format!("failed to send to worker: {}", e)))
    }

    /// Read one response frame. `None` when the worker closed its pipe.
    pub fn recv_line(&mut self) -> Result<Option<String>> {
        match self.reader.read_line() {
            Ok(line) => Ok(line.map(String::from)),
            Err(e) => Err(DrvStreamError::Worker(format!(
                "failed to read from worker: {}",
                e
            ))),
        }
    }

    /// Non-blocking liveness check.
    pub fn try_wait(&mut self) -> Option<WaitStatus> {
        if self.reaped {
            return None;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => {
                self.reaped = true;
                Some(status)
            }
            Err(_) => {
                self.reaped = true;
                None
            }
        }
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }

        // A cooperative worker exits on `exit` or on pipe EOF; give it a
        // moment before escalating so normal teardown never signals.
        let _ = self.send(&CollectMsg::Exit);

        let deadline = std::time::Instant::now() + Duration::from_millis(500);
        while std::time::Instant::now() < deadline {
            if self.try_wait().is_some() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let _ = signal::kill(self.pid, Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(50));
        if self.try_wait().is_some() {
            return;
        }

        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
        self.reaped = true;
    }
}
