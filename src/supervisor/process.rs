/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Handles to running backnet processes.
//!
//! Every [`Process`] has one supervising thread that exclusively owns its child OS process. The thread
//! waits for either of:
//! - The child exiting by itself. This is always a failure: backnets are meant to run until stopped. The
//!   failure is forwarded to the supervisor's failure channel, tagged with the process and community id.
//! - A cancellation signal from [`Process::stop`] (or the handle being dropped). The child is asked to
//!   terminate, given a grace period to exit cleanly, and only then killed.

use std::{
    fmt::{self, Display, Formatter},
    io,
    process::{Child, ExitStatus},
    sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::types::{
    basic::{CommunityID, ProcessID},
    community::BacknetType,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Process {
    id: ProcessID,
    community_id: CommunityID,
    backnet_type: BacknetType,
    pid: u32,
    cancel: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Process {
    /// Start supervising `child`, which has already reported that it is ready.
    pub(crate) fn supervise(
        id: ProcessID,
        community_id: CommunityID,
        backnet_type: BacknetType,
        mut child: Child,
        shutdown_grace: Duration,
        failures: SyncSender<ProcessFailure>,
    ) -> Process {
        let pid = child.id();
        let (cancel, cancel_receiver) = mpsc::channel();
        let thread_community_id = community_id.clone();

        let thread = thread::spawn(move || loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let _ = failures.send(ProcessFailure {
                        process: Some(id),
                        community: thread_community_id,
                        error: ProcessError::Runtime(ProcessRuntimeError::Exited { status }),
                    });
                    return;
                }
                Ok(None) => (),
                Err(err) => {
                    let _ = failures.send(ProcessFailure {
                        process: Some(id),
                        community: thread_community_id,
                        error: ProcessError::Runtime(ProcessRuntimeError::Wait(err)),
                    });
                    return;
                }
            }

            match cancel_receiver.recv_timeout(POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    terminate(&mut child, shutdown_grace);
                    return;
                }
                Err(RecvTimeoutError::Timeout) => (),
            }
        });

        Process {
            id,
            community_id,
            backnet_type,
            pid,
            cancel,
            thread: Some(thread),
        }
    }

    pub fn id(&self) -> ProcessID {
        self.id
    }

    pub fn community_id(&self) -> &CommunityID {
        &self.community_id
    }

    pub fn backnet_type(&self) -> BacknetType {
        self.backnet_type
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the supervising thread is still running, i.e. the child has neither exited nor been stopped.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    /// Cooperatively stop the child and wait for the supervising thread to finish.
    pub fn stop(mut self) {
        let _ = self.cancel.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Ask `child` to exit, escalating to a kill if it has not exited after `grace`.
fn terminate(child: &mut Child, grace: Duration) {
    request_exit(child);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(POLL_INTERVAL.min(grace)),
            Err(_) => break,
        }
    }

    log::warn!(
        "process {} did not exit within {:?} of being asked to, killing it",
        child.id(),
        grace
    );
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    if let Err(err) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
        log::debug!("failed to send SIGTERM to process {}: {}", child.id(), err);
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.kill();
}

/// A terminal error reported by, or on behalf of, a backnet process.
#[derive(Debug)]
pub struct ProcessFailure {
    /// `None` if the process failed before it could be registered.
    pub process: Option<ProcessID>,
    pub community: CommunityID,
    pub error: ProcessError,
}

#[derive(Debug)]
pub enum ProcessError {
    Startup(ProcessStartupError),
    Runtime(ProcessRuntimeError),
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Startup(err) => Display::fmt(err, f),
            ProcessError::Runtime(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for ProcessError {}

#[derive(Debug)]
pub enum ProcessStartupError {
    Spawn(io::Error),
    /// The process did not print its ready line in time. It was killed.
    StartupTimeout { after: Duration },
    /// The process exited, or closed its output, before printing its ready line.
    StartupFailed { reason: String },
}

impl Display for ProcessStartupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStartupError::Spawn(err) => write!(f, "failed to spawn backnet: {}", err),
            ProcessStartupError::StartupTimeout { after } => {
                write!(f, "backnet was not ready after {:?}", after)
            }
            ProcessStartupError::StartupFailed { reason } => {
                write!(f, "backnet failed to start: {}", reason)
            }
        }
    }
}

impl std::error::Error for ProcessStartupError {}

#[derive(Debug)]
pub enum ProcessRuntimeError {
    /// The process exited without being stopped.
    Exited { status: ExitStatus },
    Wait(io::Error),
}

impl Display for ProcessRuntimeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRuntimeError::Exited { status } => {
                write!(f, "backnet exited unexpectedly ({})", status)
            }
            ProcessRuntimeError::Wait(err) => write!(f, "failed to poll backnet: {}", err),
        }
    }
}

impl std::error::Error for ProcessRuntimeError {}
