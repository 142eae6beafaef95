// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    fs::File,
    io::Write as _,
    os::fd::{AsFd, FromRawFd as _, OwnedFd, RawFd},
};

use anyhow::Context as _;
use rustix::io::{fcntl_setfd, FdFlags};

/// One-byte status reports to the manager on fd 3.
pub const STATUS_FD: RawFd = 3;
/// The runtime's own log stream, written through /proc/<self>/fd/4.
pub const LOG_FD: RawFd = 4;
/// One byte on fd 5 tells the manager the FIFOs are open on both ends.
pub const SYNC_FD: RawFd = 5;

/// Status byte for a runtime binary that could not be spawned at all.
pub const STATUS_SPAWN_FAILED: u8 = 2;

/// The three numbered descriptors inherited from the manager.
pub struct Handshake {
    status: File,
    log: Option<OwnedFd>,
    sync: File,
}

impl Handshake {
    /// Adopts fds 3, 4 and 5. The runtime reaches these through procfs
    /// paths, never by inheritance, so they all become close-on-exec here.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the manager actually passed these
    /// descriptors and that nothing else in the process owns them. Call it
    /// exactly once, before anything can open a file onto those numbers.
    pub unsafe fn adopt() -> anyhow::Result<Self> {
        let status = File::from_raw_fd(STATUS_FD);
        let log = OwnedFd::from_raw_fd(LOG_FD);
        let sync = File::from_raw_fd(SYNC_FD);

        for fd in [status.as_fd(), log.as_fd(), sync.as_fd()] {
            fcntl_setfd(fd, FdFlags::CLOEXEC).context("failed to mark handshake fds cloexec")?;
        }

        Ok(Self {
            status,
            log: Some(log),
            sync,
        })
    }

    /// Tells the manager that every FIFO endpoint is live.
    pub fn signal_fifos_open(&mut self) -> anyhow::Result<()> {
        self.sync
            .write_all(&[0])
            .context("failed to write sync byte")?;
        Ok(())
    }

    /// Reports the front-process result: `STATUS_SPAWN_FAILED` if the
    /// runtime never started, its exit status otherwise.
    pub fn write_status(&mut self, code: u8) -> anyhow::Result<()> {
        self.status
            .write_all(&[code])
            .context("failed to write status byte")?;
        Ok(())
    }

    /// Closes the log descriptor. Nothing more will be written there once
    /// the runtime front-process is gone.
    pub fn close_log(&mut self) {
        self.log.take();
    }

    /// The procfs path the runtime writes its logs to.
    pub fn log_path(&self) -> String {
        proc_fd_path(LOG_FD)
    }
}

/// The procfs path the runtime reads the process spec from. The manager
/// feeds the process spec on our stdin; the runtime opens it by path rather
/// than by inheritance.
pub fn spec_path() -> String {
    proc_fd_path(0)
}

fn proc_fd_path(fd: RawFd) -> String {
    format!("/proc/{}/fd/{}", std::process::id(), fd)
}
