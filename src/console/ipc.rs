// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::io;
use std::os::fd::{FromRawFd as _, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex};

use uds::UnixStreamExt as _;

/// Counts in-flight output pumps. The reaper must not persist the exit code
/// while the counter is non-zero, so that everything the user process wrote
/// has reached the stdout FIFO first.
///
/// A guard taken with [`OutputDrain::track`] decrements on drop; [`wait`]
/// blocks until the count reaches zero, and passes straight through if no
/// pump was ever started.
#[derive(Clone)]
pub struct OutputDrain(Arc<DrainState>);

struct DrainState {
    pending: Mutex<usize>,
    drained: Condvar,
}

pub struct DrainGuard(Arc<DrainState>);

impl OutputDrain {
    pub fn new() -> Self {
        Self(Arc::new(DrainState {
            pending: Mutex::new(0),
            drained: Condvar::new(),
        }))
    }

    pub fn track(&self) -> DrainGuard {
        *self.0.pending.lock().unwrap() += 1;
        DrainGuard(self.0.clone())
    }

    pub fn wait(&self) {
        let mut pending = self.0.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.0.drained.wait(pending).unwrap();
        }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let mut pending = self.0.pending.lock().unwrap();
        *pending -= 1;
        if *pending == 0 {
            self.0.drained.notify_all();
        }
    }
}

/// Receives the master pty descriptor from the runtime over the accepted
/// console-socket connection.
pub fn recv_console_fd(conn: &UnixStream) -> io::Result<OwnedFd> {
    // The runtime sends a short identifying payload along with the
    // SCM_RIGHTS message; we only care about the descriptor.
    let mut buf = [0_u8; 256];
    let mut fds: [RawFd; 1] = [-1];

    let (_, nfds) = conn.recv_fds(&mut buf, &mut fds)?;
    if nfds == 0 || fds[0] < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no fd in console handoff message",
        ));
    }

    let fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    Ok(fd)
}
