// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{path::Path, time::Duration};

use anyhow::{anyhow, bail, Context as _};
use crossbeam_channel::Receiver;
use rustix::io::Errno;
use rustix::process::{kill_process, wait, waitpid, Pid, Signal, WaitOptions, WaitStatus};
use signal_hook::{consts::SIGCHLD, iterator::Signals};
use tracing::{debug, warn};

use crate::console::OutputDrain;
use crate::state::ProcessState;

/// Enough to ride out a burst of dying orphans. Signals past this are
/// dropped, which is safe: every drain loops over all pending children.
const SIGNAL_BACKLOG: usize = 100;

/// The runtime writes the pid file some time after the front-process
/// reports success, so reads back off and retry.
const PID_FILE_ATTEMPTS: u32 = 20;
const PID_FILE_BACKOFF: Duration = Duration::from_millis(500);

/// Starts listening for SIGCHLD. Must be called before the runtime is
/// spawned, or an early exit could go unnoticed.
pub fn watch_sigchld() -> anyhow::Result<Receiver<()>> {
    let mut signals = Signals::new([SIGCHLD]).context("failed to install SIGCHLD handler")?;
    let (tx, rx) = crossbeam_channel::bounded(SIGNAL_BACKLOG);

    std::thread::spawn(move || {
        for _ in signals.forever() {
            let _ = tx.try_send(());
        }
    });

    Ok(rx)
}

/// Marks us as the subreaper, so the detached container process lands here
/// when the runtime front-process exits. Must run before the runtime is
/// spawned; otherwise the orphan reparents to init and we never see it.
pub fn set_child_subreaper() -> anyhow::Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error()).context("prctl(PR_SET_CHILD_SUBREAPER)");
    }

    Ok(())
}

/// Phase A: blocks until the runtime front-process exits and returns the
/// byte to report on the status channel. The front-process only forks off
/// the container and detaches, so this resolves quickly.
pub fn wait_front_process(pid: Pid) -> anyhow::Result<u8> {
    loop {
        match waitpid(Some(pid), WaitOptions::empty()) {
            Ok(Some(status)) => {
                let byte = status.exit_status().map(|s| s as u8).unwrap_or(u8::MAX);
                debug!(byte, "runtime front-process exited");
                return Ok(byte);
            }
            Ok(None) => continue,
            Err(Errno::INTR) => continue,
            // Start succeeded, so failing to wait can only be a programmer
            // error.
            Err(err) => return Err(err).context("waitpid on runtime front-process"),
        }
    }
}

/// Phase B: drains SIGCHLD, reaping adopted orphans until the tracked
/// container pid comes back. Waits for the stdout pump before persisting
/// the exit code, so the manager never reads a code ahead of output.
pub fn wait_for_container(
    state: &ProcessState,
    container_pid: Pid,
    signals: &Receiver<()>,
    drain: &OutputDrain,
) -> anyhow::Result<i32> {
    for _ in signals.iter() {
        loop {
            match wait(WaitOptions::NOHANG) {
                Ok(Some((pid, status))) if pid == container_pid => {
                    let code = exit_code(status);
                    debug!(code, "container process exited");

                    drain.wait();
                    state.write_exit_code(code)?;
                    return Ok(code);
                }
                Ok(Some((pid, _))) => {
                    debug!(pid = pid.as_raw_nonzero().get(), "reaped adopted orphan");
                }
                Ok(None) => break,
                Err(Errno::INTR) => continue,
                Err(_) => break,
            }
        }
    }

    bail!("signal stream closed before the container exited");
}

fn exit_code(status: WaitStatus) -> i32 {
    if let Some(signal) = status.terminating_signal() {
        128 + signal as i32
    } else {
        status.exit_status().unwrap_or_default() as i32
    }
}

/// Reads the container pid, retrying while the runtime finishes writing it.
pub fn read_container_pid(pid_file: &Path) -> anyhow::Result<Pid> {
    let mut attempt = 0;
    loop {
        match parse_pid(pid_file) {
            Ok(pid) => return Ok(pid),
            Err(err) => {
                attempt += 1;
                if attempt >= PID_FILE_ATTEMPTS {
                    return Err(err)
                        .with_context(|| format!("failed to read {}", pid_file.display()));
                }
            }
        }

        std::thread::sleep(PID_FILE_BACKOFF);
    }
}

fn parse_pid(pid_file: &Path) -> anyhow::Result<Pid> {
    let contents = std::fs::read_to_string(pid_file)?;
    let raw: i32 = contents.trim().parse()?;
    if raw <= 0 {
        // A negative pid would address a whole process group.
        return Err(anyhow!("invalid pid {raw}"));
    }

    Pid::from_raw(raw).ok_or_else(|| anyhow!("invalid pid {raw}"))
}

/// Best-effort SIGKILL of the container, for failure paths where the
/// runtime may have launched it and nobody else will clean it up.
pub fn kill_container(pid_file: &Path) {
    match read_container_pid(pid_file) {
        Ok(pid) => {
            warn!(pid = pid.as_raw_nonzero().get(), "killing container process");
            if let Err(err) = kill_process(pid, Signal::Kill) {
                warn!(?err, "failed to kill container process");
            }
        }
        Err(err) => warn!(?err, "container pid unknown, nothing to kill"),
    }
}

#[cfg(test)]
mod test {
    use super::{parse_pid, set_child_subreaper};

    #[test_log::test]
    fn parse_pid_accepts_decimal_with_whitespace() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pidfile");
        std::fs::write(&path, "1234\n")?;

        let pid = parse_pid(&path)?;
        pretty_assertions::assert_eq!(pid.as_raw_nonzero().get(), 1234);

        Ok(())
    }

    #[test_log::test]
    fn parse_pid_rejects_garbage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pidfile");

        assert!(parse_pid(&path).is_err());

        std::fs::write(&path, "not-a-pid")?;
        assert!(parse_pid(&path).is_err());

        std::fs::write(&path, "0")?;
        assert!(parse_pid(&path).is_err());

        std::fs::write(&path, "-1")?;
        assert!(parse_pid(&path).is_err());

        Ok(())
    }

    #[test_log::test]
    fn subreaper_flag_sticks() -> anyhow::Result<()> {
        set_child_subreaper()?;

        let mut val: libc::c_int = 0;
        let ret = unsafe {
            libc::prctl(
                libc::PR_GET_CHILD_SUBREAPER,
                &mut val as *mut libc::c_int as libc::c_ulong,
                0,
                0,
                0,
            )
        };
        assert!(ret >= 0);
        assert!(val != 0);

        Ok(())
    }
}
