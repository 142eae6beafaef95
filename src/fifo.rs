// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
};

use anyhow::Context as _;
use tracing::debug;

use crate::state::ProcessState;

/// The named pipes shared with the manager. A missing FIFO is legal and
/// leaves the matching role unwired; the user process then sees nothing on
/// that stream.
pub struct Fifos {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
    pub winsz: Option<File>,

    // Held open for our whole lifetime. The manager watches for this pipe to
    // close, which tells it the supervisor is gone.
    _exit: Option<File>,
}

/// Opens the five FIFOs in the state directory. Each open blocks until the
/// manager has the other end open, so by the time this returns both sides of
/// every present pipe are live.
pub fn open(state: &ProcessState) -> anyhow::Result<Fifos> {
    let stdin = open_fifo(&state.fifo_path("stdin"), OpenOptions::new().read(true))?;
    let stdout = open_fifo(
        &state.fifo_path("stdout"),
        OpenOptions::new().append(true),
    )?;
    let stderr = open_fifo(
        &state.fifo_path("stderr"),
        OpenOptions::new().append(true),
    )?;
    let winsz = open_fifo(
        &state.fifo_path("winsz"),
        OpenOptions::new().read(true).write(true),
    )?;
    let exit = open_fifo(
        &state.fifo_path("exit"),
        OpenOptions::new().read(true).write(true),
    )?;

    debug!(
        stdin = stdin.is_some(),
        stdout = stdout.is_some(),
        stderr = stderr.is_some(),
        winsz = winsz.is_some(),
        "opened stdio pipes"
    );

    Ok(Fifos {
        stdin,
        stdout,
        stderr,
        winsz,
        _exit: exit,
    })
}

fn open_fifo(path: &Path, opts: &OpenOptions) -> anyhow::Result<Option<File>> {
    match opts.open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to open {}", path.display())),
    }
}
