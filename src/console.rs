// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{
    fs::File,
    io,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _};
use rand::distributions::{Alphanumeric, DistString as _};
use rustix::termios::{tcsetwinsize, Winsize};
use serde::Deserialize;
use tracing::{debug, error, warn};

mod ipc;
pub use ipc::OutputDrain;

/// The transient socket path must fit in sun_path with headroom for the
/// random subdirectory and socket name, so the caller-chosen base directory
/// is capped well below the 108-byte kernel limit.
pub const MAX_SOCKET_DIR_PATH_LEN: usize = 80;

/// The FIFO ends the console pumps own once streaming starts.
pub struct ConsoleStreams {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub winsz: Option<File>,
}

/// A window-size change event, as the manager writes it to the winsz FIFO.
#[derive(Debug, Clone, Copy, Deserialize)]
struct WindowSize {
    columns: u16,
    rows: u16,
}

/// Creates the console socket and hands its path back for the runtime's
/// `-console-socket` flag. A background thread then accepts the runtime's
/// single connection, takes the master pty descriptor off it, and pumps
/// bytes between the master and the FIFOs until the master goes away.
///
/// Everything past the accept means the runtime connected and the container
/// may be running, so failures there kill the container before aborting.
pub fn setup(
    socket_dir: &Path,
    streams: ConsoleStreams,
    pid_file: PathBuf,
    drain: OutputDrain,
) -> anyhow::Result<PathBuf> {
    if socket_dir.as_os_str().len() > MAX_SOCKET_DIR_PATH_LEN {
        bail!(
            "--socket-dir-path cannot exceed {} bytes",
            MAX_SOCKET_DIR_PATH_LEN
        );
    }

    let scratch = socket_dir.join(format!(
        "con.{}",
        Alphanumeric.sample_string(&mut rand::thread_rng(), 10),
    ));
    std::fs::create_dir(&scratch)
        .with_context(|| format!("failed to create {}", scratch.display()))?;

    let sock_path = scratch.join("tty.sock");
    let listener = UnixListener::bind(&sock_path)
        .with_context(|| format!("failed to listen on {}", sock_path.display()))?;

    debug!(sock = %sock_path.display(), "waiting for console handoff");

    std::thread::spawn(move || {
        if let Err(err) = broker(listener, &scratch, streams, drain) {
            error!(?err, "console broker failed");

            // The runtime got far enough to connect, so a container process
            // may be out there with nobody holding its terminal.
            crate::reaper::kill_container(&pid_file);
            std::process::exit(1);
        }
    });

    Ok(sock_path)
}

fn broker(
    listener: UnixListener,
    scratch: &Path,
    streams: ConsoleStreams,
    drain: OutputDrain,
) -> anyhow::Result<()> {
    let (conn, _) = listener.accept().context("accept on console socket")?;

    // One handoff per exec; free the address for other instances.
    drop(listener);

    let master = ipc::recv_console_fd(&conn).context("failed to receive master pty fd")?;
    drop(conn);

    std::fs::remove_dir_all(scratch)
        .with_context(|| format!("failed to remove {}", scratch.display()))?;

    stream_console(File::from(master), streams, drain)
}

/// Starts the three pumps. Only the master-to-stdout copy is tracked by the
/// drain counter: the exit code must not be persisted until that side has
/// seen EOF, or a short-lived program's final output could be lost. Inbound
/// bytes past exit are harmless, so the stdin pump is untracked.
fn stream_console(
    master: File,
    streams: ConsoleStreams,
    drain: OutputDrain,
) -> anyhow::Result<()> {
    if let Some(mut stdout) = streams.stdout {
        let mut master = master.try_clone().context("failed to dup master fd")?;
        let guard = drain.track();
        std::thread::spawn(move || {
            // The copy ends with EIO rather than a clean EOF once the last
            // slave descriptor closes; either way the output is drained.
            let _ = io::copy(&mut master, &mut stdout);
            drop(guard);
        });
    }

    if let Some(mut stdin) = streams.stdin {
        let mut master = master.try_clone().context("failed to dup master fd")?;
        std::thread::spawn(move || {
            let _ = io::copy(&mut stdin, &mut master);
        });
    }

    if let Some(winsz) = streams.winsz {
        std::thread::spawn(move || resize_loop(winsz, master));
    }

    Ok(())
}

fn resize_loop(winsz: File, master: File) {
    // We hold the write end of the read-write FIFO ourselves, so EOF never
    // arrives in practice; this loop lives until the process exits.
    let mut reader = io::BufReader::new(winsz);
    'stream: loop {
        let events = serde_json::Deserializer::from_reader(&mut reader).into_iter::<WindowSize>();

        for event in events {
            match event {
                Ok(size) => {
                    debug!(columns = size.columns, rows = size.rows, "resizing console");

                    if let Err(err) = tcsetwinsize(
                        &master,
                        Winsize {
                            ws_col: size.columns,
                            ws_row: size.rows,
                            ws_xpixel: 0,
                            ws_ypixel: 0,
                        },
                    ) {
                        warn!(?err, "failed to set console window size");
                    }
                }
                Err(err) if err.is_eof() || err.is_io() => break 'stream,
                Err(err) => {
                    warn!(?err, "ignoring malformed window-size event");

                    // The stream deserializer wedges once it has returned an
                    // error; pick the stream back up at the current offset.
                    continue 'stream;
                }
            }
        }

        break;
    }
}
