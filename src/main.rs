// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod console;
mod fifo;
mod handshake;
mod reaper;
mod runtime;
mod state;

use std::{
    path::PathBuf,
    process::{ExitCode, Stdio},
};

use anyhow::{Context as _, Result};
use clap::{builder::TypedValueParser as _, Parser};
use rustix::io::fcntl_dupfd_cloexec;
use tracing::{debug, error};
use tracing_subscriber::{util::SubscriberInitExt as _, EnvFilter, Layer as _};

use console::{ConsoleStreams, OutputDrain};
use handshake::Handshake;
use state::ProcessState;

/// Exit code when the runtime binary could not be spawned.
const EXIT_SPAWN_FAILED: u8 = 2;
/// Exit code when the runtime ran but its front-process failed, meaning the
/// container never launched.
const EXIT_LAUNCH_FAILED: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "runshim")]
#[command(about = "Supervises a single detached container exec", long_about = None)]
struct Cli {
    /// Uid to chown the console to. Reserved; not consulted on the exec path.
    #[arg(long, default_value_t = 0)]
    uid: u32,
    /// Gid to chown the console to. Reserved; not consulted on the exec path.
    #[arg(long, default_value_t = 0)]
    gid: u32,
    /// Whether the exec gets a pseudo-terminal.
    #[arg(
        long,
        value_name = "BOOL",
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        default_value_t = false
    )]
    tty: bool,
    /// Directory in which to create the transient console socket.
    #[arg(
        long,
        value_name = "PATH",
        default_value = "",
        value_parser = clap::builder::StringValueParser::new().map(PathBuf::from)
    )]
    socket_dir_path: PathBuf,

    /// The OCI-style runtime binary to invoke.
    runtime: PathBuf,
    /// Directory holding the stdio FIFOs; receives the pidfile and exitcode.
    process_state_dir: PathBuf,
    /// Id of the already-created container to exec into.
    container_id: String,
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    init_logging()?;

    run(args)
}

fn run(args: Cli) -> Result<ExitCode> {
    debug!(
        tty = args.tty,
        uid = args.uid,
        gid = args.gid,
        container_id = %args.container_id,
        "starting up"
    );

    // Listening for SIGCHLD and becoming a subreaper both have to predate
    // the runtime spawn; a signal or a reparenting that slips in between is
    // lost forever.
    let signals = reaper::watch_sigchld()?;

    let mut handshake = unsafe { Handshake::adopt()? };
    let state = ProcessState::new(&args.process_state_dir);
    let pid_file = state.pid_file_path();

    let mut fifos = fifo::open(&state)?;
    handshake.signal_fifos_open()?;

    let drain = OutputDrain::new();

    let mut cmd = if args.tty {
        let streams = ConsoleStreams {
            stdin: fifos.stdin.take(),
            stdout: fifos.stdout.take(),
            winsz: fifos.winsz.take(),
        };

        let sock_path = console::setup(
            &args.socket_dir_path,
            streams,
            pid_file.clone(),
            drain.clone(),
        )?;

        let mut cmd = runtime::exec_command(
            &args.runtime,
            &handshake.log_path(),
            Some(sock_path.as_path()),
            &pid_file,
            &args.container_id,
        );

        // All output travels over the pty; the runtime itself gets nothing.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    } else {
        let mut cmd = runtime::exec_command(
            &args.runtime,
            &handshake.log_path(),
            None,
            &pid_file,
            &args.container_id,
        );

        // The runtime passes its stdio straight through to the user
        // process, so the FIFO ends go in directly. Our own copies stay
        // open until we exit.
        match &fifos.stdin {
            Some(fifo) => cmd.stdin(fcntl_dupfd_cloexec(fifo, 0)?),
            None => cmd.stdin(Stdio::null()),
        };
        match &fifos.stdout {
            Some(fifo) => cmd.stdout(fcntl_dupfd_cloexec(fifo, 0)?),
            None => cmd.stdout(Stdio::null()),
        };
        match &fifos.stderr {
            Some(fifo) => cmd.stderr(fcntl_dupfd_cloexec(fifo, 0)?),
            None => cmd.stderr(Stdio::null()),
        };
        cmd
    };

    reaper::set_child_subreaper()?;

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(?err, runtime = %args.runtime.display(), "failed to spawn runtime");

            handshake.write_status(handshake::STATUS_SPAWN_FAILED)?;
            handshake.close_log();
            return Ok(ExitCode::from(EXIT_SPAWN_FAILED));
        }
    };

    let front_pid = rustix::process::Pid::from_raw(child.id() as i32)
        .context("runtime spawned with pid 0")?;

    let status = reaper::wait_front_process(front_pid)?;
    handshake.close_log();
    handshake.write_status(status)?;

    if status != 0 {
        error!(status, "runtime exited without launching the container");
        return Ok(ExitCode::from(EXIT_LAUNCH_FAILED));
    }

    // The container is out there now; on any failure below, take it down
    // with us rather than leave it orphaned.
    match supervise(&state, &pid_file, &signals, &drain) {
        Ok(code) => Ok(ExitCode::from(code as u8)),
        Err(err) => {
            reaper::kill_container(&pid_file);
            Err(err)
        }
    }
}

fn supervise(
    state: &ProcessState,
    pid_file: &std::path::Path,
    signals: &crossbeam_channel::Receiver<()>,
    drain: &OutputDrain,
) -> Result<i32> {
    let container_pid = reaper::read_container_pid(pid_file)?;
    debug!(
        pid = container_pid.as_raw_nonzero().get(),
        "tracking container process"
    );

    reaper::wait_for_container(state, container_pid, signals, drain)
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt as _;

    // Our stdout belongs to the manager; diagnostics go to stderr only.
    let printed_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive("runshim=info".parse()?)
                .from_env_lossy(),
        );

    tracing_subscriber::registry().with(printed_log).init();

    Ok(())
}
