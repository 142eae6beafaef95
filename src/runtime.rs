// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{path::Path, process::Command};

use crate::handshake;

/// Builds the runtime invocation for a detached exec.
///
/// The runtime reads the process spec from our stdin and writes its log
/// stream to inherited fd 4, both addressed through procfs paths so the
/// runtime can open them without relying on descriptor inheritance. The
/// argument order matters to some runtimes and is kept stable.
pub fn exec_command(
    runtime: &Path,
    log_path: &str,
    console_socket: Option<&Path>,
    pid_file: &Path,
    container_id: &str,
) -> Command {
    let mut cmd = Command::new(runtime);
    cmd.arg("-debug").arg("-log").arg(log_path).arg("exec");

    match console_socket {
        Some(sock) => {
            cmd.arg("-d")
                .arg("-tty")
                .arg("-console-socket")
                .arg(sock)
                .arg("-p")
                .arg(handshake::spec_path())
                .arg("-pid-file")
                .arg(pid_file);
        }
        None => {
            cmd.arg("-p")
                .arg(handshake::spec_path())
                .arg("-d")
                .arg("-pid-file")
                .arg(pid_file);
        }
    }

    cmd.arg(container_id);
    cmd
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::exec_command;

    fn argv(cmd: &std::process::Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test_log::test]
    fn tty_form() {
        let cmd = exec_command(
            Path::new("/usr/bin/runc"),
            "/proc/42/fd/4",
            Some(Path::new("/tmp/con.abc/tty.sock")),
            Path::new("/state/pidfile"),
            "cafe",
        );

        let spec = super::handshake::spec_path();
        pretty_assertions::assert_eq!(
            argv(&cmd),
            vec![
                "-debug",
                "-log",
                "/proc/42/fd/4",
                "exec",
                "-d",
                "-tty",
                "-console-socket",
                "/tmp/con.abc/tty.sock",
                "-p",
                spec.as_str(),
                "-pid-file",
                "/state/pidfile",
                "cafe",
            ]
        );
    }

    #[test_log::test]
    fn plain_form() {
        let cmd = exec_command(
            Path::new("runc"),
            "/proc/42/fd/4",
            None,
            Path::new("/state/pidfile"),
            "cafe",
        );

        let spec = super::handshake::spec_path();
        pretty_assertions::assert_eq!(
            argv(&cmd),
            vec![
                "-debug",
                "-log",
                "/proc/42/fd/4",
                "exec",
                "-p",
                spec.as_str(),
                "-d",
                "-pid-file",
                "/state/pidfile",
                "cafe",
            ]
        );
    }
}
