// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::{io::Write as _, os::unix::fs::OpenOptionsExt as _, path::PathBuf};

use anyhow::Context as _;

/// The process state directory, created by the manager before we start. It
/// holds the stdio FIFOs, the pid file the runtime writes, and the exitcode
/// file we leave behind. We never remove it.
#[derive(Debug, Clone)]
pub struct ProcessState {
    dir: PathBuf,
}

impl ProcessState {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn fifo_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Written by the runtime once the container process is up.
    pub fn pid_file_path(&self) -> PathBuf {
        self.dir.join("pidfile")
    }

    pub fn exit_code_path(&self) -> PathBuf {
        self.dir.join("exitcode")
    }

    /// Persists the container's exit code as ASCII decimal. The manager polls
    /// for this file after the exit FIFO closes.
    pub fn write_exit_code(&self, code: i32) -> anyhow::Result<()> {
        let path = self.exit_code_path();
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o700)
            .open(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;

        file.write_all(code.to_string().as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt as _;

    use super::ProcessState;

    #[test_log::test]
    fn exit_code_contents_and_mode() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = ProcessState::new(dir.path());

        state.write_exit_code(137)?;

        let path = state.exit_code_path();
        pretty_assertions::assert_eq!(std::fs::read_to_string(&path)?, "137");

        let mode = std::fs::metadata(&path)?.permissions().mode();
        pretty_assertions::assert_eq!(mode & 0o777, 0o700);

        Ok(())
    }

    #[test_log::test]
    fn exit_code_overwrites() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = ProcessState::new(dir.path());

        state.write_exit_code(255)?;
        state.write_exit_code(0)?;

        pretty_assertions::assert_eq!(
            std::fs::read_to_string(state.exit_code_path())?,
            "0"
        );

        Ok(())
    }
}
