// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// The three endpoints a managed process is wired to. A slot is `None` when
/// the supervisor passed an empty path or the path does not exist at setup
/// time; the process then runs with that stream unbound.
#[derive(Debug, Default)]
pub struct Stdio {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

impl Stdio {
    pub fn setup(stdin: &str, stdout: &str, stderr: &str) -> Result<Self> {
        let stdin = open_read(stdin).with_context(|| format!("open stdin {:?}", stdin))?;
        let stdout = open_write(stdout).with_context(|| format!("open stdout {:?}", stdout))?;
        let stderr = open_write(stderr).with_context(|| format!("open stderr {:?}", stderr))?;

        Ok(Self {
            stdin,
            stdout,
            stderr,
        })
    }

    /// Close whatever slots are still open. Individual close failures do not
    /// keep the remaining slots from closing, and a second call is a no-op.
    pub fn close(&mut self) {
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
    }
}

fn open_read(path: &str) -> Result<Option<File>> {
    if path.is_empty() || !Path::new(path).exists() {
        return Ok(None);
    }

    // The non-blocking flag is only there so the open does not stall when
    // the write side of a fifo is not connected yet; the fd itself must
    // block for the io copiers.
    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::empty())).context("clear O_NONBLOCK")?;

    Ok(Some(file))
}

fn open_write(path: &str) -> Result<Option<File>> {
    if path.is_empty() || !Path::new(path).exists() {
        return Ok(None);
    }

    Ok(Some(OpenOptions::new().write(true).open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    #[test]
    fn test_missing_paths_leave_slots_empty() {
        let io = Stdio::setup("", "", "").unwrap();
        assert!(io.stdin.is_none());
        assert!(io.stdout.is_none());
        assert!(io.stderr.is_none());

        let io = Stdio::setup("/does/not/exist", "/does/not/exist", "").unwrap();
        assert!(io.stdin.is_none());
        assert!(io.stdout.is_none());
        assert!(io.stderr.is_none());
    }

    #[test]
    fn test_existing_fifos_are_bound() {
        let dir = tempfile::tempdir().unwrap();
        let stdin = dir.path().join("stdin");
        let stdout = dir.path().join("stdout");
        mkfifo(&stdin, Mode::from_bits_truncate(0o600)).unwrap();

        // Hold both ends open so the write-only open of stdout succeeds.
        mkfifo(&stdout, Mode::from_bits_truncate(0o600)).unwrap();
        let _reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&stdout)
            .unwrap();

        let mut io = Stdio::setup(
            stdin.to_str().unwrap(),
            stdout.to_str().unwrap(),
            "",
        )
        .unwrap();
        assert!(io.stdin.is_some());
        assert!(io.stdout.is_some());
        assert!(io.stderr.is_none());

        io.close();
        assert!(io.stdin.is_none());
        io.close();
    }
}
