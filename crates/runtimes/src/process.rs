// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio as ProcessStdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chdir, chroot, setgid, setpgid, setsid, setuid, Gid, Pid, Uid};
use oci_spec::runtime as oci;
use tokio::sync::{watch, Mutex, RwLock};

use crate::error::Error;
use crate::stdio::Stdio;
use crate::types::{ProcessExitStatus, ProcessStatus, StateInfo};

pub type ProcessWatcher = (
    Option<watch::Receiver<bool>>,
    Arc<RwLock<ProcessExitStatus>>,
);

/// One executable invocation inside a container: the primary workload or an
/// auxiliary exec. The invocation is assembled at setup and consumed by
/// `start`; everything the reaper touches afterwards sits behind shared
/// handles so no container lock is needed to record the exit.
pub struct ManagedProcess {
    logger: slog::Logger,
    pub container_id: String,
    pub exec_id: String,
    pub bundle: String,

    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    console_size: Option<(u16, u16)>,

    cmd: Option<Command>,
    child: Option<Child>,

    pub io: Arc<Mutex<Stdio>>,
    pub console: Arc<Mutex<Option<File>>>,
    pub status: Arc<RwLock<ProcessStatus>>,
    pub exit_status: Arc<RwLock<ProcessExitStatus>>,
    exit_watcher_rx: Option<watch::Receiver<bool>>,
    exit_watcher_tx: Option<watch::Sender<bool>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("container_id", &self.container_id)
            .field("exec_id", &self.exec_id)
            .field("terminal", &self.terminal)
            .finish()
    }
}

impl ManagedProcess {
    pub fn setup(
        container_id: &str,
        exec_id: &str,
        bundle: &str,
        spec: &oci::Process,
        rootfs: &Path,
        stdin: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<Self> {
        let args = spec.args().as_ref().cloned().unwrap_or_default();
        if args.is_empty() {
            return Err(Error::InvalidArgument("process args must not be empty".into()).into());
        }

        let io = Stdio::setup(stdin, stdout, stderr).context("setup io")?;

        let terminal = spec.terminal().unwrap_or_default();
        let console_size = spec
            .console_size()
            .as_ref()
            .map(|b| (b.width() as u16, b.height() as u16));

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        cmd.env_clear();
        if let Some(env) = spec.env().as_ref() {
            for entry in env {
                if let Some((key, value)) = entry.split_once('=') {
                    cmd.env(key, value);
                }
            }
        }

        let rootfs = rootfs.to_path_buf();
        let cwd = if spec.cwd().as_os_str().is_empty() {
            PathBuf::from("/")
        } else {
            spec.cwd().clone()
        };
        let uid = spec.user().uid();
        let gid = spec.user().gid();
        set_child_attributes(&mut cmd, rootfs, cwd, uid, gid, terminal);

        let (exit_watcher_tx, exit_watcher_rx) = watch::channel(false);
        let logger = sl!().new(o!(
            "container_id" => container_id.to_string(),
            "exec_id" => exec_id.to_string(),
        ));

        Ok(Self {
            logger,
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            bundle: bundle.to_string(),
            stdin: stdin.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            terminal,
            console_size,
            cmd: Some(cmd),
            child: None,
            io: Arc::new(Mutex::new(io)),
            console: Arc::new(Mutex::new(None)),
            status: Arc::new(RwLock::new(ProcessStatus::Created)),
            exit_status: Arc::new(RwLock::new(ProcessExitStatus::new())),
            exit_watcher_rx: Some(exit_watcher_rx),
            exit_watcher_tx: Some(exit_watcher_tx),
        })
    }

    pub async fn start(&mut self) -> Result<u32> {
        let mut cmd = self
            .cmd
            .take()
            .ok_or_else(|| Error::FailedPrecondition(self.id()))?;

        let child = if self.terminal {
            let winsize = self.console_size.map(|(cols, rows)| Winsize {
                ws_row: rows,
                ws_col: cols,
                ws_xpixel: 0,
                ws_ypixel: 0,
            });
            let pty = openpty(winsize.as_ref(), None).context("openpty")?;
            let master = unsafe { File::from_raw_fd(pty.master) };
            let slave = unsafe { File::from_raw_fd(pty.slave) };

            cmd.stdin(slave.try_clone().context("clone pty secondary")?);
            cmd.stdout(slave.try_clone().context("clone pty secondary")?);
            cmd.stderr(slave);

            let child = cmd.spawn().context("spawn process")?;

            let io = self.io.lock().await;
            if let Some(stdin) = io.stdin.as_ref() {
                self.spawn_io_copy(
                    "stdin",
                    stdin.try_clone().context("clone stdin")?,
                    master.try_clone().context("clone console")?,
                );
            }
            if let Some(stdout) = io.stdout.as_ref() {
                self.spawn_io_copy(
                    "stdout",
                    master.try_clone().context("clone console")?,
                    stdout.try_clone().context("clone stdout")?,
                );
            }
            drop(io);

            *self.console.lock().await = Some(master);

            child
        } else {
            let io = self.io.lock().await;
            match io.stdin.as_ref() {
                Some(stdin) => cmd.stdin(stdin.try_clone().context("clone stdin")?),
                None => cmd.stdin(ProcessStdio::null()),
            };
            match io.stdout.as_ref() {
                Some(stdout) => cmd.stdout(stdout.try_clone().context("clone stdout")?),
                None => cmd.stdout(ProcessStdio::null()),
            };
            match io.stderr.as_ref() {
                Some(stderr) => cmd.stderr(stderr.try_clone().context("clone stderr")?),
                None => cmd.stderr(ProcessStdio::null()),
            };
            drop(io);

            cmd.spawn().context("spawn process")?
        };

        let pid = child.id();
        self.child = Some(child);
        *self.status.write().await = ProcessStatus::Running;

        info!(self.logger, "process started"; "pid" => pid);

        Ok(pid)
    }

    fn spawn_io_copy(&self, name: &'static str, reader: File, writer: File) {
        let logger = self.logger.new(o!("io_name" => name));
        let mut reader = tokio::fs::File::from_std(reader);
        let mut writer = tokio::fs::File::from_std(writer);

        tokio::spawn(async move {
            match tokio::io::copy(&mut reader, &mut writer).await {
                Ok(length) => debug!(logger, "io copy finished, {} bytes", length),
                Err(err) => warn!(logger, "io copy failed: {}", err),
            }
        });
    }

    /// Deliver `signal` to the process group. Nothing happens when the
    /// process was never started.
    pub fn kill(&self, signal: Signal) -> Result<()> {
        if let Some(child) = self.child.as_ref() {
            kill(Pid::from_raw(-(child.id() as i32)), signal).context("kill process group")?;
        }

        Ok(())
    }

    /// Update the pty window size; a process without a pty ignores this.
    pub async fn resize_pty(&self, width: u32, height: u32) -> Result<()> {
        let console = self.console.lock().await;
        let master = match console.as_ref() {
            Some(master) => master,
            None => return Ok(()),
        };

        let winsize = Winsize {
            ws_row: height as u16,
            ws_col: width as u16,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("set winsize");
        }

        Ok(())
    }

    /// Close the stdin half only; stdout and stderr stay open so remaining
    /// output can drain.
    pub async fn close_io(&self) {
        self.io.lock().await.stdin.take();
    }

    /// Best-effort teardown: SIGKILL the group, drop the io binding and the
    /// pty, and force the terminal state if the reaper did not get there
    /// first. Waiters are released.
    pub async fn destroy(&mut self) -> Result<()> {
        let _ = self.kill(Signal::SIGKILL);

        self.io.lock().await.close();
        self.console.lock().await.take();

        let mut status = self.status.write().await;
        if *status != ProcessStatus::Stopped {
            *status = ProcessStatus::Stopped;
            self.exit_status
                .write()
                .await
                .update_exit_code(libc::SIGKILL as u32);
        }
        drop(status);

        self.exit_watcher_tx.take();

        Ok(())
    }

    pub fn fetch_exit_watcher(&self) -> ProcessWatcher {
        (self.exit_watcher_rx.clone(), self.exit_status.clone())
    }

    /// Hand the single-fire side of the completion latch to the reaper.
    pub fn take_exit_notifier(&mut self) -> Option<watch::Sender<bool>> {
        self.exit_watcher_tx.take()
    }

    pub fn pid(&self) -> u32 {
        self.child.as_ref().map(|child| child.id()).unwrap_or(0)
    }

    pub async fn get_status(&self) -> ProcessStatus {
        *self.status.read().await
    }

    pub async fn state(&self) -> StateInfo {
        StateInfo {
            container_id: self.container_id.clone(),
            exec_id: self.exec_id.clone(),
            bundle: self.bundle.clone(),
            pid: self.pid(),
            status: self.get_status().await,
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            terminal: self.terminal,
            exit: self.exit_status.read().await.clone(),
        }
    }

    fn id(&self) -> String {
        if self.exec_id.is_empty() {
            self.container_id.clone()
        } else {
            format!("{}/{}", self.container_id, self.exec_id)
        }
    }
}

/// Arrange the jail for the child: own process group (or own session with a
/// controlling tty), chroot into the rootfs, then drop to the configured
/// credentials.
fn set_child_attributes(
    cmd: &mut Command,
    rootfs: PathBuf,
    cwd: PathBuf,
    uid: u32,
    gid: u32,
    terminal: bool,
) {
    use std::os::unix::process::CommandExt;

    unsafe {
        cmd.pre_exec(move || {
            if terminal {
                setsid().map_err(io_error)?;
                // The pty secondary is fd 0 at this point.
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            } else {
                setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io_error)?;
            }

            chroot(&rootfs).map_err(io_error)?;
            chdir(&cwd).map_err(io_error)?;
            setgid(Gid::from_raw(gid)).map_err(io_error)?;
            setuid(Uid::from_raw(uid)).map_err(io_error)?;

            Ok(())
        });
    }
}

fn io_error(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}
