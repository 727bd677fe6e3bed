// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Collects the exit of a spawned process group leader.
//!
//! Darwin has no `waitpid(-pgid, ...)`, so the leader is first watched for
//! its transition to zombie through kqueue, then the remaining group members
//! are drained, and only then is the status collected. See
//! <https://jmmv.dev/2019/11/wait-for-process-group-darwin.html>.

use anyhow::Result;
use nix::sys::wait::WaitStatus;

/// Block until `pid` and its process group are gone and return the leader's
/// wait status. Must be called exactly once per started process, from a
/// context that may block.
pub fn wait(pid: i32) -> Result<WaitStatus> {
    imp::wait(pid)
}

/// Exit code encoding: the status byte for a normal exit, the signal number
/// for a signalled death.
pub fn exit_code(status: WaitStatus) -> u32 {
    match status {
        WaitStatus::Exited(_, code) => code as u32,
        WaitStatus::Signaled(_, signal, _) => signal as i32 as u32,
        _ => libc::SIGKILL as u32,
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use nix::sys::event::{kevent_ts, kqueue, EventFilter, EventFlag, FilterFlag, KEvent};
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{close, Pid};

    pub(super) fn wait(pid: i32) -> Result<WaitStatus> {
        wait_until_zombie(pid).context("wait until zombie")?;
        wait_for_process_group(pid).context("wait for process group")?;

        waitpid(Pid::from_raw(pid), None).context("collect status")
    }

    fn wait_until_zombie(pid: i32) -> Result<()> {
        let kq = kqueue()?;

        let changes = [KEvent::new(
            pid as libc::uintptr_t,
            EventFilter::EVFILT_PROC,
            EventFlag::EV_ADD,
            FilterFlag::NOTE_EXIT,
            0,
            0,
        )];
        let mut events = [KEvent::new(
            0,
            EventFilter::EVFILT_PROC,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        )];

        let result = kevent_ts(kq, &changes, &mut events, None);
        let _ = close(kq);
        result?;

        Ok(())
    }

    fn wait_for_process_group(pid: i32) -> Result<()> {
        loop {
            if process_group_len(pid)? <= 1 {
                return Ok(());
            }

            let _ = kill(Pid::from_raw(-pid), Signal::SIGTERM);

            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Number of processes whose pgid is `pgid`, the leader included.
    fn process_group_len(pgid: i32) -> Result<usize> {
        let mut mib = [
            libc::CTL_KERN,
            libc::KERN_PROC,
            libc::KERN_PROC_PGRP,
            pgid as libc::c_int,
        ];
        let mut size: libc::size_t = 0;

        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as libc::c_uint,
                std::ptr::null_mut(),
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        if rc != 0 {
            return Err(anyhow!(
                "sysctl kern.proc.pgrp: {}",
                std::io::Error::last_os_error()
            ));
        }

        Ok(size / std::mem::size_of::<libc::kinfo_proc>())
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use anyhow::{anyhow, Context, Result};
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    pub(super) fn wait(pid: i32) -> Result<WaitStatus> {
        let mut leader = None;

        loop {
            match waitpid(Pid::from_raw(-pid), None) {
                Ok(status) => {
                    if status.pid() == Some(Pid::from_raw(pid)) {
                        leader = Some(status);
                    }
                }
                Err(Errno::ECHILD) => break,
                Err(err) => return Err(err).context("wait4"),
            }
        }

        leader.ok_or_else(|| anyhow!("process {} was already reaped", pid))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use super::*;

    #[test]
    fn test_wait_exit() {
        let child = Command::new("/bin/sh")
            .args(["-c", "exit 42"])
            .process_group(0)
            .spawn()
            .unwrap();

        let status = wait(child.id() as i32).unwrap();
        assert_eq!(exit_code(status), 42);
    }

    #[test]
    fn test_wait_kill() {
        let child = Command::new("/bin/sh")
            .args(["-c", "sleep 60"])
            .process_group(0)
            .spawn()
            .unwrap();

        kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL).unwrap();

        let status = wait(child.id() as i32).unwrap();
        assert_eq!(exit_code(status), libc::SIGKILL as u32);
    }

    #[test]
    fn test_wait_group() {
        // The whole group is drained, not just the leader.
        let child = Command::new("/bin/sh")
            .args(["-c", "sleep 30 & exit 7"])
            .process_group(0)
            .spawn()
            .unwrap();

        let status = wait(child.id() as i32).unwrap();
        assert_eq!(exit_code(status), 7);
    }
}
