// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Applies and undoes the mount list computed for a container rootfs.
//!
//! Mounting goes through the platform helpers (`bindfs` for directory
//! binds, `/sbin/mount` for everything else); unmounting talks to the
//! kernel directly so `MNT_FORCE` can be applied.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mount {
    pub mount_type: String,
    pub source: String,
    pub target: PathBuf,
    pub options: Vec<String>,
}

pub fn mount_all(mounts: &[Mount]) -> Result<()> {
    for m in mounts {
        apply(m).with_context(|| format!("mount {} on {:?}", m.source, m.target))?;
    }

    Ok(())
}

fn apply(m: &Mount) -> Result<()> {
    let mut cmd = if m.mount_type == "bind" {
        let mut cmd = Command::new("bindfs");
        if !m.options.is_empty() {
            cmd.arg("-o").arg(m.options.join(","));
        }
        cmd.arg(&m.source).arg(&m.target);
        cmd
    } else {
        let mut cmd = Command::new("/sbin/mount");
        cmd.arg("-t").arg(&m.mount_type);
        if !m.options.is_empty() {
            cmd.arg("-o").arg(m.options.join(","));
        }
        cmd.arg(&m.source).arg(&m.target);
        cmd
    };

    let output = cmd.output().context("run mount helper")?;
    if !output.status.success() {
        return Err(anyhow!(
            "mount helper failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(())
}

/// Force-unmount every filesystem mounted at or below `root`, deepest
/// first. Paths that are not mount points are skipped silently.
pub fn unmount_recursive(root: &Path) -> Result<()> {
    let mut targets = mounts_under(root)?;
    targets.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    for target in targets {
        unmount(&target).with_context(|| format!("unmount {:?}", target))?;
    }

    Ok(())
}

#[cfg(target_os = "macos")]
fn unmount(target: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let path = std::ffi::CString::new(target.as_os_str().as_bytes()).context("target path")?;
    let rc = unsafe { libc::unmount(path.as_ptr(), libc::MNT_FORCE) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount(target: &Path) -> Result<()> {
    use nix::mount::{umount2, MntFlags};

    umount2(target, MntFlags::MNT_FORCE)?;

    Ok(())
}

#[cfg(target_os = "macos")]
fn mounts_under(root: &Path) -> Result<Vec<PathBuf>> {
    use std::ffi::CStr;
    use std::mem;
    use std::os::unix::ffi::OsStrExt;

    let count = unsafe { libc::getfsstat(std::ptr::null_mut(), 0, libc::MNT_NOWAIT) };
    if count < 0 {
        return Err(std::io::Error::last_os_error()).context("getfsstat");
    }

    let mut stats: Vec<libc::statfs> = Vec::with_capacity(count as usize);
    let bufsize = (count as usize * mem::size_of::<libc::statfs>()) as libc::c_int;
    let count = unsafe { libc::getfsstat(stats.as_mut_ptr(), bufsize, libc::MNT_NOWAIT) };
    if count < 0 {
        return Err(std::io::Error::last_os_error()).context("getfsstat");
    }
    unsafe { stats.set_len(count as usize) };

    let mounts = stats
        .iter()
        .map(|s| {
            let name = unsafe { CStr::from_ptr(s.f_mntonname.as_ptr()) };
            PathBuf::from(std::ffi::OsStr::from_bytes(name.to_bytes()))
        })
        .filter(|p| p.starts_with(root))
        .collect();

    Ok(mounts)
}

#[cfg(target_os = "linux")]
fn mounts_under(root: &Path) -> Result<Vec<PathBuf>> {
    let info = std::fs::read_to_string("/proc/self/mountinfo").context("read mountinfo")?;

    let mounts = info
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(PathBuf::from)
        .filter(|p| p.starts_with(root))
        .collect();

    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmount_recursive_without_mounts() {
        let dir = tempfile::tempdir().unwrap();
        unmount_recursive(dir.path()).unwrap();
    }

    #[test]
    fn test_mounts_under_filters_prefix() {
        let dir = tempfile::tempdir().unwrap();
        assert!(mounts_under(dir.path()).unwrap().is_empty());
        assert!(!mounts_under(Path::new("/")).unwrap().is_empty());
    }
}
