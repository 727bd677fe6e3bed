// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};

use crate::shim::socket_file;
use crate::{Error, ShimExecutor, SOCKET_FD};

impl ShimExecutor {
    /// The supervisor-facing `start` action: bring up the per-container
    /// shim process and report how to reach it.
    pub fn start(&mut self) -> Result<()> {
        self.args.validate().context("validate")?;

        let address = self.do_start().context("do start")?;

        let bootstrap = serde_json::json!({
            "version": 3,
            "address": address.to_str().unwrap_or_default(),
            "protocol": "ttrpc",
        });
        std::io::stdout()
            .write_all(bootstrap.to_string().as_bytes())
            .context("write bootstrap to stdout")?;

        Ok(())
    }

    fn do_start(&mut self) -> Result<PathBuf> {
        let address = self.socket_address(&self.args.id)?;
        let file_path = socket_file(&address)?;

        let listener = match new_listener(&file_path) {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                if can_connect(&file_path) {
                    // A live shim already serves this container.
                    self.write_address(&address)?;
                    return Ok(address);
                }
                fs::remove_file(&file_path).context("remove stale socket")?;
                new_listener(&file_path)
                    .map_err(|e| Error::BindSocket(e, file_path.clone()))
                    .context("create shim socket twice")?
            }
            Err(err) => {
                return Err(Error::BindSocket(err, file_path).into());
            }
        };

        self.write_address(&address)?;

        match self.create_shim_process(listener) {
            Ok(child) => {
                // The child is reaped in the background; its lifetime is
                // governed by the Shutdown RPC, not by this process.
                std::thread::spawn(move || {
                    let mut child = child;
                    let _ = child.wait();
                });
                Ok(address)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path);
                Err(err)
            }
        }
    }

    fn new_command(&self) -> Result<Command> {
        let bundle_path = self.get_bundle_path()?;
        let self_exec = std::env::current_exe().map_err(Error::SelfExec)?;
        let mut command = Command::new(self_exec);

        command
            .current_dir(bundle_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("-namespace")
            .arg(&self.args.namespace)
            .arg("-id")
            .arg(&self.args.id)
            .arg("-address")
            .arg(&self.args.address)
            .env("RUST_BACKTRACE", "1");

        if self.args.debug {
            command.arg("-debug");
        }

        Ok(command)
    }

    fn create_shim_process(&self, listener: UnixListener) -> Result<Child> {
        use std::os::unix::process::CommandExt;

        use nix::fcntl::{fcntl, FcntlArg, FdFlag};
        use nix::unistd::dup2;

        let mut command = self.new_command().context("new command")?;

        let fd = listener.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // The listener must come up as SOCKET_FD with CLOEXEC off.
                if fd == SOCKET_FD {
                    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                } else {
                    dup2(fd, SOCKET_FD)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(Error::SpawnChild)?;
        drop(listener);

        Ok(child)
    }
}

fn new_listener(file_path: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)?;
    }

    UnixListener::bind(file_path)
}

fn can_connect(file_path: &Path) -> bool {
    UnixStream::connect(file_path).is_ok()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::Args;

    #[test]
    #[serial]
    fn test_new_command() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let args = Args {
            id: "sandbox1".to_string(),
            namespace: "ns".to_string(),
            address: "address".to_string(),
            bundle: dir.path().to_str().unwrap().to_string(),
            debug: false,
        };
        let mut executor = ShimExecutor::new(args);

        let cmd = executor.new_command().unwrap();
        assert_eq!(cmd.get_args().len(), 6);
        assert_eq!(cmd.get_envs().len(), 1);
        assert_eq!(
            cmd.get_current_dir().unwrap(),
            executor.get_bundle_path().unwrap()
        );

        executor.args.debug = true;
        let cmd = executor.new_command().unwrap();
        assert_eq!(cmd.get_args().len(), 7);
    }

    #[test]
    fn test_listener_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("s").join("shim.sock");

        let listener = new_listener(&file_path).unwrap();
        assert!(can_connect(&file_path));

        let err = new_listener(&file_path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);

        // A dead socket file is not connectable and gets replaced.
        drop(listener);
        assert!(!can_connect(&file_path));
        fs::remove_file(&file_path).unwrap();
        let _ = new_listener(&file_path).unwrap();
    }
}
