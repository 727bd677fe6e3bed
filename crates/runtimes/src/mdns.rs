// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Relays bonjour lookups from inside the rootfs to the host resolver.
//!
//! The host socket cannot be hard-linked into the chroot (cross-device), so
//! a listener is bound at the container-relative path and every accepted
//! connection is proxied message by message, ancillary payload included.

use std::fs::DirBuilder;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use nix::sys::socket::{
    recvmsg, sendmsg, shutdown, ControlMessage, ControlMessageOwned, MsgFlags, Shutdown, UnixAddr,
};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

pub const MDNS_RESPONDER_SOCKET: &str = "/var/run/mDNSResponder";

/// Capacity of `sockaddr_un.sun_path` on Darwin.
pub const MAX_SOCKET_PATH_LEN: usize = 104;

/// The in-rootfs socket path, shortened to its working-directory-relative
/// form when the absolute one does not fit a socket address.
pub fn socket_path(rootfs: &Path, cwd: &Path) -> Result<PathBuf> {
    let absolute = rootfs.join("var/run/mDNSResponder");
    if absolute.as_os_str().len() <= MAX_SOCKET_PATH_LEN {
        return Ok(absolute);
    }

    if let Ok(relative) = absolute.strip_prefix(cwd) {
        if relative.as_os_str().len() <= MAX_SOCKET_PATH_LEN {
            return Ok(relative.to_path_buf());
        }
    }

    Err(anyhow!(
        "mDNS socket path {:?} exceeds {} bytes",
        absolute,
        MAX_SOCKET_PATH_LEN
    ))
}

/// A listening relay endpoint inside a container rootfs.
pub struct MdnsProxy {
    path: PathBuf,
    handle: JoinHandle<()>,
}

impl MdnsProxy {
    /// Create `var/run` beneath the rootfs, bind the listener and start
    /// accepting.
    pub fn start(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)
                .with_context(|| format!("create {:?}", parent))?;
        }

        // A socket file left behind by an earlier run would fail the bind.
        let _ = std::fs::remove_file(path);

        let listener =
            std::os::unix::net::UnixListener::bind(path).with_context(|| format!("bind {:?}", path))?;
        listener.set_nonblocking(true).context("set nonblocking")?;
        let listener = UnixListener::from_std(listener).context("register listener")?;

        let handle = tokio::spawn(accept_loop(listener));

        Ok(Self {
            path: path.to_path_buf(),
            handle,
        })
    }

    /// Stop accepting and remove the socket file. In-flight relays run
    /// until their connections drop.
    pub fn shutdown(&self) {
        self.handle.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((client, _)) => {
                tokio::spawn(async move {
                    if let Err(err) = relay_connection(client).await {
                        warn!(sl!(), "mdns relay finished: {:?}", err);
                    }
                });
            }
            Err(err) => {
                warn!(sl!(), "mdns accept failed: {:?}", err);
                return;
            }
        }
    }
}

async fn relay_connection(client: tokio::net::UnixStream) -> Result<()> {
    let client = client.into_std().context("client stream")?;
    client.set_nonblocking(false).context("client blocking")?;

    let host =
        StdUnixStream::connect(MDNS_RESPONDER_SOCKET).context("dial host mDNSResponder")?;

    let client_rx = client.try_clone().context("clone client")?;
    let host_tx = host.try_clone().context("clone host")?;

    let inbound = tokio::task::spawn_blocking(move || relay_messages(client_rx, host_tx));
    let outbound = tokio::task::spawn_blocking(move || relay_messages(host, client));

    let _ = inbound.await;
    let _ = outbound.await;

    Ok(())
}

/// Copy unix messages from `from` to `to` until either side goes away,
/// forwarding any file descriptors riding along in the control data.
fn relay_messages(from: StdUnixStream, to: StdUnixStream) {
    let mut buf = [0u8; 8192];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 8]);

    loop {
        let (len, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match recvmsg::<UnixAddr>(
                from.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(_) => break,
            };

            let fds: Vec<RawFd> = msg
                .cmsgs()
                .filter_map(|cmsg| match cmsg {
                    ControlMessageOwned::ScmRights(fds) => Some(fds),
                    _ => None,
                })
                .flatten()
                .collect();

            (msg.bytes, fds)
        };

        if len == 0 {
            break;
        }

        let cmsgs = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(&fds)]
        };

        let iov = [IoSlice::new(&buf[..len])];
        let sent = sendmsg(
            to.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None::<&UnixAddr>,
        );

        for fd in fds {
            let _ = nix::unistd::close(fd);
        }

        if sent.is_err() {
            break;
        }
    }

    let _ = shutdown(from.as_raw_fd(), Shutdown::Both);
    let _ = shutdown(to.as_raw_fd(), Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn test_socket_path_fits() {
        let rootfs = Path::new("/tmp/bundle/rootfs");
        let path = socket_path(rootfs, Path::new("/tmp/bundle")).unwrap();
        assert_eq!(path, rootfs.join("var/run/mDNSResponder"));
        assert!(path.as_os_str().len() <= MAX_SOCKET_PATH_LEN);
    }

    #[test]
    fn test_socket_path_shortened() {
        let cwd = PathBuf::from(format!("/private/tmp/{}", "x".repeat(90)));
        let rootfs = cwd.join("rootfs");
        let path = socket_path(&rootfs, &cwd).unwrap();
        assert_eq!(path, Path::new("rootfs/var/run/mDNSResponder"));
        assert!(path.as_os_str().len() <= MAX_SOCKET_PATH_LEN);
    }

    #[test]
    fn test_socket_path_too_long() {
        let cwd = PathBuf::from(format!("/private/tmp/{}", "x".repeat(90)));
        let rootfs = cwd.join("r".repeat(120));
        assert!(socket_path(&rootfs, Path::new("/elsewhere")).is_err());
    }

    #[test]
    fn test_relay_messages_copies_payload() {
        let (client, client_peer) = StdUnixStream::pair().unwrap();
        let (host, host_peer) = StdUnixStream::pair().unwrap();

        let relay = std::thread::spawn(move || relay_messages(client_peer, host));

        let mut client = client;
        client.write_all(b"lookup example.local").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let mut host_peer = host_peer;
        let mut received = Vec::new();
        host_peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"lookup example.local");

        relay.join().unwrap();
    }

    #[tokio::test]
    async fn test_proxy_binds_and_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rootfs/var/run/mDNSResponder");

        let proxy = MdnsProxy::start(&path).unwrap();
        assert!(path.exists());
        assert!(StdUnixStream::connect(&path).is_ok());

        proxy.shutdown();
        assert!(!path.exists());
    }
}
