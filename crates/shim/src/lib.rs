// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "shim"))
    };
}

mod logger;
mod shim;
mod shim_delete;
mod shim_run;
mod shim_start;

pub use shim::ShimExecutor;

use std::path::PathBuf;

/// The listening socket the manager hands to the long-running shim child.
pub(crate) const SOCKET_FD: std::os::unix::io::RawFd = 3;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("empty container id")]
    EmptyContainerId,
    #[error("failed to get bundle path: {0}")]
    GetBundlePath(#[source] std::io::Error),
    #[error("failed to open file {0}")]
    FileOpen(String),
    #[error("failed to write file {0}")]
    FileWrite(String),
    #[error("failed to get self exec path: {0}")]
    SelfExec(#[source] std::io::Error),
    #[error("failed to spawn shim child: {0}")]
    SpawnChild(#[source] std::io::Error),
    #[error("failed to bind socket at {1}: {0}")]
    BindSocket(#[source] std::io::Error, PathBuf),
}

/// Command line arguments handed over by the supervisor, as specified by the
/// shim v2 protocol.
#[derive(Debug, Default, Clone)]
pub struct Args {
    /// Id of the container.
    pub id: String,
    /// Namespace that owns the shim.
    pub namespace: String,
    /// Address of the supervisor's main socket.
    pub address: String,
    /// Path to the bundle, set for the delete action.
    pub bundle: String,
    /// Whether to enable debug output in logs.
    pub debug: bool,
}

impl Args {
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() || self.namespace.is_empty() || self.address.is_empty() {
            return Err(Error::InvalidArgument);
        }

        if is_component_dangerous(&self.id) || is_component_dangerous(&self.namespace) {
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }
}

// Only allow ascii alphanumeric characters and '-', '_', '.' and '~' in path
// components derived from caller input.
fn is_component_dangerous(component: &str) -> bool {
    if component.is_empty() {
        return true;
    }

    !component
        .chars()
        .all(|c| matches!(c, '0'..='9' | 'A'..='Z' | 'a'..='z' | '-' | '_' | '.' | '~'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_validate() {
        let mut args = Args {
            id: "1dfc0567".to_string(),
            namespace: "ns1".to_string(),
            address: "/run/containerd/containerd.sock".to_string(),
            bundle: String::new(),
            debug: false,
        };
        args.validate().unwrap();

        args.id = String::new();
        args.validate().unwrap_err();
        args.id = "1dfc0567".to_string();

        args.namespace = String::new();
        args.validate().unwrap_err();
        args.namespace = "ns1/ns2".to_string();
        args.validate().unwrap_err();
        args.namespace = "ns1".to_string();

        args.address = String::new();
        args.validate().unwrap_err();
        args.address = "/run/containerd/containerd.sock".to_string();

        args.validate().unwrap();
    }

    #[test]
    fn test_is_component_dangerous() {
        assert!(is_component_dangerous(""));
        assert!(is_component_dangerous("../.."));
        assert!(is_component_dangerous("id with space"));
        assert!(is_component_dangerous("é"));

        assert!(!is_component_dangerous("avs098-09_8"));
    }
}
