// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use oci_spec::runtime as oci;
use sha2::Digest;

use crate::{Args, Error};

const SOCKET_ROOT: &str = "/run/containerd";

/// Command executor for the shim binary: one instance per invocation,
/// driving the `start`, `delete` or long-running action.
pub struct ShimExecutor {
    pub(crate) args: Args,
}

impl ShimExecutor {
    pub fn new(args: Args) -> Self {
        ShimExecutor { args }
    }

    pub(crate) fn load_oci_spec(&self, bundle: &Path) -> Result<oci::Spec> {
        let spec_file = bundle.join("config.json");

        oci::Spec::load(&spec_file).with_context(|| format!("load spec {:?}", spec_file))
    }

    pub(crate) fn write_address(&self, address: &Path) -> Result<()> {
        let dir = self.get_bundle_path()?;
        let file_path = dir.join("address");
        std::fs::write(&file_path, address.as_os_str().as_bytes())
            .context(Error::FileWrite(format!("{:?}", file_path)))
    }

    /// The working directory of a shim invocation is the bundle.
    pub(crate) fn get_bundle_path(&self) -> Result<PathBuf> {
        std::env::current_dir().map_err(|e| Error::GetBundlePath(e).into())
    }

    /// Per-container socket address, derived from the supervisor address,
    /// the namespace and the container id.
    pub(crate) fn socket_address(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() {
            return Err(anyhow!(Error::EmptyContainerId));
        }

        let data = [&self.args.address, &self.args.namespace, id].join("/");
        let mut hasher = sha2::Sha256::new();
        hasher.update(data);
        Ok(PathBuf::from(format!(
            "unix://{}/s/{:X}",
            SOCKET_ROOT,
            hasher.finalize()
        )))
    }
}

/// Map a `unix://` address onto the filesystem path it names.
pub(crate) fn socket_file(address: &Path) -> Result<PathBuf> {
    let trimmed = address
        .strip_prefix("unix:")
        .with_context(|| format!("trim unix prefix from {:?}", address))?;

    Ok(Path::new("/").join(trimmed))
}
