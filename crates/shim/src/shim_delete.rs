// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use containerd_shim_protos::api::DeleteResponse;
use containerd_shim_protos::protobuf::{Message, MessageField};

use runtimes::mount;
use runtimes::types::to_timestamp;

use crate::{Error, ShimExecutor};

impl ShimExecutor {
    /// The supervisor-facing `delete` action: clean up whatever a dead shim
    /// left behind. Best-effort by contract, the response always reports a
    /// SIGKILL exit at the current time.
    pub fn delete(&mut self) -> Result<()> {
        self.args.validate().context("validate")?;

        let rsp = self.do_cleanup().context("do cleanup")?;
        rsp.write_to_writer(&mut std::io::stdout())
            .context(Error::FileWrite(format!("write {:?} to stdout", rsp)))?;

        Ok(())
    }

    fn do_cleanup(&self) -> Result<DeleteResponse> {
        let mut rsp = DeleteResponse::new();
        rsp.exit_status = 128 + libc::SIGKILL as u32;
        rsp.exited_at = MessageField::some(to_timestamp(SystemTime::now()));

        // The bundle is the sibling of the working directory named after
        // the container.
        let cwd = self.get_bundle_path()?;
        let bundle = cwd
            .parent()
            .unwrap_or_else(|| cwd.as_path())
            .join(&self.args.id);

        match self.load_oci_spec(&bundle) {
            Ok(spec) => {
                let rootfs = resolve_rootfs(&spec, &bundle);
                if let Err(err) = mount::unmount_recursive(&rootfs) {
                    warn!(sl!(), "failed to cleanup rootfs mount: {:?}", err);
                }
            }
            Err(err) => {
                warn!(sl!(), "failed to load bundle spec: {:?}", err);
            }
        }

        Ok(rsp)
    }
}

fn resolve_rootfs(spec: &oci_spec::runtime::Spec, bundle: &std::path::Path) -> PathBuf {
    let root_path = spec
        .root()
        .as_ref()
        .map(|root| root.path().clone())
        .unwrap_or_else(|| PathBuf::from("rootfs"));

    if root_path.is_absolute() {
        root_path
    } else {
        bundle.join(root_path)
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::Args;

    #[test]
    #[serial]
    fn test_shim_delete() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let args = Args {
            id: "c1".to_string(),
            namespace: "ns1".to_string(),
            address: "containerd_socket".to_string(),
            bundle: dir.path().to_str().unwrap().to_string(),
            debug: false,
        };
        let executor = ShimExecutor::new(args);

        let rsp = executor.do_cleanup().unwrap();
        assert_eq!(rsp.exit_status, 128 + libc::SIGKILL as u32);
        assert!(rsp.exited_at.as_ref().unwrap().seconds > 0);
    }
}
