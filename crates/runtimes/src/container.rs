// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use oci_spec::runtime as oci;
use tokio::sync::Mutex;

use crate::error::Error;
use crate::mdns::{self, MdnsProxy};
use crate::mount;
use crate::process::ManagedProcess;
use crate::types::CreateConfig;

/// A created container: the parsed spec and derived paths are fixed for its
/// lifetime, the primary process and the exec table change under the
/// container lock.
pub struct Container {
    pub container_id: String,
    pub bundle: String,
    pub spec: oci::Spec,
    pub rootfs: PathBuf,
    pub mdns_socket: PathBuf,
    pub inner: Mutex<ContainerInner>,
}

pub struct ContainerInner {
    pub init: ManagedProcess,
    pub execs: HashMap<String, ManagedProcess>,
    pub mdns: Option<MdnsProxy>,
}

impl ContainerInner {
    /// An empty exec id selects the primary process.
    pub fn get_process(&self, exec_id: &str) -> Result<&ManagedProcess> {
        if exec_id.is_empty() {
            return Ok(&self.init);
        }

        self.execs
            .get(exec_id)
            .ok_or_else(|| Error::ProcessNotFound(exec_id.to_string()).into())
    }

    pub fn get_process_mut(&mut self, exec_id: &str) -> Result<&mut ManagedProcess> {
        if exec_id.is_empty() {
            return Ok(&mut self.init);
        }

        self.execs
            .get_mut(exec_id)
            .ok_or_else(|| Error::ProcessNotFound(exec_id.to_string()).into())
    }
}

impl Container {
    pub fn new(config: &CreateConfig, spec: oci::Spec) -> Result<Self> {
        let rootfs = resolve_rootfs(&spec, &config.bundle)?;

        let cwd = std::env::current_dir().context("current dir")?;
        let mdns_socket = mdns::socket_path(&rootfs, &cwd).context("derive mDNS socket path")?;

        let process_spec = spec
            .process()
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("spec has no process".into()))?;
        let init = ManagedProcess::setup(
            &config.container_id,
            "",
            &config.bundle,
            process_spec,
            &rootfs,
            &config.stdin,
            &config.stdout,
            &config.stderr,
        )
        .context("setup init process")?;

        Ok(Self {
            container_id: config.container_id.clone(),
            bundle: config.bundle.clone(),
            spec,
            rootfs,
            mdns_socket,
            inner: Mutex::new(ContainerInner {
                init,
                execs: HashMap::new(),
                mdns: None,
            }),
        })
    }

    /// Tear everything down. Every step runs even when earlier ones fail;
    /// the failures are reported together.
    pub async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut failures: Vec<String> = Vec::new();

        for (exec_id, exec) in inner.execs.iter_mut() {
            if let Err(err) = exec.destroy().await {
                failures.push(format!("destroy exec {}: {:?}", exec_id, err));
            }
        }
        inner.execs.clear();

        if let Err(err) = inner.init.destroy().await {
            failures.push(format!("destroy init: {:?}", err));
        }

        if let Some(mdns) = inner.mdns.take() {
            mdns.shutdown();
        }
        // A leftover socket file would collide as an irregular file when the
        // rootfs is reused.
        let _ = std::fs::remove_file(&self.mdns_socket);

        if let Err(err) = mount::unmount_recursive(&self.rootfs) {
            failures.push(format!("unmount rootfs: {:?}", err));
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "destroy container {}: {}",
                self.container_id,
                failures.join("; ")
            ))
        }
    }
}

fn resolve_rootfs(spec: &oci::Spec, bundle: &str) -> Result<PathBuf> {
    let root_path = spec
        .root()
        .as_ref()
        .map(|root| root.path().clone())
        .ok_or_else(|| Error::InvalidArgument("spec has no root".into()))?;

    let rootfs = if root_path.is_absolute() {
        root_path
    } else {
        Path::new(bundle).join(root_path)
    };

    rootfs
        .canonicalize()
        .with_context(|| format!("canonicalize rootfs {:?}", rootfs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn test_spec(rootfs: &Path) -> oci::Spec {
        oci::SpecBuilder::default()
            .process(
                oci::ProcessBuilder::default()
                    .args(vec!["/bin/true".to_string()])
                    .cwd("/")
                    .build()
                    .unwrap(),
            )
            .root(
                oci_spec::runtime::RootBuilder::default()
                    .path(rootfs)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn test_config(bundle: &Path) -> CreateConfig {
        CreateConfig {
            container_id: "c1".to_string(),
            bundle: bundle.to_str().unwrap().to_string(),
            rootfs_mounts: Vec::new(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            terminal: false,
        }
    }

    #[tokio::test]
    async fn test_process_routing() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();

        let container = Container::new(&test_config(dir.path()), test_spec(&rootfs)).unwrap();
        assert_eq!(container.rootfs, rootfs.canonicalize().unwrap());

        let inner = container.inner.lock().await;
        assert!(inner.get_process("").is_ok());
        let err = inner.get_process("e1").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ProcessNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_relative_root_resolves_against_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();

        let spec = oci::SpecBuilder::default()
            .process(
                oci::ProcessBuilder::default()
                    .args(vec!["/bin/true".to_string()])
                    .cwd("/")
                    .build()
                    .unwrap(),
            )
            .root(
                oci_spec::runtime::RootBuilder::default()
                    .path("rootfs")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        let container = Container::new(&test_config(dir.path()), spec).unwrap();
        assert_eq!(container.rootfs, rootfs.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();

        let container = Container::new(&test_config(dir.path()), test_spec(&rootfs)).unwrap();
        container.destroy().await.unwrap();

        let inner = container.inner.lock().await;
        assert!(inner.execs.is_empty());
    }
}
