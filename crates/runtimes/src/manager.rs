// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use containerd_shim_protos::events::task::{
    TaskCreate, TaskDelete, TaskExecAdded, TaskExecStarted, TaskExit, TaskIO, TaskStart,
};
use containerd_shim_protos::protobuf::MessageField;
use containerd_shim_protos::types::mount::Mount as ProtoMount;
use nix::sys::signal::Signal;
use oci_spec::runtime as oci;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::container::Container;
use crate::error::Error;
use crate::mdns::MdnsProxy;
use crate::message::Event;
use crate::mount::{self, Mount};
use crate::process::ManagedProcess;
use crate::reaper;
use crate::types::{
    to_timestamp, CreateConfig, ExecConfig, ProcessExitStatus, ProcessStatus, StateInfo,
};

const CONFIG_FILE: &str = "config.json";

/// Sized to absorb event bursts while the forwarder drains asynchronously.
pub const EVENT_CHANNEL_SIZE: usize = 128;

/// The RPC-facing state machine: one registry of containers, one bounded
/// event mailbox, one shutdown handle.
pub struct TaskManager {
    pid: u32,
    containers: Arc<RwLock<HashMap<String, Arc<Container>>>>,
    events: mpsc::Sender<Arc<dyn Event + Send + Sync>>,
    shutdown: Arc<Notify>,
}

impl TaskManager {
    #[allow(clippy::type_complexity)]
    pub fn new(shutdown: Arc<Notify>) -> (Self, mpsc::Receiver<Arc<dyn Event + Send + Sync>>) {
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_SIZE);

        (
            Self {
                pid: std::process::id(),
                containers: Arc::new(RwLock::new(HashMap::new())),
                events,
                shutdown,
            },
            receiver,
        )
    }

    async fn get_container(&self, container_id: &str) -> Result<Arc<Container>> {
        let containers = self.containers.read().await;
        containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()).into())
    }

    pub async fn create(&self, config: CreateConfig) -> Result<()> {
        let mut containers = self.containers.write().await;
        if containers.contains_key(&config.container_id) {
            return Err(Error::ContainerExists(config.container_id).into());
        }

        let config_path = Path::new(&config.bundle).join(CONFIG_FILE);
        let spec = oci::Spec::load(&config_path).map_err(|err| {
            Error::InvalidArgument(format!("load spec {:?}: {}", config_path, err))
        })?;

        let container = Container::new(&config, spec).context("new container")?;

        let mounts = compute_mounts(&config.rootfs_mounts, &container.spec, &container.rootfs)
            .context("compute mounts")?;
        if let Err(err) = mount::mount_all(&mounts) {
            // Everything applied in this call sits below the rootfs.
            if let Err(undo) = mount::unmount_recursive(&container.rootfs) {
                warn!(sl!(), "failed to cleanup rootfs mount: {:?}", undo);
            }
            return Err(err).context("mount rootfs component");
        }

        let event = TaskCreate {
            container_id: config.container_id.clone(),
            bundle: config.bundle.clone(),
            rootfs: config.rootfs_mounts.iter().map(to_proto_mount).collect(),
            io: MessageField::some(TaskIO {
                stdin: config.stdin.clone(),
                stdout: config.stdout.clone(),
                stderr: config.stderr.clone(),
                terminal: config.terminal,
                ..Default::default()
            }),
            ..Default::default()
        };

        containers.insert(container.container_id.clone(), Arc::new(container));
        drop(containers);

        self.publish(Arc::new(event)).await;

        Ok(())
    }

    pub async fn start(&self, container_id: &str, exec_id: &str) -> Result<u32> {
        let container = self.get_container(container_id).await?;
        let mut inner = container.inner.lock().await;

        if exec_id.is_empty() {
            if inner.init.get_status().await != ProcessStatus::Created {
                return Err(Error::FailedPrecondition(container_id.to_string()).into());
            }

            let mdns = MdnsProxy::start(&container.mdns_socket).context("start mDNS proxy")?;
            inner.mdns = Some(mdns);

            let pid = inner.init.start().await.context("start init process")?;

            // TaskStart goes into the mailbox before the reaper exists, so
            // it always precedes the TaskExit of the same process.
            self.publish(Arc::new(TaskStart {
                container_id: container_id.to_string(),
                pid,
                ..Default::default()
            }))
            .await;

            self.spawn_reaper(&mut inner.init);

            Ok(pid)
        } else {
            let exec = inner.get_process_mut(exec_id)?;
            if exec.get_status().await != ProcessStatus::Created {
                return Err(Error::FailedPrecondition(exec_id.to_string()).into());
            }

            let pid = exec.start().await.context("start exec process")?;

            self.publish(Arc::new(TaskExecStarted {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
                pid,
                ..Default::default()
            }))
            .await;

            self.spawn_reaper(exec);

            Ok(pid)
        }
    }

    pub async fn exec(&self, config: ExecConfig) -> Result<()> {
        if config.exec_id.is_empty() {
            return Err(Error::InvalidArgument("empty exec id".into()).into());
        }
        if config.spec_type_url.is_empty() {
            return Err(Error::InvalidArgument("empty process spec type url".into()).into());
        }
        let process_spec: oci::Process = serde_json::from_slice(&config.spec_value)
            .map_err(|err| Error::InvalidArgument(format!("decode process spec: {}", err)))?;

        let container = self.get_container(&config.container_id).await?;
        let mut inner = container.inner.lock().await;
        if inner.execs.contains_key(&config.exec_id) {
            return Err(Error::ProcessExists(config.exec_id).into());
        }

        let process = ManagedProcess::setup(
            &config.container_id,
            &config.exec_id,
            &container.bundle,
            &process_spec,
            &container.rootfs,
            &config.stdin,
            &config.stdout,
            &config.stderr,
        )
        .context("setup exec process")?;
        inner.execs.insert(config.exec_id.clone(), process);
        drop(inner);

        self.publish(Arc::new(TaskExecAdded {
            container_id: config.container_id.clone(),
            exec_id: config.exec_id.clone(),
            ..Default::default()
        }))
        .await;

        Ok(())
    }

    pub async fn kill(&self, container_id: &str, exec_id: &str, signal: u32) -> Result<()> {
        let container = self.get_container(container_id).await?;
        let inner = container.inner.lock().await;
        let process = inner.get_process(exec_id)?;

        let signal = Signal::try_from(signal as i32)
            .map_err(|_| Error::InvalidArgument(format!("signal {}", signal)))?;
        if let Err(err) = process.kill(signal) {
            warn!(sl!(), "failed to signal process: {:?}", err;
                "container_id" => container_id, "exec_id" => exec_id);
        }

        Ok(())
    }

    pub async fn resize_pty(
        &self,
        container_id: &str,
        exec_id: &str,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let container = self.get_container(container_id).await?;
        let inner = container.inner.lock().await;
        let process = inner.get_process(exec_id)?;

        process.resize_pty(width, height).await
    }

    pub async fn close_io(&self, container_id: &str, exec_id: &str) -> Result<()> {
        let container = self.get_container(container_id).await?;
        let inner = container.inner.lock().await;
        let process = inner.get_process(exec_id)?;

        process.close_io().await;

        Ok(())
    }

    /// Block until the target process reaches `Stopped`. No lock is held
    /// while waiting; the completion latch establishes the happens-before
    /// with the reaper's final writes.
    pub async fn wait(&self, container_id: &str, exec_id: &str) -> Result<ProcessExitStatus> {
        let container = self.get_container(container_id).await?;
        let inner = container.inner.lock().await;
        let process = inner.get_process(exec_id)?;
        let (watcher, exit_status) = process.fetch_exit_watcher();
        drop(inner);

        if let Some(mut watcher) = watcher {
            while watcher.changed().await.is_ok() {}
        }

        let status = exit_status.read().await.clone();
        Ok(status)
    }

    pub async fn state(&self, container_id: &str, exec_id: &str) -> Result<StateInfo> {
        let container = self.get_container(container_id).await?;
        let inner = container.inner.lock().await;
        let process = inner.get_process(exec_id)?;

        Ok(process.state().await)
    }

    pub async fn delete(
        &self,
        container_id: &str,
        exec_id: &str,
    ) -> Result<(u32, ProcessExitStatus)> {
        if !exec_id.is_empty() {
            let container = self.get_container(container_id).await?;
            let mut inner = container.inner.lock().await;
            let mut process = inner
                .execs
                .remove(exec_id)
                .ok_or_else(|| Error::ProcessNotFound(exec_id.to_string()))?;
            drop(inner);

            let pid = process.pid();
            process.destroy().await.context("destroy exec process")?;
            let exit = process.exit_status.read().await.clone();

            return Ok((pid, exit));
        }

        let mut containers = self.containers.write().await;
        let container = containers
            .remove(container_id)
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))?;
        drop(containers);

        if let Err(err) = container.destroy().await {
            warn!(sl!(), "failed to destroy container: {:?}", err;
                "container_id" => container_id);
        }

        let inner = container.inner.lock().await;
        let pid = inner.init.pid();
        let exit = inner.init.exit_status.read().await.clone();
        drop(inner);

        self.publish(Arc::new(TaskDelete {
            container_id: container_id.to_string(),
            pid,
            exit_status: exit.exit_code,
            exited_at: exit.exited_at.map(to_timestamp).into(),
            ..Default::default()
        }))
        .await;

        Ok((pid, exit))
    }

    pub async fn connect(&self, container_id: &str) -> Result<(u32, u32)> {
        let task_pid = match self.get_container(container_id).await {
            Ok(container) => container.inner.lock().await.init.pid(),
            Err(_) => 0,
        };

        Ok((self.pid, task_pid))
    }

    /// A no-op while any container is registered; the supervisor retries.
    pub async fn shutdown(&self) -> Result<()> {
        let containers = self.containers.read().await;
        if containers.is_empty() {
            self.shutdown.notify_one();
        }

        Ok(())
    }

    /// One reaper task per started process. It runs without any lock,
    /// records the final state, closes the stdio binding, emits the exit
    /// event and only then fires the completion latch.
    fn spawn_reaper(&self, process: &mut ManagedProcess) {
        let pid = process.pid();
        let container_id = process.container_id.clone();
        let exec_id = process.exec_id.clone();
        let status = process.status.clone();
        let exit_status = process.exit_status.clone();
        let io = process.io.clone();
        let console = process.console.clone();
        let exit_notifier = process.take_exit_notifier();
        let events = self.events.clone();
        let logger = sl!().new(o!(
            "container_id" => container_id.clone(),
            "exec_id" => exec_id.clone(),
            "pid" => pid,
        ));

        tokio::spawn(async move {
            let exit_code =
                match tokio::task::spawn_blocking(move || reaper::wait(pid as i32)).await {
                    Ok(Ok(wait_status)) => reaper::exit_code(wait_status),
                    Ok(Err(err)) => {
                        error!(logger, "failed to collect exit status: {:?}", err);
                        libc::SIGKILL as u32
                    }
                    Err(err) => {
                        error!(logger, "reaper task failed: {:?}", err);
                        libc::SIGKILL as u32
                    }
                };

            exit_status.write().await.update_exit_code(exit_code);
            *status.write().await = ProcessStatus::Stopped;

            io.lock().await.close();
            console.lock().await.take();

            let exited_at = exit_status.read().await.exited_at;
            let event = TaskExit {
                container_id: container_id.clone(),
                id: if exec_id.is_empty() {
                    container_id
                } else {
                    exec_id
                },
                pid,
                exit_status: exit_code,
                exited_at: exited_at.map(to_timestamp).into(),
                ..Default::default()
            };
            if let Err(err) = events.send(Arc::new(event)).await {
                error!(logger, "post exit event: {:?}", err);
            }

            drop(exit_notifier);
        });
    }

    async fn publish(&self, event: Arc<dyn Event + Send + Sync>) {
        if let Err(err) = self.events.send(event).await {
            error!(sl!(), "post event: {:?}", err);
        }
    }
}

fn to_proto_mount(m: &Mount) -> ProtoMount {
    ProtoMount {
        type_: m.mount_type.clone(),
        source: m.source.clone(),
        target: m.target.display().to_string(),
        options: m.options.clone(),
        ..Default::default()
    }
}

/// Effective mount list for a container: the supervisor's rootfs entries
/// first, the spec's own mounts after. Directory binds and devfs pass
/// through, everything else is skipped.
fn compute_mounts(rootfs_mounts: &[Mount], spec: &oci::Spec, rootfs: &Path) -> Result<Vec<Mount>> {
    let mut mounts = Vec::new();

    for m in rootfs_mounts {
        push_mount(
            &mut mounts,
            &m.mount_type,
            &m.source,
            rootfs.to_path_buf(),
            &m.options,
        )?;
    }

    if let Some(spec_mounts) = spec.mounts().as_ref() {
        for m in spec_mounts {
            let mount_type = m.typ().as_ref().cloned().unwrap_or_default();
            let source = m
                .source()
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let destination = m.destination();
            let target = rootfs.join(
                destination
                    .strip_prefix("/")
                    .unwrap_or(destination.as_path()),
            );
            let options = m.options().as_ref().cloned().unwrap_or_default();

            push_mount(&mut mounts, &mount_type, &source, target, &options)?;
        }
    }

    Ok(mounts)
}

fn push_mount(
    mounts: &mut Vec<Mount>,
    mount_type: &str,
    source: &str,
    target: PathBuf,
    options: &[String],
) -> Result<()> {
    match mount_type {
        // bindfs only handles directories.
        "bind" => match std::fs::metadata(source) {
            Ok(meta) if meta.is_dir() => {
                create_mount_target(&target)?;
                mounts.push(Mount {
                    mount_type: mount_type.to_string(),
                    source: source.to_string(),
                    target,
                    options: options.to_vec(),
                });
            }
            _ => {
                debug!(sl!(), "skipping non-directory bind mount"; "source" => source);
            }
        },
        "devfs" => {
            mounts.push(Mount {
                mount_type: mount_type.to_string(),
                source: source.to_string(),
                target,
                options: options.to_vec(),
            });
        }
        other => {
            warn!(sl!(), "skipping unsupported mount type"; "type" => other);
        }
    }

    Ok(())
}

fn create_mount_target(target: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(target)
        .with_context(|| format!("create mount target {:?}", target))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn write_bundle(dir: &Path, args: &[&str]) -> String {
        let rootfs = dir.join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();

        let args = args
            .iter()
            .map(|a| format!("{:?}", a))
            .collect::<Vec<_>>()
            .join(",");
        let config = format!(
            r#"{{
  "ociVersion": "1.0.2",
  "process": {{"user": {{"uid": 0, "gid": 0}}, "args": [{}], "cwd": "/"}},
  "root": {{"path": "rootfs"}}
}}"#,
            args
        );
        std::fs::write(dir.join("config.json"), config).unwrap();

        dir.to_str().unwrap().to_string()
    }

    fn create_config(id: &str, bundle: &str) -> CreateConfig {
        CreateConfig {
            container_id: id.to_string(),
            bundle: bundle.to_string(),
            rootfs_mounts: Vec::new(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            terminal: false,
        }
    }

    fn exec_config(id: &str, exec_id: &str) -> ExecConfig {
        let spec = r#"{"user": {"uid": 0, "gid": 0}, "args": ["/bin/true"], "cwd": "/"}"#;
        ExecConfig {
            container_id: id.to_string(),
            exec_id: exec_id.to_string(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            terminal: false,
            spec_type_url: "types.containerd.io/opencontainers/runtime-spec/1/Process".to_string(),
            spec_value: spec.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_create_state_delete() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), &["/bin/true"]);
        let shutdown = Arc::new(Notify::new());
        let (manager, mut events) = TaskManager::new(shutdown);

        manager.create(create_config("c1", &bundle)).await.unwrap();
        assert_eq!(events.recv().await.unwrap().r#type(), "/tasks/create");

        let err = manager
            .create(create_config("c1", &bundle))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ContainerExists(_))
        ));

        let state = manager.state("c1", "").await.unwrap();
        assert_eq!(state.status, ProcessStatus::Created);
        assert_eq!(state.pid, 0);
        assert_eq!(state.bundle, bundle);

        let (pid, exit) = manager.delete("c1", "").await.unwrap();
        assert_eq!(pid, 0);
        assert_eq!(exit.exit_code, libc::SIGKILL as u32);
        assert_eq!(events.recv().await.unwrap().r#type(), "/tasks/delete");

        for err in [
            manager.state("c1", "").await.unwrap_err(),
            manager.delete("c1", "").await.unwrap_err(),
            manager.wait("c1", "").await.unwrap_err(),
            manager.kill("c1", "", 9).await.unwrap_err(),
        ] {
            assert!(matches!(
                err.downcast_ref::<Error>(),
                Some(Error::ContainerNotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_gated_on_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), &["/bin/true"]);
        let shutdown = Arc::new(Notify::new());
        let (manager, _events) = TaskManager::new(shutdown.clone());

        manager.create(create_config("c1", &bundle)).await.unwrap();

        manager.shutdown().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), shutdown.notified())
                .await
                .is_err()
        );

        manager.delete("c1", "").await.unwrap();
        manager.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_millis(50), shutdown.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exec_registration() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = write_bundle(dir.path(), &["/bin/sleep", "60"]);
        let shutdown = Arc::new(Notify::new());
        let (manager, mut events) = TaskManager::new(shutdown);

        manager.create(create_config("c1", &bundle)).await.unwrap();
        events.recv().await.unwrap();

        manager.exec(exec_config("c1", "e1")).await.unwrap();
        assert_eq!(events.recv().await.unwrap().r#type(), "/tasks/exec-added");

        let err = manager.exec(exec_config("c1", "e1")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ProcessExists(_))
        ));

        let err = manager.exec(exec_config("c1", "")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidArgument(_))
        ));

        let err = manager
            .exec(exec_config("missing", "e2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ContainerNotFound(_))
        ));

        let state = manager.state("c1", "e1").await.unwrap();
        assert_eq!(state.status, ProcessStatus::Created);
        assert_eq!(state.pid, 0);
        assert_eq!(state.exec_id, "e1");

        let (pid, exit) = manager.delete("c1", "e1").await.unwrap();
        assert_eq!(pid, 0);
        assert_eq!(exit.exit_code, libc::SIGKILL as u32);
        let err = manager.state("c1", "e1").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ProcessNotFound(_))
        ));

        manager.delete("c1", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_reports_shim_pid() {
        let shutdown = Arc::new(Notify::new());
        let (manager, _events) = TaskManager::new(shutdown);

        let (shim_pid, task_pid) = manager.connect("missing").await.unwrap();
        assert_eq!(shim_pid, std::process::id());
        assert_eq!(task_pid, 0);
    }

    #[test]
    fn test_compute_mounts_policy() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();
        let shared = dir.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        let file_source = dir.path().join("file");
        std::fs::write(&file_source, b"x").unwrap();

        let spec = oci::SpecBuilder::default()
            .mounts(vec![
                oci::MountBuilder::default()
                    .destination("/mnt/shared")
                    .typ("bind")
                    .source(shared.clone())
                    .options(vec!["ro".to_string()])
                    .build()
                    .unwrap(),
                oci::MountBuilder::default()
                    .destination("/mnt/file")
                    .typ("bind")
                    .source(file_source)
                    .build()
                    .unwrap(),
                oci::MountBuilder::default()
                    .destination("/dev")
                    .typ("devfs")
                    .source("devfs")
                    .build()
                    .unwrap(),
                oci::MountBuilder::default()
                    .destination("/proc")
                    .typ("procfs")
                    .source("proc")
                    .build()
                    .unwrap(),
            ])
            .build()
            .unwrap();

        let rootfs_mounts = vec![Mount {
            mount_type: "bind".to_string(),
            source: shared.to_str().unwrap().to_string(),
            target: PathBuf::new(),
            options: Vec::new(),
        }];

        let mounts = compute_mounts(&rootfs_mounts, &spec, &rootfs).unwrap();
        assert_eq!(mounts.len(), 3);

        // Supervisor rootfs entries come first and land on the rootfs.
        assert_eq!(mounts[0].target, rootfs);

        assert_eq!(mounts[1].mount_type, "bind");
        assert_eq!(mounts[1].target, rootfs.join("mnt/shared"));
        assert_eq!(mounts[1].options, vec!["ro".to_string()]);
        assert!(rootfs.join("mnt/shared").is_dir());

        assert_eq!(mounts[2].mount_type, "devfs");
        assert_eq!(mounts[2].target, rootfs.join("dev"));
    }
}
