// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use async_trait::async_trait;
use containerd_shim_protos::protobuf::EnumOrUnknown;
use containerd_shim_protos::{api, shim_async};
use ttrpc::error::get_rpc_status;
use ttrpc::r#async::TtrpcContext;
use ttrpc::Code;

use runtimes::mount::Mount;
use runtimes::types::{to_timestamp, CreateConfig, ExecConfig, ProcessStatus, StateInfo};
use runtimes::{Error, TaskManager};

/// The ttrpc-facing adapter: decodes requests, hands them to the task
/// manager and encodes typed results and error kinds back onto the wire.
pub struct TaskService {
    manager: Arc<TaskManager>,
}

impl TaskService {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }

    async fn do_create(&self, req: api::CreateTaskRequest) -> ttrpc::Result<api::CreateTaskResponse> {
        let rootfs_mounts = req
            .rootfs
            .iter()
            .map(|m| Mount {
                mount_type: m.type_.clone(),
                source: m.source.clone(),
                target: m.target.clone().into(),
                options: m.options.to_vec(),
            })
            .collect();

        let config = CreateConfig {
            container_id: req.id.clone(),
            bundle: req.bundle.clone(),
            rootfs_mounts,
            stdin: req.stdin.clone(),
            stdout: req.stdout.clone(),
            stderr: req.stderr.clone(),
            terminal: req.terminal,
        };

        self.manager.create(config).await.map_err(to_rpc_status)?;

        Ok(api::CreateTaskResponse::default())
    }

    async fn do_start(&self, req: api::StartRequest) -> ttrpc::Result<api::StartResponse> {
        let pid = self
            .manager
            .start(&req.id, &req.exec_id)
            .await
            .map_err(to_rpc_status)?;

        Ok(api::StartResponse {
            pid,
            ..Default::default()
        })
    }

    async fn do_state(&self, req: api::StateRequest) -> ttrpc::Result<api::StateResponse> {
        let state = self
            .manager
            .state(&req.id, &req.exec_id)
            .await
            .map_err(to_rpc_status)?;

        Ok(to_state_response(state))
    }

    async fn do_exec(&self, req: api::ExecProcessRequest) -> ttrpc::Result<api::Empty> {
        let config = ExecConfig {
            container_id: req.id.clone(),
            exec_id: req.exec_id.clone(),
            stdin: req.stdin.clone(),
            stdout: req.stdout.clone(),
            stderr: req.stderr.clone(),
            terminal: req.terminal,
            spec_type_url: req.spec.type_url.clone(),
            spec_value: req.spec.value.to_vec(),
        };

        self.manager.exec(config).await.map_err(to_rpc_status)?;

        Ok(api::Empty::new())
    }

    async fn do_kill(&self, req: api::KillRequest) -> ttrpc::Result<api::Empty> {
        self.manager
            .kill(&req.id, &req.exec_id, req.signal)
            .await
            .map_err(to_rpc_status)?;

        Ok(api::Empty::new())
    }

    async fn do_resize_pty(&self, req: api::ResizePtyRequest) -> ttrpc::Result<api::Empty> {
        self.manager
            .resize_pty(&req.id, &req.exec_id, req.width, req.height)
            .await
            .map_err(to_rpc_status)?;

        Ok(api::Empty::new())
    }

    async fn do_close_io(&self, req: api::CloseIORequest) -> ttrpc::Result<api::Empty> {
        self.manager
            .close_io(&req.id, &req.exec_id)
            .await
            .map_err(to_rpc_status)?;

        Ok(api::Empty::new())
    }

    async fn do_wait(&self, req: api::WaitRequest) -> ttrpc::Result<api::WaitResponse> {
        let exit = self
            .manager
            .wait(&req.id, &req.exec_id)
            .await
            .map_err(to_rpc_status)?;

        Ok(api::WaitResponse {
            exit_status: exit.exit_code,
            exited_at: exit.exited_at.map(to_timestamp).into(),
            ..Default::default()
        })
    }

    async fn do_delete(&self, req: api::DeleteRequest) -> ttrpc::Result<api::DeleteResponse> {
        let (pid, exit) = self
            .manager
            .delete(&req.id, &req.exec_id)
            .await
            .map_err(to_rpc_status)?;

        Ok(api::DeleteResponse {
            pid,
            exit_status: exit.exit_code,
            exited_at: exit.exited_at.map(to_timestamp).into(),
            ..Default::default()
        })
    }

    async fn do_connect(&self, req: api::ConnectRequest) -> ttrpc::Result<api::ConnectResponse> {
        let (shim_pid, task_pid) = self
            .manager
            .connect(&req.id)
            .await
            .map_err(to_rpc_status)?;

        Ok(api::ConnectResponse {
            shim_pid,
            task_pid,
            ..Default::default()
        })
    }

    async fn do_shutdown(&self, _req: api::ShutdownRequest) -> ttrpc::Result<api::Empty> {
        self.manager.shutdown().await.map_err(to_rpc_status)?;

        Ok(api::Empty::new())
    }
}

#[async_trait]
impl shim_async::Task for TaskService {
    async fn state(
        &self,
        _ctx: &TtrpcContext,
        req: api::StateRequest,
    ) -> ttrpc::Result<api::StateResponse> {
        debug!(sl!(), "====> state: {:?}", req);
        let rsp = self.do_state(req).await;
        debug!(sl!(), "<==== state: {:?}", rsp);
        rsp
    }

    async fn create(
        &self,
        _ctx: &TtrpcContext,
        req: api::CreateTaskRequest,
    ) -> ttrpc::Result<api::CreateTaskResponse> {
        debug!(sl!(), "====> create: {:?}", req);
        let rsp = self.do_create(req).await;
        debug!(sl!(), "<==== create: {:?}", rsp);
        rsp
    }

    async fn start(
        &self,
        _ctx: &TtrpcContext,
        req: api::StartRequest,
    ) -> ttrpc::Result<api::StartResponse> {
        debug!(sl!(), "====> start: {:?}", req);
        let rsp = self.do_start(req).await;
        debug!(sl!(), "<==== start: {:?}", rsp);
        rsp
    }

    async fn delete(
        &self,
        _ctx: &TtrpcContext,
        req: api::DeleteRequest,
    ) -> ttrpc::Result<api::DeleteResponse> {
        debug!(sl!(), "====> delete: {:?}", req);
        let rsp = self.do_delete(req).await;
        debug!(sl!(), "<==== delete: {:?}", rsp);
        rsp
    }

    async fn pids(
        &self,
        _ctx: &TtrpcContext,
        req: api::PidsRequest,
    ) -> ttrpc::Result<api::PidsResponse> {
        debug!(sl!(), "====> pids: {:?}", req);
        Err(unimplemented("Pids"))
    }

    async fn pause(&self, _ctx: &TtrpcContext, req: api::PauseRequest) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> pause: {:?}", req);
        Err(unimplemented("Pause"))
    }

    async fn resume(
        &self,
        _ctx: &TtrpcContext,
        req: api::ResumeRequest,
    ) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> resume: {:?}", req);
        Err(unimplemented("Resume"))
    }

    async fn checkpoint(
        &self,
        _ctx: &TtrpcContext,
        req: api::CheckpointTaskRequest,
    ) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> checkpoint: {:?}", req);
        Err(unimplemented("Checkpoint"))
    }

    async fn kill(&self, _ctx: &TtrpcContext, req: api::KillRequest) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> kill: {:?}", req);
        let rsp = self.do_kill(req).await;
        debug!(sl!(), "<==== kill: {:?}", rsp);
        rsp
    }

    async fn exec(
        &self,
        _ctx: &TtrpcContext,
        req: api::ExecProcessRequest,
    ) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> exec: {:?}", req);
        let rsp = self.do_exec(req).await;
        debug!(sl!(), "<==== exec: {:?}", rsp);
        rsp
    }

    async fn resize_pty(
        &self,
        _ctx: &TtrpcContext,
        req: api::ResizePtyRequest,
    ) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> resize_pty: {:?}", req);
        let rsp = self.do_resize_pty(req).await;
        debug!(sl!(), "<==== resize_pty: {:?}", rsp);
        rsp
    }

    async fn close_io(
        &self,
        _ctx: &TtrpcContext,
        req: api::CloseIORequest,
    ) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> close_io: {:?}", req);
        let rsp = self.do_close_io(req).await;
        debug!(sl!(), "<==== close_io: {:?}", rsp);
        rsp
    }

    async fn update(
        &self,
        _ctx: &TtrpcContext,
        req: api::UpdateTaskRequest,
    ) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> update: {:?}", req);
        Err(unimplemented("Update"))
    }

    async fn wait(
        &self,
        _ctx: &TtrpcContext,
        req: api::WaitRequest,
    ) -> ttrpc::Result<api::WaitResponse> {
        debug!(sl!(), "====> wait: {:?}", req);
        let rsp = self.do_wait(req).await;
        debug!(sl!(), "<==== wait: {:?}", rsp);
        rsp
    }

    async fn stats(
        &self,
        _ctx: &TtrpcContext,
        req: api::StatsRequest,
    ) -> ttrpc::Result<api::StatsResponse> {
        debug!(sl!(), "====> stats: {:?}", req);
        Err(unimplemented("Stats"))
    }

    async fn connect(
        &self,
        _ctx: &TtrpcContext,
        req: api::ConnectRequest,
    ) -> ttrpc::Result<api::ConnectResponse> {
        debug!(sl!(), "====> connect: {:?}", req);
        let rsp = self.do_connect(req).await;
        debug!(sl!(), "<==== connect: {:?}", rsp);
        rsp
    }

    async fn shutdown(
        &self,
        _ctx: &TtrpcContext,
        req: api::ShutdownRequest,
    ) -> ttrpc::Result<api::Empty> {
        debug!(sl!(), "====> shutdown: {:?}", req);
        let rsp = self.do_shutdown(req).await;
        debug!(sl!(), "<==== shutdown: {:?}", rsp);
        rsp
    }
}

fn to_state_response(state: StateInfo) -> api::StateResponse {
    api::StateResponse {
        id: state.container_id,
        bundle: state.bundle,
        pid: state.pid,
        status: to_status(state.status),
        stdin: state.stdin,
        stdout: state.stdout,
        stderr: state.stderr,
        terminal: state.terminal,
        exit_status: state.exit.exit_code,
        exited_at: state.exit.exited_at.map(to_timestamp).into(),
        exec_id: state.exec_id,
        ..Default::default()
    }
}

fn to_status(status: ProcessStatus) -> EnumOrUnknown<api::Status> {
    EnumOrUnknown::new(match status {
        ProcessStatus::Created => api::Status::CREATED,
        ProcessStatus::Running => api::Status::RUNNING,
        ProcessStatus::Stopped => api::Status::STOPPED,
    })
}

fn to_rpc_status(err: anyhow::Error) -> ttrpc::Error {
    let code = match err.downcast_ref::<Error>() {
        Some(Error::ContainerNotFound(_)) | Some(Error::ProcessNotFound(_)) => Code::NOT_FOUND,
        Some(Error::ContainerExists(_)) | Some(Error::ProcessExists(_)) => Code::ALREADY_EXISTS,
        Some(Error::InvalidArgument(_)) => Code::INVALID_ARGUMENT,
        Some(Error::FailedPrecondition(_)) => Code::FAILED_PRECONDITION,
        Some(Error::Unimplemented(_)) => Code::UNIMPLEMENTED,
        None => Code::INTERNAL,
    };

    get_rpc_status(code, format!("{:?}", err))
}

fn unimplemented(method: &str) -> ttrpc::Error {
    get_rpc_status(
        Code::UNIMPLEMENTED,
        format!("/containerd.task.v2.Task/{} is not supported", method),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn code_of(err: ttrpc::Error) -> Code {
        match err {
            ttrpc::Error::RpcStatus(status) => status.code(),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_error_kinds_map_to_codes() {
        let cases = [
            (
                anyhow::Error::from(Error::ContainerNotFound("c1".into())),
                Code::NOT_FOUND,
            ),
            (
                anyhow::Error::from(Error::ProcessNotFound("e1".into())),
                Code::NOT_FOUND,
            ),
            (
                anyhow::Error::from(Error::ContainerExists("c1".into())),
                Code::ALREADY_EXISTS,
            ),
            (
                anyhow::Error::from(Error::InvalidArgument("args".into())),
                Code::INVALID_ARGUMENT,
            ),
            (
                anyhow::Error::from(Error::FailedPrecondition("c1".into())),
                Code::FAILED_PRECONDITION,
            ),
            (anyhow!("mount failed"), Code::INTERNAL),
        ];

        for (err, code) in cases {
            assert_eq!(code_of(to_rpc_status(err)), code);
        }
    }

    #[test]
    fn test_error_context_keeps_kind() {
        use anyhow::Context;

        let err = Result::<(), _>::Err(Error::ContainerNotFound("c1".into()))
            .context("get container")
            .unwrap_err();
        assert_eq!(code_of(to_rpc_status(err)), Code::NOT_FOUND);
    }

    #[test]
    fn test_unimplemented_message() {
        let err = unimplemented("Pause");
        match err {
            ttrpc::Error::RpcStatus(status) => {
                assert_eq!(status.code(), Code::UNIMPLEMENTED);
                assert!(status.message().contains("Pause"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
