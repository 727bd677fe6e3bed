// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::{SystemTime, UNIX_EPOCH};

use containerd_shim_protos::protobuf::well_known_types::timestamp::Timestamp;

use crate::mount::Mount;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    Created,
    Running,
    Stopped,
}

/// Final exit record of a managed process. `exited_at` is set exactly once,
/// together with the exit code, when the process reaches `Stopped`.
#[derive(Debug, Clone, Default)]
pub struct ProcessExitStatus {
    pub exit_code: u32,
    pub exited_at: Option<SystemTime>,
}

impl ProcessExitStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_exit_code(&mut self, exit_code: u32) {
        self.exit_code = exit_code;
        self.exited_at = Some(SystemTime::now());
    }
}

/// Snapshot returned by the `State` RPC.
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub container_id: String,
    pub exec_id: String,
    pub bundle: String,
    pub pid: u32,
    pub status: ProcessStatus,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    pub exit: ProcessExitStatus,
}

/// Parameters of the `Create` RPC after transport decoding.
#[derive(Debug, Clone)]
pub struct CreateConfig {
    pub container_id: String,
    pub bundle: String,
    pub rootfs_mounts: Vec<Mount>,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

/// Parameters of the `Exec` RPC. The process spec travels as an embedded
/// serialized document next to its type url.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub container_id: String,
    pub exec_id: String,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    pub spec_type_url: String,
    pub spec_value: Vec<u8>,
}

pub fn to_timestamp(time: SystemTime) -> Timestamp {
    let duration = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    Timestamp {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
        ..Default::default()
    }
}
