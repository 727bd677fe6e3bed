// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "service"))
    };
}

mod event;
mod task_service;

pub use event::spawn_forwarder;
pub use task_service::TaskService;
