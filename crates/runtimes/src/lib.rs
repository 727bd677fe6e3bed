// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate slog;

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "runtimes"))
    };
}

#[cfg(test)]
macro_rules! skip_if_not_root {
    () => {
        if !nix::unistd::Uid::effective().is_root() {
            println!("INFO: skipping {} which needs root", module_path!());
            return;
        }
    };
}

pub mod container;
pub mod error;
pub mod manager;
pub mod mdns;
pub mod message;
pub mod mount;
pub mod process;
pub mod reaper;
pub mod stdio;
pub mod types;

pub use error::Error;
pub use manager::TaskManager;
pub use message::Event;
