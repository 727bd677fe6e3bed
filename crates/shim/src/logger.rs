// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::os::unix::fs::OpenOptionsExt;

use anyhow::{Context, Result};
use slog::Drain;

use crate::Error;

/// Install the global json logger writing to the supervisor-provided `log`
/// fifo in the bundle directory. The returned guard flushes the async drain
/// on drop.
pub(crate) fn set_logger(
    path: &str,
    sid: &str,
    is_debug: bool,
) -> Result<slog_async::AsyncGuard> {
    let fifo = std::fs::OpenOptions::new()
        .custom_flags(libc::O_NONBLOCK)
        .create(true)
        .write(true)
        .append(true)
        .open(path)
        .context(Error::FileOpen(path.to_string()))?;

    let level = if is_debug {
        slog::Level::Debug
    } else {
        slog::Level::Info
    };

    let json_drain = slog_json::Json::new(fifo)
        .add_default_keys()
        .build()
        .fuse();
    let filter_drain = json_drain.filter_level(level).fuse();

    let (async_drain, async_guard) = slog_async::Async::new(filter_drain).build_with_guard();

    let logger = slog::Logger::root(
        async_drain.fuse(),
        o!(
            "version" => env!("CARGO_PKG_VERSION"),
            "name" => "containerd-shim-cove-v2",
            "pid" => std::process::id().to_string(),
            "sid" => sid.to_string(),
        ),
    );

    // Not reset when the returned guard drops; the logger lives as long as
    // the shim.
    slog_scope::set_global_logger(logger).cancel_reset();

    let level = if is_debug {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    slog_stdlog::init_with_level(level).context(format!("init stdlog with level {}", level))?;

    Ok(async_guard)
}
