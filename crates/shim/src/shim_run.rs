// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use anyhow::{Context, Result};
use containerd_shim_protos::shim_async;
use tokio::sync::Notify;
use ttrpc::asynchronous::Server;

use runtimes::TaskManager;
use service::{spawn_forwarder, TaskService};

use crate::shim::socket_file;
use crate::{logger, ShimExecutor, SOCKET_FD};

impl ShimExecutor {
    /// The long-running action: serve the task API on the socket inherited
    /// from the manager until the registry drains and Shutdown fires.
    pub fn run(&mut self) -> Result<()> {
        self.args.validate().context("validate")?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("build runtime")?;

        runtime.block_on(self.do_run())
    }

    async fn do_run(&mut self) -> Result<()> {
        let _logger_guard =
            logger::set_logger("log", &self.args.id, self.args.debug).context("set logger")?;

        info!(sl!(), "shim starts";
            "id" => &self.args.id, "namespace" => &self.args.namespace);

        let shutdown = Arc::new(Notify::new());
        let (manager, events) = TaskManager::new(shutdown.clone());
        spawn_forwarder(self.args.namespace.clone(), events);

        let service = TaskService::new(Arc::new(manager));
        let task_service = shim_async::create_task(Arc::new(service));

        let mut server = Server::new()
            .add_listener(SOCKET_FD)
            .context("add listener")?
            .register_service(task_service);
        server.start().await.context("start ttrpc server")?;

        info!(sl!(), "task server started");

        shutdown.notified().await;
        info!(sl!(), "shutting down");

        if let Err(err) = server.shutdown().await {
            warn!(sl!(), "failed to shutdown server: {:?}", err);
        }

        // Leave no socket behind so a later start can bind afresh.
        if let Ok(address) = self.socket_address(&self.args.id) {
            if let Ok(file_path) = socket_file(&address) {
                let _ = std::fs::remove_file(file_path);
            }
        }

        Ok(())
    }
}
