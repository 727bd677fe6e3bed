// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use containerd_shim::publisher::RemotePublisher;
use containerd_shim::TtrpcContext;
use containerd_shim_protos::protobuf::MessageField;
use containerd_shim_protos::shim::events::ForwardRequest;
use containerd_shim_protos::shim_async::Events;
use tokio::sync::mpsc;
use ttrpc::MessageHeader;

use runtimes::message::{envelope, Event};

// The supervisor hands the events socket over through the environment.
const TTRPC_ADDRESS_ENV: &str = "TTRPC_ADDRESS";

/// Pushes drained lifecycle events up to the supervisor. When no events
/// socket is available the events land in the shim log instead, so a
/// standalone shim keeps a usable trace.
struct EventForwarder {
    namespace: String,
    publisher: Option<RemotePublisher>,
}

impl EventForwarder {
    async fn connect(namespace: String) -> Self {
        let publisher = match env::var(TTRPC_ADDRESS_ENV) {
            Ok(address) if !address.is_empty() => {
                match RemotePublisher::new(&address).await {
                    Ok(publisher) => Some(publisher),
                    Err(err) => {
                        error!(sl!(), "failed to dial events socket {}: {:?}", address, err);
                        None
                    }
                }
            }
            Ok(_) | Err(_) => None,
        };

        if publisher.is_none() {
            info!(sl!(), "no events socket, events go to the shim log");
        }

        Self {
            namespace,
            publisher,
        }
    }

    async fn post(&self, event: Arc<dyn Event + Send + Sync>) -> Result<()> {
        let publisher = match self.publisher.as_ref() {
            Some(publisher) => publisher,
            None => {
                info!(sl!(), "event: {:?}", event;
                    "topic" => event.r#type(), "namespace" => &self.namespace);
                return Ok(());
            }
        };

        let req = ForwardRequest {
            envelope: MessageField::some(
                envelope(event.as_ref(), &self.namespace).context("build event envelope")?,
            ),
            ..Default::default()
        };

        let ctx = TtrpcContext {
            fd: 0,
            mh: MessageHeader::default(),
            metadata: HashMap::default(),
            timeout_nano: 0,
        };
        publisher.forward(&ctx, req).await.context("forward event")?;

        Ok(())
    }
}

/// Drain the task manager's event channel from a single background task;
/// publish failures are logged, never propagated.
pub fn spawn_forwarder(
    namespace: String,
    mut events: mpsc::Receiver<Arc<dyn Event + Send + Sync>>,
) {
    tokio::spawn(async move {
        let forwarder = EventForwarder::connect(namespace).await;

        while let Some(event) = events.recv().await {
            if let Err(err) = forwarder.post(event).await {
                error!(sl!(), "post event: {:?}", err);
            }
        }
    });
}
