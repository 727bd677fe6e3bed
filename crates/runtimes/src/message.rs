// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::SystemTime;

use anyhow::{Context, Result};
use containerd_shim_protos::events::task::{
    TaskCreate, TaskDelete, TaskExecAdded, TaskExecStarted, TaskExit, TaskStart,
};
use containerd_shim_protos::protobuf::well_known_types::any::Any;
use containerd_shim_protos::protobuf::Message as ProtobufMessage;
use containerd_shim_protos::protobuf::MessageField;
use containerd_shim_protos::shim::events::Envelope;
use containerd_shim_protos::topics::{
    TASK_CREATE_EVENT_TOPIC, TASK_DELETE_EVENT_TOPIC, TASK_EXEC_ADDED_EVENT_TOPIC,
    TASK_EXEC_STARTED_EVENT_TOPIC, TASK_EXIT_EVENT_TOPIC, TASK_START_EVENT_TOPIC,
};

use crate::types::to_timestamp;

const TASK_CREATE_EVENT_URL: &str = "containerd.events.TaskCreate";
const TASK_START_EVENT_URL: &str = "containerd.events.TaskStart";
const TASK_EXEC_ADDED_EVENT_URL: &str = "containerd.events.TaskExecAdded";
const TASK_EXEC_STARTED_EVENT_URL: &str = "containerd.events.TaskExecStarted";
const TASK_EXIT_EVENT_URL: &str = "containerd.events.TaskExit";
const TASK_DELETE_EVENT_URL: &str = "containerd.events.TaskDelete";

/// A lifecycle notification on its way to the supervisor.
pub trait Event: std::fmt::Debug + Send {
    fn r#type(&self) -> String;
    fn type_url(&self) -> String;
    fn value(&self) -> Result<Vec<u8>>;
}

/// Wrap an event in the supervisor's envelope, stamped with the current
/// time and scoped to `namespace`.
pub fn envelope(event: &dyn Event, namespace: &str) -> Result<Envelope> {
    Ok(Envelope {
        topic: event.r#type(),
        namespace: namespace.to_string(),
        timestamp: MessageField::some(to_timestamp(SystemTime::now())),
        event: MessageField::some(Any {
            type_url: event.type_url(),
            value: event.value().context("serialize event")?,
            ..Default::default()
        }),
        ..Default::default()
    })
}

macro_rules! impl_event {
    ($(($event:ty, $topic:expr, $url:expr)),*) => {
        $(impl Event for $event {
            fn r#type(&self) -> String {
                $topic.to_string()
            }

            fn type_url(&self) -> String {
                $url.to_string()
            }

            fn value(&self) -> Result<Vec<u8>> {
                self.write_to_bytes().context("get event value")
            }
        })*
    };
}

impl_event!(
    (TaskCreate, TASK_CREATE_EVENT_TOPIC, TASK_CREATE_EVENT_URL),
    (TaskStart, TASK_START_EVENT_TOPIC, TASK_START_EVENT_URL),
    (TaskExecAdded, TASK_EXEC_ADDED_EVENT_TOPIC, TASK_EXEC_ADDED_EVENT_URL),
    (TaskExecStarted, TASK_EXEC_STARTED_EVENT_TOPIC, TASK_EXEC_STARTED_EVENT_URL),
    (TaskExit, TASK_EXIT_EVENT_TOPIC, TASK_EXIT_EVENT_URL),
    (TaskDelete, TASK_DELETE_EVENT_TOPIC, TASK_DELETE_EVENT_URL)
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topics() {
        let exit = TaskExit {
            container_id: "c1".to_string(),
            id: "c1".to_string(),
            pid: 42,
            exit_status: 0,
            ..Default::default()
        };
        assert_eq!(exit.r#type(), "/tasks/exit");
        assert_eq!(exit.type_url(), "containerd.events.TaskExit");
        assert!(!exit.value().unwrap().is_empty());

        let start = TaskStart {
            container_id: "c1".to_string(),
            pid: 42,
            ..Default::default()
        };
        assert_eq!(start.r#type(), "/tasks/start");
        assert_eq!(start.type_url(), "containerd.events.TaskStart");
    }

    #[test]
    fn test_envelope_wraps_event() {
        let start = TaskStart {
            container_id: "c1".to_string(),
            pid: 7,
            ..Default::default()
        };

        let envelope = envelope(&start, "default").unwrap();
        assert_eq!(envelope.topic, "/tasks/start");
        assert_eq!(envelope.namespace, "default");
        assert!(envelope.timestamp.is_some());
        assert_eq!(envelope.event.type_url, "containerd.events.TaskStart");
        assert!(!envelope.event.value.is_empty());
    }
}
