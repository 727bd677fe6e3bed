// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

/// Error kinds that map onto the status codes returned to the supervisor.
/// Everything else surfaces as an internal error with its context chain.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("container {0} not created")]
    ContainerNotFound(String),
    #[error("process {0} not found")]
    ProcessNotFound(String),
    #[error("container {0} already exists")]
    ContainerExists(String),
    #[error("process {0} already exists")]
    ProcessExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("process {0} not in expected state")]
    FailedPrecondition(String),
    #[error("{0} not implemented")]
    Unimplemented(&'static str),
}
