// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors that escape a component. Per-resource problems (validation,
/// resolution, conflicts) never appear here: they are carried as status
/// conditions on the owning resource and the build proceeds without the
/// broken piece.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The process cannot usefully continue: bind failure, first sync
    /// failure, or an internal invariant broken beyond repair.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The xDS transport failed to start or serve.
    #[error("xds transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A component's single-writer task has already shut down.
    #[error("core task shut down")]
    Shutdown,
}

pub type CoreResult<T> = Result<T, CoreError>;
