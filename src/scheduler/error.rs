/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the scheduling loop.

use thiserror::Error;

use crate::cluster::ClusterError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// An application reached `start` with an unplaced task container.  Fatal
    /// for the run; the queue drain stops and the operator sees the name.
    #[error("a task container of application '{app}' is not placed on any node")]
    NotCorrectlyScheduled { app: String },

    /// No peeked application fits the available capacity.  Local to one drain
    /// pass; the next completion re-enters the scheduler.
    #[error("no queued application fits the available capacity")]
    NoApplicationCanBeScheduled,

    /// The external runner process could not be spawned.
    #[error("failed to launch application '{app}'")]
    LaunchFailed {
        app: String,
        #[source]
        source: anyhow::Error,
    },

    /// Bookkeeping violation inside placement.  Always a scheduler bug.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}
