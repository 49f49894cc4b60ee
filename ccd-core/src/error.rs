// SPDX-License-Identifier: GPL-2.0
//
// ccd-core: error taxonomy
//
// Mirrors the error classes spelled out in the design: scan/state/supervisor
// failures are expected to be recoverable by the caller (log and retry next
// tick); the rest are treated as fatal by the binaries that call into us.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CcdError {
    #[error("topology not available: {0}")]
    TopologyNotAvailable(String),

    #[error("invalid CPU list {input:?}: {reason}")]
    InvalidCpuList { input: String, reason: String },

    #[error("failed to load config from {path:?}: {source}")]
    ConfigLoadFailed {
        path: Option<PathBuf>,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to load state from {path:?}: {source}")]
    StateLoadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to save state to {path:?}: {source}")]
    StateSaveFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("init supervisor unavailable: {0}")]
    SupervisorUnavailable(String),

    #[error("init supervisor call {method} on {unit:?} failed: {source}")]
    SupervisorCallFailed {
        method: &'static str,
        unit: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("init supervisor call {method} on {unit:?} exceeded its {deadline:?} deadline")]
    SupervisorCallTimedOut {
        method: &'static str,
        unit: String,
        deadline: std::time::Duration,
    },

    #[error("process scan failed: {0}")]
    ScanFailure(String),

    #[error("timed out waiting for coordinator lock at {0:?}")]
    LockContention(PathBuf),

    #[error("failed to launch child command: {0}")]
    ChildLaunchFailed(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CcdError>;
