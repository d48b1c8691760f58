// SPDX-License-Identifier: MIT
//! Error taxonomy for the multiplexer core (spec §7).
//!
//! Each variant here is a *kind*, not a leaf: callers that need to
//! aggregate this with arbitrary library failures reach for
//! [`anyhow::Error`] instead, exactly as the rest of this crate does at its
//! public boundaries.

use std::time::Duration;

use serde_json::Value;

/// A thin wrapper so `#[from] std::io::Error` can be attached to both
/// [`CoreError::Io`] (generic stream I/O) and [`CoreError::Spawn`] (process
/// launch failure) without an overlapping `From<std::io::Error>` impl.
#[derive(Debug)]
pub struct SpawnIoError(pub std::io::Error);

impl std::fmt::Display for SpawnIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for SpawnIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<std::io::Error> for SpawnIoError {
    fn from(e: std::io::Error) -> Self {
        SpawnIoError(e)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// A structured JSON-RPC error surfaced verbatim from a peer.
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no backend configured for this file")]
    NotConfigured,

    #[error("instance failed: {0}")]
    InstanceFailed(String),

    #[error("no activity for {0:?}")]
    ActivityTimeout(Duration),

    #[error("hard timeout after {0:?}")]
    HardTimeout(Duration),

    #[error("build error: {0}")]
    Build(String),

    #[error("spawn error: {0}")]
    Spawn(#[from] SpawnIoError),
}

impl CoreError {
    /// True for the one transient condition the MCP Bridge retries on:
    /// `code == 0` and the message mentions "no views" (spec §4.9 step 4).
    pub fn is_no_views(&self) -> bool {
        matches!(
            self,
            CoreError::Rpc { code, message, .. }
                if *code == 0 && message.contains("no views")
        )
    }

    /// Maps a core error to a standard JSON-RPC error code for replies the
    /// Handler sends back to the client (spec §7 propagation policy).
    pub fn to_jsonrpc_code(&self) -> i64 {
        match self {
            CoreError::NotConfigured => super::rpc::message::METHOD_NOT_FOUND,
            CoreError::Parse(_) => super::rpc::message::PARSE_ERROR,
            CoreError::Protocol(_) => super::rpc::message::INVALID_REQUEST,
            CoreError::Rpc { code, .. } => *code,
            _ => super::rpc::message::INTERNAL_ERROR,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
