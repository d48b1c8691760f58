// SPDX-License-Identifier: MIT
//! Progress Tracker (spec §4.5): tracks work-done progress tokens reported
//! by a backend and exposes a readiness condition the LSP Instance polls
//! before declaring itself usable.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::rpc::message::RequestId;

#[derive(Debug, Clone)]
pub struct ProgressToken {
    pub title: Option<String>,
    pub message: Option<String>,
    pub percent: Option<u32>,
    pub created_at: Instant,
}

impl ProgressToken {
    fn new() -> Self {
        ProgressToken {
            title: None,
            message: None,
            percent: None,
            created_at: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ProgressValue {
    Begin {
        title: Option<String>,
        message: Option<String>,
        percentage: Option<u32>,
    },
    Report {
        message: Option<String>,
        percentage: Option<u32>,
    },
    End {
        #[allow(dead_code)]
        message: Option<String>,
    },
}

struct Inner {
    tokens: HashMap<RequestId, ProgressToken>,
    last_activity_at: Instant,
}

/// Per-instance tracker of in-flight work-done progress (spec §4.5).
pub struct ProgressTracker {
    inner: Mutex<Inner>,
    ready: Notify,
}

impl ProgressTracker {
    pub fn new() -> Self {
        ProgressTracker {
            inner: Mutex::new(Inner {
                tokens: HashMap::new(),
                last_activity_at: Instant::now(),
            }),
            ready: Notify::new(),
        }
    }

    /// `window/workDoneProgress/create(token)`: inserts an empty token.
    pub fn create(&self, token: RequestId) {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.entry(token).or_insert_with(ProgressToken::new);
        inner.last_activity_at = Instant::now();
    }

    /// `$/progress(token, value)`: applies a begin/report/end payload.
    pub fn progress(&self, token: RequestId, value: Value) {
        let parsed: Result<ProgressValue, _> = serde_json::from_value(value);
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity_at = Instant::now();

        match parsed {
            Ok(ProgressValue::Begin {
                title,
                message,
                percentage,
            }) => {
                let entry = inner.tokens.entry(token).or_insert_with(ProgressToken::new);
                entry.title = title;
                entry.message = message;
                entry.percent = percentage;
            }
            Ok(ProgressValue::Report { message, percentage }) => {
                if let Some(entry) = inner.tokens.get_mut(&token) {
                    if message.is_some() {
                        entry.message = message;
                    }
                    if percentage.is_some() {
                        entry.percent = percentage;
                    }
                }
            }
            Ok(ProgressValue::End { .. }) => {
                // Unknown-token end is a no-op (must not underflow).
                inner.tokens.remove(&token);
                if inner.tokens.is_empty() {
                    drop(inner);
                    self.ready.notify_waiters();
                }
            }
            Err(_) => {
                // Malformed payload — activity timestamp already bumped above.
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().unwrap().tokens.is_empty()
    }

    fn last_activity_at(&self) -> Instant {
        self.inner.lock().unwrap().last_activity_at
    }

    /// Polls (≤250ms) for the token map to empty, subject to an activity
    /// timeout, a hard timeout, a failure predicate, and cancellation
    /// (spec §4.5 `wait_for_ready`).
    pub async fn wait_for_ready<F>(
        &self,
        activity_timeout: Duration,
        hard_timeout: Duration,
        is_failed: F,
        cancel: CancellationToken,
    ) -> Result<(), CoreError>
    where
        F: Fn() -> bool,
    {
        let start = Instant::now();
        loop {
            if self.is_ready() {
                return Ok(());
            }
            if is_failed() {
                return Err(CoreError::InstanceFailed(
                    "instance failed while waiting for readiness".to_string(),
                ));
            }
            if Instant::now().duration_since(self.last_activity_at()) > activity_timeout {
                return Err(CoreError::ActivityTimeout(activity_timeout));
            }
            if start.elapsed() > hard_timeout {
                return Err(CoreError::HardTimeout(hard_timeout));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = self.ready.notified() => {}
            }
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
