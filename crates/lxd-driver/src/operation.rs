//! Tracking asynchronous hypervisor operations to a terminal state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PollConfig;
use crate::session::{status, OperationHandle, OperationStatus, RemoteError, Session};
use crate::{DriverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    Seconds(u64),
    Infinite,
}

impl WaitTimeout {
    /// `-1` (or any negative value) means block indefinitely.
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            WaitTimeout::Infinite
        } else {
            WaitTimeout::Seconds(secs as u64)
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            WaitTimeout::Seconds(secs) => Some(Duration::from_secs(*secs)),
            WaitTimeout::Infinite => None,
        }
    }
}

impl fmt::Display for WaitTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitTimeout::Seconds(secs) => write!(f, "{secs}s"),
            WaitTimeout::Infinite => write!(f, "no timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Success(Value),
    Failure(String),
    Timeout,
    /// The hypervisor no longer knows the operation; nothing to wait for.
    Gone,
}

/// Terminal classification of one status reading, `None` while still running.
pub fn classify(reading: &OperationStatus) -> Option<OperationOutcome> {
    let job = &reading.metadata;
    let terminal = matches!(
        job.status_code,
        status::SUCCESS | status::FAILURE | status::CANCELLED
    ) || matches!(job.status.as_str(), "Success" | "Failure" | "Cancelled");
    if !terminal {
        return None;
    }

    if reading.status_code == status::SUCCESS && job.status_code == status::SUCCESS {
        return Some(OperationOutcome::Success(job.metadata.clone()));
    }

    let reason = if job.err.is_empty() {
        format!("operation ended with status {} ({})", job.status, job.status_code)
    } else {
        job.err.clone()
    };
    Some(OperationOutcome::Failure(reason))
}

#[derive(Clone)]
pub struct OperationTracker {
    session: Arc<dyn Session>,
    poll: PollConfig,
}

impl OperationTracker {
    pub fn new(session: Arc<dyn Session>, poll: PollConfig) -> Self {
        Self { session, poll }
    }

    /// Long-poll `handle` until it is terminal or `timeout` elapses.
    ///
    /// Each status query asks the server to block for at most one poll slice.
    /// If a query comes back early without a terminal state the transport is
    /// not honouring the long-poll, so the next query is delayed by a capped
    /// exponential backoff.
    pub async fn wait(
        &self,
        handle: &OperationHandle,
        timeout: WaitTimeout,
    ) -> std::result::Result<OperationOutcome, RemoteError> {
        let deadline = timeout.duration().map(|d| Instant::now() + d);
        let mut backoff = self.poll.initial_backoff;

        loop {
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.poll.poll_slice),
                None => self.poll.poll_slice,
            };

            let asked = Instant::now();
            let reading = match self.session.operation_wait(&handle.id, slice).await {
                Ok(reading) => reading,
                Err(e) if e.is_not_found() => {
                    debug!(operation = %handle.id, "Operation unknown to the hypervisor");
                    return Ok(OperationOutcome::Gone);
                }
                Err(e) => return Err(e),
            };

            if let Some(outcome) = classify(&reading) {
                debug!(operation = %handle.id, ?outcome, "Operation finished");
                return Ok(outcome);
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if remaining == Some(Duration::ZERO) {
                return Ok(OperationOutcome::Timeout);
            }

            if asked.elapsed() < slice {
                let pause = remaining.map_or(backoff, |r| backoff.min(r));
                debug!(operation = %handle.id, ?pause, status = %reading.metadata.status, "Operation still running");
                tokio::time::sleep(pause).await;
                backoff = (backoff * 2).min(self.poll.max_backoff);
            }
        }
    }

    /// Wait and require success, returning the operation metadata.
    pub async fn wait_for_success(
        &self,
        name: &str,
        handle: &OperationHandle,
        timeout: WaitTimeout,
    ) -> Result<Value> {
        match self.wait(handle, timeout).await {
            Ok(OperationOutcome::Success(metadata)) => Ok(metadata),
            Ok(OperationOutcome::Failure(message)) => {
                Err(DriverError::RemoteOperation {
                    name: name.to_string(),
                    message,
                })
            }
            Ok(OperationOutcome::Timeout) => Err(DriverError::OperationTimeout {
                name: name.to_string(),
                operation: handle.id.clone(),
                timeout,
            }),
            Ok(OperationOutcome::Gone) => Err(DriverError::NotFound {
                name: name.to_string(),
                resource: format!("operation {}", handle.id),
            }),
            Err(e) => Err(DriverError::RemoteOperation {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Like [`wait_for_success`](Self::wait_for_success) but a vanished
    /// operation counts as done. For delete/stop paths.
    pub async fn wait_allow_gone(
        &self,
        name: &str,
        handle: &OperationHandle,
        timeout: WaitTimeout,
    ) -> Result<()> {
        match self.wait_for_success(name, handle, timeout).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(instance = %name, operation = %handle.id, "Operation vanished, treating as complete");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OperationMetadata;
    use crate::test_utils::FakeSession;
    use serde_json::json;

    fn reading(envelope: i64, code: i64, status: &str, err: &str) -> OperationStatus {
        OperationStatus {
            status_code: envelope,
            metadata: OperationMetadata {
                id: "op".to_string(),
                status: status.to_string(),
                status_code: code,
                metadata: json!({"fingerprint": "abc"}),
                err: err.to_string(),
            },
        }
    }

    fn tracker(session: Arc<FakeSession>) -> OperationTracker {
        OperationTracker::new(
            session,
            PollConfig {
                poll_slice: Duration::from_secs(1),
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(400),
            },
        )
    }

    #[test]
    fn test_classify_success() {
        let outcome = classify(&reading(200, 200, "Success", "")).unwrap();
        assert_eq!(outcome, OperationOutcome::Success(json!({"fingerprint": "abc"})));
    }

    #[test]
    fn test_classify_embedded_failure() {
        let outcome = classify(&reading(200, 400, "Failure", "no space left")).unwrap();
        assert_eq!(outcome, OperationOutcome::Failure("no space left".to_string()));
    }

    #[test]
    fn test_classify_envelope_mismatch_is_failure() {
        let outcome = classify(&reading(500, 200, "Success", "")).unwrap();
        assert!(matches!(outcome, OperationOutcome::Failure(_)));
    }

    #[test]
    fn test_classify_running() {
        assert!(classify(&reading(200, 103, "Running", "")).is_none());
    }

    #[test]
    fn test_wait_timeout_from_secs() {
        assert_eq!(WaitTimeout::from_secs(-1), WaitTimeout::Infinite);
        assert_eq!(WaitTimeout::from_secs(5), WaitTimeout::Seconds(5));
        assert_eq!(WaitTimeout::Infinite.duration(), None);
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_reading() {
        let session = Arc::new(FakeSession::new());
        let handle = session.push_operation(reading(200, 200, "Success", ""));
        let outcome = tracker(session)
            .wait(&handle, WaitTimeout::Seconds(5))
            .await
            .unwrap();
        assert!(matches!(outcome, OperationOutcome::Success(_)));
    }

    #[tokio::test]
    async fn test_missing_operation_is_gone() {
        let session = Arc::new(FakeSession::new());
        let handle = OperationHandle::from_path("/1.0/operations/missing", 100);
        let outcome = tracker(session.clone())
            .wait(&handle, WaitTimeout::Seconds(5))
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Gone);

        // Delete-style callers treat that as done.
        tracker(session)
            .wait_allow_gone("instance-1", &handle, WaitTimeout::Seconds(5))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_operation_times_out() {
        let session = Arc::new(FakeSession::new());
        let handle = session.push_operation(reading(200, 103, "Running", ""));
        let started = Instant::now();
        let outcome = tracker(session.clone())
            .wait(&handle, WaitTimeout::Seconds(3))
            .await
            .unwrap();
        assert_eq!(outcome, OperationOutcome::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(3));
        // Backoff keeps the query count far below a busy loop.
        assert!(session.operation_queries() < 20);
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal() {
        let session = Arc::new(FakeSession::new());
        let handle = session.push_operation(reading(200, 103, "Running", ""));
        session.fail_next(
            "operation_wait",
            RemoteError::Transport("connection reset".to_string()),
        );
        let err = tracker(session)
            .wait_for_success("instance-1", &handle, WaitTimeout::Seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::RemoteOperation { ref message, .. } if message.contains("connection reset")));
    }

    #[tokio::test]
    async fn test_failure_surfaces_embedded_message() {
        let session = Arc::new(FakeSession::new());
        let handle = session.push_operation(reading(200, 400, "Failure", "image not found"));
        let err = tracker(session)
            .wait_for_success("instance-1", &handle, WaitTimeout::Seconds(5))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("instance-1"));
        assert!(text.contains("image not found"));
    }
}
