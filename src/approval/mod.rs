//! Human-in-the-loop approval workflow for side-effecting tool calls.
//!
//! Each approval request resolves exactly once: auto-approval policy first,
//! then whichever of {external decision, expiry timer} fires first. Timers
//! of cancelled sessions keep running; their resolutions are discarded.

use crate::api::ApiClient;
use crate::config::{ApprovalPolicy, RetryConfig};
use crate::error::Error;
use crate::resilience::Retryer;
use crate::types::{ToolCallStatus, ToolResultPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a resolved entry outlives its expiry. Within this window a late
/// decision still classifies as expired instead of unknown; afterwards the
/// entry is removed so the map stays bounded.
const RESOLVED_RETENTION: Duration = Duration::from_secs(60);

/// A pending request for human sign-off on one tool call.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub id: String,
    pub tool_call_id: String,
    pub requested_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub enum ApprovalResolution {
    Approved { reason: Option<String> },
    Rejected { reason: Option<String> },
    AutoApproved,
    Expired,
}

impl ApprovalResolution {
    pub fn tool_status(&self) -> ToolCallStatus {
        match self {
            ApprovalResolution::Approved { .. } => ToolCallStatus::Approved,
            ApprovalResolution::Rejected { .. } => ToolCallStatus::Rejected,
            ApprovalResolution::AutoApproved => ToolCallStatus::AutoApproved,
            ApprovalResolution::Expired => ToolCallStatus::Expired,
        }
    }
}

/// Delivered into the owning session's loop; the session applies these to
/// its state, the coordinator never touches `SessionState` directly.
#[derive(Debug)]
pub(crate) enum ApprovalOutcome {
    Resolved {
        approval_id: String,
        tool_call_id: String,
        status: ToolCallStatus,
    },
    ExecutionFinished {
        result: ToolResultPayload,
    },
}

#[derive(Debug, Clone)]
pub struct ApprovalSnapshot {
    pub resolution: Option<ToolCallStatus>,
    pub orphaned: bool,
}

struct PendingEntry {
    tool_call_id: String,
    tool_name: String,
    expires_at: Instant,
    decision_tx: Option<oneshot::Sender<ApprovalResolution>>,
    resolution: Option<ToolCallStatus>,
    orphaned: bool,
}

pub struct ApprovalCoordinator {
    client: Arc<ApiClient>,
    retryer: Arc<Retryer>,
    policy: ApprovalPolicy,
    retry: RetryConfig,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl ApprovalCoordinator {
    pub fn new(
        client: Arc<ApiClient>,
        retryer: Arc<Retryer>,
        policy: ApprovalPolicy,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            retryer,
            policy,
            retry,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Track a new approval request and arm its expiry timer.
    ///
    /// Returns true when auto-approval policy matched: the request resolves
    /// immediately and nothing is published for a human decision.
    pub(crate) fn register(
        self: &Arc<Self>,
        request: ApprovalRequest,
        tool_name: String,
        outcome_tx: mpsc::UnboundedSender<ApprovalOutcome>,
    ) -> bool {
        let auto = self.policy.auto_approves(&tool_name);
        if auto {
            self.track(&request, tool_name, None);
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator
                    .finish(request.id, ApprovalResolution::AutoApproved, outcome_tx)
                    .await;
            });
            return true;
        }

        let (decision_tx, decision_rx) = oneshot::channel();
        self.track(&request, tool_name, Some(decision_tx));
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let resolution = tokio::select! {
                _ = tokio::time::sleep_until(request.expires_at) => ApprovalResolution::Expired,
                decision = decision_rx => {
                    match decision {
                        // Hard deadline: a decision that raced past the
                        // expiry loses even if it won the select.
                        Ok(resolution) if Instant::now() < request.expires_at => resolution,
                        Ok(_) => ApprovalResolution::Expired,
                        Err(_) => ApprovalResolution::Expired,
                    }
                }
            };
            coordinator.finish(request.id, resolution, outcome_tx).await;
        });
        false
    }

    fn track(
        &self,
        request: &ApprovalRequest,
        tool_name: String,
        decision_tx: Option<oneshot::Sender<ApprovalResolution>>,
    ) {
        self.lock().insert(
            request.id.clone(),
            PendingEntry {
                tool_call_id: request.tool_call_id.clone(),
                tool_name,
                expires_at: request.expires_at,
                decision_tx,
                resolution: None,
                orphaned: false,
            },
        );
    }

    /// External decision channel entry point.
    ///
    /// A decision after expiry is rejected with `ApprovalExpired`; a second
    /// decision after a first resolution is a no-op. Once the retention
    /// window past expiry has elapsed the id is no longer known.
    pub fn resolve(
        &self,
        approval_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Result<(), Error> {
        let mut pending = self.lock();
        let Some(entry) = pending.get_mut(approval_id) else {
            return Err(Error::Validation(format!(
                "unknown approval '{approval_id}'"
            )));
        };

        match entry.resolution {
            Some(ToolCallStatus::Expired) => {
                return Err(Error::ApprovalExpired {
                    approval_id: approval_id.to_string(),
                });
            }
            Some(_) => {
                debug!(approval_id, "decision after resolution ignored");
                return Ok(());
            }
            None => {}
        }

        if Instant::now() >= entry.expires_at {
            return Err(Error::ApprovalExpired {
                approval_id: approval_id.to_string(),
            });
        }

        let Some(tx) = entry.decision_tx.take() else {
            // A decision is already in flight toward the watcher task.
            return Ok(());
        };
        let resolution = if approved {
            ApprovalResolution::Approved { reason }
        } else {
            ApprovalResolution::Rejected { reason }
        };
        let _ = tx.send(resolution);
        Ok(())
    }

    pub fn snapshot(&self, approval_id: &str) -> Option<ApprovalSnapshot> {
        self.lock().get(approval_id).map(|entry| ApprovalSnapshot {
            resolution: entry.resolution,
            orphaned: entry.orphaned,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.resolution.is_none())
            .count()
    }

    async fn finish(
        self: Arc<Self>,
        approval_id: String,
        resolution: ApprovalResolution,
        outcome_tx: mpsc::UnboundedSender<ApprovalOutcome>,
    ) {
        let status = resolution.tool_status();
        let (tool_call_id, tool_name, expires_at) = {
            let mut pending = self.lock();
            let Some(entry) = pending.get_mut(&approval_id) else {
                return;
            };
            if entry.resolution.is_some() {
                return;
            }
            entry.resolution = Some(status);
            entry.decision_tx = None;
            (
                entry.tool_call_id.clone(),
                entry.tool_name.clone(),
                entry.expires_at,
            )
        };
        info!(%approval_id, ?status, "approval resolved");
        self.schedule_prune(approval_id.clone(), expires_at);

        let delivered = outcome_tx
            .send(ApprovalOutcome::Resolved {
                approval_id: approval_id.clone(),
                tool_call_id: tool_call_id.clone(),
                status,
            })
            .is_ok();
        if !delivered {
            // The session is gone. The timer fired on schedule as required,
            // but its resolution must not mutate live state; discard it.
            if let Some(entry) = self.lock().get_mut(&approval_id) {
                entry.orphaned = true;
            }
            debug!(%approval_id, "approval resolved after session ended, discarding");
            return;
        }

        match status {
            ToolCallStatus::Approved | ToolCallStatus::AutoApproved => {
                self.record_decision(&approval_id, true, &resolution).await;
                let result = self.execute(&approval_id, &tool_name, &tool_call_id).await;
                let _ = outcome_tx.send(ApprovalOutcome::ExecutionFinished { result });
            }
            ToolCallStatus::Rejected | ToolCallStatus::Expired => {
                self.record_decision(&approval_id, false, &resolution).await;
                let reason = if status == ToolCallStatus::Rejected {
                    "approval rejected"
                } else {
                    "approval expired"
                };
                let _ = outcome_tx.send(ApprovalOutcome::ExecutionFinished {
                    result: ToolResultPayload {
                        tool_call_id,
                        content: format!("tool unavailable: {reason}"),
                        is_error: true,
                    },
                });
            }
            _ => {}
        }
    }

    fn schedule_prune(self: &Arc<Self>, approval_id: String, expires_at: Instant) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at + RESOLVED_RETENTION).await;
            if coordinator.lock().remove(&approval_id).is_some() {
                debug!(%approval_id, "retention elapsed, entry removed");
            }
        });
    }

    async fn record_decision(
        &self,
        approval_id: &str,
        approved: bool,
        resolution: &ApprovalResolution,
    ) {
        let reason = match resolution {
            ApprovalResolution::Approved { reason } | ApprovalResolution::Rejected { reason } => {
                reason.as_deref()
            }
            ApprovalResolution::AutoApproved => Some("auto-approved"),
            ApprovalResolution::Expired => Some("approval expired"),
        };
        if let Err(error) = self.client.approve(approval_id, approved, reason).await {
            warn!(approval_id, %error, "failed to record approval decision");
        }
    }

    async fn execute(
        &self,
        approval_id: &str,
        tool_name: &str,
        tool_call_id: &str,
    ) -> ToolResultPayload {
        let operation = format!("tool:{tool_name}");
        let client = Arc::clone(&self.client);
        let approval = approval_id.to_string();
        let outcome = self
            .retryer
            .execute(&operation, &self.retry, || {
                let client = Arc::clone(&client);
                let approval = approval.clone();
                async move { client.execute_tool(&approval).await }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(error) => {
                warn!(approval_id, tool_name, %error, "tool execution failed");
                ToolResultPayload {
                    tool_call_id: tool_call_id.to_string(),
                    content: format!("tool execution failed: {error}"),
                    is_error: true,
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::ScriptedBackend;
    use crate::config::CircuitBreakerConfig;
    use std::time::Duration;

    fn coordinator_with(
        backend: ScriptedBackend,
        policy: ApprovalPolicy,
    ) -> Arc<ApprovalCoordinator> {
        let client = Arc::new(ApiClient::new_mock(Arc::new(backend)));
        let retryer = Arc::new(Retryer::new(CircuitBreakerConfig::default()));
        Arc::new(ApprovalCoordinator::new(
            client,
            retryer,
            policy,
            RetryConfig::default(),
        ))
    }

    fn request(expires_in: Duration) -> ApprovalRequest {
        let now = Instant::now();
        ApprovalRequest {
            id: "ap_1".to_string(),
            tool_call_id: "tc_1".to_string(),
            requested_at: now,
            expires_at: now + expires_in,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_approval_resolves_and_executes_without_human_request() {
        let backend = ScriptedBackend::new().with_tool_result(
            "ap_1",
            Ok(ToolResultPayload {
                tool_call_id: "tc_1".to_string(),
                content: "42".to_string(),
                is_error: false,
            }),
        );
        let policy = ApprovalPolicy {
            auto_approve_tools: vec!["calculator".to_string()],
            ..ApprovalPolicy::default()
        };
        let coordinator = coordinator_with(backend, policy);
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

        let auto = coordinator.register(
            request(Duration::from_secs(300)),
            "calculator".to_string(),
            outcome_tx,
        );
        assert!(auto);

        match outcome_rx.recv().await.expect("resolution outcome") {
            ApprovalOutcome::Resolved { status, .. } => {
                assert_eq!(status, ToolCallStatus::AutoApproved);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        match outcome_rx.recv().await.expect("execution outcome") {
            ApprovalOutcome::ExecutionFinished { result } => {
                assert_eq!(result.content, "42");
                assert!(!result.is_error);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecided_request_expires_on_schedule() {
        let coordinator = coordinator_with(ScriptedBackend::new(), ApprovalPolicy::default());
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

        let auto = coordinator.register(
            request(Duration::from_secs(300)),
            "calculator".to_string(),
            outcome_tx,
        );
        assert!(!auto);
        assert_eq!(coordinator.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;

        match outcome_rx.recv().await.expect("resolution outcome") {
            ApprovalOutcome::Resolved { status, .. } => {
                assert_eq!(status, ToolCallStatus::Expired);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        match outcome_rx.recv().await.expect("synthetic failure") {
            ApprovalOutcome::ExecutionFinished { result } => {
                assert!(result.is_error);
                assert!(result.content.contains("expired"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // A decision arriving past the deadline is rejected outright.
        assert!(matches!(
            coordinator.resolve("ap_1", true, None),
            Err(Error::ApprovalExpired { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_yields_synthetic_failure_result() {
        let coordinator = coordinator_with(ScriptedBackend::new(), ApprovalPolicy::default());
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        coordinator.register(
            request(Duration::from_secs(300)),
            "file_write".to_string(),
            outcome_tx,
        );

        coordinator
            .resolve("ap_1", false, Some("too risky".to_string()))
            .expect("decision accepted");

        match outcome_rx.recv().await.expect("resolution outcome") {
            ApprovalOutcome::Resolved { status, .. } => {
                assert_eq!(status, ToolCallStatus::Rejected);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        match outcome_rx.recv().await.expect("synthetic failure") {
            ApprovalOutcome::ExecutionFinished { result } => {
                assert!(result.is_error);
                assert!(result.content.contains("rejected"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_decision_after_resolution_is_a_no_op() {
        let backend = ScriptedBackend::new().with_tool_result(
            "ap_1",
            Ok(ToolResultPayload {
                tool_call_id: "tc_1".to_string(),
                content: "done".to_string(),
                is_error: false,
            }),
        );
        let coordinator = coordinator_with(backend, ApprovalPolicy::default());
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        coordinator.register(
            request(Duration::from_secs(300)),
            "calculator".to_string(),
            outcome_tx,
        );

        coordinator.resolve("ap_1", true, None).expect("first decision");
        let _ = outcome_rx.recv().await.expect("resolution outcome");
        let _ = outcome_rx.recv().await.expect("execution outcome");

        // Flip attempt after resolution: ignored, status stays approved.
        assert!(coordinator.resolve("ap_1", false, None).is_ok());
        let snapshot = coordinator.snapshot("ap_1").expect("tracked");
        assert_eq!(snapshot.resolution, Some(ToolCallStatus::Approved));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_after_session_end_is_orphaned() {
        let coordinator = coordinator_with(ScriptedBackend::new(), ApprovalPolicy::default());
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        coordinator.register(
            request(Duration::from_secs(300)),
            "calculator".to_string(),
            outcome_tx,
        );

        // Session ends before the timer fires.
        drop(outcome_rx);
        tokio::time::sleep(Duration::from_secs(301)).await;

        let snapshot = coordinator.snapshot("ap_1").expect("tracked");
        assert_eq!(snapshot.resolution, Some(ToolCallStatus::Expired));
        assert!(snapshot.orphaned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_entries_are_pruned_after_retention() {
        let coordinator = coordinator_with(ScriptedBackend::new(), ApprovalPolicy::default());
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        coordinator.register(
            request(Duration::from_secs(300)),
            "calculator".to_string(),
            outcome_tx,
        );

        tokio::time::sleep(Duration::from_secs(301)).await;
        let _ = outcome_rx.recv().await.expect("resolution outcome");
        let _ = outcome_rx.recv().await.expect("synthetic failure");

        // Within retention the entry survives and late decisions classify
        // as expired.
        assert!(coordinator.snapshot("ap_1").is_some());
        assert!(matches!(
            coordinator.resolve("ap_1", true, None),
            Err(Error::ApprovalExpired { .. })
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(coordinator.snapshot("ap_1").is_none());
        assert_eq!(coordinator.pending_count(), 0);
        assert!(matches!(
            coordinator.resolve("ap_1", true, None),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_approval_id_is_a_validation_error() {
        let coordinator = coordinator_with(ScriptedBackend::new(), ApprovalPolicy::default());
        assert!(matches!(
            coordinator.resolve("nope", true, None),
            Err(Error::Validation(_))
        ));
    }
}
