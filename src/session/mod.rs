//! Session lifecycle: prepare a turn, drive its stream, surface updates.

mod consumer;
pub mod state;

use crate::api::ApiClient;
use crate::approval::{ApprovalCoordinator, ApprovalSnapshot};
use crate::config::Config;
use crate::error::Error;
use crate::monitor::{ConnectionMonitor, ConnectivityVerdict};
use crate::resilience::{CircuitState, Retryer};
use crate::types::{ToolCall, ToolCallStatus, ToolDescriptor, TurnInput};
use consumer::TurnDriver;
use state::SessionState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Incremental progress of one turn, delivered in stream order.
#[derive(Debug)]
pub enum SessionUpdate {
    TextDelta(String),
    ToolsAvailable(Vec<ToolDescriptor>),
    ToolCallDetected(ToolCall),
    ToolStatus {
        tool_call_id: String,
        status: ToolCallStatus,
    },
    ApprovalRequested {
        approval_id: String,
        tool_call_id: String,
        tool_name: String,
        expires_in: Duration,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    Completed(SessionSummary),
    Failed(Error),
}

/// Final accumulated state of a completed turn.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub last_event_seq: u64,
}

impl SessionSummary {
    fn of(state: &SessionState) -> Self {
        Self {
            text: state.text.clone(),
            tool_calls: state.tool_calls.clone(),
            last_event_seq: state.last_event_seq,
        }
    }
}

/// Caller's handle on a running turn.
///
/// Dropping the handle does not cancel the turn; call [`SessionHandle::cancel`]
/// for that. After cancellation no terminal update arrives; the update channel
/// simply closes.
pub struct SessionHandle {
    session_id: Uuid,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.session_id
    }

    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        self.updates.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the driver task to finish. Updates still queued on the
    /// channel remain readable afterwards.
    pub async fn join(&mut self) {
        let _ = (&mut self.join).await;
    }
}

/// Entry point: owns the shared services (HTTP client, breaker registry,
/// approval coordinator, connection monitor) and spawns one driver task per
/// turn.
pub struct SessionManager {
    client: Arc<ApiClient>,
    retryer: Arc<Retryer>,
    approvals: Arc<ApprovalCoordinator>,
    monitor: Arc<ConnectionMonitor>,
    config: Config,
}

impl SessionManager {
    pub fn new(config: Config) -> Result<Self, Error> {
        config
            .validate()
            .map_err(|error| Error::Validation(error.to_string()))?;
        let client = Arc::new(ApiClient::new(&config)?);
        Ok(Self::assemble(client, config))
    }

    #[cfg(test)]
    pub(crate) fn with_client(client: Arc<ApiClient>, config: Config) -> Self {
        Self::assemble(client, config)
    }

    fn assemble(client: Arc<ApiClient>, config: Config) -> Self {
        let retryer = Arc::new(Retryer::new(config.breaker.clone()));
        let approvals = Arc::new(ApprovalCoordinator::new(
            Arc::clone(&client),
            Arc::clone(&retryer),
            config.approvals.clone(),
            config.retry.clone(),
        ));
        let monitor = ConnectionMonitor::new(Arc::clone(&client), config.monitor.clone());
        monitor.spawn();
        Self {
            client,
            retryer,
            approvals,
            monitor,
            config,
        }
    }

    /// Spawn the driver for one turn and hand back its update channel.
    pub fn start_turn(&self, input: TurnInput) -> SessionHandle {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let session_id = Uuid::new_v4();
        let driver = TurnDriver {
            client: Arc::clone(&self.client),
            retryer: Arc::clone(&self.retryer),
            approvals: Arc::clone(&self.approvals),
            config: self.config.clone(),
            session_id,
            updates: updates_tx,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(driver.run(input));
        SessionHandle {
            session_id,
            updates: updates_rx,
            cancel,
            join,
        }
    }

    /// Forward an external approval decision to the coordinator.
    pub fn resolve_approval(
        &self,
        approval_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> Result<(), Error> {
        self.approvals.resolve(approval_id, approved, reason)
    }

    pub fn approval_snapshot(&self, approval_id: &str) -> Option<ApprovalSnapshot> {
        self.approvals.snapshot(approval_id)
    }

    pub fn connectivity(&self) -> ConnectivityVerdict {
        self.monitor.verdict()
    }

    /// Hint from the embedding environment that network reachability
    /// changed; triggers an immediate re-check.
    pub fn notify_online_change(&self, online: bool) {
        self.monitor.notify_online_change(online);
    }

    pub fn breaker_state(&self, operation: &str) -> CircuitState {
        self.retryer.breakers().state(operation)
    }

    /// Stop the background monitor loops. In-flight turns are unaffected.
    pub fn shutdown(&self) {
        self.monitor.shutdown();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.monitor.shutdown();
    }
}
