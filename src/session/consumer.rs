//! Read loop for one active turn.
//!
//! Owns the transport, the frame parser, and the session state for the
//! turn's lifetime. Approval resolutions arrive over an internal channel and
//! are folded back into the same loop, so the state has a single writer.

use crate::api::{ApiClient, FrameParser};
use crate::approval::{ApprovalCoordinator, ApprovalOutcome, ApprovalRequest};
use crate::config::Config;
use crate::error::Error;
use crate::resilience::Retryer;
use crate::session::state::SessionState;
use crate::session::{SessionSummary, SessionUpdate};
use crate::types::{PreparedTurn, StreamEvent, ToolCallStatus, TurnInput};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) struct TurnDriver {
    pub client: Arc<ApiClient>,
    pub retryer: Arc<Retryer>,
    pub approvals: Arc<ApprovalCoordinator>,
    pub config: Config,
    pub session_id: Uuid,
    pub updates: mpsc::UnboundedSender<SessionUpdate>,
    pub cancel: CancellationToken,
}

enum TurnEnd {
    Completed(SessionSummary),
    Cancelled,
}

impl TurnDriver {
    pub(crate) async fn run(self, input: TurnInput) {
        match self.drive(input).await {
            Ok(TurnEnd::Completed(summary)) => {
                info!(session_id = %self.session_id, "turn completed");
                let _ = self.updates.send(SessionUpdate::Completed(summary));
            }
            Ok(TurnEnd::Cancelled) => {
                // Cancellation sends no terminal update; the channel simply
                // closes when the driver drops.
                debug!(session_id = %self.session_id, "turn cancelled, closing channel");
            }
            Err(error) => {
                warn!(session_id = %self.session_id, %error, "turn failed");
                let _ = self.updates.send(SessionUpdate::Failed(error));
            }
        }
    }

    async fn drive(&self, input: TurnInput) -> Result<TurnEnd, Error> {
        validate_turn(&input)?;

        // Cancellation must also abort the retry/backoff phase, not just
        // the read loop.
        let prepared = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!(session_id = %self.session_id, "cancelled during prepare");
                return Ok(TurnEnd::Cancelled);
            }
            prepared = self.prepare(&input) => prepared?,
        };

        // Stream tokens are single-use; opening the stream is never retried.
        let mut stream = self
            .client
            .open_stream(&prepared.stream_token, &prepared.stream_url)
            .await?;
        debug!(session_id = %self.session_id, url = %prepared.stream_url, "stream open");

        let mut parser = FrameParser::new(self.config.malformed_frame_limit);
        let mut state = SessionState::new(self.config.approvals.clone());
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    state.cancel();
                    info!(session_id = %self.session_id, "cancellation signalled mid-stream");
                    return Ok(TurnEnd::Cancelled);
                }
                Some(outcome) = outcome_rx.recv() => {
                    self.apply_outcome(&mut state, outcome);
                }
                chunk = stream.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for event in parser.process(&bytes)? {
                                // Cancellation is honored at least once per
                                // decoded frame.
                                if self.cancel.is_cancelled() {
                                    state.cancel();
                                    return Ok(TurnEnd::Cancelled);
                                }
                                if let Some(end) =
                                    self.apply_event(&mut state, event, &outcome_tx)?
                                {
                                    return Ok(end);
                                }
                            }
                        }
                        Some(Err(error)) => return Err(error),
                        None => {
                            return Err(Error::Network(
                                "stream closed before terminal event".to_string(),
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn prepare(&self, input: &TurnInput) -> Result<PreparedTurn, Error> {
        let client = Arc::clone(&self.client);
        self.retryer
            .execute("prepare", &self.config.retry, || {
                let client = Arc::clone(&client);
                let input = input.clone();
                async move { client.prepare(&input).await }
            })
            .await
    }

    /// Fold one decoded stream event into the state and forward the
    /// corresponding update. Returns the turn end on a terminal event.
    fn apply_event(
        &self,
        state: &mut SessionState,
        event: StreamEvent,
        outcome_tx: &mpsc::UnboundedSender<ApprovalOutcome>,
    ) -> Result<Option<TurnEnd>, Error> {
        state.apply(&event);

        match event {
            StreamEvent::ContentChunk { text } => {
                let _ = self.updates.send(SessionUpdate::TextDelta(text));
            }
            StreamEvent::ToolsAvailable { tools } => {
                let _ = self.updates.send(SessionUpdate::ToolsAvailable(tools));
            }
            StreamEvent::ToolCallDetected { .. } => {
                // The reducer may have rewritten the status per auto-approve
                // policy; forward its copy, not the wire one.
                if let Some(call) = state.tool_calls.last() {
                    let _ = self
                        .updates
                        .send(SessionUpdate::ToolCallDetected(call.clone()));
                }
            }
            StreamEvent::ToolExecuting { tool_name } => {
                if let Some(call) = state
                    .tool_calls
                    .iter()
                    .rev()
                    .find(|c| c.tool_name == tool_name)
                {
                    let _ = self.updates.send(SessionUpdate::ToolStatus {
                        tool_call_id: call.id.clone(),
                        status: ToolCallStatus::Executing,
                    });
                }
            }
            StreamEvent::ToolResult { result } => {
                let _ = self.updates.send(SessionUpdate::ToolResult {
                    tool_call_id: result.tool_call_id,
                    content: result.content,
                    is_error: result.is_error,
                });
            }
            StreamEvent::ToolApprovalRequired { approval } => {
                let Some(pending) = state
                    .pending_approvals
                    .iter()
                    .find(|p| p.approval_id == approval.id)
                else {
                    return Ok(None);
                };
                let tool_name = state
                    .tool_calls
                    .iter()
                    .find(|c| c.id == approval.tool_call_id)
                    .map(|c| c.tool_name.clone())
                    .unwrap_or_default();
                let now = Instant::now();
                let request = ApprovalRequest {
                    id: approval.id.clone(),
                    tool_call_id: approval.tool_call_id.clone(),
                    requested_at: now,
                    expires_at: now + pending.expires_in,
                };
                let expires_in = pending.expires_in;
                let auto =
                    self.approvals
                        .register(request, tool_name.clone(), outcome_tx.clone());
                if !auto {
                    let _ = self.updates.send(SessionUpdate::ApprovalRequested {
                        approval_id: approval.id,
                        tool_call_id: approval.tool_call_id,
                        tool_name,
                        expires_in,
                    });
                }
            }
            StreamEvent::AssistantMessageComplete { .. } | StreamEvent::Done => {
                return Ok(Some(TurnEnd::Completed(SessionSummary::of(state))));
            }
            StreamEvent::Error { message } => {
                return Err(Error::Server(message));
            }
            StreamEvent::Unknown => {}
        }
        Ok(None)
    }

    /// Fold an approval resolution or tool-execution result back into the
    /// session, as if it had arrived on the stream.
    fn apply_outcome(&self, state: &mut SessionState, outcome: ApprovalOutcome) {
        match outcome {
            ApprovalOutcome::Resolved {
                approval_id,
                tool_call_id,
                status,
            } => {
                state.resolve_approval(&approval_id, status);
                let _ = self.updates.send(SessionUpdate::ToolStatus {
                    tool_call_id,
                    status,
                });
            }
            ApprovalOutcome::ExecutionFinished { result } => {
                state.apply(&StreamEvent::ToolResult {
                    result: result.clone(),
                });
                let _ = self.updates.send(SessionUpdate::ToolResult {
                    tool_call_id: result.tool_call_id,
                    content: result.content,
                    is_error: result.is_error,
                });
            }
        }
    }
}

fn validate_turn(input: &TurnInput) -> Result<(), Error> {
    if input.message.trim().is_empty() {
        return Err(Error::Validation("message must not be empty".to_string()));
    }
    if input.model.trim().is_empty() {
        return Err(Error::Validation("model must not be empty".to_string()));
    }
    Ok(())
}
