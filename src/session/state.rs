//! Pure reducer over the turn's event stream.
//!
//! The state never talks to the network; the driver feeds it decoded events
//! and approval outcomes and forwards the resulting updates to the caller.

use crate::config::ApprovalPolicy;
use crate::types::{StreamEvent, ToolCall, ToolCallStatus, ToolDescriptor};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Completed,
    Errored,
    Cancelled,
}

/// Approval bookkeeping the state keeps for observability; the timer itself
/// lives in the approval coordinator.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_id: String,
    pub tool_call_id: String,
    pub expires_in: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub tools_available: Vec<ToolDescriptor>,
    pub status: SessionStatus,
    pub last_event_seq: u64,
    pub pending_approvals: Vec<PendingApproval>,
    pub error: Option<String>,
    policy: ApprovalPolicy,
}

impl SessionState {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            text: String::new(),
            tool_calls: Vec::new(),
            tools_available: Vec::new(),
            status: SessionStatus::Active,
            last_event_seq: 0,
            pending_approvals: Vec::new(),
            error: None,
            policy,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != SessionStatus::Active
    }

    /// Fold one decoded event into the state. Events after a terminal
    /// transition are ignored; unrecognized event types are skipped without
    /// advancing the sequence counter.
    pub fn apply(&mut self, event: &StreamEvent) {
        if self.is_terminal() {
            return;
        }
        if matches!(event, StreamEvent::Unknown) {
            return;
        }
        self.last_event_seq += 1;

        match event {
            StreamEvent::ContentChunk { text } => {
                self.text.push_str(text);
            }
            StreamEvent::ToolsAvailable { tools } => {
                self.tools_available = tools.clone();
            }
            StreamEvent::ToolCallDetected { call } => {
                let mut call = call.clone();
                if self.policy.auto_approves(&call.tool_name) {
                    call.status = ToolCallStatus::AutoApproved;
                }
                self.tool_calls.push(call);
            }
            StreamEvent::ToolExecuting { tool_name } => {
                if let Some(call) = self
                    .tool_calls
                    .iter_mut()
                    .rev()
                    .find(|c| c.tool_name == *tool_name && !c.status.is_terminal())
                {
                    call.status = ToolCallStatus::Executing;
                }
            }
            StreamEvent::ToolResult { result } => {
                if let Some(call) = self
                    .tool_calls
                    .iter_mut()
                    .find(|c| c.id == result.tool_call_id && !c.status.is_terminal())
                {
                    call.status = if result.is_error {
                        ToolCallStatus::Failed
                    } else {
                        ToolCallStatus::Completed
                    };
                }
                if !result.content.is_empty() && !result.is_error {
                    if !self.text.is_empty() && !self.text.ends_with('\n') {
                        self.text.push('\n');
                    }
                    self.text.push_str(&result.content);
                }
            }
            StreamEvent::ToolApprovalRequired { approval } => {
                let expires_in = approval
                    .expires_in_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.policy.expiry());
                self.pending_approvals.push(PendingApproval {
                    approval_id: approval.id.clone(),
                    tool_call_id: approval.tool_call_id.clone(),
                    expires_in,
                });
            }
            StreamEvent::AssistantMessageComplete { message } => {
                if !message.is_empty() {
                    self.text = message.clone();
                }
                self.status = SessionStatus::Completed;
            }
            StreamEvent::Done => {
                self.status = SessionStatus::Completed;
            }
            StreamEvent::Error { message } => {
                self.error = Some(message.clone());
                self.status = SessionStatus::Errored;
            }
            StreamEvent::Unknown => {}
        }
    }

    /// Record the outcome of an approval, clearing the pending entry.
    pub fn resolve_approval(&mut self, approval_id: &str, status: ToolCallStatus) {
        let Some(index) = self
            .pending_approvals
            .iter()
            .position(|p| p.approval_id == approval_id)
        else {
            return;
        };
        let pending = self.pending_approvals.remove(index);
        if let Some(call) = self
            .tool_calls
            .iter_mut()
            .find(|c| c.id == pending.tool_call_id)
        {
            if !call.status.is_terminal() {
                call.status = status;
            }
        }
    }

    pub fn cancel(&mut self) {
        if !self.is_terminal() {
            self.status = SessionStatus::Cancelled;
        }
    }
}
