//! Scripted control-plane/stream backend for tests.

use super::client::{ByteStream, MockBackend};
use crate::error::Error;
use crate::types::{HealthPayload, PreparedTurn, StreamToken, ToolResultPayload, TurnInput};
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

pub struct ScriptedBackend {
    streams: Mutex<Vec<Vec<String>>>,
    hold_open: bool,
    prepare_failures: Mutex<Vec<Error>>,
    tool_results: Mutex<HashMap<String, Result<ToolResultPayload, Error>>>,
    approve_calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            hold_open: false,
            prepare_failures: Mutex::new(Vec::new()),
            tool_results: Mutex::new(HashMap::new()),
            approve_calls: AtomicU32::new(0),
        }
    }

    /// Queue one stream script; each entry becomes a `data: <entry>` frame.
    pub fn with_stream(self, payloads: &[&str]) -> Self {
        self.streams
            .lock()
            .unwrap()
            .push(payloads.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Keep the transport open (pending forever) after the scripted frames,
    /// for cancellation and approval-expiry scenarios.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn with_tool_result(
        self,
        approval_id: &str,
        result: Result<ToolResultPayload, Error>,
    ) -> Self {
        self.tool_results
            .lock()
            .unwrap()
            .insert(approval_id.to_string(), result);
        self
    }

    pub fn with_prepare_failures(self, errors: Vec<Error>) -> Self {
        *self.prepare_failures.lock().unwrap() = errors;
        self
    }

    pub fn approve_calls(&self) -> u32 {
        self.approve_calls.load(Ordering::SeqCst)
    }

    fn canned_prepared() -> PreparedTurn {
        PreparedTurn {
            stream_token: StreamToken::new("tok_1"),
            stream_url: "http://localhost:8080/stream/tok_1".to_string(),
            user_message_id: "um_1".to_string(),
            assistant_message_id: "am_1".to_string(),
        }
    }
}

impl MockBackend for ScriptedBackend {
    fn prepare(&self, _turn: &TurnInput) -> Result<PreparedTurn, Error> {
        let mut failures = self.prepare_failures.lock().unwrap();
        if failures.is_empty() {
            Ok(Self::canned_prepared())
        } else {
            Err(failures.remove(0))
        }
    }

    fn open_stream(&self, _token: &StreamToken) -> Result<ByteStream, Error> {
        let mut streams = self.streams.lock().unwrap();
        if streams.is_empty() {
            return Err(Error::Network("no scripted stream configured".into()));
        }
        let payloads = streams.remove(0);
        drop(streams);

        let chunks: Vec<Result<Bytes, Error>> = payloads
            .into_iter()
            .map(|payload| Ok(Bytes::from(format!("data: {payload}\n"))))
            .collect();

        if self.hold_open {
            Ok(Box::pin(stream::iter(chunks).chain(stream::pending())))
        } else {
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    fn approve(&self, _approval_id: &str, _approved: bool) -> Result<(), Error> {
        self.approve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute_tool(&self, approval_id: &str) -> Result<ToolResultPayload, Error> {
        self.tool_results
            .lock()
            .unwrap()
            .remove(approval_id)
            .unwrap_or_else(|| {
                Err(Error::Validation(format!(
                    "no scripted tool result for approval '{approval_id}'"
                )))
            })
    }

    fn health(&self) -> Result<HealthPayload, Error> {
        Ok(HealthPayload {
            status: "ok".to_string(),
            service: Some("gateway".to_string()),
            services: HashMap::new(),
        })
    }
}
