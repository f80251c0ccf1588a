use crate::error::Error;
use crate::types::StreamEvent;
use std::borrow::Cow;
use tracing::warn;

/// Incremental decoder for the line-oriented `data: <json>` stream framing.
///
/// Malformed payloads are logged and skipped; the stream only fails once
/// `malformed_limit` consecutive frames were undecodable.
pub struct FrameParser {
    buffer: Vec<u8>,
    consecutive_malformed: usize,
    malformed_limit: usize,
}

impl FrameParser {
    pub fn new(malformed_limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            consecutive_malformed: 0,
            malformed_limit: malformed_limit.max(1),
        }
    }

    pub fn process(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, Error> {
        // Buffer raw bytes and decode per complete line: a multi-byte
        // character split across transport chunks must not be decoded
        // until both halves have arrived.
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            // Blank separators and `:` comments carry nothing; other SSE
            // fields (event:, id:, retry:) are ignored per the framing
            // contract -- only data lines carry events.
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() || payload == "[DONE]" {
                continue;
            }

            match serde_json::from_str::<StreamEvent>(payload) {
                Ok(event) => {
                    self.consecutive_malformed = 0;
                    events.push(event);
                }
                Err(error) => {
                    self.consecutive_malformed += 1;
                    warn!(
                        %error,
                        consecutive = self.consecutive_malformed,
                        "skipping malformed stream frame"
                    );
                    if self.consecutive_malformed >= self.malformed_limit {
                        return Err(Error::Protocol(format!(
                            "{} consecutive malformed frames",
                            self.consecutive_malformed
                        )));
                    }
                }
            }
        }

        Ok(events)
    }

    /// Unconsumed partial line, if the transport closed mid-frame.
    pub fn remainder(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }
}
