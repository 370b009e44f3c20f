//! Scripted instrument channel for testing
//!
//! `MockChannel` answers queries from a script instead of a real instrument. It provides:
//! - Per-query reply queues, consumed in order
//! - Sticky replies that answer a query every time
//! - Failure injection (timeouts, closed connection)
//! - A shared call log for verifying the exact command sequence
//!
//! Queries without a scripted reply time out, the same way a real instrument behaves
//! when it does not understand a query.

use super::InstrumentChannel;
use crate::error::{InstrumentError, InstrumentResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Reply a [`MockChannel`] gives to a query.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// Textual response line (without terminator)
    Text(String),
    /// Raw response payload (without terminator)
    Raw(Vec<u8>),
    /// No response; the query fails with `ProtocolTimeout`
    Timeout,
    /// The connection drops
    Closed,
}

impl MockReply {
    /// Shorthand for [`MockReply::Text`].
    pub fn text(response: impl Into<String>) -> Self {
        MockReply::Text(response.into())
    }
}

/// Shared, cloneable record of every command and query sent over a channel.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.lock().push(entry.into());
    }

    /// Copy of all entries in order.
    pub fn entries(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Number of entries that start with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Clear the log.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<MockReply>>,
    sticky: HashMap<String, MockReply>,
}

/// Instrument channel answering from a script
///
/// # Example
///
/// ```
/// use bode_sweep::channel::{InstrumentChannel, MockChannel, MockReply};
///
/// # tokio_test::block_on(async {
/// let channel = MockChannel::new().on("*OPC?", MockReply::text("1"));
/// assert_eq!(channel.ask("*OPC?").await.unwrap(), "1");
/// assert_eq!(channel.log().entries(), vec!["ask *OPC?"]);
/// # })
/// ```
pub struct MockChannel {
    script: Mutex<Script>,
    log: CallLog,
    timeout: Duration,
    name: String,
}

impl MockChannel {
    /// Create a channel with an empty script.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            log: CallLog::default(),
            timeout: Duration::from_millis(2000),
            name: "mock".to_string(),
        }
    }

    /// Name shown by `describe`.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Answer `query` with `reply` every time it is asked.
    pub fn on(self, query: &str, reply: MockReply) -> Self {
        self.script().sticky.insert(query.to_string(), reply);
        self
    }

    /// Answer the next unanswered ask of `query` with `reply`.
    ///
    /// Queued replies take precedence over sticky ones.
    pub fn expect(self, query: &str, reply: MockReply) -> Self {
        self.push_reply(query, reply);
        self
    }

    /// Queue a reply on an existing channel.
    pub fn push_reply(&self, query: &str, reply: MockReply) {
        self.script()
            .queued
            .entry(query.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Handle to the call log; stays valid after the channel is moved.
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_reply(&self, query: &str) -> MockReply {
        let mut script = self.script();
        if let Some(reply) = script.queued.get_mut(query).and_then(VecDeque::pop_front) {
            return reply;
        }
        script
            .sticky
            .get(query)
            .cloned()
            .unwrap_or(MockReply::Timeout)
    }

    fn fail(&self, query: &str, reply: &MockReply) -> Option<InstrumentError> {
        match reply {
            MockReply::Timeout => Some(InstrumentError::ProtocolTimeout {
                query: query.to_string(),
                timeout: self.timeout,
            }),
            MockReply::Closed => Some(InstrumentError::Closed),
            _ => None,
        }
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstrumentChannel for MockChannel {
    async fn send(&self, command: &str) -> InstrumentResult<()> {
        self.log.push(format!("send {}", command));
        tracing::debug!(channel = %self.name, command, "Mock SCPI write");
        Ok(())
    }

    async fn ask(&self, query: &str) -> InstrumentResult<String> {
        self.log.push(format!("ask {}", query));
        let reply = self.next_reply(query);
        if let Some(err) = self.fail(query, &reply) {
            return Err(err);
        }
        match reply {
            MockReply::Text(text) => Ok(text.trim().to_string()),
            MockReply::Raw(bytes) => String::from_utf8(bytes)
                .map(|text| text.trim().to_string())
                .map_err(|e| InstrumentError::decode(query, e.to_string())),
            MockReply::Timeout | MockReply::Closed => Err(InstrumentError::Closed),
        }
    }

    async fn ask_raw(&self, query: &str) -> InstrumentResult<Vec<u8>> {
        self.log.push(format!("ask_raw {}", query));
        let reply = self.next_reply(query);
        if let Some(err) = self.fail(query, &reply) {
            return Err(err);
        }
        match reply {
            MockReply::Text(text) => Ok(text.into_bytes()),
            MockReply::Raw(bytes) => Ok(bytes),
            MockReply::Timeout | MockReply::Closed => Err(InstrumentError::Closed),
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_before_sticky() {
        let channel = MockChannel::new()
            .on("*OPC?", MockReply::text("1"))
            .expect("*OPC?", MockReply::text("0"));

        assert_eq!(channel.ask("*OPC?").await.unwrap(), "0");
        assert_eq!(channel.ask("*OPC?").await.unwrap(), "1");
        assert_eq!(channel.ask("*OPC?").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_unscripted_query_times_out() {
        let channel = MockChannel::new();
        let result = channel.ask("*IDN?").await;
        assert!(matches!(
            result,
            Err(InstrumentError::ProtocolTimeout { ref query, .. }) if query == "*IDN?"
        ));
    }

    #[tokio::test]
    async fn test_raw_reply_rejected_by_text_path() {
        let channel = MockChannel::new().on(
            "C2-C1:MEAD? PHA",
            MockReply::Raw(b"C2-C1:MEAD PHA,10.0\xa1\xe3".to_vec()),
        );

        assert!(matches!(
            channel.ask("C2-C1:MEAD? PHA").await,
            Err(InstrumentError::DecodeFault { .. })
        ));
        let raw = channel.ask_raw("C2-C1:MEAD? PHA").await.unwrap();
        assert_eq!(&raw[raw.len() - 2..], b"\xa1\xe3");
    }

    #[tokio::test]
    async fn test_closed_reply() {
        let channel = MockChannel::new().expect("SARA?", MockReply::Closed);
        assert!(matches!(
            channel.ask_raw("SARA?").await,
            Err(InstrumentError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_call_log_survives_move() {
        let channel = MockChannel::new().named("scope");
        let log = channel.log();
        let boxed: Box<dyn InstrumentChannel> = Box::new(channel);

        boxed.send("CHDR SHORT").await.unwrap();
        let _ = boxed.ask("TDIV?").await;

        assert_eq!(log.entries(), vec!["send CHDR SHORT", "ask TDIV?"]);
        assert_eq!(log.count_prefix("send"), 1);
        assert_eq!(boxed.describe(), "scope");

        log.clear();
        assert!(log.entries().is_empty());
    }
}
