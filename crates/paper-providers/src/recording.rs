//! Record/replay of external service calls.
//!
//! A [`CallLog`] is a JSON array of request/response pairs in call order,
//! one file per service. Recording rewrites the file after every call so a
//! crashed run still leaves a replayable prefix.

use core::result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use paper_core::{LlmClient, LlmError, LlmRequest, Result};

/// Locks a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedCall<Req, Resp> {
    /// What was sent
    pub request: Req,
    /// What came back
    pub response: Resp,
}

/// Ordered log of calls to one external service, persisted as JSON.
#[derive(Debug, Clone)]
pub struct CallLog<Req, Resp> {
    /// File the log is persisted to
    path: PathBuf,
    /// Calls in order
    calls: Vec<RecordedCall<Req, Resp>>,
}

impl<Req, Resp> CallLog<Req, Resp>
where
    Req: Serialize + DeserializeOwned,
    Resp: Serialize + DeserializeOwned,
{
    /// Creates an empty log persisted to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            calls: Vec::new(),
        }
    }

    /// Loads a log written earlier.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let calls = serde_json::from_str(&contents)?;
        Ok(Self {
            path: path.to_path_buf(),
            calls,
        })
    }

    /// Appends a call and rewrites the file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn push(&mut self, request: Req, response: Resp) -> Result<()> {
        self.calls.push(RecordedCall { request, response });
        self.save()
    }

    /// Writes the log to its file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.calls)?)?;
        Ok(())
    }

    /// Call at `index`.
    pub fn get(&self, index: usize) -> Option<&RecordedCall<Req, Resp>> {
        self.calls.get(index)
    }

    /// Number of recorded calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call was recorded.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// File the log is persisted to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Log of LLM calls.
pub type LlmCallLog = CallLog<LlmRequest, String>;

/// Forwards requests to a live client and records every successful call.
pub struct RecordingClient {
    /// Live client
    inner: Arc<dyn LlmClient>,
    /// Log being written
    log: Mutex<LlmCallLog>,
}

impl RecordingClient {
    /// Records calls into a new log at `path`.
    pub fn new(inner: Arc<dyn LlmClient>, path: impl Into<PathBuf>) -> Self {
        Self::with_log(inner, CallLog::new(path))
    }

    /// Records calls after those already in `log`.
    pub fn with_log(inner: Arc<dyn LlmClient>, log: LlmCallLog) -> Self {
        Self {
            inner,
            log: Mutex::new(log),
        }
    }

    /// Number of calls recorded so far.
    pub fn recorded(&self) -> usize {
        lock(&self.log).len()
    }
}

#[async_trait]
impl LlmClient for RecordingClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn request(&self, request: &LlmRequest) -> result::Result<String, LlmError> {
        let response = self.inner.request(request).await?;
        let mut log = lock(&self.log);
        if let Err(error) = log.push(request.clone(), response.clone()) {
            warn!("Failed to record LLM call to {}: {error}", log.path().display());
        }
        Ok(response)
    }
}

/// Serves recorded responses in call order.
pub struct ReplayClient {
    /// Recorded calls
    log: LlmCallLog,
    /// Index of the next call to serve
    cursor: Mutex<usize>,
    /// Whether running past the end of the log is an error
    strict: bool,
    /// Whether a request differing from the recorded one is an error
    verify_requests: bool,
    /// Live client used once the log is exhausted in non-strict mode
    fallback: Option<Arc<dyn LlmClient>>,
}

impl ReplayClient {
    /// Replays `log`.
    pub fn new(log: LlmCallLog, strict: bool) -> Self {
        info!(
            "Replaying {} recorded LLM calls from {}",
            log.len(),
            log.path().display()
        );
        Self {
            log,
            cursor: Mutex::new(0),
            strict,
            verify_requests: false,
            fallback: None,
        }
    }

    /// Continues with a live client once the recorded calls run out.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn LlmClient>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Rejects requests whose messages differ from the recorded ones.
    #[must_use]
    pub const fn with_request_verification(mut self, verify: bool) -> Self {
        self.verify_requests = verify;
        self
    }

    /// Number of calls served from the log so far.
    pub fn served(&self) -> usize {
        *lock(&self.cursor)
    }

    /// Takes the next recorded response, if any.
    fn next_recorded(&self, request: &LlmRequest) -> Option<result::Result<String, LlmError>> {
        let mut cursor = lock(&self.cursor);
        let index = *cursor;
        let call = self.log.get(index)?;
        *cursor += 1;
        drop(cursor);

        if call.request.messages != request.messages {
            if self.verify_requests {
                return Some(Err(LlmError::ReplayMismatch(index)));
            }
            warn!("Replayed call {index} was recorded for a different conversation");
        }
        debug!("Replaying recorded call {index}");
        Some(Ok(call.response.clone()))
    }
}

#[async_trait]
impl LlmClient for ReplayClient {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn request(&self, request: &LlmRequest) -> result::Result<String, LlmError> {
        if let Some(recorded) = self.next_recorded(request) {
            return recorded;
        }
        match (&self.fallback, self.strict) {
            (Some(fallback), false) => fallback.request(request).await,
            _ => Err(LlmError::ReplayExhausted(self.log.len())),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    clippy::assertions_on_result_states,
    reason = "Tests unwrap and assert on results directly"
)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;
    use paper_core::{ChatMessage, LlmSettings, Message};
    use tempfile::TempDir;

    fn request(text: &str) -> LlmRequest {
        LlmRequest::new(
            vec![
                ChatMessage::from(&Message::system("sys")),
                ChatMessage::from(&Message::user(text)),
            ],
            &LlmSettings::default(),
        )
    }

    /// Tests that the log survives a save and reload.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[test]
    fn test_call_log_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("calls.json");
        let mut log: CallLog<String, u32> = CallLog::new(&path);
        log.push("one".to_owned(), 1).unwrap();
        log.push("two".to_owned(), 2).unwrap();

        let loaded: CallLog<String, u32> = CallLog::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(1).map(|call| call.response), Some(2));
    }

    /// Tests that strict replay fails once recorded calls run out.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_strict_replay_exhausts() {
        let temp = TempDir::new().unwrap();
        let mut log = LlmCallLog::new(temp.path().join("llm.json"));
        log.push(request("a"), "answer a".to_owned()).unwrap();

        let replay = ReplayClient::new(log, true);
        assert_eq!(replay.request(&request("a")).await, Ok("answer a".to_owned()));
        assert_eq!(
            replay.request(&request("b")).await,
            Err(LlmError::ReplayExhausted(1))
        );
        assert_eq!(replay.served(), 1);
    }

    /// Tests that non-strict replay falls through to the live client.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_lenient_replay_falls_back() {
        let temp = TempDir::new().unwrap();
        let log = LlmCallLog::new(temp.path().join("llm.json"));
        let live = ScriptedProvider::new("live").with_default_response("live answer");

        let replay = ReplayClient::new(log, false).with_fallback(Arc::new(live.clone()));
        assert_eq!(replay.request(&request("a")).await, Ok("live answer".to_owned()));
        assert_eq!(live.call_count(), 1);
    }

    /// Tests that verification rejects a diverging request.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_replay_mismatch() {
        let temp = TempDir::new().unwrap();
        let mut log = LlmCallLog::new(temp.path().join("llm.json"));
        log.push(request("a"), "answer a".to_owned()).unwrap();

        let replay = ReplayClient::new(log, true).with_request_verification(true);
        assert_eq!(
            replay.request(&request("different")).await,
            Err(LlmError::ReplayMismatch(0))
        );
    }
}
