//! Scripted provider for testing conversers without real API calls.
//!
//! Responses are served from a FIFO queue first, then from substring
//! patterns matched against the last user message, then from a default.

use async_trait::async_trait;
use paper_core::{LlmClient, LlmError, LlmRequest};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Locks a mutex, recovering the data if a panicking test poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Mock provider returning pre-defined responses.
#[derive(Clone)]
pub struct ScriptedProvider {
    /// Name of this provider
    name: String,
    /// Responses served in order before anything else
    queue: Arc<Mutex<VecDeque<Result<String, LlmError>>>>,
    /// Responses keyed by a substring of the last user message
    patterns: Arc<Mutex<Vec<(String, String)>>>,
    /// Response when nothing else matches
    default_response: Arc<Mutex<Option<String>>>,
    /// Every request received, for verification
    call_history: Arc<Mutex<Vec<LlmRequest>>>,
}

impl ScriptedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            patterns: Arc::new(Mutex::new(Vec::new())),
            default_response: Arc::new(Mutex::new(None)),
            call_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues a response.
    #[must_use]
    pub fn with_queued(self, response: impl Into<String>) -> Self {
        self.push_response(response);
        self
    }

    /// Queues several responses in order.
    #[must_use]
    pub fn with_queued_all<I, T>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for response in responses {
            self.push_response(response);
        }
        self
    }

    /// Queues an error.
    #[must_use]
    pub fn with_queued_error(self, error: LlmError) -> Self {
        lock(&self.queue).push_back(Err(error));
        self
    }

    /// Adds a response for requests whose last user message contains `pattern`.
    #[must_use]
    pub fn with_response(self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        lock(&self.patterns).push((pattern.into(), response.into()));
        self
    }

    /// Sets the response for requests nothing else matches.
    #[must_use]
    pub fn with_default_response(self, response: impl Into<String>) -> Self {
        *lock(&self.default_response) = Some(response.into());
        self
    }

    /// Queues a response on a shared provider.
    pub fn push_response(&self, response: impl Into<String>) {
        lock(&self.queue).push_back(Ok(response.into()));
    }

    /// Number of queued responses not yet served.
    pub fn remaining(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Every request received so far.
    pub fn call_history(&self) -> Vec<LlmRequest> {
        lock(&self.call_history).clone()
    }

    /// Number of requests received so far.
    pub fn call_count(&self) -> usize {
        lock(&self.call_history).len()
    }

    /// Clears the call history.
    pub fn clear_history(&self) {
        lock(&self.call_history).clear();
    }

    fn find_pattern(&self, text: &str) -> Option<String> {
        lock(&self.patterns)
            .iter()
            .find(|(pattern, _)| text.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
    }
}

#[async_trait]
impl LlmClient for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self, request: &LlmRequest) -> Result<String, LlmError> {
        lock(&self.call_history).push(request.clone());

        if let Some(queued) = lock(&self.queue).pop_front() {
            return queued;
        }
        if let Some(response) = self.find_pattern(request.last_user_content().unwrap_or_default())
        {
            return Ok(response);
        }
        lock(&self.default_response).clone().ok_or_else(|| {
            LlmError::Fatal(format!(
                "{} has no scripted response left (call {})",
                self.name,
                self.call_count()
            ))
        })
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
    use paper_core::{ChatMessage, LlmSettings, Message};

    fn request(text: &str) -> LlmRequest {
        LlmRequest::new(
            vec![
                ChatMessage::from(&Message::system("sys")),
                ChatMessage::from(&Message::user(text)),
            ],
            &LlmSettings::default(),
        )
    }

    /// Tests that queued responses are served before patterns.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_queue_then_pattern() {
        let provider = ScriptedProvider::new("test")
            .with_queued("first")
            .with_response("code", "```python\nx = 1\n```");

        assert_eq!(provider.request(&request("write code")).await, Ok("first".to_owned()));
        assert_eq!(
            provider.request(&request("write code")).await,
            Ok("```python\nx = 1\n```".to_owned())
        );
        assert_eq!(provider.call_count(), 2);
    }

    /// Tests default response fallback and the error when nothing is scripted.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_default_and_exhaustion() {
        let empty = ScriptedProvider::new("empty");
        assert!(matches!(
            empty.request(&request("anything")).await,
            Err(LlmError::Fatal(_))
        ));

        let provider = ScriptedProvider::new("test").with_default_response("default");
        assert_eq!(provider.request(&request("anything")).await, Ok("default".to_owned()));
    }

    /// Tests that the call history records full requests.
    ///
    /// # Panics
    /// Panics if assertions fail during test execution.
    #[tokio::test]
    async fn test_call_history() {
        let provider = ScriptedProvider::new("test").with_default_response("ok");
        let _response = provider.request(&request("question")).await;

        let history = provider.call_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].last_user_content(), Some("question"));

        provider.clear_history();
        assert_eq!(provider.call_count(), 0);
    }
}
